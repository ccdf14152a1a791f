//! Scriptable stand-ins for the Native Engine and the Display Backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::display::backend::{
    BackendError, BackendKind, CancelFlag, DisplayBackend, DisplayConnection, DisplayTarget,
};
use crate::engine::{EngineError, EngineFeatures, NativeEngine};
use crate::model::devices::{DeviceCapabilities, DeviceCatalog, DeviceOption, DeviceScan};
use crate::model::vm_config::VmConfig;

#[derive(Default)]
struct MockState {
    statuses: HashMap<String, String>,
    snapshots: HashMap<String, Vec<String>>,
    logs: HashMap<String, Vec<String>>,
    calls: HashMap<&'static str, usize>,
    fail_status: bool,
    panic_on_status: bool,
    refuse_start: bool,
    refuse_snapshots: bool,
}

/// In-memory engine. VMs it was never told about report `stopped`.
pub struct MockEngine {
    features: EngineFeatures,
    available: AtomicBool,
    scan_delay: Duration,
    state: Mutex<MockState>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            features: EngineFeatures::all(),
            available: AtomicBool::new(true),
            scan_delay: Duration::ZERO,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_features(mut self, features: EngineFeatures) -> Self {
        self.features = features;
        self
    }

    /// Make every device scan take `delay`.
    pub fn with_scan_delay(mut self, delay: Duration) -> Self {
        self.scan_delay = delay;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, op: &'static str) {
        *self.state().calls.entry(op).or_default() += 1;
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or_default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_status(&self, name: &str, status: &str) {
        self.state()
            .statuses
            .insert(name.to_string(), status.to_string());
    }

    pub fn status_of(&self, name: &str) -> Option<String> {
        self.state().statuses.get(name).cloned()
    }

    pub fn set_logs(&self, name: &str, lines: &[&str]) {
        self.state().logs.insert(
            name.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
    }

    pub fn fail_status_queries(&self, fail: bool) {
        self.state().fail_status = fail;
    }

    pub fn panic_on_status(&self, panic: bool) {
        self.state().panic_on_status = panic;
    }

    /// `start_vm` answers `false`.
    pub fn refuse_start(&self, refuse: bool) {
        self.state().refuse_start = refuse;
    }

    /// `create_snapshot` answers `false`.
    pub fn refuse_snapshots(&self, refuse: bool) {
        self.state().refuse_snapshots = refuse;
    }

    fn require_known(&self, name: &str) -> Result<(), EngineError> {
        if self.state().statuses.contains_key(name) {
            Ok(())
        } else {
            Err(EngineError::VmNotFound(name.to_string()))
        }
    }

    fn scan_result() -> DeviceScan {
        DeviceScan {
            capabilities: DeviceCapabilities {
                kvm_supported: false,
                jit_supported: true,
                total_memory: 8192,
                cpu_cores: 4,
                machines: None,
            },
            catalog: DeviceCatalog {
                machines: vec![DeviceOption::new("virt", "QEMU ARM Virtual Machine")],
                displays: vec![DeviceOption::new("vnc", "VNC display")],
                networks: vec![DeviceOption::new("virtio-net-pci", "Virtio network device")],
                audios: vec![DeviceOption::new("intel-hda", "Intel HD Audio Controller")],
            },
        }
    }
}

#[async_trait]
impl NativeEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn features(&self) -> EngineFeatures {
        self.features
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn start_vm(&self, config: &VmConfig) -> Result<bool, EngineError> {
        self.record("start_vm");
        let mut state = self.state();
        if state.refuse_start {
            return Ok(false);
        }
        state
            .statuses
            .insert(config.name.clone(), "running".to_string());
        Ok(true)
    }

    async fn stop_vm(&self, name: &str) -> Result<bool, EngineError> {
        self.record("stop_vm");
        self.require_known(name)?;
        self.set_status(name, "stopped");
        Ok(true)
    }

    async fn get_vm_status(&self, name: &str) -> Result<String, EngineError> {
        self.record("get_vm_status");
        let state = self.state();
        if state.panic_on_status {
            drop(state);
            panic!("status probe crashed");
        }
        if state.fail_status {
            return Err(EngineError::Call("engine unreachable".into()));
        }
        Ok(state
            .statuses
            .get(name)
            .cloned()
            .unwrap_or_else(|| "stopped".to_string()))
    }

    async fn pause_vm(&self, name: &str) -> Result<bool, EngineError> {
        self.record("pause_vm");
        self.require_known(name)?;
        self.set_status(name, "paused");
        Ok(true)
    }

    async fn resume_vm(&self, name: &str) -> Result<bool, EngineError> {
        self.record("resume_vm");
        self.require_known(name)?;
        self.set_status(name, "running");
        Ok(true)
    }

    async fn get_vm_logs(
        &self,
        name: &str,
        start_line: Option<usize>,
    ) -> Result<Vec<String>, EngineError> {
        self.record("get_vm_logs");
        let state = self.state();
        let lines = state.logs.get(name).cloned().unwrap_or_default();
        Ok(lines.into_iter().skip(start_line.unwrap_or(0)).collect())
    }

    async fn create_snapshot(&self, name: &str, snapshot: &str) -> Result<bool, EngineError> {
        self.record("create_snapshot");
        let mut state = self.state();
        if state.refuse_snapshots {
            return Ok(false);
        }
        let snapshots = state.snapshots.entry(name.to_string()).or_default();
        if !snapshots.iter().any(|s| s == snapshot) {
            snapshots.push(snapshot.to_string());
        }
        Ok(true)
    }

    async fn restore_snapshot(&self, name: &str, snapshot: &str) -> Result<bool, EngineError> {
        self.record("restore_snapshot");
        Ok(self
            .state()
            .snapshots
            .get(name)
            .is_some_and(|s| s.iter().any(|s| s == snapshot)))
    }

    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<bool, EngineError> {
        self.record("delete_snapshot");
        let mut state = self.state();
        let Some(snapshots) = state.snapshots.get_mut(name) else {
            return Ok(false);
        };
        let before = snapshots.len();
        snapshots.retain(|s| s != snapshot);
        Ok(snapshots.len() != before)
    }

    async fn list_snapshots(&self, name: &str) -> Result<Vec<String>, EngineError> {
        self.record("list_snapshots");
        Ok(self.state().snapshots.get(name).cloned().unwrap_or_default())
    }

    async fn get_device_capabilities(&self) -> Result<DeviceCapabilities, EngineError> {
        self.record("get_device_capabilities");
        Ok(Self::scan_result().capabilities)
    }

    async fn kvm_supported(&self) -> Result<bool, EngineError> {
        self.record("kvm_supported");
        Ok(false)
    }

    async fn jit_supported(&self) -> Result<bool, EngineError> {
        self.record("jit_supported");
        Ok(true)
    }

    async fn scan_devices(&self) -> Result<DeviceScan, EngineError> {
        self.record("scan_devices");
        if !self.scan_delay.is_zero() {
            tokio::time::sleep(self.scan_delay).await;
        }
        Ok(Self::scan_result())
    }
}

#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    Succeed,
    Fail(String),
    /// Block until [`MockDisplayBackend::release`] is called. With
    /// `honor_cancel` the attempt also gives up once the cancel flag is set.
    Hang { honor_cancel: bool },
}

#[derive(Default)]
struct ConnectionCounters {
    disconnects: AtomicUsize,
    released: AtomicUsize,
}

struct MockConnection {
    counters: Arc<ConnectionCounters>,
}

impl DisplayConnection for MockConnection {
    fn disconnect(self: Box<Self>) -> Result<(), BackendError> {
        self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockDisplayBackend {
    kind: BackendKind,
    behavior: ConnectBehavior,
    released_gate: AtomicBool,
    connects: AtomicUsize,
    counters: Arc<ConnectionCounters>,
}

/// Upper bound on how long a hanging connect blocks a pool thread.
const HANG_LIMIT: Duration = Duration::from_secs(10);

impl MockDisplayBackend {
    pub fn new(kind: BackendKind, behavior: ConnectBehavior) -> Self {
        Self {
            kind,
            behavior,
            released_gate: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            counters: Arc::new(ConnectionCounters::default()),
        }
    }

    /// Let hanging connect attempts complete successfully.
    pub fn release(&self) {
        self.released_gate.store(true, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connections closed through `disconnect`.
    pub fn disconnects(&self) -> usize {
        self.counters.disconnects.load(Ordering::SeqCst)
    }

    /// Connections dropped without `disconnect`.
    pub fn released(&self) -> usize {
        self.counters
            .released
            .load(Ordering::SeqCst)
            .saturating_sub(self.disconnects())
    }

    fn connection(&self) -> Box<dyn DisplayConnection> {
        Box::new(MockConnection {
            counters: self.counters.clone(),
        })
    }
}

impl DisplayBackend for MockDisplayBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn connect(
        &self,
        _target: &DisplayTarget,
        cancel: &CancelFlag,
    ) -> Result<Box<dyn DisplayConnection>, BackendError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            ConnectBehavior::Succeed => Ok(self.connection()),
            ConnectBehavior::Fail(reason) => Err(BackendError::Connect(reason.clone())),
            ConnectBehavior::Hang { honor_cancel } => {
                let deadline = Instant::now() + HANG_LIMIT;
                loop {
                    if *honor_cancel && cancel.is_cancelled() {
                        return Err(BackendError::Cancelled);
                    }
                    if self.released_gate.load(Ordering::SeqCst) {
                        return Ok(self.connection());
                    }
                    if Instant::now() >= deadline {
                        return Err(BackendError::Connect("mock connect hung".into()));
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
        }
    }
}
