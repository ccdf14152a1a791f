use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::command::{VmPaths, build_args, disk_create_args};
use super::{parse, qmp};
use crate::configuration::QemuSettings;
use crate::engine::{EngineError, EngineFeatures, NativeEngine};
use crate::model::devices::{DeviceCapabilities, DeviceCatalog, DeviceScan};
use crate::model::vm_config::{ArchType, VmConfig};

const SOCKET_WAIT_ATTEMPTS: u32 = 50;
const SOCKET_WAIT_INTERVAL: Duration = Duration::from_millis(100);
const QUIT_GRACE: Duration = Duration::from_secs(5);
const HELP_TIMEOUT: Duration = Duration::from_secs(10);

struct VmInstance {
    process: Child,
    paths: VmPaths,
}

/// Holds a VM name in the starting set until dropped.
struct StartReservation<'a> {
    starting: &'a std::sync::Mutex<HashSet<String>>,
    name: String,
}

impl Drop for StartReservation<'_> {
    fn drop(&mut self) {
        self.starting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

/// Runs guests as `qemu-system-*` child processes, one QMP socket each.
///
/// `vms` is only held for map lookups and updates. A start in progress is
/// tracked in `starting` so that disk creation and the socket wait run
/// without blocking other VMs.
pub struct QemuEngine {
    settings: QemuSettings,
    vms: Mutex<HashMap<String, VmInstance>>,
    starting: std::sync::Mutex<HashSet<String>>,
}

impl QemuEngine {
    pub fn new(settings: QemuSettings) -> Self {
        Self {
            settings,
            vms: Mutex::new(HashMap::new()),
            starting: std::sync::Mutex::new(HashSet::new()),
        }
    }

    fn is_starting(&self, name: &str) -> bool {
        self.starting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Claim `name` for a start. Fails if it is running or already starting.
    async fn reserve(&self, name: &str) -> Result<StartReservation<'_>, EngineError> {
        let mut vms = self.vms.lock().await;
        if let Some(existing) = vms.get_mut(name) {
            match existing.process.try_wait() {
                Ok(None) => return Err(EngineError::VmAlreadyExists(name.to_string())),
                _ => {
                    debug!("Replacing exited instance of VM {}", name);
                    vms.remove(name);
                }
            }
        }

        let mut starting = self.starting.lock().unwrap_or_else(PoisonError::into_inner);
        if !starting.insert(name.to_string()) {
            return Err(EngineError::VmAlreadyExists(name.to_string()));
        }
        Ok(StartReservation {
            starting: &self.starting,
            name: name.to_string(),
        })
    }

    fn binary(&self, arch: ArchType) -> Option<PathBuf> {
        match &self.settings.binary_dir {
            Some(dir) => Some(dir.join(arch.qemu_binary())).filter(|path| path.is_file()),
            None => which::which(arch.qemu_binary()).ok(),
        }
    }

    /// First architecture with a usable emulator, preferring the default.
    fn any_binary(&self) -> Option<PathBuf> {
        ArchType::ALL.iter().find_map(|arch| self.binary(*arch))
    }

    fn qemu_img(&self) -> Result<PathBuf, EngineError> {
        match &self.settings.qemu_img {
            Some(path) => Ok(path.clone()),
            None => which::which("qemu-img")
                .map_err(|e| EngineError::Spawn(format!("qemu-img not found: {}", e))),
        }
    }

    fn kvm_usable() -> bool {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/kvm")
            .is_ok()
    }

    async fn ensure_disk(&self, config: &VmConfig, paths: &VmPaths) -> Result<(), EngineError> {
        if tokio::fs::try_exists(&paths.disk).await.unwrap_or(false) {
            return Ok(());
        }
        let qemu_img = self.qemu_img()?;
        info!("Creating {}G disk {:?}", config.disk_size_gb, paths.disk);
        let output = Command::new(&qemu_img)
            .args(disk_create_args(paths, config.disk_size_gb))
            .output()
            .await
            .map_err(|e| EngineError::Spawn(format!("{:?}: {}", qemu_img, e)))?;
        if !output.status.success() {
            return Err(EngineError::Spawn(format!(
                "qemu-img create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// QMP socket of a live instance. `None` when the VM is unknown.
    async fn socket_of(&self, name: &str) -> Option<PathBuf> {
        let vms = self.vms.lock().await;
        vms.get(name).map(|vm| vm.paths.qmp_socket.clone())
    }

    async fn require_socket(&self, name: &str) -> Result<PathBuf, EngineError> {
        self.socket_of(name)
            .await
            .ok_or_else(|| EngineError::VmNotFound(name.to_string()))
    }

    async fn execute(&self, name: &str, command: &str) -> Result<bool, EngineError> {
        let socket = self.require_socket(name).await?;
        qmp::execute_once(&socket, self.settings.monitor_timeout(), command, None).await?;
        Ok(true)
    }

    /// HMP snapshot commands print nothing on success.
    async fn snapshot_command(
        &self,
        name: &str,
        verb: &str,
        snapshot: &str,
    ) -> Result<bool, EngineError> {
        let socket = self.require_socket(name).await?;
        let output = qmp::hmp_once(
            &socket,
            self.settings.monitor_timeout(),
            &format!("{} {}", verb, snapshot),
        )
        .await?;
        let output = output.trim();
        if output.is_empty() {
            Ok(true)
        } else {
            warn!("{} {} on VM {}: {}", verb, snapshot, name, output);
            Ok(false)
        }
    }

    async fn help_output(&self, binary: &Path, flag: &str) -> Result<String, EngineError> {
        let run = Command::new(binary)
            .args([flag, "help"])
            .stdin(Stdio::null())
            .output();
        let output = tokio::time::timeout(HELP_TIMEOUT, run)
            .await
            .map_err(|_| EngineError::Call(format!("{} help timed out", flag)))?
            .map_err(|e| EngineError::Call(format!("{:?} {} help: {}", binary, flag, e)))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Wait for QEMU to create the QMP socket, failing early if it exits.
    async fn wait_for_socket(
        &self,
        name: &str,
        process: &mut Child,
        paths: &VmPaths,
    ) -> Result<(), EngineError> {
        for _ in 0..SOCKET_WAIT_ATTEMPTS {
            if tokio::fs::try_exists(&paths.qmp_socket).await.unwrap_or(false) {
                return Ok(());
            }
            if let Ok(Some(status)) = process.try_wait() {
                let log = tokio::fs::read_to_string(&paths.log).await.unwrap_or_default();
                return Err(EngineError::Spawn(format!(
                    "VM {} exited during startup ({}): {}",
                    name,
                    status,
                    log.lines().last().unwrap_or_default()
                )));
            }
            tokio::time::sleep(SOCKET_WAIT_INTERVAL).await;
        }
        Err(EngineError::Spawn(format!(
            "QMP socket {:?} did not appear",
            paths.qmp_socket
        )))
    }
}

#[async_trait]
impl NativeEngine for QemuEngine {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn features(&self) -> EngineFeatures {
        EngineFeatures::all()
    }

    async fn is_available(&self) -> bool {
        self.any_binary().is_some()
    }

    async fn start_vm(&self, config: &VmConfig) -> Result<bool, EngineError> {
        let paths = VmPaths::new(&self.settings, &config.name)?;
        let _reservation = self.reserve(&config.name).await?;

        let binary = self.binary(config.arch_type).ok_or_else(|| {
            EngineError::Spawn(format!("{} not found", config.arch_type.qemu_binary()))
        })?;

        for dir in [&self.settings.runtime_dir, &self.settings.log_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| EngineError::Spawn(format!("create {:?}: {}", dir, e)))?;
        }

        self.ensure_disk(config, &paths).await?;
        let _ = tokio::fs::remove_file(&paths.qmp_socket).await;

        let args = build_args(config, &paths, &self.settings, Self::kvm_usable());
        info!("Spawning {:?} for VM {}", binary, config.name);
        debug!("QEMU args: {:?}", args);

        let console = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&paths.log)
            .map_err(|e| EngineError::Spawn(format!("open {:?}: {}", paths.log, e)))?;
        let console_err = console
            .try_clone()
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        let mut process = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(console)
            .stderr(console_err)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn(format!("{:?}: {}", binary, e)))?;

        self.wait_for_socket(&config.name, &mut process, &paths).await?;

        info!("VM {} started (pid {:?})", config.name, process.id());
        self.vms
            .lock()
            .await
            .insert(config.name.clone(), VmInstance { process, paths });
        Ok(true)
    }

    async fn stop_vm(&self, name: &str) -> Result<bool, EngineError> {
        let mut instance = {
            let mut vms = self.vms.lock().await;
            vms.remove(name)
                .ok_or_else(|| EngineError::VmNotFound(name.to_string()))?
        };

        if let Err(e) = qmp::execute_once(
            &instance.paths.qmp_socket,
            self.settings.monitor_timeout(),
            "quit",
            None,
        )
        .await
        {
            debug!("QMP quit for VM {} failed: {}", name, e);
        }

        match tokio::time::timeout(QUIT_GRACE, instance.process.wait()).await {
            Ok(Ok(status)) => info!("VM {} exited with {}", name, status),
            _ => {
                warn!("VM {} did not quit in time, killing", name);
                if let Err(e) = instance.process.kill().await {
                    warn!("Failed to kill VM {}: {}", name, e);
                }
            }
        }

        let _ = tokio::fs::remove_file(&instance.paths.qmp_socket).await;
        Ok(true)
    }

    async fn get_vm_status(&self, name: &str) -> Result<String, EngineError> {
        let socket = {
            let mut vms = self.vms.lock().await;
            let Some(instance) = vms.get_mut(name) else {
                if self.is_starting(name) {
                    return Ok("starting".into());
                }
                return Ok("stopped".into());
            };
            match instance.process.try_wait() {
                Ok(Some(status)) if status.success() => return Ok("stopped".into()),
                Ok(Some(_)) => return Ok("failed".into()),
                Ok(None) => instance.paths.qmp_socket.clone(),
                Err(e) => return Err(EngineError::Call(e.to_string())),
            }
        };

        let status = qmp::execute_once(
            &socket,
            self.settings.monitor_timeout(),
            "query-status",
            None,
        )
        .await?;
        let state = status["status"].as_str().unwrap_or_default();
        Ok(parse::run_state(state).to_string())
    }

    async fn pause_vm(&self, name: &str) -> Result<bool, EngineError> {
        self.execute(name, "stop").await
    }

    async fn resume_vm(&self, name: &str) -> Result<bool, EngineError> {
        self.execute(name, "cont").await
    }

    async fn get_vm_logs(
        &self,
        name: &str,
        start_line: Option<usize>,
    ) -> Result<Vec<String>, EngineError> {
        let path = VmPaths::new(&self.settings, name)?.log;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::VmNotFound(name.to_string()));
            }
            Err(e) => return Err(EngineError::Call(format!("read {:?}: {}", path, e))),
        };
        Ok(content
            .lines()
            .skip(start_line.unwrap_or(0))
            .map(str::to_string)
            .collect())
    }

    async fn create_snapshot(&self, name: &str, snapshot: &str) -> Result<bool, EngineError> {
        self.snapshot_command(name, "savevm", snapshot).await
    }

    async fn restore_snapshot(&self, name: &str, snapshot: &str) -> Result<bool, EngineError> {
        self.snapshot_command(name, "loadvm", snapshot).await
    }

    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<bool, EngineError> {
        self.snapshot_command(name, "delvm", snapshot).await
    }

    async fn list_snapshots(&self, name: &str) -> Result<Vec<String>, EngineError> {
        let socket = self.require_socket(name).await?;
        let output =
            qmp::hmp_once(&socket, self.settings.monitor_timeout(), "info snapshots").await?;
        Ok(parse::snapshot_tags(&output))
    }

    async fn get_device_capabilities(&self) -> Result<DeviceCapabilities, EngineError> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .unwrap_or_default();
        Ok(DeviceCapabilities {
            kvm_supported: Self::kvm_usable(),
            jit_supported: self.any_binary().is_some(),
            total_memory: parse::total_memory_mib(&meminfo).unwrap_or(0),
            cpu_cores: u32::try_from(num_cpus::get()).unwrap_or(u32::MAX),
            machines: None,
        })
    }

    async fn kvm_supported(&self) -> Result<bool, EngineError> {
        Ok(Self::kvm_usable())
    }

    async fn jit_supported(&self) -> Result<bool, EngineError> {
        Ok(self.any_binary().is_some())
    }

    async fn scan_devices(&self) -> Result<DeviceScan, EngineError> {
        let binary = self
            .any_binary()
            .ok_or_else(|| EngineError::Call("no qemu-system binary found".into()))?;
        info!("Scanning devices with {:?}", binary);

        let machines = parse::machines(&self.help_output(&binary, "-machine").await?);
        let displays = parse::displays(&self.help_output(&binary, "-display").await?);
        let (networks, audios) = parse::devices(&self.help_output(&binary, "-device").await?);

        let mut capabilities = self.get_device_capabilities().await?;
        capabilities.machines = Some(machines.clone());

        Ok(DeviceScan {
            capabilities,
            catalog: DeviceCatalog {
                machines,
                displays,
                networks,
                audios,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &std::path::Path) -> QemuSettings {
        QemuSettings {
            binary_dir: Some(dir.join("bin")),
            qemu_img: Some(dir.join("bin/qemu-img")),
            runtime_dir: dir.join("run"),
            log_dir: dir.join("logs"),
            rdp_host_port: 3390,
            ssh_host_port: 2222,
            vnc_display: 0,
            monitor_timeout_ms: 500,
        }
    }

    fn config(name: &str) -> VmConfig {
        VmConfig {
            name: name.into(),
            arch_type: ArchType::X86_64,
            iso_path: None,
            disk_size_gb: 1,
            memory_mb: 256,
            cpu_count: 1,
            accel: None,
            display: None,
            nographic: true,
            efi_firmware: None,
        }
    }

    #[tokio::test]
    async fn unknown_vm_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let engine = QemuEngine::new(settings(dir.path()));
        assert_eq!(engine.get_vm_status("ghost").await.unwrap(), "stopped");
        assert_eq!(
            engine.stop_vm("ghost").await.unwrap_err(),
            EngineError::VmNotFound("ghost".into())
        );
        assert_eq!(
            engine.pause_vm("ghost").await.unwrap_err(),
            EngineError::VmNotFound("ghost".into())
        );
    }

    #[tokio::test]
    async fn missing_emulator_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = QemuEngine::new(settings(dir.path()));
        assert!(!engine.is_available().await);
        assert!(!engine.jit_supported().await.unwrap());

        let err = engine.start_vm(&config("vm1")).await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn(_)));
        assert_eq!(engine.get_vm_status("vm1").await.unwrap(), "stopped");
    }

    #[tokio::test]
    async fn logs_are_read_from_start_line() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        std::fs::create_dir_all(&settings.log_dir).unwrap();
        std::fs::write(settings.log_dir.join("vm1.log"), "boot\nkernel\nlogin:\n").unwrap();

        let engine = QemuEngine::new(settings);
        assert_eq!(engine.get_vm_logs("vm1", None).await.unwrap().len(), 3);
        assert_eq!(
            engine.get_vm_logs("vm1", Some(1)).await.unwrap(),
            vec!["kernel", "login:"]
        );
        assert!(engine.get_vm_logs("vm1", Some(10)).await.unwrap().is_empty());
        assert_eq!(
            engine.get_vm_logs("vm2", None).await.unwrap_err(),
            EngineError::VmNotFound("vm2".into())
        );
    }

    #[tokio::test]
    async fn logs_refuse_names_outside_the_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        std::fs::create_dir_all(&settings.log_dir).unwrap();
        std::fs::write(dir.path().join("secret.log"), "token\n").unwrap();

        let engine = QemuEngine::new(settings);
        assert_eq!(
            engine.get_vm_logs("../secret", None).await.unwrap_err(),
            EngineError::InvalidName("../secret".into())
        );
        assert!(matches!(
            engine.start_vm(&config("../run/vm1")).await,
            Err(EngineError::InvalidName(_))
        ));
    }

    /// An emulator that never opens its QMP socket.
    #[cfg(unix)]
    fn install_silent_emulator(settings: &QemuSettings) {
        use std::os::unix::fs::PermissionsExt;

        let bin = settings.binary_dir.clone().unwrap();
        std::fs::create_dir_all(&bin).unwrap();
        let emulator = bin.join(ArchType::X86_64.qemu_binary());
        std::fs::write(&emulator, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&emulator, std::fs::Permissions::from_mode(0o755)).unwrap();

        std::fs::create_dir_all(&settings.runtime_dir).unwrap();
        std::fs::write(settings.runtime_dir.join("vm1.qcow2"), b"").unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_start_does_not_block_other_vms() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        install_silent_emulator(&settings);
        let engine = std::sync::Arc::new(QemuEngine::new(settings));

        let start = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start_vm(&config("vm1")).await }
        });
        while !engine.is_starting("vm1") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let asked = tokio::time::Instant::now();
        assert_eq!(engine.get_vm_status("vm2").await.unwrap(), "stopped");
        assert_eq!(
            engine.get_vm_logs("vm2", None).await.unwrap_err(),
            EngineError::VmNotFound("vm2".into())
        );
        assert!(asked.elapsed() < Duration::from_secs(1));

        assert_eq!(engine.get_vm_status("vm1").await.unwrap(), "starting");
        assert_eq!(
            engine.start_vm(&config("vm1")).await.unwrap_err(),
            EngineError::VmAlreadyExists("vm1".into())
        );
        assert!(!start.is_finished());

        start.abort();
        let _ = start.await;
        assert!(!engine.is_starting("vm1"));
        assert_eq!(engine.get_vm_status("vm1").await.unwrap(), "stopped");
    }

    #[tokio::test]
    async fn capabilities_report_host_resources() {
        let dir = tempfile::tempdir().unwrap();
        let engine = QemuEngine::new(settings(dir.path()));
        let capabilities = engine.get_device_capabilities().await.unwrap();
        assert!(capabilities.cpu_cores >= 1);
        assert!(!capabilities.jit_supported);
        assert!(capabilities.machines.is_none());
    }

    #[tokio::test]
    async fn scan_without_emulator_fails() {
        let dir = tempfile::tempdir().unwrap();
        let engine = QemuEngine::new(settings(dir.path()));
        assert!(matches!(
            engine.scan_devices().await,
            Err(EngineError::Call(_))
        ));
    }
}
