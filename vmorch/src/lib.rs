pub mod configuration;
pub mod device_cache;
pub mod display;
pub mod engine;
pub mod errors;
pub mod handlers;
#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;
pub mod model;
pub mod qemu;
pub mod registry;
pub mod snapshot;
pub mod startup;
pub mod vm_monitor;

use std::sync::Arc;
use std::time::Duration;

use crate::device_cache::DeviceCapabilityCache;
use crate::display::DisplaySessions;
use crate::engine::{EngineFeatures, NativeEngine};
use crate::registry::VmRegistry;
use crate::snapshot::SnapshotManager;
use crate::vm_monitor::StatusMonitor;

/// Everything a command handler can reach. Cheap to clone.
#[derive(Clone)]
pub struct App {
    engine: Arc<dyn NativeEngine>,
    features: EngineFeatures,
    registry: Arc<VmRegistry>,
    monitor: StatusMonitor,
    snapshots: Arc<SnapshotManager>,
    devices: Arc<DeviceCapabilityCache>,
    displays: Arc<DisplaySessions>,
}

impl App {
    pub fn new(
        engine: Arc<dyn NativeEngine>,
        displays: DisplaySessions,
        poll_interval: Duration,
    ) -> Self {
        let features = engine.features();
        tracing::info!("Using {} engine with {:?}", engine.name(), features);
        Self {
            features,
            registry: Arc::new(VmRegistry::new()),
            monitor: StatusMonitor::new(engine.clone(), poll_interval),
            snapshots: Arc::new(SnapshotManager::new(engine.clone(), features)),
            devices: Arc::new(DeviceCapabilityCache::new(engine.clone())),
            displays: Arc::new(displays),
            engine,
        }
    }

    pub fn engine(&self) -> &dyn NativeEngine {
        self.engine.as_ref()
    }

    pub fn engine_arc(&self) -> Arc<dyn NativeEngine> {
        self.engine.clone()
    }

    pub fn features(&self) -> EngineFeatures {
        self.features
    }

    pub fn registry(&self) -> &VmRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &StatusMonitor {
        &self.monitor
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn devices(&self) -> &DeviceCapabilityCache {
        &self.devices
    }

    pub fn devices_arc(&self) -> Arc<DeviceCapabilityCache> {
        self.devices.clone()
    }

    pub fn displays(&self) -> &DisplaySessions {
        &self.displays
    }

    pub fn registry_arc(&self) -> Arc<VmRegistry> {
        self.registry.clone()
    }
}
