//! The Native Engine boundary.
//!
//! The orchestrator never runs guests itself. Everything it knows about a VM
//! comes through this trait, and every call may block for as long as the
//! engine likes, so callers must not hold locks across it.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::model::devices::{DeviceCapabilities, DeviceScan};
use crate::model::vm_config::VmConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{0} is not supported by this engine")]
    Unsupported(&'static str),

    #[error("VM {0} not found")]
    VmNotFound(String),

    #[error("VM {0} already exists")]
    VmAlreadyExists(String),

    #[error("`{0}` is not a valid VM name")]
    InvalidName(String),

    #[error("Failed to spawn emulator: {0}")]
    Spawn(String),

    #[error("Monitor error: {0}")]
    Monitor(String),

    #[error("{0}")]
    Call(String),
}

/// Optional entry points an engine exposes. Computed once when the
/// application is assembled and consulted by handlers instead of probing the
/// engine on every call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineFeatures {
    pub pause_resume: bool,
    pub snapshots: bool,
    pub logs: bool,
    pub device_capabilities: bool,
    pub device_scan: bool,
}

impl EngineFeatures {
    pub const fn all() -> Self {
        Self {
            pause_resume: true,
            snapshots: true,
            logs: true,
            device_capabilities: true,
            device_scan: true,
        }
    }
}

#[async_trait]
pub trait NativeEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn features(&self) -> EngineFeatures;

    async fn is_available(&self) -> bool;

    /// `true` means the engine accepted the request, not that the guest is
    /// running yet.
    async fn start_vm(&self, config: &VmConfig) -> Result<bool, EngineError>;

    async fn stop_vm(&self, name: &str) -> Result<bool, EngineError>;

    /// Best effort. Values the orchestrator does not recognize are treated
    /// as `stopped`.
    async fn get_vm_status(&self, name: &str) -> Result<String, EngineError>;

    async fn pause_vm(&self, _name: &str) -> Result<bool, EngineError> {
        Err(EngineError::Unsupported("pause_vm"))
    }

    async fn resume_vm(&self, _name: &str) -> Result<bool, EngineError> {
        Err(EngineError::Unsupported("resume_vm"))
    }

    async fn get_vm_logs(
        &self,
        _name: &str,
        _start_line: Option<usize>,
    ) -> Result<Vec<String>, EngineError> {
        Err(EngineError::Unsupported("get_vm_logs"))
    }

    async fn create_snapshot(&self, _name: &str, _snapshot: &str) -> Result<bool, EngineError> {
        Err(EngineError::Unsupported("create_snapshot"))
    }

    async fn restore_snapshot(&self, _name: &str, _snapshot: &str) -> Result<bool, EngineError> {
        Err(EngineError::Unsupported("restore_snapshot"))
    }

    async fn delete_snapshot(&self, _name: &str, _snapshot: &str) -> Result<bool, EngineError> {
        Err(EngineError::Unsupported("delete_snapshot"))
    }

    async fn list_snapshots(&self, _name: &str) -> Result<Vec<String>, EngineError> {
        Err(EngineError::Unsupported("list_snapshots"))
    }

    async fn get_device_capabilities(&self) -> Result<DeviceCapabilities, EngineError> {
        Err(EngineError::Unsupported("get_device_capabilities"))
    }

    async fn kvm_supported(&self) -> Result<bool, EngineError>;

    async fn jit_supported(&self) -> Result<bool, EngineError>;

    /// The expensive device enumeration. Callers go through
    /// [`crate::device_cache::DeviceCapabilityCache`] so that at most one
    /// scan runs at a time.
    async fn scan_devices(&self) -> Result<DeviceScan, EngineError> {
        Err(EngineError::Unsupported("scan_devices"))
    }
}
