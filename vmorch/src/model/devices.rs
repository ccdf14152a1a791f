use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceOption {
    pub id: String,
    pub name: String,
    pub desc: String,
}

impl DeviceOption {
    pub fn new(id: impl Into<String>, desc: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            desc: desc.into(),
        }
    }
}

/// What the host and engine can offer a guest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    pub kvm_supported: bool,
    pub jit_supported: bool,
    /// MiB
    pub total_memory: u64,
    pub cpu_cores: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machines: Option<Vec<DeviceOption>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceCatalog {
    pub machines: Vec<DeviceOption>,
    pub displays: Vec<DeviceOption>,
    pub networks: Vec<DeviceOption>,
    pub audios: Vec<DeviceOption>,
}

/// Output of one engine device scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceScan {
    pub capabilities: DeviceCapabilities,
    pub catalog: DeviceCatalog,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub success: bool,
    /// `true` when served from the cache, `false` for a fresh probe or a hint.
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<DeviceCapabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<DeviceCatalog>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanResult {
    pub fn fresh(scan: DeviceScan) -> Self {
        Self::with_scan(scan, false)
    }

    pub fn cached(scan: DeviceScan) -> Self {
        Self::with_scan(scan, true)
    }

    /// Nothing cached yet; the caller should trigger an asynchronous scan.
    pub fn hint() -> Self {
        Self {
            success: false,
            cached: false,
            capabilities: None,
            catalog: None,
            error: Some("no cached device scan, request an asynchronous scan".into()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::hint()
        }
    }

    pub fn has_data(&self) -> bool {
        self.capabilities.is_some()
    }

    fn with_scan(scan: DeviceScan, cached: bool) -> Self {
        Self {
            success: true,
            cached,
            capabilities: Some(scan.capabilities),
            catalog: Some(scan.catalog),
            error: None,
        }
    }
}
