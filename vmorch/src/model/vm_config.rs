use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};

use crate::errors::ConfigError;

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString,
)]
pub enum ArchType {
    #[default]
    #[serde(rename = "aarch64")]
    #[strum(serialize = "aarch64")]
    Aarch64,

    #[serde(rename = "x86_64")]
    #[strum(serialize = "x86_64")]
    X86_64,

    #[serde(rename = "i386")]
    #[strum(serialize = "i386")]
    I386,
}

impl ArchType {
    pub const ALL: [ArchType; 3] = [ArchType::Aarch64, ArchType::X86_64, ArchType::I386];

    pub fn qemu_binary(&self) -> &'static str {
        match self {
            ArchType::Aarch64 => "qemu-system-aarch64",
            ArchType::X86_64 => "qemu-system-x86_64",
            ArchType::I386 => "qemu-system-i386",
        }
    }
}

/// Canonical VM creation request, as produced by [`normalize`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmConfig {
    pub name: String,
    pub arch_type: ArchType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iso_path: Option<String>,
    #[serde(rename = "diskSizeGB")]
    pub disk_size_gb: u32,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u32,
    pub cpu_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    pub nographic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub efi_firmware: Option<String>,
}

/// A VM creation request as callers send it: canonical fields, legacy
/// aliases, or a mix of both. Numeric fields are kept untyped so that a bad
/// value is reported against its field in check order instead of failing the
/// whole document.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RawVmConfig {
    pub name: Option<String>,
    pub arch_type: Option<String>,
    pub arch: Option<String>,
    pub iso_path: Option<String>,
    #[serde(rename = "diskSizeGB")]
    pub disk_size_gb: Option<Value>,
    pub disk_size: Option<Value>,
    #[serde(rename = "memoryMB")]
    pub memory_mb: Option<Value>,
    pub memory: Option<Value>,
    pub cpu_count: Option<Value>,
    pub cpu_cores: Option<Value>,
    pub accel: Option<String>,
    pub accel_mode: Option<String>,
    pub display: Option<String>,
    pub display_mode: Option<String>,
    pub nographic: Option<bool>,
    pub efi_firmware: Option<String>,
}

impl RawVmConfig {
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        if !value.is_object() {
            return Err(ConfigError::Malformed("expected a JSON object".into()));
        }
        serde_json::from_value(value).map_err(|e| ConfigError::Malformed(e.to_string()))
    }
}

impl From<&VmConfig> for RawVmConfig {
    fn from(config: &VmConfig) -> Self {
        RawVmConfig {
            name: Some(config.name.clone()),
            arch_type: Some(config.arch_type.to_string()),
            iso_path: config.iso_path.clone(),
            disk_size_gb: Some(config.disk_size_gb.into()),
            memory_mb: Some(config.memory_mb.into()),
            cpu_count: Some(config.cpu_count.into()),
            accel: config.accel.clone(),
            display: config.display.clone(),
            nographic: Some(config.nographic),
            efi_firmware: config.efi_firmware.clone(),
            ..Default::default()
        }
    }
}

/// VM names become file names under the runtime and log directories, so
/// only `[A-Za-z0-9._-]` is allowed and a name made only of dots is refused.
pub fn is_valid_vm_name(name: &str) -> bool {
    !name.is_empty()
        && !name.chars().all(|c| c == '.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Validate and canonicalize a creation request.
///
/// Checks run in a fixed order (name, memory, cpu, disk, arch) and the first
/// failure is returned. A canonical field always wins over its alias.
pub fn normalize(raw: RawVmConfig) -> Result<VmConfig, ConfigError> {
    let name = non_empty(raw.name).ok_or(ConfigError::MissingField("name"))?;
    if !is_valid_vm_name(&name) {
        return Err(ConfigError::InvalidField {
            field: "name",
            reason: format!("`{}` may only contain letters, digits, '.', '_' and '-'", name),
        });
    }

    let memory_mb = positive_int("memoryMB", present(raw.memory_mb).or(present(raw.memory)), 1)?;
    let cpu_count = positive_int("cpuCount", present(raw.cpu_count).or(present(raw.cpu_cores)), 1)?;
    let disk_size_gb = positive_int(
        "diskSizeGB",
        present(raw.disk_size_gb).or(present(raw.disk_size)),
        1,
    )?;

    let arch_type = match non_empty(raw.arch_type).or(non_empty(raw.arch)) {
        Some(arch) => arch.parse().map_err(|_| ConfigError::InvalidField {
            field: "archType",
            reason: format!("unknown architecture '{}'", arch),
        })?,
        None => ArchType::default(),
    };

    Ok(VmConfig {
        name,
        arch_type,
        iso_path: non_empty(raw.iso_path),
        disk_size_gb,
        memory_mb,
        cpu_count,
        accel: non_empty(raw.accel).or(non_empty(raw.accel_mode)),
        display: non_empty(raw.display).or(non_empty(raw.display_mode)),
        nographic: raw.nographic.unwrap_or(false),
        efi_firmware: non_empty(raw.efi_firmware),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn present(value: Option<Value>) -> Option<Value> {
    value.filter(|v| !v.is_null())
}

fn positive_int(field: &'static str, value: Option<Value>, min: u64) -> Result<u32, ConfigError> {
    let value = value.ok_or(ConfigError::MissingField(field))?;
    let invalid = |reason: String| ConfigError::InvalidField { field, reason };

    let number = match &value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .ok_or_else(|| invalid(format!("expected a whole number >= {}, got {}", min, n)))?,
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid(format!("expected a whole number, got '{}'", s)))?,
        other => return Err(invalid(format!("expected a number, got {}", other))),
    };

    if number < min {
        return Err(invalid(format!("must be at least {}", min)));
    }
    u32::try_from(number).map_err(|_| invalid(format!("{} is out of range", number)))
}
