use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "VMORCH";

#[derive(serde::Deserialize, Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval_secs: u64,
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct ChannelSettings {
    pub capacity: usize,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct DisplaySettings {
    pub default_timeout_secs: u64,
    pub cancel_grace_secs: u64,
}

impl DisplaySettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct QemuSettings {
    /// Directory holding the `qemu-system-*` binaries. Looked up on `PATH`
    /// when unset.
    pub binary_dir: Option<PathBuf>,
    pub qemu_img: Option<PathBuf>,
    pub runtime_dir: PathBuf,
    pub log_dir: PathBuf,
    pub rdp_host_port: u16,
    pub ssh_host_port: u16,
    pub vnc_display: u16,
    pub monitor_timeout_ms: u64,
}

impl QemuSettings {
    pub fn monitor_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor_timeout_ms)
    }
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct Settings {
    pub monitor: MonitorSettings,
    pub channel: ChannelSettings,
    pub display: DisplaySettings,
    pub qemu: QemuSettings,
}

/// `configuration/` next to the workspace root.
pub fn default_configuration_dir() -> PathBuf {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/.."))
        .join("configuration")
}

pub fn get_configuration(configuration_directory: &Path) -> Result<Settings, config::ConfigError> {
    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;
    load(configuration_directory, environment, None)
}

/// Layer `base.yaml`, `<environment>.yaml` and `VMORCH_*` overrides, in that
/// order. `overrides` replaces the process environment when given.
pub fn load(
    configuration_directory: &Path,
    environment: Environment,
    overrides: Option<HashMap<String, String>>,
) -> Result<Settings, config::ConfigError> {
    let environment_filename = format!("{}.yaml", environment.as_str());
    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(configuration_directory.join(environment_filename)).required(false),
        )
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(overrides),
        )
        .build()?;
    settings.try_deserialize::<Settings>()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}
