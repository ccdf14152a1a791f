use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum VmStatus {
    Creating,
    Preparing,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
    Error,
}

impl VmStatus {
    /// Map whatever the engine reported onto a known status. Anything
    /// unrecognized counts as `stopped`.
    pub fn normalize(raw: &str) -> Self {
        raw.trim().parse().unwrap_or(VmStatus::Stopped)
    }

    /// Terminal statuses end status monitoring for the VM.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmStatus::Stopped | VmStatus::Failed | VmStatus::Error)
    }
}
