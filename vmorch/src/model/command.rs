use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumString};

use crate::display::backend::{BackendKind, DisplayTarget};
use crate::errors::{ConfigError, Error};
use crate::model::vm_config::RawVmConfig;
use crate::model::vm_status::VmStatus;

/// What callers put on the command channel.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    /// Opaque correlation id, echoed back on the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,
    /// Kind-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandEnvelope {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn vm_id(mut self, id: impl Into<String>) -> Self {
        self.vm_id = Some(id.into());
        self
    }

    pub fn vm_name(mut self, name: impl Into<String>) -> Self {
        self.vm_name = Some(name.into());
        self
    }

    pub fn vm_config(mut self, config: Value) -> Self {
        self.vm_config = Some(config);
        self
    }

    pub fn snapshot_name(mut self, name: impl Into<String>) -> Self {
        self.snapshot_name = Some(name.into());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    fn target(&self) -> VmTarget {
        VmTarget {
            vm_id: self.vm_id.clone(),
            vm_name: self.vm_name.clone(),
        }
    }

    fn extra_string(&self, key: &'static str) -> Option<String> {
        self.extra
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn extra_u64(&self, key: &'static str) -> Result<Option<u64>, Error> {
        match self.extra.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| {
                Error::InvalidCommand(format!("`{}` must be a non-negative integer", key))
            }),
        }
    }

    fn require_string(&self, key: &'static str) -> Result<String, Error> {
        self.extra_string(key)
            .filter(|s| !s.trim().is_empty())
            .ok_or(Error::Config(ConfigError::MissingField(key)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum CommandKind {
    StartVm,
    StopVm,
    PauseVm,
    ResumeVm,
    GetStatus,
    GetLogs,
    CreateSnapshot,
    RestoreSnapshot,
    DeleteSnapshot,
    ListSnapshots,
    GetKvmInfo,
    ScanDevices,
    RefreshDevices,
    ClearDeviceCache,
    CreateDisplaySession,
    ConnectDisplay,
    DisconnectDisplay,
    DisplayStatus,
    DisplaySetTimeout,
    DisplayCheckTimeout,
    DisplayRequestCancel,
    DisplayForceCleanup,
    DestroyDisplaySession,
    ListDisplaySessions,
    ForwardPort,
    SetupNetwork,
    MountSharedDir,
    SetDeviceInfo,
}

impl CommandKind {
    /// Commands that may wait on a full device scan. The command loop
    /// answers these from their own task.
    pub fn runs_detached(&self) -> bool {
        matches!(self, CommandKind::RefreshDevices)
    }
}

/// A VM addressed by identifier, name, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmTarget {
    pub vm_id: Option<String>,
    pub vm_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRef {
    pub vm_name: String,
    pub snapshot_name: String,
}

/// A validated command, ready for routing.
#[derive(Debug, Clone)]
pub enum Command {
    StartVm(RawVmConfig),
    StopVm(VmTarget),
    PauseVm(VmTarget),
    ResumeVm(VmTarget),
    GetStatus(VmTarget),
    GetLogs {
        target: VmTarget,
        start_line: Option<usize>,
    },
    CreateSnapshot(SnapshotRef),
    RestoreSnapshot(SnapshotRef),
    DeleteSnapshot(SnapshotRef),
    ListSnapshots {
        vm_name: String,
    },
    GetKvmInfo,
    ScanDevices,
    RefreshDevices,
    ClearDeviceCache,
    CreateDisplaySession {
        kind: BackendKind,
    },
    ConnectDisplay {
        client_id: String,
        target: DisplayTarget,
    },
    DisconnectDisplay {
        client_id: String,
    },
    DisplayStatus {
        client_id: String,
    },
    DisplaySetTimeout {
        client_id: String,
        seconds: u64,
    },
    DisplayCheckTimeout {
        client_id: String,
    },
    DisplayRequestCancel {
        client_id: String,
    },
    DisplayForceCleanup {
        client_id: String,
    },
    DestroyDisplaySession {
        client_id: String,
    },
    ListDisplaySessions,
    /// A known command the engine has no entry point for yet.
    Unbacked(CommandKind),
}

impl TryFrom<CommandEnvelope> for Command {
    type Error = Error;

    fn try_from(envelope: CommandEnvelope) -> Result<Self, Self::Error> {
        let raw_kind = envelope.command.trim();
        if raw_kind.is_empty() {
            return Err(Error::InvalidCommand("missing `command` field".into()));
        }
        let kind: CommandKind = raw_kind
            .parse()
            .map_err(|_| Error::NotImplemented(raw_kind.to_string()))?;

        let command = match kind {
            CommandKind::StartVm => {
                let value = envelope
                    .vm_config
                    .clone()
                    .ok_or(Error::Config(ConfigError::MissingField("vmConfig")))?;
                Command::StartVm(RawVmConfig::from_value(value)?)
            }
            CommandKind::StopVm => Command::StopVm(envelope.target()),
            CommandKind::PauseVm => Command::PauseVm(envelope.target()),
            CommandKind::ResumeVm => Command::ResumeVm(envelope.target()),
            CommandKind::GetStatus => Command::GetStatus(envelope.target()),
            CommandKind::GetLogs => Command::GetLogs {
                target: envelope.target(),
                start_line: envelope
                    .extra_u64("startLine")?
                    .map(|n| {
                        usize::try_from(n).map_err(|_| {
                            Error::InvalidCommand(format!("`startLine` {} is out of range", n))
                        })
                    })
                    .transpose()?,
            },
            CommandKind::CreateSnapshot => Command::CreateSnapshot(snapshot_ref(&envelope)),
            CommandKind::RestoreSnapshot => Command::RestoreSnapshot(snapshot_ref(&envelope)),
            CommandKind::DeleteSnapshot => Command::DeleteSnapshot(snapshot_ref(&envelope)),
            CommandKind::ListSnapshots => Command::ListSnapshots {
                vm_name: snapshot_ref(&envelope).vm_name,
            },
            CommandKind::GetKvmInfo => Command::GetKvmInfo,
            CommandKind::ScanDevices => Command::ScanDevices,
            CommandKind::RefreshDevices => Command::RefreshDevices,
            CommandKind::ClearDeviceCache => Command::ClearDeviceCache,
            CommandKind::CreateDisplaySession => {
                let kind = envelope.require_string("backendKind")?;
                Command::CreateDisplaySession {
                    kind: kind.parse().map_err(|_| {
                        Error::InvalidCommand(format!("unknown display backend '{}'", kind))
                    })?,
                }
            }
            CommandKind::ConnectDisplay => {
                let client_id = envelope.require_string("clientId")?;
                let target: DisplayTarget =
                    serde_json::from_value(Value::Object(envelope.extra.clone()))
                        .map_err(|e| Error::InvalidCommand(e.to_string()))?;
                if target.host.trim().is_empty() {
                    return Err(ConfigError::MissingField("host").into());
                }
                if target.port == 0 {
                    return Err(ConfigError::InvalidField {
                        field: "port",
                        reason: "must be between 1 and 65535".into(),
                    }
                    .into());
                }
                Command::ConnectDisplay { client_id, target }
            }
            CommandKind::DisconnectDisplay => Command::DisconnectDisplay {
                client_id: envelope.require_string("clientId")?,
            },
            CommandKind::DisplayStatus => Command::DisplayStatus {
                client_id: envelope.require_string("clientId")?,
            },
            CommandKind::DisplaySetTimeout => Command::DisplaySetTimeout {
                client_id: envelope.require_string("clientId")?,
                seconds: envelope
                    .extra_u64("timeoutSeconds")?
                    .ok_or(Error::Config(ConfigError::MissingField("timeoutSeconds")))?,
            },
            CommandKind::DisplayCheckTimeout => Command::DisplayCheckTimeout {
                client_id: envelope.require_string("clientId")?,
            },
            CommandKind::DisplayRequestCancel => Command::DisplayRequestCancel {
                client_id: envelope.require_string("clientId")?,
            },
            CommandKind::DisplayForceCleanup => Command::DisplayForceCleanup {
                client_id: envelope.require_string("clientId")?,
            },
            CommandKind::DestroyDisplaySession => Command::DestroyDisplaySession {
                client_id: envelope.require_string("clientId")?,
            },
            CommandKind::ListDisplaySessions => Command::ListDisplaySessions,
            CommandKind::ForwardPort
            | CommandKind::SetupNetwork
            | CommandKind::MountSharedDir
            | CommandKind::SetDeviceInfo => Command::Unbacked(kind),
        };

        Ok(command)
    }
}

fn snapshot_ref(envelope: &CommandEnvelope) -> SnapshotRef {
    SnapshotRef {
        vm_name: envelope
            .vm_name
            .clone()
            .or_else(|| envelope.vm_id.clone())
            .unwrap_or_default(),
        snapshot_name: envelope.snapshot_name.clone().unwrap_or_default(),
    }
}

/// What the dispatcher returns for every command.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            id: None,
            success: true,
            message: message.into(),
            vm_id: None,
            status: None,
            data: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            message: if message.trim().is_empty() {
                "command failed".to_string()
            } else {
                message
            },
            ..Self::ok("")
        }
    }

    pub fn with_vm_id(mut self, vm_id: impl Into<String>) -> Self {
        self.vm_id = Some(vm_id.into());
        self
    }

    pub fn with_status(mut self, status: impl ToString) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn vm_status(&self) -> Option<VmStatus> {
        self.status.as_deref().map(VmStatus::normalize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<Command, Error> {
        let envelope: CommandEnvelope = serde_json::from_value(value).unwrap();
        Command::try_from(envelope)
    }

    #[test]
    fn unknown_kind_is_not_implemented() {
        let err = parse(json!({ "command": "teleport_vm" })).unwrap_err();
        assert!(matches!(err, Error::NotImplemented(ref kind) if kind == "teleport_vm"));
        assert_eq!(err.to_string(), "command `teleport_vm` is not implemented");
    }

    #[test]
    fn missing_kind_is_invalid() {
        assert!(matches!(parse(json!({})), Err(Error::InvalidCommand(_))));
    }

    #[test]
    fn start_vm_requires_a_config() {
        let err = parse(json!({ "command": "start_vm" })).unwrap_err();
        assert_eq!(err.to_string(), "missing required field `vmConfig`");
    }

    #[test]
    fn kind_specific_fields_are_read_from_the_envelope() {
        let command = parse(json!({
            "command": "get_logs", "vmId": "vm1", "startLine": 10
        }))
        .unwrap();
        match command {
            Command::GetLogs { target, start_line } => {
                assert_eq!(target.vm_id.as_deref(), Some("vm1"));
                assert_eq!(start_line, Some(10));
            }
            other => panic!("unexpected command {:?}", other),
        }

        let command = parse(json!({
            "command": "connect_display", "clientId": "c1",
            "host": "127.0.0.1", "port": 5900
        }))
        .unwrap();
        assert!(matches!(command, Command::ConnectDisplay { ref client_id, ref target }
            if client_id == "c1" && target.port == 5900));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn start_line_keeps_its_full_value() {
        let command = parse(json!({
            "command": "get_logs", "vmId": "vm1", "startLine": u64::MAX
        }))
        .unwrap();
        assert!(matches!(command, Command::GetLogs { start_line: Some(usize::MAX), .. }));

        let err = parse(json!({ "command": "get_logs", "vmId": "vm1", "startLine": -1 }))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCommand(_)));
    }

    #[test]
    fn only_refresh_runs_detached() {
        assert!(CommandKind::RefreshDevices.runs_detached());
        assert!(!CommandKind::ScanDevices.runs_detached());
        assert!(!CommandKind::DisplayForceCleanup.runs_detached());
        assert!(matches!(
            parse(json!({ "command": "list_display_sessions" })),
            Ok(Command::ListDisplaySessions)
        ));
    }

    #[test]
    fn snapshot_commands_fall_back_to_vm_id() {
        let command = parse(json!({
            "command": "create_snapshot", "vmId": "vm1", "snapshotName": "s1"
        }))
        .unwrap();
        assert!(matches!(command, Command::CreateSnapshot(SnapshotRef { ref vm_name, .. })
            if vm_name == "vm1"));
    }

    #[test]
    fn connect_display_validates_port() {
        let err = parse(json!({
            "command": "connect_display", "clientId": "c1", "host": "h", "port": 0
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::InvalidField { field: "port", .. })));
    }

    #[test]
    fn backend_kind_is_parsed() {
        let command = parse(json!({ "command": "create_display_session", "backendKind": "VNC" }))
            .unwrap();
        assert!(matches!(
            command,
            Command::CreateDisplaySession { kind: BackendKind::Vnc }
        ));
    }

    #[test]
    fn failure_always_has_a_message() {
        let result = CommandResult::failure("  ");
        assert!(!result.success);
        assert_eq!(result.message, "command failed");
    }

    #[test]
    fn result_serializes_without_empty_fields() {
        let value = serde_json::to_value(CommandResult::ok("done").with_vm_id("vm1")).unwrap();
        assert_eq!(value, json!({ "success": true, "message": "done", "vmId": "vm1" }));
    }
}
