use crate::engine::EngineError;

/// A VM creation request that could not be normalized. Always names the
/// offending field.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("malformed VM config: {0}")]
    Malformed(String),
}

impl ConfigError {
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ConfigError::MissingField(field) | ConfigError::InvalidField { field, .. } => {
                Some(field)
            }
            ConfigError::Malformed(_) => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is not supported by the engine")]
    Unsupported(String),

    #[error("{0}")]
    NativeCall(String),

    #[error("connection timed out after {0}s")]
    TimeoutExceeded(u64),

    #[error("{0} was cancelled")]
    Cancelled(String),

    #[error("{0}")]
    Conflict(String),

    #[error("command `{0}` is not implemented")]
    NotImplemented(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unsupported(op) => Error::Unsupported(op.to_string()),
            EngineError::VmNotFound(name) => Error::NotFound(format!("VM {}", name)),
            EngineError::InvalidName(name) => Error::Config(ConfigError::InvalidField {
                field: "name",
                reason: format!("`{}` is not a valid VM name", name),
            }),
            other => Error::NativeCall(other.to_string()),
        }
    }
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_not_found_maps_to_not_found() {
        let err: Error = EngineError::VmNotFound("vm1".into()).into();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(err.to_string(), "VM vm1 not found");
    }

    #[test]
    fn engine_unsupported_keeps_operation_name() {
        let err: Error = EngineError::Unsupported("pause_vm").into();
        assert_eq!(err.to_string(), "pause_vm is not supported by the engine");
    }

    #[test]
    fn engine_invalid_name_is_a_config_error() {
        let err: Error = EngineError::InvalidName("../x".into()).into();
        assert!(matches!(
            err,
            Error::Config(ConfigError::InvalidField { field: "name", .. })
        ));
    }

    #[test]
    fn config_error_reports_field() {
        let err = ConfigError::MissingField("memoryMB");
        assert_eq!(err.field(), Some("memoryMB"));
        assert_eq!(
            Error::from(err).to_string(),
            "missing required field `memoryMB`"
        );
    }
}
