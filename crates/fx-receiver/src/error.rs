use fx_protocol::{CodecError, ValidationError};

/// Configuration that cannot be turned into a runnable receiver.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown role `{0}` (expected \"client\" or \"server\")")]
    UnknownRole(String),
    #[error("port must lie in [1, 65535], got {0}")]
    PortOutOfRange(i64),
    #[error("host must not be empty")]
    EmptyHost,
    #[error("password must not be empty")]
    EmptyPassword,
}

/// Effect handler registration failure.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("a handler is already registered for effect `{0}`")]
    Duplicate(String),
}

/// Failure signalled by user handler code. Translated onto the wire as an
/// EFFECT_RESULT/FAILURE; `NoApplicableTarget` gets its distinguished
/// message.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("no applicable target")]
    NoApplicableTarget,
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Failure writing a response to one or many connections.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("socket closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Codec(#[from] CodecError),
    #[error("invalid packet: {0}")]
    Invalid(#[from] ValidationError),
    /// Aggregated per-connection failures from a broadcast; delivery to the
    /// remaining connections was not affected.
    #[error("broadcast failed on {} connection(s)", .0.len())]
    Broadcast(Vec<(u64, WriteError)>),
}

/// Timed effect lifecycle violation, surfaced synchronously to the caller.
#[derive(Debug, thiserror::Error)]
pub enum TimedEffectError {
    #[error("cannot {op} a timed effect that is {actual}")]
    IllegalState {
        op: &'static str,
        actual: &'static str,
    },
    #[error("timed effect builder is missing {0}")]
    Missing(&'static str),
}
