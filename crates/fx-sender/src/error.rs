use fx_protocol::ValidationError;

/// Configuration that cannot be turned into a runnable sender.
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

/// Synchronous `send_request` rejection; the request never left the tracker.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// A previous response marked this effect unavailable on the game.
    #[error("effect `{0}` is known to be unavailable")]
    EffectUnavailable(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("no active connection")]
    NotConnected,
}

/// Terminal failure delivered through a request's response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    /// No response arrived within the initial-response timeout.
    #[error("no response within the initial timeout")]
    Timeout,
    /// An effect request was sent while the connection was not open.
    #[error("connection is not accepting requests")]
    NotAccepting,
    /// The handler shut down before the request completed.
    #[error("handler shutting down")]
    Shutdown,
    #[error("connection closed")]
    Closed,
}
