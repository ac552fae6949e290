use thiserror::Error;

#[derive(Error, Debug)]
pub enum VesperError {
    #[error("Compile error in {script}: {message}")]
    Compile { script: String, message: String },

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Runtime not ready")]
    NotReady,

    #[error("No handler registered")]
    NoHandler,

    #[error("Script error: {0}")]
    Script(String),

    #[error("IO context is draining")]
    ContextDraining,

    #[error("IO context is not bound to a request")]
    ContextNotBound,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("KV backend not found for {0}")]
    KvBackendNotFound(String),

    #[error("KV error: {0}")]
    Kv(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shard stopped")]
    ShardStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VesperError {
    /// Returns true for errors caused by the script being rejected at
    /// reload time, as opposed to failures while serving a request.
    pub fn is_reload_failure(&self) -> bool {
        matches!(self, VesperError::Compile { .. } | VesperError::Registration(_))
    }
}

impl From<std::net::AddrParseError> for VesperError {
    fn from(err: std::net::AddrParseError) -> Self {
        VesperError::InvalidConfig(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VesperError>;
