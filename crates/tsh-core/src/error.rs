use thiserror::Error;

/// Errors produced by the tsh protocol engine.
#[derive(Debug, Error)]
pub enum TshError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("token error: {0}")]
    Token(String),

    #[error("not connected")]
    NotConnected,

    #[error("giving up after {0} reconnect attempts")]
    ReconnectExhausted(u32),

    #[error("config error: {0}")]
    Config(String),

    #[error("shell error: {0}")]
    Shell(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl TshError {
    /// Whether this error is a per-message routing failure.
    ///
    /// Routing failures are reported to whoever routed the message and never
    /// tear down the connection.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            TshError::SessionNotFound(_)
                | TshError::LimitExceeded(_)
                | TshError::InvalidMessage(_)
                | TshError::Shell(_)
        )
    }
}

impl From<ciborium::de::Error<std::io::Error>> for TshError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        TshError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for TshError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        TshError::Codec(e.to_string())
    }
}

pub type TshResult<T> = Result<T, TshError>;
