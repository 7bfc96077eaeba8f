use thiserror::Error;

/// Misuse of the saga runner. Callers decide whether to log, ignore or escalate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SagaError {
    #[error("saga `{name}` is already running")]
    AlreadyRunning { name: String },

    #[error("saga `{name}` is not running")]
    NotRunning { name: String },
}

/// Errors raised inside the websocket connection task
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid websocket URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("JSON serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
