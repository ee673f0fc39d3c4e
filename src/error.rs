use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Error taxonomy for the realtime core.
///
/// Every rejection from an internal async operation is caught and folded into
/// observable state (connection state, call error field, queue status) before
/// it reaches a UI layer. The variants exist so callers can distinguish the
/// recovery path: transport errors want an explicit reconnect, media and
/// signaling errors are fatal to the current call attempt only.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("api error: {0}")]
    Api(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("queue storage error: {0}")]
    Queue(String),
}

impl EngineError {
    /// Whether retrying the same operation can reasonably succeed later
    /// (after a reconnect or a transient network failure clears).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_) | EngineError::NotConnected | EngineError::Api(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Transport(format!("codec: {e}"))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Api(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Queue(e.to_string())
    }
}
