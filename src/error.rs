//! Error types for the bridge

use thiserror::Error;

/// Bridge-wide error kinds
///
/// Nothing crosses a component boundary by unwinding; failures either
/// become `CancelRejected` responses on the queue or set a book's
/// refresh flag.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("authentication failure: {0}")]
    Auth(String),

    #[error("exchange rejected request: code {code}: {msg}")]
    Rejected { code: i64, msg: String },

    #[error("depth sequence gap: expected first id <= {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("stale depth update")]
    Stale,

    #[error("request timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("credentials missing or malformed: {0}")]
    CredentialsMissing(String),

    #[error("order book reconciliation attempts exhausted for {0}")]
    ReconcileExhausted(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BridgeError::Timeout
        } else {
            BridgeError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
