// src/error.rs
use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Which part of the runtime an error belongs to, and therefore how it is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Key store or fingerprint problems. Blocks registration and connect.
    Identity,
    /// Rejected pairing code, challenge or signature. The step must restart.
    Protocol,
    /// Manifest fetch or stream failures. Recovered by the poll timer.
    Sync,
    /// Never surfaced beyond a log line.
    Heartbeat,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("identity unavailable: {0}")]
    Identity(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("local store: {0}")]
    Store(#[from] sqlx::Error),

    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("server rejected request ({status}): {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("registration session expired; enter a new pairing code")]
    SessionExpired,

    #[error("auth challenge expired; request a new challenge")]
    ChallengeExpired,

    #[error("signature: {0}")]
    Signature(String),

    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("stream: {0}")]
    Stream(String),

    #[error("heartbeat: {0}")]
    Heartbeat(String),
}

impl RuntimeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RuntimeError::Identity(_) | RuntimeError::Config(_) | RuntimeError::Store(_) => {
                ErrorClass::Identity
            }
            // 5xx and 429 are transient.
            RuntimeError::Api { status, .. } if *status >= 500 || *status == 429 => ErrorClass::Sync,
            RuntimeError::Validation { .. }
            | RuntimeError::Api { .. }
            | RuntimeError::SessionExpired
            | RuntimeError::ChallengeExpired
            | RuntimeError::Signature(_) => ErrorClass::Protocol,
            RuntimeError::Transport(_) | RuntimeError::Decode(_) | RuntimeError::Stream(_) => {
                ErrorClass::Sync
            }
            RuntimeError::Heartbeat(_) => ErrorClass::Heartbeat,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Identity | ErrorClass::Protocol)
    }

    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        RuntimeError::Validation {
            field,
            message: message.into(),
        }
    }
}
