//! Crate-wide error type.
//!
//! Internal APIs return `Result<T, ExecutorError>` so `?` composes across
//! module boundaries. Server handlers translate this into the wire-level
//! `error`/`message` fields (see `server::protocol`); callers outside the
//! process never see this type directly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serde(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("integration failure: {0}")]
    Integration(String),

    #[error("audit chain corrupted: {0}")]
    AuditChain(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for ExecutorError {
    fn from(e: std::io::Error) -> Self {
        ExecutorError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ExecutorError {
    fn from(e: serde_json::Error) -> Self {
        ExecutorError::Serde(e.to_string())
    }
}

impl From<toml::de::Error> for ExecutorError {
    fn from(e: toml::de::Error) -> Self {
        ExecutorError::Config(e.to_string())
    }
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
