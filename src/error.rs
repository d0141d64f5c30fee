//! Error types shared by the pipeline, the state stores and the CDC sources.

use thiserror::Error;

/// Failure of a state-store backend.
#[derive(Debug, Error)]
pub enum StateBackendError {
    #[error("backend i/o error: {0}")]
    Io(String),

    #[error("table {table} is missing column {column} and column creation is disabled")]
    SchemaMissing { table: String, column: String },

    #[error("column {column}: expected {expected}, got {got}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failure to decode an external payload into a record, or a record into a
/// user type.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("malformed json payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Failure of a CDC source while talking to the server.
#[derive(Debug, Error)]
pub enum CdcError {
    /// Read/connect failure; the capture worker backs off and retries.
    #[error("transient source failure: {0}")]
    Transient(String),

    /// The server-side artefact (capture instance, slot) already exists.
    /// Swallowed when configuring idempotently.
    #[error("server-side capture already configured")]
    AlreadyConfigured,

    #[error("malformed change payload: {0}")]
    Malformed(#[from] SerializationError),

    #[error(transparent)]
    StateBackend(#[from] StateBackendError),
}

/// Top-level error surfaced by `process`, `start` and the builder runtime.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("illegal configuration: {0}")]
    IllegalConfiguration(String),

    #[error(transparent)]
    StateBackend(#[from] StateBackendError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Source(#[from] CdcError),
}

impl StreamError {
    pub(crate) fn illegal(msg: impl Into<String>) -> Self {
        StreamError::IllegalConfiguration(msg.into())
    }
}
