// ── Core error types ──
//
// Every failure a consumer of the state client can observe. Configuration
// problems are caught before any network call; backend errors keep the
// underlying `aief_api::Error` as their source so the full cause chain is
// available to callers and logs.

use strum::Display;
use thiserror::Error;

/// Coarse classification of a [`CoreError`], for callers that branch on the
/// kind of failure without matching on variant fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Config,
    BackendInit,
    Operation,
    NotInitialized,
}

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Configuration errors ─────────────────────────────────────────
    /// A required credential or settings field is missing or invalid.
    /// Never retried.
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        /// The offending field, when one field is to blame.
        field: Option<&'static str>,
    },

    // ── Connection errors ────────────────────────────────────────────
    /// The credential material was rejected or the backend was
    /// unreachable while the connection was being set up.
    #[error("Backend initialization failed: {source}")]
    BackendInit {
        #[source]
        source: aief_api::Error,
    },

    /// A document or subscription call was made before `initialize`.
    #[error("State client is not initialized -- call initialize() first")]
    NotInitialized,

    // ── Operation errors ─────────────────────────────────────────────
    /// A backend call failed permanently or exhausted its retries.
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Operation {
        operation: String,
        attempts: u32,
        /// The cause of the last attempt.
        #[source]
        source: aief_api::Error,
    },
}

impl CoreError {
    /// A configuration error not tied to a single field.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            field: None,
        }
    }

    /// A required field is absent or empty.
    pub fn missing_field(field: &'static str) -> Self {
        Self::Config {
            message: format!("missing required field '{field}'"),
            field: Some(field),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Config,
            Self::BackendInit { .. } => ErrorKind::BackendInit,
            Self::NotInitialized => ErrorKind::NotInitialized,
            Self::Operation { .. } => ErrorKind::Operation,
        }
    }

    /// The field a configuration error names, if any.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Config { field, .. } => *field,
            _ => None,
        }
    }

    /// Whether the underlying backend failure was transient. An operation
    /// error can be transient yet final once retries are exhausted.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::BackendInit { source } | Self::Operation { source, .. } => source.is_transient(),
            Self::Config { .. } | Self::NotInitialized => false,
        }
    }
}
