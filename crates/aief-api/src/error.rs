use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the `aief-api` crate.
///
/// Covers every failure mode across the wire surfaces: service-account
/// authentication, transport, Firestore REST, and the Realtime Database
/// event stream. `aief-core` decides what is retried based on
/// [`is_transient`](Self::is_transient).
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The token endpoint rejected the signed assertion.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// The access token expired or was revoked mid-session.
    #[error("Access token expired -- re-authentication required")]
    TokenExpired,

    /// The service-account key material could not be used (bad PEM, etc.)
    #[error("Invalid service-account credential: {0}")]
    Credential(String),

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    // ── Backend API ─────────────────────────────────────────────────
    /// Structured error from a Google REST surface
    /// (`{"error": {"code", "message", "status"}}`).
    #[error("Backend API error (HTTP {status}): {message}")]
    Api {
        message: String,
        /// Canonical status string, e.g. `"UNAVAILABLE"`, `"PERMISSION_DENIED"`.
        code: Option<String>,
        status: u16,
    },

    // ── Realtime stream ─────────────────────────────────────────────
    /// The event stream could not be opened or broke mid-read.
    #[error("Event stream failed: {0}")]
    Stream(String),

    /// The server cancelled the listener (security rules changed).
    #[error("Listener cancelled by server: {0}")]
    ListenerCancelled(String),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// A value could not be encoded for the backend.
    #[error("Invalid document data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Returns `true` if this error indicates auth has expired
    /// and re-authentication might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::TokenExpired | Self::Api { status: 401, .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    ///
    /// Network, timeout and availability failures are transient;
    /// validation and permission failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().is_some_and(|s| is_transient_status(s.as_u16()))
            }
            Self::Timeout { .. } | Self::TokenExpired | Self::Stream(_) => true,
            Self::Api { status, code, .. } => {
                is_transient_status(*status)
                    || *status == 401
                    || code.as_deref().is_some_and(is_transient_code)
            }
            _ => false,
        }
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::Api { status: 404, .. } => true,
            _ => false,
        }
    }

    /// Extract the canonical API error code, if available.
    pub fn api_error_code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

fn is_transient_code(code: &str) -> bool {
    matches!(
        code,
        "UNAVAILABLE" | "DEADLINE_EXCEEDED" | "ABORTED" | "RESOURCE_EXHAUSTED" | "INTERNAL"
    )
}
