// Shared transport configuration for building reqwest::Client instances.
//
// The token exchange, Firestore and one-shot Realtime Database calls share
// one `reqwest::Client`; event streams get a second client without an
// overall timeout.

use std::time::Duration;

use crate::error::Error;

const USER_AGENT: &str = concat!("aief/", env!("CARGO_PKG_VERSION"));

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound on a whole request/response round trip.
    pub timeout: Duration,
    /// Upper bound on establishing the TCP/TLS connection.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Build a `reqwest::Client` for request/response calls.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(Error::Transport)
    }

    /// Build a `reqwest::Client` for long-lived event streams.
    ///
    /// No overall timeout: a server-sent event stream stays open
    /// indefinitely. Only connection establishment is bounded.
    pub fn build_streaming_client(&self) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(Error::Transport)
    }
}
