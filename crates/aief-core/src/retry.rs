// ── Retry policy ──
//
// Bounded, fixed-delay retry for backend calls. Only transient failures
// are retried; each attempt is capped by the operation timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::config::OperationalSettings;
use crate::error::CoreError;

/// Source of the pause between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// `max_retries` retries after the first attempt, `retry_delay` apart.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(settings: &OperationalSettings, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            max_retries: settings.max_retries,
            retry_delay: settings.retry_delay,
            timeout: settings.timeout,
            sleeper,
        }
    }

    /// Run `call` until it succeeds, fails permanently, or the retry
    /// budget is spent. The error carries the attempt count and the last
    /// cause.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, aief_api::Error>>,
    {
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);

            let result = tokio::time::timeout(self.timeout, call())
                .await
                .unwrap_or_else(|_| {
                    Err(aief_api::Error::Timeout {
                        timeout: self.timeout,
                    })
                });

            match result {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(operation, attempts, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempts <= self.max_retries => {
                    warn!(
                        operation,
                        attempt = attempts,
                        max_retries = self.max_retries,
                        error = %e,
                        "transient backend failure, retrying"
                    );
                    self.sleeper.sleep(self.retry_delay).await;
                }
                Err(source) => {
                    return Err(CoreError::Operation {
                        operation: operation.to_owned(),
                        attempts,
                        source,
                    });
                }
            }
        }
    }
}
