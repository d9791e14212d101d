//! Retry policy for remote calls
//!
//! Searches, order submission, status checks and file transfers all go through
//! [`retry_with_backoff`], usually wrapped around [`with_timeout`]. Waits go
//! through a [`Sleeper`] so tests can inspect the schedule without waiting, and
//! end as soon as the run's cancellation token fires.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use eodms_dl::clock::TokioSleeper;
//! use eodms_dl::config::RetryConfig;
//! use eodms_dl::retry::{retry_with_backoff, with_timeout};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> eodms_dl::Result<()> {
//! let config = RetryConfig::default();
//! let cancel = CancellationToken::new();
//! let items = retry_with_backoff(&config, &TokioSleeper, &cancel, "status", || {
//!     with_timeout(Duration::from_secs(60), "status", async {
//!         Ok::<_, eodms_dl::Error>(Vec::<String>::new())
//!     })
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::clock::Sleeper;
use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Classifies failures as transient (worth another attempt) or permanent
pub trait IsRetryable {
    /// Whether another attempt could succeed
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Decode errors are permanent; timeouts and failed connects are not
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Remote { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            // The partial file stays on disk, so the next attempt resumes it
            Error::Timeout { .. } | Error::IncompleteTransfer { .. } => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            Error::Config { .. }
            | Error::Authentication(_)
            | Error::Serialization(_)
            | Error::Csv(_)
            | Error::InvalidInput(_)
            | Error::InvalidTransition { .. }
            | Error::NotFound(_)
            | Error::Cancelled
            | Error::Other(_) => false,
        }
    }
}

/// Delay schedule of one retried call
#[derive(Debug)]
struct Backoff<'a> {
    config: &'a RetryConfig,
    next: Duration,
    retries: u32,
}

impl<'a> Backoff<'a> {
    fn new(config: &'a RetryConfig) -> Self {
        Self {
            config,
            next: config.initial_delay.min(config.max_delay),
            retries: 0,
        }
    }

    /// Delay before the next retry, or None once the retry budget is spent
    fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.config.max_attempts {
            return None;
        }
        self.retries += 1;
        let delay = self.next;
        let grown = delay.as_secs_f64() * self.config.backoff_multiplier.max(1.0);
        self.next = Duration::from_secs_f64(grown).min(self.config.max_delay);
        Some(if self.config.jitter {
            add_jitter(delay)
        } else {
            delay
        })
    }
}

/// Call `operation` until it succeeds, fails permanently or runs out of retries
///
/// `config.max_attempts` counts retries, so a call is made at most
/// `max_attempts + 1` times. The last error is returned unchanged.
///
/// Once `cancel` fires no new attempt starts and a pending backoff wait ends
/// early with [`Error::Cancelled`]. A call already in flight is never cut short.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(config);

    loop {
        if cancel.is_cancelled() {
            tracing::debug!(operation = operation_name, "Run cancelled, not calling again");
            return Err(Error::Cancelled);
        }

        let error = match operation().await {
            Ok(value) => {
                if backoff.retries > 0 {
                    tracing::info!(
                        operation = operation_name,
                        retries = backoff.retries,
                        "Remote call succeeded after retrying"
                    );
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            tracing::debug!(operation = operation_name, error = %error, "Permanent failure, not retrying");
            return Err(error);
        }
        if cancel.is_cancelled() {
            tracing::debug!(operation = operation_name, error = %error, "Run cancelled, dropping retries");
            return Err(Error::Cancelled);
        }
        let Some(delay) = backoff.next_delay() else {
            tracing::error!(
                operation = operation_name,
                error = %error,
                calls = backoff.retries + 1,
                "Giving up after exhausting retries"
            );
            return Err(error);
        };

        tracing::warn!(
            operation = operation_name,
            error = %error,
            retry = backoff.retries,
            max_retries = config.max_attempts,
            delay_ms = delay.as_millis(),
            "Transient failure, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleeper.sleep(delay) => {}
        }
    }
}

/// Run a remote call under its own timeout
///
/// An elapsed timer becomes [`Error::Timeout`], which is retryable.
pub async fn with_timeout<T, Fut>(limit: Duration, operation: &'static str, call: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| {
            Err(Error::Timeout {
                operation,
                seconds: limit.as_secs(),
            })
        })
}

/// Spread a delay over `[delay, 2 * delay]`
fn add_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(1.0..=2.0);
    delay.mul_f64(factor)
}
