//! Bounded polling against an eventually-consistent API server.
//!
//! [`poll_until`] and [`poll_immediate_until`] drive a condition until it
//! reports success, a permanent error, or the timeout expires. Retryable errors
//! (see [`Retryable`]) are logged and polling continues. Expiry is reported as
//! [`Error::Timeout`], never as the last error seen, so callers can tell
//! "never succeeded" from "the API server refused".
//!
//! [`Ticker`] is the shared timing model; the assertion combinators reuse it
//! with their own error tolerance.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

use crate::config::duration_format;
use crate::error::{Error, Retryable};

/// An interval/timeout pair. For `consistently` the timeout is the length of
/// the sampling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSpec {
    #[serde(with = "duration_format")]
    pub interval: Duration,
    #[serde(with = "duration_format")]
    pub timeout: Duration,
}

impl PollSpec {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub const fn secs(interval: u64, timeout: u64) -> Self {
        Self::new(Duration::from_secs(interval), Duration::from_secs(timeout))
    }
}

/// Yields once per evaluation until the timeout has elapsed.
///
/// An immediate ticker yields right away for the first evaluation; otherwise
/// every evaluation is preceded by one interval of sleep. Once an evaluation
/// has happened at or after the deadline, the ticker is exhausted.
#[derive(Debug)]
pub struct Ticker {
    spec: PollSpec,
    immediate: bool,
    started: Instant,
    attempts: u32,
}

impl Ticker {
    pub fn new(spec: PollSpec) -> Self {
        Self {
            spec,
            immediate: false,
            started: Instant::now(),
            attempts: 0,
        }
    }

    pub fn immediate(spec: PollSpec) -> Self {
        Self {
            immediate: true,
            ..Self::new(spec)
        }
    }

    pub async fn tick(&mut self) -> bool {
        if self.attempts == 0 && self.immediate {
            self.attempts = 1;
            return true;
        }
        if self.attempts > 0 && self.started.elapsed() >= self.spec.timeout {
            return false;
        }
        sleep(self.spec.interval).await;
        self.attempts += 1;
        true
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Waits one interval, then evaluates `condition` every interval.
pub async fn poll_until<F, Fut>(spec: PollSpec, what: &str, condition: F) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    poll(Ticker::new(spec), what, condition).await
}

/// Same as [`poll_until`] but evaluates `condition` once before the first wait.
pub async fn poll_immediate_until<F, Fut>(
    spec: PollSpec,
    what: &str,
    condition: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    poll(Ticker::immediate(spec), what, condition).await
}

async fn poll<F, Fut>(mut ticker: Ticker, what: &str, mut condition: F) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let mut last_observed = String::from("condition never evaluated");
    while ticker.tick().await {
        match condition().await {
            Ok(true) => {
                debug!(what, attempts = ticker.attempts(), "Condition met.");
                return Ok(());
            }
            Ok(false) => {
                last_observed = format!("condition not met after {} attempt(s)", ticker.attempts());
            }
            Err(e) if e.is_retryable() => {
                let attempt = ticker.attempts();
                warn!(what, attempt, error = %e, "Retryable error while polling.");
                last_observed = format!("retryable error: {}", e);
            }
            Err(e) => {
                let attempt = ticker.attempts();
                error!(what, attempt, error = %e, "Permanent error, aborting poll.");
                return Err(e);
            }
        }
    }
    Err(Error::Timeout {
        what: what.to_string(),
        elapsed: ticker.elapsed(),
        last_observed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::api_error;
    use std::sync::atomic::{AtomicU32, Ordering};

    const SPEC: PollSpec = PollSpec::secs(2, 10);

    #[tokio::test(start_paused = true)]
    async fn immediate_poll_evaluates_before_waiting() {
        let start = Instant::now();
        poll_immediate_until(SPEC, "ready", || async { Ok(true) })
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_waits_one_interval_before_first_evaluation() {
        let start = Instant::now();
        poll_until(SPEC, "ready", || async { Ok(true) }).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_are_swallowed() {
        let calls = AtomicU32::new(0);
        poll_until(SPEC, "list volumes", || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Error::Kube(api_error(500, "InternalError"))),
                1 => Err(Error::Kube(api_error(429, "TooManyRequests"))),
                _ => Ok(true),
            }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_aborts_immediately() {
        let calls = AtomicU32::new(0);
        let err = poll_until(SPEC, "get daemon set", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<bool, _>(Error::Kube(api_error(403, "Forbidden")))
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::Kube(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_distinct_from_last_error() {
        let err = poll_until(SPEC, "never", || async {
            Err::<bool, _>(Error::Kube(api_error(504, "Timeout")))
        })
        .await
        .unwrap_err();
        match err {
            Error::Timeout {
                what,
                elapsed,
                last_observed,
            } => {
                assert_eq!(what, "never");
                assert_eq!(elapsed, Duration::from_secs(10));
                assert!(last_observed.starts_with("retryable error"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_counts_evaluations_within_window() {
        let mut ticker = Ticker::immediate(PollSpec::secs(5, 30));
        let mut evaluations = 0;
        while ticker.tick().await {
            evaluations += 1;
        }
        // t = 0, 5, 10, 15, 20, 25, 30
        assert_eq!(evaluations, 7);

        let mut ticker = Ticker::new(PollSpec::secs(5, 30));
        let mut evaluations = 0;
        while ticker.tick().await {
            evaluations += 1;
        }
        assert_eq!(evaluations, 6);
    }
}
