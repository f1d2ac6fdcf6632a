//! `eventually` and `consistently`, the two ways the scenario asserts on state
//! it can only observe by polling.
//!
//! Both share the [`Ticker`] timing model with the retry poller but tolerate
//! errors differently: `eventually` treats any failed sample as "not yet",
//! `consistently` fails on the first one.

use std::future::Future;

use tracing::{debug, error, info};

use crate::error::Error;
use crate::poll::{PollSpec, Ticker};

/// One sample taken by an `eventually` probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    /// Not there yet; carries what was observed for the timeout report.
    Pending(String),
}

impl<T> Probe<T> {
    pub fn pending(observation: impl Into<String>) -> Self {
        Probe::Pending(observation.into())
    }
}

/// Samples `probe` until it is ready. Errors and pending samples are logged
/// and retried; on timeout the last observation is attached to the error.
pub async fn eventually<T, F, Fut>(what: &str, spec: PollSpec, mut probe: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>, Error>>,
{
    let mut ticker = Ticker::immediate(spec);
    let mut last_observed = String::from("probe never evaluated");
    while ticker.tick().await {
        match probe().await {
            Ok(Probe::Ready(value)) => {
                debug!(what, attempts = ticker.attempts(), "Eventually satisfied.");
                return Ok(value);
            }
            Ok(Probe::Pending(observation)) => {
                info!(what, observation = %observation, "Waiting.");
                last_observed = observation;
            }
            Err(e) => {
                info!(what, error = %e, "Probe failed, will retry.");
                last_observed = e.to_string();
            }
        }
    }
    error!(what, elapsed = ?ticker.elapsed(), last_observed = %last_observed, "Timed out.");
    Err(Error::Timeout {
        what: what.to_string(),
        elapsed: ticker.elapsed(),
        last_observed,
    })
}

/// Samples `probe` across the whole window. The first `false` or error fails
/// the assertion at once.
pub async fn consistently<F, Fut>(what: &str, spec: PollSpec, mut probe: F) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let mut ticker = Ticker::immediate(spec);
    while ticker.tick().await {
        match probe().await {
            Ok(true) => debug!(what, sample = ticker.attempts(), "still holds"),
            Ok(false) => {
                error!(what, sample = ticker.attempts(), "Stopped holding.");
                return Err(Error::assertion(
                    what,
                    format!("stopped holding after {:?}", ticker.elapsed()),
                ));
            }
            Err(e) => {
                error!(what, sample = ticker.attempts(), error = %e, "Sample failed.");
                return Err(e);
            }
        }
    }
    info!(what, samples = ticker.attempts(), "Held for the whole window.");
    Ok(())
}
