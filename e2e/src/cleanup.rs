//! Teardown actions registered while the scenario creates things.
//!
//! Actions run last-registered-first, each exactly once. A failing or
//! panicking action is logged and recorded but never stops the ones after it;
//! the failures come back together as [`Error::Cleanup`].

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::error::{CleanupFailure, Error};

type Action = Box<dyn FnOnce() -> LocalBoxFuture<'static, Result<(), Error>>>;

#[derive(Default)]
pub struct CleanupRegistry {
    actions: Vec<(String, Action)>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<(), Error>> + 'static,
    {
        let name = name.into();
        debug!(action = %name, "Registered cleanup action.");
        self.actions
            .push((name, Box::new(move || action().boxed_local())));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.actions.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Drains the registry. Calling it again afterwards is a no-op.
    pub async fn run_all(&mut self) -> Result<(), Error> {
        let actions = std::mem::take(&mut self.actions);
        if actions.is_empty() {
            return Ok(());
        }
        info!(count = actions.len(), "Running cleanup actions.");
        let mut failures = Vec::new();
        for (name, action) in actions.into_iter().rev() {
            debug!(action = %name, "Running cleanup action.");
            match AssertUnwindSafe(action()).catch_unwind().await {
                Ok(Ok(())) => info!(action = %name, "cleanup action finished"),
                Ok(Err(e)) => {
                    error!(action = %name, error = %e, "Cleanup action failed.");
                    failures.push(CleanupFailure {
                        action: name,
                        error: e.to_string(),
                    });
                }
                Err(_) => {
                    error!(action = %name, "Cleanup action panicked.");
                    failures.push(CleanupFailure {
                        action: name,
                        error: "panicked".to_string(),
                    });
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup { failures })
        }
    }
}

impl Drop for CleanupRegistry {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            warn!(
                pending = ?self.names(),
                "Cleanup registry dropped without running its actions."
            );
        }
    }
}
