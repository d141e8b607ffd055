//! Named, timeout-bounded wait primitives.
//!
//! A [`Gate`] lets caller code suspend until some asynchronous event calls
//! [`GateHandle::proceed`], failing with [`GateError::Timeout`] instead of
//! hanging when the event never arrives. Every acquisition is independent, so
//! two gates sharing a name never observe each other's releases.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Errors produced while waiting on a gate.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GateError {
    /// The gate was not released before its deadline.
    #[error("gate `{name}` timed out after {}ms", .timeout.as_millis())]
    Timeout { name: String, timeout: Duration },
}

/// Single-use wait primitive.
///
/// A gate only reports a missing release from [`wait`](Gate::wait); dropping
/// it unwaited discards the outcome. Prefer [`scoped`] when the release is
/// expected before some block of code finishes.
#[must_use = "a gate reports a missing release only when waited on; see gate::scoped"]
#[derive(Debug)]
pub struct Gate {
    handle: GateHandle,
    released: watch::Receiver<bool>,
    timeout: Duration,
    waited: bool,
}

/// Cloneable release side of a [`Gate`].
#[derive(Clone, Debug)]
pub struct GateHandle {
    name: Arc<str>,
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    /// Creates a fresh gate named `name` that expires after `timeout`.
    pub fn acquire(name: impl Into<String>, timeout: Duration) -> Self {
        let (tx, released) = watch::channel(false);
        let name: String = name.into();
        Self {
            handle: GateHandle {
                name: Arc::from(name),
                tx: Arc::new(tx),
            },
            released,
            timeout,
            waited: false,
        }
    }

    /// Diagnostic name, reported in [`GateError::Timeout`].
    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// Deadline applied by [`wait`](Gate::wait).
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns a handle that can release this gate from another task or a
    /// callback.
    pub fn handle(&self) -> GateHandle {
        self.handle.clone()
    }

    /// Whether some handle already called [`GateHandle::proceed`].
    pub fn is_released(&self) -> bool {
        *self.released.borrow()
    }

    /// Suspends until the gate is released or its timeout elapses.
    pub async fn wait(mut self) -> Result<(), GateError> {
        self.waited = true;
        let timeout = self.timeout;
        let mut released = self.released.clone();
        let outcome = tokio::time::timeout(timeout, async move {
            // The sender lives in `self.handle`, so the channel cannot close here.
            let _ = released.wait_for(|value| *value).await;
        })
        .await;

        match outcome {
            Ok(()) => {
                debug!(event = "gate_released", gate = %self.handle.name);
                Ok(())
            }
            Err(_) => {
                warn!(
                    event = "gate_timeout",
                    gate = %self.handle.name,
                    timeout_ms = timeout.as_millis() as u64
                );
                Err(GateError::Timeout {
                    name: self.handle.name.to_string(),
                    timeout,
                })
            }
        }
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        if !self.waited && !self.is_released() {
            warn!(event = "gate_dropped_unwaited", gate = %self.handle.name);
        }
    }
}

impl GateHandle {
    /// Releases the gate. Returns `true` only for the call that actually
    /// released it; later calls are no-ops.
    pub fn proceed(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Runs `body` with a handle to a fresh gate, then waits for that gate.
///
/// Mirrors a scoped acquisition: leaving the scope without anyone calling
/// [`GateHandle::proceed`] fails with [`GateError::Timeout`].
pub async fn scoped<F>(
    name: impl Into<String>,
    timeout: Duration,
    body: F,
) -> Result<(), GateError>
where
    F: FnOnce(&GateHandle),
{
    let gate = Gate::acquire(name, timeout);
    body(&gate.handle);
    gate.wait().await
}

/// Awaits a single future under a named deadline.
pub async fn bounded<T, Fut>(
    name: impl Into<String>,
    timeout: Duration,
    future: Fut,
) -> Result<T, GateError>
where
    Fut: Future<Output = T>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(value) => Ok(value),
        Err(_) => {
            let name = name.into();
            warn!(
                event = "bounded_wait_timeout",
                gate = %name,
                timeout_ms = timeout.as_millis() as u64
            );
            Err(GateError::Timeout { name, timeout })
        }
    }
}
