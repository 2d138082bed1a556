//! Cancellable scheduled work.
//!
//! Every timer in DevBridge (heartbeats, reconnect backoff, cache sweeps,
//! accept loops) is a [`ScheduledTask`] owned by the component that created
//! it.  Dropping the owner drops the task, which aborts it, so no timer can
//! outlive the component it works for.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// A spawned Tokio task that is aborted when this handle is dropped.
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawns `future` on the current runtime.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            handle: tokio::spawn(future),
        }
    }

    /// Spawns a loop that calls `tick` every `period`, skipping the immediate
    /// first tick.  The loop ends when `tick` returns `false`.
    pub fn every<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::spawn(name, async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !tick().await {
                    break;
                }
            }
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns `true` once the task has completed or been aborted.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Aborts the task now.  Calling it twice is harmless.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if !self.handle.is_finished() {
            debug!("aborting scheduled task '{}'", self.name);
        }
        self.handle.abort();
    }
}
