use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::RequestError;

mod diff;

pub use diff::{diff_by_id, Keyed, ListDiff};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Run the first cycle immediately instead of waiting one interval.
    pub immediate: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            immediate: true,
        }
    }
}

/// Periodically fetches a list and reports only what changed since the last
/// successful fetch. Fetch failures keep the previous baseline; the next
/// cycle diffs against it as if the failure never happened.
pub struct Poller {
    task: JoinHandle<()>,
    enabled: Arc<AtomicBool>,
    poke: Arc<Notify>,
}

impl Poller {
    pub fn spawn<T, F, Fut, C>(config: PollerConfig, fetch: F, on_change: C) -> Self
    where
        T: Keyed + PartialEq + Clone + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, RequestError>> + Send + 'static,
        C: Fn(ListDiff<T>, &[T]) + Send + Sync + 'static,
    {
        let enabled = Arc::new(AtomicBool::new(true));
        let poke = Arc::new(Notify::new());
        let task = tokio::spawn(run_cycles(
            config,
            fetch,
            on_change,
            enabled.clone(),
            poke.clone(),
        ));
        Self {
            task,
            enabled,
            poke,
        }
    }

    /// Pause or resume polling. Resuming runs a catch-up cycle right away.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if enabled && !was {
            self.poke.notify_one();
        }
    }

    /// Force a cycle now, outside the regular cadence. Used after
    /// connectivity returns so state resyncs without waiting out the
    /// interval.
    pub fn poke(&self) {
        self.poke.notify_one();
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_cycles<T, F, Fut, C>(
    config: PollerConfig,
    fetch: F,
    on_change: C,
    enabled: Arc<AtomicBool>,
    poke: Arc<Notify>,
) where
    T: Keyed + PartialEq + Clone + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>, RequestError>> + Send + 'static,
    C: Fn(ListDiff<T>, &[T]) + Send + Sync + 'static,
{
    let start = if config.immediate {
        Instant::now()
    } else {
        Instant::now() + config.interval
    };
    let mut ticker = interval_at(start, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut previous: Vec<T> = Vec::new();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = poke.notified() => {
                // An out-of-band cycle restarts the cadence from now.
                ticker.reset();
            }
        }
        if !enabled.load(Ordering::SeqCst) {
            continue;
        }
        match fetch().await {
            Ok(snapshot) => {
                let changes = diff_by_id(&previous, &snapshot);
                if changes.is_empty() {
                    debug!("poll cycle found no changes");
                } else {
                    on_change(changes, &snapshot);
                }
                previous = snapshot;
            }
            Err(err) => {
                warn!(error = %err, "poll fetch failed, keeping previous baseline");
            }
        }
    }
}
