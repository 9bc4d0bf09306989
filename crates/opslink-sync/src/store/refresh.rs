use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::connection::ConnectionState;

/// Named periodic refresh timers, gated on connectivity. A tick is skipped
/// outright while the connection is down; the refresh future is awaited
/// inline, so a slow fetch never overlaps the next one.
pub struct RefreshScheduler {
    connection: watch::Receiver<ConnectionState>,
    timers: parking_lot::Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RefreshScheduler {
    pub fn new(connection: watch::Receiver<ConnectionState>) -> Self {
        Self {
            connection,
            timers: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Install or replace the timer registered under `name`. The first run
    /// happens one full interval after this call.
    pub fn configure<F, Fut>(&self, name: &str, interval: Duration, refresh: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let connection = self.connection.clone();
        let timer_name = name.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if *connection.borrow() != ConnectionState::Connected {
                    debug!(timer = %timer_name, "refresh skipped while offline");
                    continue;
                }
                refresh().await;
            }
        });
        if let Some(previous) = self.timers.lock().insert(name.to_string(), task) {
            previous.abort();
        }
    }

    pub fn stop(&self, name: &str) {
        if let Some(task) = self.timers.lock().remove(name) {
            task.abort();
        }
    }

    pub fn shutdown(&self) {
        for (_, task) in self.timers.lock().drain() {
            task.abort();
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
