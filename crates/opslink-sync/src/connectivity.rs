use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Source of truth for whether the host believes it has network access.
/// Implementations wrap whatever the platform exposes; tests drive
/// [`SharedConnectivity`] directly.
pub trait ConnectivitySignal: Send + Sync {
    fn is_online(&self) -> bool;
    fn changes(&self) -> watch::Receiver<bool>;
}

/// Hand-settable connectivity signal.
pub struct SharedConnectivity {
    tx: watch::Sender<bool>,
}

impl SharedConnectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    pub fn set_online(&self, online: bool) {
        let _ = self.tx.send(online);
    }
}

impl Default for SharedConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivitySignal for SharedConnectivity {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn changes(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Invokes a callback each time connectivity transitions from offline to
/// online. Staying online, or going offline, triggers nothing.
pub struct ConnectivityWatcher {
    task: JoinHandle<()>,
}

impl ConnectivityWatcher {
    pub fn spawn<F>(signal: &dyn ConnectivitySignal, on_restore: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut changes = signal.changes();
        let task = tokio::spawn(async move {
            let mut was_online = *changes.borrow_and_update();
            while changes.changed().await.is_ok() {
                let online = *changes.borrow_and_update();
                if online && !was_online {
                    info!("connectivity restored");
                    on_restore();
                }
                was_online = online;
            }
        });
        Self { task }
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for ConnectivityWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
