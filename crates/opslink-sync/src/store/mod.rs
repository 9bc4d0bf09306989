use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use opslink_proto::{Alert, Identity, ServerEvent, TransitStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::bus::EventBus;
use crate::connection::ConnectionState;

mod persist;
mod refresh;
mod slices;

pub use persist::{
    FileStorage, KeyValueStorage, MemoryStorage, PersistedSession, IDENTITY_KEY, SESSION_STATE_KEY,
};
pub use refresh::RefreshScheduler;
pub use slices::{neutral, remove_by_id, upsert_by_id, StateKey, StatePatch, StateValue};

type PatchListener = Arc<dyn Fn(&StatePatch) + Send + Sync>;
type ValueListener = Arc<dyn Fn(&StateValue) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    global: Vec<(u64, PatchListener)>,
    keyed: HashMap<StateKey, Vec<(u64, ValueListener)>>,
}

struct StoreInner {
    state: parking_lot::RwLock<HashMap<StateKey, StateValue>>,
    listeners: parking_lot::Mutex<Listeners>,
    storage: Arc<dyn KeyValueStorage>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    next_listener_id: AtomicU64,
}

/// Single authority for client-visible state. Components read slices by key
/// and subscribe for changes; nothing mutates a slice except through a
/// [`StatePatch`], so every observer sees the same ordering of updates.
#[derive(Clone)]
pub struct SharedStateStore {
    inner: Arc<StoreInner>,
}

enum Scope {
    Global,
    Keyed(StateKey),
}

/// Cancels its registration when asked; dropping the handle without calling
/// [`cancel`](SubscriptionHandle::cancel) leaves the listener installed.
pub struct SubscriptionHandle {
    inner: Weak<StoreInner>,
    id: u64,
    scope: Scope,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut listeners = inner.listeners.lock();
        match self.scope {
            Scope::Global => listeners.global.retain(|(id, _)| *id != self.id),
            Scope::Keyed(key) => {
                if let Some(list) = listeners.keyed.get_mut(&key) {
                    list.retain(|(id, _)| *id != self.id);
                }
            }
        }
    }
}

impl SharedStateStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        let mut state = HashMap::new();
        for key in StateKey::ALL {
            state.insert(key, neutral(key));
        }
        Self {
            inner: Arc::new(StoreInner {
                state: parking_lot::RwLock::new(state),
                listeners: parking_lot::Mutex::new(Listeners::default()),
                storage,
                tasks: parking_lot::Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn get(&self, key: StateKey) -> StateValue {
        self.inner
            .state
            .read()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| neutral(key))
    }

    /// Copy of every slice. Mutating the returned map changes nothing; all
    /// writes go through [`apply`](SharedStateStore::apply).
    pub fn snapshot(&self) -> HashMap<StateKey, StateValue> {
        self.inner.state.read().clone()
    }

    /// Register for every patch. The listener fires synchronously with a
    /// snapshot of the current state before this call returns.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&StatePatch) + Send + Sync + 'static,
    {
        let listener: PatchListener = Arc::new(listener);
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().global.push((id, listener.clone()));

        let snapshot = {
            let state = self.inner.state.read();
            let mut patch = StatePatch::new();
            for key in StateKey::ALL {
                if let Some(value) = state.get(&key) {
                    patch = patch.set(key, value.clone());
                }
            }
            patch
        };
        listener(&snapshot);

        SubscriptionHandle {
            inner: Arc::downgrade(&self.inner),
            id,
            scope: Scope::Global,
        }
    }

    /// Register for one slice. The listener fires synchronously with the
    /// slice's current value before this call returns.
    pub fn subscribe_key<F>(&self, key: StateKey, listener: F) -> SubscriptionHandle
    where
        F: Fn(&StateValue) + Send + Sync + 'static,
    {
        let listener: ValueListener = Arc::new(listener);
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .keyed
            .entry(key)
            .or_default()
            .push((id, listener.clone()));

        let current = self.get(key);
        listener(&current);

        SubscriptionHandle {
            inner: Arc::downgrade(&self.inner),
            id,
            scope: Scope::Keyed(key),
        }
    }

    /// Merge a patch into the state map, persist the durable subset, then
    /// notify listeners. Persistence failures are logged, never propagated;
    /// in-memory state is already the source of truth.
    pub async fn apply(&self, patch: StatePatch) {
        if patch.is_empty() {
            return;
        }
        trace!(slices = patch.entries().len(), "applying state patch");
        {
            let mut state = self.inner.state.write();
            for (key, value) in patch.entries() {
                state.insert(*key, value.clone());
            }
        }
        self.persist_subset(&patch).await;
        self.notify(&patch);
    }

    /// Only the auth subset is durable: the identity blob and a small
    /// session snapshot. Domain slices are always refetched fresh.
    async fn persist_subset(&self, patch: &StatePatch) {
        for (key, value) in patch.entries() {
            let (StateKey::Identity, StateValue::Identity(identity)) = (key, value) else {
                continue;
            };
            let outcome = match identity {
                Some(identity) => {
                    let session =
                        PersistedSession::from_identity(identity, crate::clock::now_millis());
                    match (
                        serde_json::to_string(identity),
                        serde_json::to_string(&session),
                    ) {
                        (Ok(identity_blob), Ok(session_blob)) => {
                            match self.inner.storage.store(IDENTITY_KEY, &identity_blob).await {
                                Ok(()) => {
                                    self.inner
                                        .storage
                                        .store(SESSION_STATE_KEY, &session_blob)
                                        .await
                                }
                                Err(err) => Err(err),
                            }
                        }
                        _ => {
                            warn!("identity not serializable, skipping persist");
                            continue;
                        }
                    }
                }
                None => match self.inner.storage.remove(IDENTITY_KEY).await {
                    Ok(()) => self.inner.storage.remove(SESSION_STATE_KEY).await,
                    Err(err) => Err(err),
                },
            };
            if let Err(err) = outcome {
                warn!(error = %err, "auth state persistence failed");
            }
        }
    }

    fn notify(&self, patch: &StatePatch) {
        // Listener sets are snapshotted before any callback runs, so a
        // listener cancelling another mid-pass does not starve it of the
        // current patch.
        let (global, keyed): (Vec<PatchListener>, Vec<(ValueListener, StateValue)>) = {
            let listeners = self.inner.listeners.lock();
            let global = listeners
                .global
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect();
            let mut keyed = Vec::new();
            for (key, value) in patch.entries() {
                if let Some(list) = listeners.keyed.get(key) {
                    for (_, listener) in list {
                        keyed.push((listener.clone(), value.clone()));
                    }
                }
            }
            (global, keyed)
        };
        for listener in global {
            listener(patch);
        }
        for (listener, value) in keyed {
            listener(&value);
        }
    }

    /// Restore persisted slices from storage. Call once at startup, before
    /// any connection is opened.
    pub async fn hydrate(&self) {
        let identity = match self.inner.storage.load(IDENTITY_KEY).await {
            Ok(Some(blob)) => match serde_json::from_str::<Identity>(&blob) {
                Ok(identity) => Some(identity),
                Err(err) => {
                    warn!(error = %err, "discarding unreadable persisted identity");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "identity hydration failed");
                None
            }
        };
        let session = match self.inner.storage.load(SESSION_STATE_KEY).await {
            Ok(Some(blob)) => match serde_json::from_str::<PersistedSession>(&blob) {
                Ok(session) => Some(session),
                Err(err) => {
                    warn!(error = %err, "discarding unreadable persisted session state");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "session state hydration failed");
                None
            }
        };
        // The session snapshot must agree with the identity it was saved
        // with; on mismatch (interleaved writes, partial wipe) neither side
        // is trustworthy.
        let identity = match (identity, session) {
            (Some(identity), Some(session)) if session.user_id != identity.user_id => {
                warn!(
                    user_id = %identity.user_id,
                    session_user_id = %session.user_id,
                    "persisted session does not match persisted identity, discarding"
                );
                None
            }
            (Some(identity), Some(session)) => {
                debug!(saved_at = session.saved_at, "restoring persisted session");
                Some(identity)
            }
            (identity, _) => identity,
        };
        if let Some(identity) = identity {
            self.apply(
                StatePatch::new().set(StateKey::Identity, StateValue::Identity(Some(identity))),
            )
            .await;
        }
    }

    /// Fold one server event into the affected slices.
    pub async fn fold_event(&self, event: ServerEvent) {
        let patch = {
            let state = self.inner.state.read();
            build_event_patch(&state, event)
        };
        self.apply(patch).await;
    }

    /// Drive the store from the live event bus. Runs until the bus closes or
    /// [`shutdown`](SharedStateStore::shutdown) is called.
    pub fn attach_events(&self, bus: &EventBus) {
        let mut events = bus.subscribe_all();
        let store = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => store.fold_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "state store lagged behind event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.inner.tasks.lock().push(task);
    }

    /// Mirror the connection manager's state into the `ConnectionStatus`
    /// slice.
    pub fn attach_connection(&self, mut states: watch::Receiver<ConnectionState>) {
        let store = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let state = *states.borrow_and_update();
                store
                    .apply(
                        StatePatch::new()
                            .set(StateKey::ConnectionStatus, StateValue::Connection(state)),
                    )
                    .await;
                if states.changed().await.is_err() {
                    break;
                }
            }
        });
        self.inner.tasks.lock().push(task);
    }

    pub fn attach_identity(&self, mut identities: watch::Receiver<Option<Identity>>) {
        let store = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let identity = identities.borrow_and_update().clone();
                store
                    .apply(
                        StatePatch::new()
                            .set(StateKey::Identity, StateValue::Identity(identity)),
                    )
                    .await;
                if identities.changed().await.is_err() {
                    break;
                }
            }
        });
        self.inner.tasks.lock().push(task);
    }

    /// Clear everything tied to the authenticated session: domain slices,
    /// identity, and the persisted blobs. Connection status is left alone;
    /// it tracks the socket, not the session.
    pub async fn end_session(&self) {
        let mut patch = StatePatch::new();
        for key in StateKey::ALL {
            if key != StateKey::ConnectionStatus {
                patch = patch.set(key, neutral(key));
            }
        }
        self.apply(patch).await;
        if let Err(err) = self.inner.storage.remove(IDENTITY_KEY).await {
            warn!(error = %err, "persisted identity removal failed");
        }
        if let Err(err) = self.inner.storage.remove(SESSION_STATE_KEY).await {
            warn!(error = %err, "persisted session state removal failed");
        }
    }

    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Compute the slice replacements one event implies, against the current
/// state. Transits move between the pending and active slices as their
/// status changes; completed and cancelled transits leave both.
fn build_event_patch(
    state: &HashMap<StateKey, StateValue>,
    event: ServerEvent,
) -> StatePatch {
    let transits = |key: StateKey| -> Vec<opslink_proto::TransitRecord> {
        match state.get(&key) {
            Some(StateValue::Transits(list)) => list.clone(),
            _ => Vec::new(),
        }
    };
    let alerts = || -> Vec<Alert> {
        match state.get(&StateKey::AlertsActive) {
            Some(StateValue::Alerts(list)) => list.clone(),
            _ => Vec::new(),
        }
    };

    match event {
        ServerEvent::TransitCreated(record) | ServerEvent::TransitUpdated(record) => {
            let mut pending = transits(StateKey::TransitPending);
            let mut active = transits(StateKey::TransitActive);
            // Upsert into the slice the record now belongs to and evict it
            // only from the other; an update that keeps its status replaces
            // in place and the record keeps its list position.
            match record.status {
                TransitStatus::Pending => {
                    remove_by_id(&mut active, record.id);
                    upsert_by_id(&mut pending, record);
                }
                TransitStatus::Active => {
                    remove_by_id(&mut pending, record.id);
                    upsert_by_id(&mut active, record);
                }
                TransitStatus::Completed | TransitStatus::Cancelled => {
                    remove_by_id(&mut pending, record.id);
                    remove_by_id(&mut active, record.id);
                }
            }
            StatePatch::new()
                .set(StateKey::TransitPending, StateValue::Transits(pending))
                .set(StateKey::TransitActive, StateValue::Transits(active))
        }
        ServerEvent::TransitDeleted { id } => {
            let mut pending = transits(StateKey::TransitPending);
            let mut active = transits(StateKey::TransitActive);
            remove_by_id(&mut pending, id);
            remove_by_id(&mut active, id);
            StatePatch::new()
                .set(StateKey::TransitPending, StateValue::Transits(pending))
                .set(StateKey::TransitActive, StateValue::Transits(active))
        }
        ServerEvent::AlertRaised(alert) | ServerEvent::AlertUpdated(alert) => {
            let mut list = alerts();
            upsert_by_id(&mut list, alert);
            StatePatch::new().set(StateKey::AlertsActive, StateValue::Alerts(list))
        }
        ServerEvent::AlertCleared { id } => {
            let mut list = alerts();
            remove_by_id(&mut list, id);
            StatePatch::new().set(StateKey::AlertsActive, StateValue::Alerts(list))
        }
        ServerEvent::AssetStatusChanged(asset) => {
            let mut list = match state.get(&StateKey::AssetStatuses) {
                Some(StateValue::Assets(list)) => list.clone(),
                _ => Vec::new(),
            };
            upsert_by_id(&mut list, asset);
            StatePatch::new().set(StateKey::AssetStatuses, StateValue::Assets(list))
        }
        ServerEvent::MetricsSnapshot(metrics) => StatePatch::new()
            .set(StateKey::Metrics, StateValue::Metrics(Some(metrics))),
        // Control events never reach the store; the connection manager
        // consumes them.
        ServerEvent::AuthSuccess { .. }
        | ServerEvent::AuthFailure { .. }
        | ServerEvent::HeartbeatAck
        | ServerEvent::ProtocolError { .. } => StatePatch::new(),
    }
}
