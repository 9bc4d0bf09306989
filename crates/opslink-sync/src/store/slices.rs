use opslink_proto::{Alert, AssetStatus, Identity, Metrics, TransitRecord};
use uuid::Uuid;

use crate::connection::ConnectionState;

/// Named slices of shared state. Every slice carries one value; components
/// read and subscribe by key rather than holding references into each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKey {
    TransitPending,
    TransitActive,
    AlertsActive,
    AssetStatuses,
    Metrics,
    ConnectionStatus,
    Identity,
}

impl StateKey {
    pub const ALL: [StateKey; 7] = [
        StateKey::TransitPending,
        StateKey::TransitActive,
        StateKey::AlertsActive,
        StateKey::AssetStatuses,
        StateKey::Metrics,
        StateKey::ConnectionStatus,
        StateKey::Identity,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StateKey::TransitPending => "transit_pending",
            StateKey::TransitActive => "transit_active",
            StateKey::AlertsActive => "alerts_active",
            StateKey::AssetStatuses => "asset_statuses",
            StateKey::Metrics => "metrics",
            StateKey::ConnectionStatus => "connection_status",
            StateKey::Identity => "identity",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Transits(Vec<TransitRecord>),
    Alerts(Vec<Alert>),
    Assets(Vec<AssetStatus>),
    Metrics(Option<Metrics>),
    Connection(ConnectionState),
    Identity(Option<Identity>),
}

/// The empty value a slice resets to on session end.
pub fn neutral(key: StateKey) -> StateValue {
    match key {
        StateKey::TransitPending | StateKey::TransitActive => StateValue::Transits(Vec::new()),
        StateKey::AlertsActive => StateValue::Alerts(Vec::new()),
        StateKey::AssetStatuses => StateValue::Assets(Vec::new()),
        StateKey::Metrics => StateValue::Metrics(None),
        StateKey::ConnectionStatus => StateValue::Connection(ConnectionState::Disconnected),
        StateKey::Identity => StateValue::Identity(None),
    }
}

/// A batch of slice replacements applied atomically.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    entries: Vec<(StateKey, StateValue)>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: StateKey, value: StateValue) -> Self {
        self.entries.push((key, value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = StateKey> + '_ {
        self.entries.iter().map(|(key, _)| *key)
    }

    pub fn entries(&self) -> &[(StateKey, StateValue)] {
        &self.entries
    }
}

pub trait Identified {
    fn ident(&self) -> Uuid;
}

impl Identified for TransitRecord {
    fn ident(&self) -> Uuid {
        self.id
    }
}

impl Identified for Alert {
    fn ident(&self) -> Uuid {
        self.id
    }
}

impl Identified for AssetStatus {
    fn ident(&self) -> Uuid {
        self.id
    }
}

/// Replace an existing item in place, else prepend the new one.
pub fn upsert_by_id<T: Identified>(list: &mut Vec<T>, item: T) {
    match list.iter().position(|it| it.ident() == item.ident()) {
        Some(index) => list[index] = item,
        None => list.insert(0, item),
    }
}

pub fn remove_by_id<T: Identified>(list: &mut Vec<T>, id: Uuid) -> bool {
    let before = list.len();
    list.retain(|it| it.ident() != id);
    list.len() != before
}
