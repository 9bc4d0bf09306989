use std::collections::HashMap;
use tokio::sync::broadcast;

use opslink_proto::ServerEvent;

const WILDCARD: &str = "*";
const CHANNEL_DEPTH: usize = 64;

/// Fan-out point for domain events: per-kind topics plus a wildcard topic.
/// Control events never reach the bus; the connection manager consumes them.
#[derive(Debug, Default)]
pub struct EventBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<ServerEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<ServerEvent> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_DEPTH).0)
            .clone()
    }

    /// Receive only events of one wire kind (e.g. `"alert_raised"`).
    pub fn subscribe(&self, kind: &str) -> broadcast::Receiver<ServerEvent> {
        self.sender_for(kind).subscribe()
    }

    /// Receive every domain event.
    pub fn subscribe_all(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender_for(WILDCARD).subscribe()
    }

    pub fn publish(&self, event: ServerEvent) {
        debug_assert!(!event.is_control(), "control events are not dispatched");
        let kind_sender = self.sender_for(event.kind());
        let wildcard_sender = self.sender_for(WILDCARD);
        // A send error just means nobody is listening on that topic yet.
        let _ = kind_sender.send(event.clone());
        let _ = wildcard_sender.send(event);
    }
}
