use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use opslink_proto::ClientMessage;

/// An outbound message captured while the connection was not usable.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub message: ClientMessage,
    pub enqueued_at: Instant,
    pub retry_count: u32,
}

/// FIFO buffer for sends attempted while disconnected. Entries that fail
/// replay are recycled up to a small ceiling and then dropped; guaranteed
/// delivery belongs to a higher layer.
#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedMessage>,
    retry_limit: u32,
}

impl OutboundQueue {
    pub fn new(retry_limit: u32) -> Self {
        Self {
            entries: VecDeque::new(),
            retry_limit,
        }
    }

    pub fn push(&mut self, message: ClientMessage) -> Uuid {
        let id = Uuid::new_v4();
        self.entries.push_back(QueuedMessage {
            id,
            message,
            enqueued_at: Instant::now(),
            retry_count: 0,
        });
        id
    }

    /// Remove everything for a replay pass, oldest first.
    pub fn take_all(&mut self) -> VecDeque<QueuedMessage> {
        std::mem::take(&mut self.entries)
    }

    /// Return entries that were taken but never attempted, preserving order.
    pub fn restore(&mut self, entries: impl IntoIterator<Item = QueuedMessage>) {
        for entry in entries {
            self.entries.push_back(entry);
        }
    }

    /// Put a failed entry back at the front for the next replay, or drop it
    /// once it has exhausted its retries.
    pub fn recycle(&mut self, mut entry: QueuedMessage) -> bool {
        entry.retry_count += 1;
        if entry.retry_count > self.retry_limit {
            warn!(
                id = %entry.id,
                kind = entry.message.kind(),
                retries = entry.retry_count - 1,
                "dropping queued message after retry ceiling"
            );
            return false;
        }
        self.entries.push_front(entry);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_fifo_order() {
        let mut queue = OutboundQueue::new(3);
        queue.push(ClientMessage::Heartbeat);
        queue.push(ClientMessage::SubscribeDomains {
            domains: vec!["alerts".into()],
        });
        let taken = queue.take_all();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].message, ClientMessage::Heartbeat);
        assert!(queue.is_empty());
    }

    #[test]
    fn recycle_drops_after_ceiling() {
        let mut queue = OutboundQueue::new(2);
        queue.push(ClientMessage::Heartbeat);
        let mut entry = queue.take_all().pop_front().unwrap();
        assert!(queue.recycle(entry.clone()));
        entry.retry_count = 2;
        assert!(!queue.recycle(entry));
        // The first recycle left one copy behind.
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn recycled_entry_leads_the_queue() {
        let mut queue = OutboundQueue::new(3);
        queue.push(ClientMessage::Heartbeat);
        queue.push(ClientMessage::SubscribeDomains { domains: vec![] });
        let mut taken = queue.take_all();
        let failed = taken.pop_front().unwrap();
        queue.restore(taken);
        queue.recycle(failed);
        let replay = queue.take_all();
        assert_eq!(replay[0].message, ClientMessage::Heartbeat);
    }
}
