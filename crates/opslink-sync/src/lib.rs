//! Realtime state synchronization for opslink clients.
//!
//! Four cooperating pieces: a [`connection::ConnectionManager`] that owns the
//! websocket lifecycle (auth, heartbeat, reconnect backoff, outbound
//! queueing), a [`cache::RequestCache`] that deduplicates and TTL-caches REST
//! reads, a [`store::SharedStateStore`] holding the client-visible state
//! slices, and a [`polling::Poller`] that reconciles list endpoints the
//! socket does not push. Components are wired together explicitly by the
//! embedding application; nothing here reaches for globals.

pub mod bus;
pub mod cache;
pub mod config;
pub mod connection;
pub mod connectivity;
pub mod error;
pub mod polling;
pub mod store;
pub mod transport;

pub(crate) mod clock {
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Unix millis. Falls back to zero before the epoch, which only a
    /// badly misconfigured host clock can produce.
    pub fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}

pub use bus::EventBus;
pub use cache::{ApiBackend, FallbackBackend, HttpBackend, RequestCache};
pub use config::{ReconnectPolicy, SyncConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use connectivity::{ConnectivitySignal, ConnectivityWatcher, SharedConnectivity};
pub use error::{RequestError, StoreError, SyncFault, TransportError};
pub use polling::{Poller, PollerConfig};
pub use store::{SharedStateStore, StateKey, StatePatch, StateValue, SubscriptionHandle};
pub use transport::{EventTransport, WsTransport};
