use thiserror::Error;

/// Failures at the event-transport seam. Recovered locally by the reconnect
/// policy; never surfaced to consumers on their own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("transport closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

/// Failures on the request path. `Network` and `Timeout` are retried with
/// backoff; `Api` carries a structured backend response and is surfaced to
/// the caller immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("api error {status}: {}", .message.as_deref().unwrap_or("no detail"))]
    Api { status: u16, message: Option<String> },
    #[error("response decode failed: {0}")]
    Decode(String),
}

impl RequestError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }
}

/// Storage-backend failures. Persistence problems are absorbed and logged
/// by the store; this error only crosses the `KeyValueStorage` seam.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(String),
    #[error("storage codec error: {0}")]
    Codec(String),
}

/// Conditions the layer surfaces to the consuming application. Everything
/// else (reconnect attempts, heartbeat misses, dropped queue entries,
/// polling fetch failures) is absorbed and logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFault {
    /// The backend rejected the authentication handshake; the application
    /// should force a re-login flow.
    AuthRejected(String),
    /// Reconnect attempts exceeded the configured ceiling; the connection
    /// is down until an external `connect()` or connectivity restoration.
    ReconnectExhausted,
}
