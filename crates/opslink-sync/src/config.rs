use std::time::Duration;

/// Backoff and retry ceilings for the event connection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub base_delay: Duration,
    /// Cap applied to the doubled delay.
    pub max_delay: Duration,
    /// Attempts beyond this count stop the supervisor until an external
    /// `connect()` or a connectivity-restoration signal.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Capped exponential delay for the given 1-based attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Event connection endpoint, e.g. `wss://ops.example.net/events`.
    pub ws_url: String,
    /// Request backend base, e.g. `https://ops.example.net/api`.
    pub api_url: String,
    pub auth_token: String,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    /// Handshake must complete within this window or the attempt fails.
    pub auth_timeout: Duration,
    pub cache_ttl: Duration,
    /// Retry ceiling for network-class request failures.
    pub request_retries: u32,
    pub retry_base_delay: Duration,
    /// Queued outbound messages are dropped after this many failed replays.
    pub queue_retry_limit: u32,
    /// Synthesize a connected session and emit synthetic events instead of
    /// dialing a real transport.
    pub simulation: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8900/events".into(),
            api_url: "http://127.0.0.1:8900/api".into(),
            auth_token: String::new(),
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(30),
            request_retries: 3,
            retry_base_delay: Duration::from_millis(250),
            queue_retry_limit: 3,
            simulation: false,
        }
    }
}

impl SyncConfig {
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    pub fn simulated() -> Self {
        Self {
            simulation: true,
            ..Self::default()
        }
    }
}
