use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use opslink_proto::{ClientMessage, Envelope, Identity, ProtoError, ServerEvent};

use crate::bus::EventBus;
use crate::clock::now_millis;
use crate::config::SyncConfig;
use crate::error::SyncFault;
use crate::transport::{EventTransport, TransportLink};

mod queue;
mod simulation;

pub use queue::{OutboundQueue, QueuedMessage};

/// Connection lifecycle, observable as a state slice by every consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Reconnecting,
    Connected,
}

pub(crate) struct Shared {
    pub(crate) config: SyncConfig,
    pub(crate) transport: Arc<dyn EventTransport>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) queue: parking_lot::Mutex<OutboundQueue>,
    pub(crate) state_tx: watch::Sender<ConnectionState>,
    pub(crate) identity_tx: watch::Sender<Option<Identity>>,
    pub(crate) faults_tx: broadcast::Sender<SyncFault>,
}

/// Owns the single event-transport connection: reconnect state machine,
/// authentication handshake, heartbeat, and the outbound queue. All inbound
/// domain events flow out through the [`EventBus`].
pub struct ConnectionManager {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ConnectionState>,
    identity_rx: watch::Receiver<Option<Identity>>,
    reset: Arc<Notify>,
    outbox: parking_lot::Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: SyncConfig, transport: Arc<dyn EventTransport>, bus: Arc<EventBus>) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (identity_tx, identity_rx) = watch::channel(None);
        let (faults_tx, _) = broadcast::channel(16);
        let queue = parking_lot::Mutex::new(OutboundQueue::new(config.queue_retry_limit));
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                bus,
                queue,
                state_tx,
                identity_tx,
                faults_tx,
            }),
            state_rx,
            identity_rx,
            reset: Arc::new(Notify::new()),
            outbox: parking_lot::Mutex::new(None),
            supervisor: parking_lot::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Identity delivered by the last successful handshake.
    pub fn identity(&self) -> watch::Receiver<Option<Identity>> {
        self.identity_rx.clone()
    }

    /// Auth rejections and exhausted reconnects; the only conditions this
    /// component surfaces upward.
    pub fn faults(&self) -> broadcast::Receiver<SyncFault> {
        self.shared.faults_tx.subscribe()
    }

    /// Start the supervisor. A no-op while a supervisor is already live, so
    /// repeated calls never stack transports or heartbeat timers.
    pub fn connect(&self) {
        let mut supervisor = self.supervisor.lock();
        if let Some(handle) = supervisor.as_ref() {
            if !handle.is_finished() {
                debug!("connect ignored; supervisor already live");
                return;
            }
        }
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        *self.outbox.lock() = Some(outbox_tx);
        let shared = self.shared.clone();
        let handle = if shared.config.simulation {
            tokio::spawn(simulation::run(shared, outbox_rx))
        } else {
            let reset = self.reset.clone();
            tokio::spawn(run_supervisor(shared, reset, outbox_rx))
        };
        *supervisor = Some(handle);
    }

    /// Connectivity-restoration entry point: clears the backoff counter on a
    /// live supervisor, or starts a fresh one after terminal disconnect.
    pub fn reset_and_connect(&self) {
        {
            let supervisor = self.supervisor.lock();
            if let Some(handle) = supervisor.as_ref() {
                if !handle.is_finished() {
                    self.reset.notify_one();
                    return;
                }
            }
        }
        self.connect();
    }

    /// Transmit immediately while connected and authenticated, otherwise
    /// enqueue for replay on the next reconnect.
    pub fn send(&self, message: ClientMessage) {
        if self.state() == ConnectionState::Connected {
            if let Some(outbox) = self.outbox.lock().as_ref() {
                if outbox.send(message.clone()).is_ok() {
                    return;
                }
            }
        }
        debug!(kind = message.kind(), "queueing outbound message");
        self.shared.queue.lock().push(message);
    }

    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        *self.outbox.lock() = None;
        let _ = self.shared.state_tx.send(ConnectionState::Disconnected);
        let _ = self.shared.identity_tx.send(None);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}

fn encode(message: &ClientMessage) -> Result<String, ProtoError> {
    message.to_envelope(now_millis())?.encode()
}

fn decode_event(text: &str) -> Result<ServerEvent, ProtoError> {
    let envelope = Envelope::decode(text)?;
    ServerEvent::from_envelope(&envelope)
}

enum HandshakeError {
    Rejected(String),
    Failed(String),
}

#[derive(Debug)]
enum ServeEnd {
    Closed,
    SendFailed,
    AuthRevoked,
    OutboxDropped,
}

async fn run_supervisor(
    shared: Arc<Shared>,
    reset: Arc<Notify>,
    mut outbox_rx: mpsc::UnboundedReceiver<ClientMessage>,
) {
    let mut attempt: u32 = 0;
    loop {
        if attempt > 0 {
            if attempt > shared.config.reconnect.max_attempts {
                warn!(attempts = attempt - 1, "reconnect attempts exhausted");
                let _ = shared.faults_tx.send(SyncFault::ReconnectExhausted);
                let _ = shared.state_tx.send(ConnectionState::Disconnected);
                return;
            }
            let delay = shared.config.reconnect.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = reset.notified() => {
                    debug!("connectivity restored; resetting backoff");
                    attempt = 0;
                    continue;
                }
            }
        }
        let _ = shared.state_tx.send(ConnectionState::Reconnecting);
        let mut link = match shared.transport.dial().await {
            Ok(link) => link,
            Err(err) => {
                warn!(error = %err, attempt, "event transport dial failed");
                attempt += 1;
                continue;
            }
        };
        let identity = match authenticate(link.as_mut(), &shared).await {
            Ok(identity) => identity,
            Err(HandshakeError::Rejected(reason)) => {
                warn!(reason = %reason, "authentication rejected");
                let _ = shared.faults_tx.send(SyncFault::AuthRejected(reason));
                link.close().await;
                attempt += 1;
                continue;
            }
            Err(HandshakeError::Failed(reason)) => {
                warn!(reason = %reason, "handshake failed");
                link.close().await;
                attempt += 1;
                continue;
            }
        };
        attempt = 0;
        let _ = shared.identity_tx.send(Some(identity));
        let _ = shared.state_tx.send(ConnectionState::Connected);
        info!("event connection established");
        if flush_queue(link.as_mut(), &shared).await {
            let end = serve(link.as_mut(), &shared, &mut outbox_rx).await;
            debug!(?end, "event connection ended");
            if matches!(end, ServeEnd::OutboxDropped) {
                link.close().await;
                let _ = shared.state_tx.send(ConnectionState::Disconnected);
                return;
            }
        }
        link.close().await;
        let _ = shared.state_tx.send(ConnectionState::Reconnecting);
        attempt = 1;
    }
}

async fn authenticate(
    link: &mut dyn TransportLink,
    shared: &Shared,
) -> Result<Identity, HandshakeError> {
    let auth = ClientMessage::Authenticate {
        token: shared.config.auth_token.clone(),
    };
    let frame = encode(&auth).map_err(|err| HandshakeError::Failed(err.to_string()))?;
    link.send(frame)
        .await
        .map_err(|err| HandshakeError::Failed(err.to_string()))?;

    let wait = async {
        loop {
            let Some(text) = link.recv().await else {
                return Err(HandshakeError::Failed("closed during handshake".into()));
            };
            match decode_event(&text) {
                Ok(ServerEvent::AuthSuccess { identity }) => return Ok(identity),
                Ok(ServerEvent::AuthFailure { reason }) => {
                    return Err(HandshakeError::Rejected(reason))
                }
                Ok(other) => debug!(kind = other.kind(), "ignoring event during handshake"),
                Err(err) => warn!(error = %err, "dropping malformed frame during handshake"),
            }
        }
    };
    match timeout(shared.config.auth_timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Failed("handshake timed out".into())),
    }
}

/// Replay queued messages FIFO. Returns false when the link died mid-flush;
/// unattempted entries go back to the queue in order.
async fn flush_queue(link: &mut dyn TransportLink, shared: &Shared) -> bool {
    let mut pending = shared.queue.lock().take_all();
    if pending.is_empty() {
        return true;
    }
    debug!(count = pending.len(), "replaying outbound queue");
    while let Some(entry) = pending.pop_front() {
        let frame = match entry.message.to_envelope(now_millis()).and_then(|e| e.encode()) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode queued message");
                continue;
            }
        };
        if let Err(err) = link.send(frame).await {
            warn!(error = %err, "queued send failed");
            let mut queue = shared.queue.lock();
            queue.recycle(entry);
            queue.restore(pending);
            return false;
        }
    }
    true
}

async fn serve(
    link: &mut dyn TransportLink,
    shared: &Shared,
    outbox_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
) -> ServeEnd {
    let period = shared.config.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                match encode(&ClientMessage::Heartbeat) {
                    Ok(frame) => {
                        if link.send(frame).await.is_err() {
                            return ServeEnd::SendFailed;
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to encode heartbeat"),
                }
            }
            maybe = outbox_rx.recv() => {
                let Some(message) = maybe else { return ServeEnd::OutboxDropped };
                match encode(&message) {
                    Ok(frame) => {
                        if link.send(frame).await.is_err() {
                            // Connection is dying; keep the message for replay.
                            shared.queue.lock().push(message);
                            return ServeEnd::SendFailed;
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to encode outbound message"),
                }
            }
            frame = link.recv() => {
                let Some(text) = frame else { return ServeEnd::Closed };
                match decode_event(&text) {
                    Err(err) => warn!(error = %err, "dropping malformed frame"),
                    Ok(event) if event.is_control() => match event {
                        ServerEvent::HeartbeatAck => debug!("heartbeat acknowledged"),
                        ServerEvent::ProtocolError { code, message } => {
                            warn!(code, message = %message, "protocol error from backend");
                        }
                        ServerEvent::AuthFailure { reason } => {
                            warn!(reason = %reason, "authentication revoked");
                            let _ = shared.faults_tx.send(SyncFault::AuthRejected(reason));
                            return ServeEnd::AuthRevoked;
                        }
                        ServerEvent::AuthSuccess { .. } => {
                            debug!("unexpected auth_success while connected");
                        }
                        _ => {}
                    },
                    Ok(event) => shared.bus.publish(event),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::transport::{PairEnd, PairTransport};
    use std::time::Duration;
    use uuid::Uuid;

    fn test_identity() -> Identity {
        Identity {
            user_id: Uuid::from_u128(7),
            display_name: "dispatch".into(),
            roles: vec!["operator".into()],
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            auth_token: "token-1".into(),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                max_attempts: 3,
            },
            heartbeat_interval: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(2),
            ..SyncConfig::default()
        }
    }

    fn manager_with_pair(
        config: SyncConfig,
    ) -> (
        ConnectionManager,
        tokio::sync::mpsc::UnboundedReceiver<PairEnd>,
        Arc<EventBus>,
    ) {
        let (transport, accepted) = PairTransport::new();
        let bus = Arc::new(EventBus::new());
        let manager = ConnectionManager::new(config, Arc::new(transport), bus.clone());
        (manager, accepted, bus)
    }

    fn send_event(end: &PairEnd, event: &ServerEvent) {
        end.tx
            .send(event.to_envelope(1).unwrap().encode().unwrap())
            .unwrap();
    }

    async fn accept_and_auth(
        accepted: &mut tokio::sync::mpsc::UnboundedReceiver<PairEnd>,
    ) -> PairEnd {
        let mut end = accepted.recv().await.unwrap();
        let frame = end.rx.recv().await.unwrap();
        let envelope = Envelope::decode(&frame).unwrap();
        assert_eq!(envelope.kind, "authenticate");
        send_event(
            &end,
            &ServerEvent::AuthSuccess {
                identity: test_identity(),
            },
        );
        end
    }

    async fn wait_for_state(manager: &ConnectionManager, target: ConnectionState) {
        let mut rx = manager.state_changes();
        timeout(Duration::from_secs(5), async {
            while *rx.borrow() != target {
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("state transition");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let (manager, mut accepted, _bus) = manager_with_pair(test_config());
        manager.connect();
        let _end = accept_and_auth(&mut accepted).await;
        wait_for_state(&manager, ConnectionState::Connected).await;

        manager.connect();
        // No second dial reaches the listener.
        assert!(accepted.try_recv().is_err());
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_flushes_in_order_on_connect() {
        let (manager, mut accepted, _bus) = manager_with_pair(test_config());
        manager.send(ClientMessage::AcknowledgeAlert {
            id: Uuid::from_u128(1),
        });
        manager.send(ClientMessage::SubscribeDomains {
            domains: vec!["alerts".into()],
        });
        assert_eq!(manager.queued_len(), 2);

        manager.connect();
        let mut end = accept_and_auth(&mut accepted).await;
        let first = Envelope::decode(&end.rx.recv().await.unwrap()).unwrap();
        let second = Envelope::decode(&end.rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.kind, "acknowledge_alert");
        assert_eq!(second.kind, "subscribe_domains");
        assert_eq!(manager.queued_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_end_disconnected() {
        let (transport, accepted) = PairTransport::new();
        transport.set_refuse(true);
        let bus = Arc::new(EventBus::new());
        let manager =
            ConnectionManager::new(test_config(), Arc::new(transport), bus);
        let mut faults = manager.faults();

        manager.connect();
        let fault = timeout(Duration::from_secs(60), faults.recv())
            .await
            .expect("fault before deadline")
            .unwrap();
        assert_eq!(fault, SyncFault::ReconnectExhausted);
        wait_for_state(&manager, ConnectionState::Disconnected).await;
        drop(accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_dropped() {
        let (manager, mut accepted, bus) = manager_with_pair(test_config());
        let mut events = bus.subscribe_all();
        manager.connect();
        let end = accept_and_auth(&mut accepted).await;
        wait_for_state(&manager, ConnectionState::Connected).await;

        end.tx.send("{not json".into()).unwrap();
        send_event(
            &end,
            &ServerEvent::AlertCleared {
                id: Uuid::from_u128(9),
            },
        );
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ServerEvent::AlertCleared {
                id: Uuid::from_u128(9)
            }
        );
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_rejection_surfaces_fault() {
        let mut config = test_config();
        config.reconnect.max_attempts = 1;
        let (manager, mut accepted, _bus) = manager_with_pair(config);
        let mut faults = manager.faults();
        manager.connect();

        let mut end = accepted.recv().await.unwrap();
        let _auth = end.rx.recv().await.unwrap();
        send_event(
            &end,
            &ServerEvent::AuthFailure {
                reason: "expired token".into(),
            },
        );
        let fault = timeout(Duration::from_secs(5), faults.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fault, SyncFault::AuthRejected("expired token".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_ticks_while_connected() {
        let (manager, mut accepted, _bus) = manager_with_pair(test_config());
        manager.connect();
        let mut end = accept_and_auth(&mut accepted).await;
        wait_for_state(&manager, ConnectionState::Connected).await;

        let frame = timeout(Duration::from_secs(60), end.rx.recv())
            .await
            .expect("heartbeat before deadline")
            .unwrap();
        let envelope = Envelope::decode(&frame).unwrap();
        assert_eq!(envelope.kind, "heartbeat");
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_triggers_reconnect_and_replay() {
        let (manager, mut accepted, _bus) = manager_with_pair(test_config());
        manager.connect();
        let end = accept_and_auth(&mut accepted).await;
        wait_for_state(&manager, ConnectionState::Connected).await;

        // Kill the first link; the supervisor should back off and redial.
        drop(end);
        wait_for_state(&manager, ConnectionState::Reconnecting).await;
        manager.send(ClientMessage::AcknowledgeAlert {
            id: Uuid::from_u128(3),
        });

        let mut end = accept_and_auth(&mut accepted).await;
        wait_for_state(&manager, ConnectionState::Connected).await;
        let frame = timeout(Duration::from_secs(5), end.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            Envelope::decode(&frame).unwrap().kind,
            "acknowledge_alert"
        );
    }
}
