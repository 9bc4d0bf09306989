//! Offline/dev substitute for the real event transport: synthesizes a
//! connected session and feeds weighted-random domain events through the
//! same dispatch path real frames take.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};
use uuid::Uuid;

use opslink_proto::{
    Alert, AssetStatus, ClientMessage, Identity, Metrics, Severity, ServerEvent, TransitRecord,
    TransitStatus,
};

use super::{ConnectionState, Shared};
use crate::clock::now_millis;

const EVENT_INTERVAL: Duration = Duration::from_secs(2);

const ROUTES: &[&str] = &["12-crosstown", "4-harbor", "9-airport", "22-loop"];
const YARDS: &[&str] = &["north-yard", "depot-7", "central", "east-terminal"];
const ALERT_SOURCES: &[&str] = &["signal-controller", "yard-gateway", "vehicle-radio"];
const ASSET_KINDS: &[&str] = &["gps-unit", "fare-reader", "radio", "camera"];

pub(super) async fn run(shared: Arc<Shared>, mut outbox_rx: mpsc::UnboundedReceiver<ClientMessage>) {
    let _ = shared.identity_tx.send(Some(Identity {
        user_id: Uuid::new_v4(),
        display_name: "simulated-operator".into(),
        roles: vec!["operator".into()],
    }));
    let _ = shared.state_tx.send(ConnectionState::Connected);
    info!("simulation mode: synthesized connected session");

    let mut generator = EventGenerator::new(StdRng::from_entropy());
    let mut ticker = interval(EVENT_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                shared.bus.publish(generator.next_event());
            }
            maybe = outbox_rx.recv() => {
                match maybe {
                    Some(message) => {
                        debug!(kind = message.kind(), "simulation consumed outbound message");
                    }
                    None => {
                        let _ = shared.state_tx.send(ConnectionState::Disconnected);
                        return;
                    }
                }
            }
        }
    }
}

/// Weighted generator keeping small pools of live ids so updates and clears
/// reference records that actually exist.
struct EventGenerator {
    rng: StdRng,
    transits: Vec<TransitRecord>,
    alerts: Vec<Alert>,
}

impl EventGenerator {
    fn new(rng: StdRng) -> Self {
        Self {
            rng,
            transits: Vec::new(),
            alerts: Vec::new(),
        }
    }

    fn next_event(&mut self) -> ServerEvent {
        match self.rng.gen_range(0..100u32) {
            0..=34 => self.transit_event(),
            35..=59 => self.raise_alert(),
            60..=74 => self.clear_alert(),
            75..=89 => self.asset_event(),
            _ => self.metrics_event(),
        }
    }

    fn pick(&mut self, options: &[&str]) -> String {
        options[self.rng.gen_range(0..options.len())].to_string()
    }

    fn transit_event(&mut self) -> ServerEvent {
        if self.transits.len() < 3 || self.rng.gen_bool(0.35) {
            let record = TransitRecord {
                id: Uuid::new_v4(),
                route: self.pick(ROUTES),
                status: TransitStatus::Pending,
                origin: self.pick(YARDS),
                destination: self.pick(YARDS),
                updated_at: now_millis(),
            };
            self.transits.push(record.clone());
            return ServerEvent::TransitCreated(record);
        }
        let idx = self.rng.gen_range(0..self.transits.len());
        let record = &mut self.transits[idx];
        record.status = match record.status {
            TransitStatus::Pending => TransitStatus::Active,
            TransitStatus::Active => TransitStatus::Completed,
            done => done,
        };
        record.updated_at = now_millis();
        let snapshot = record.clone();
        if matches!(snapshot.status, TransitStatus::Completed) {
            self.transits.swap_remove(idx);
        }
        ServerEvent::TransitUpdated(snapshot)
    }

    fn raise_alert(&mut self) -> ServerEvent {
        let severity = match self.rng.gen_range(0..10u32) {
            0..=5 => Severity::Info,
            6..=8 => Severity::Warning,
            _ => Severity::Critical,
        };
        let alert = Alert {
            id: Uuid::new_v4(),
            severity,
            message: format!("synthetic condition #{}", self.rng.gen_range(100..999u32)),
            source: self.pick(ALERT_SOURCES),
            acknowledged: false,
            raised_at: now_millis(),
        };
        self.alerts.push(alert.clone());
        ServerEvent::AlertRaised(alert)
    }

    fn clear_alert(&mut self) -> ServerEvent {
        if self.alerts.is_empty() {
            return self.raise_alert();
        }
        let idx = self.rng.gen_range(0..self.alerts.len());
        let alert = self.alerts.swap_remove(idx);
        ServerEvent::AlertCleared { id: alert.id }
    }

    fn asset_event(&mut self) -> ServerEvent {
        ServerEvent::AssetStatusChanged(AssetStatus {
            id: Uuid::from_u128(self.rng.gen_range(1..16u128)),
            name: format!("asset-{}", self.rng.gen_range(1..16u32)),
            kind: self.pick(ASSET_KINDS),
            online: self.rng.gen_bool(0.8),
            battery_pct: Some(self.rng.gen_range(5..100u8)),
            last_seen: now_millis(),
        })
    }

    fn metrics_event(&mut self) -> ServerEvent {
        ServerEvent::MetricsSnapshot(Metrics {
            cpu_pct: self.rng.gen_range(5.0..95.0),
            memory_pct: self.rng.gen_range(20.0..80.0),
            active_connections: self.rng.gen_range(1..200u64),
            events_per_second: self.rng.gen_range(0.1..50.0),
            captured_at: now_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_emits_only_domain_events() {
        let mut generator = EventGenerator::new(StdRng::seed_from_u64(42));
        for _ in 0..200 {
            let event = generator.next_event();
            assert!(!event.is_control(), "unexpected control event {event:?}");
        }
    }

    #[test]
    fn cleared_alerts_were_previously_raised() {
        let mut generator = EventGenerator::new(StdRng::seed_from_u64(7));
        let mut raised = std::collections::HashSet::new();
        for _ in 0..500 {
            match generator.next_event() {
                ServerEvent::AlertRaised(alert) => {
                    raised.insert(alert.id);
                }
                ServerEvent::AlertCleared { id } => {
                    assert!(raised.contains(&id));
                }
                _ => {}
            }
        }
    }
}
