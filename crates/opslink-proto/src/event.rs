use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::envelope::{Envelope, ProtoError};
use crate::model::{Alert, AssetStatus, Identity, Metrics, TransitRecord};

/// Inbound events, validated and narrowed at the connection boundary.
/// Control variants are consumed by the connection manager and never reach
/// subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    AuthSuccess { identity: Identity },
    AuthFailure { reason: String },
    HeartbeatAck,
    ProtocolError { code: u16, message: String },
    TransitCreated(TransitRecord),
    TransitUpdated(TransitRecord),
    TransitDeleted { id: Uuid },
    AlertRaised(Alert),
    AlertUpdated(Alert),
    AlertCleared { id: Uuid },
    AssetStatusChanged(AssetStatus),
    MetricsSnapshot(Metrics),
}

#[derive(Debug, Clone, Deserialize)]
struct IdPayload {
    id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorPayload {
    code: u16,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ReasonPayload {
    reason: String,
}

impl ServerEvent {
    /// Wire name of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthSuccess { .. } => "auth_success",
            Self::AuthFailure { .. } => "auth_failure",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::ProtocolError { .. } => "protocol_error",
            Self::TransitCreated(_) => "transit_created",
            Self::TransitUpdated(_) => "transit_updated",
            Self::TransitDeleted { .. } => "transit_deleted",
            Self::AlertRaised(_) => "alert_raised",
            Self::AlertUpdated(_) => "alert_updated",
            Self::AlertCleared { .. } => "alert_cleared",
            Self::AssetStatusChanged(_) => "asset_status",
            Self::MetricsSnapshot(_) => "metrics_snapshot",
        }
    }

    /// Control events drive the connection state machine internally.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::AuthSuccess { .. }
                | Self::AuthFailure { .. }
                | Self::HeartbeatAck
                | Self::ProtocolError { .. }
        )
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtoError> {
        fn payload<T: serde::de::DeserializeOwned>(
            kind: &str,
            data: &serde_json::Value,
        ) -> Result<T, ProtoError> {
            serde_json::from_value(data.clone()).map_err(|err| ProtoError::InvalidPayload {
                kind: kind.to_string(),
                reason: err.to_string(),
            })
        }

        let kind = envelope.kind.as_str();
        let data = &envelope.data;
        match kind {
            "auth_success" => Ok(Self::AuthSuccess {
                identity: payload(kind, data)?,
            }),
            "auth_failure" => {
                let ReasonPayload { reason } = payload(kind, data)?;
                Ok(Self::AuthFailure { reason })
            }
            "heartbeat_ack" => Ok(Self::HeartbeatAck),
            "protocol_error" => {
                let ErrorPayload { code, message } = payload(kind, data)?;
                Ok(Self::ProtocolError { code, message })
            }
            "transit_created" => Ok(Self::TransitCreated(payload(kind, data)?)),
            "transit_updated" => Ok(Self::TransitUpdated(payload(kind, data)?)),
            "transit_deleted" => {
                let IdPayload { id } = payload(kind, data)?;
                Ok(Self::TransitDeleted { id })
            }
            "alert_raised" => Ok(Self::AlertRaised(payload(kind, data)?)),
            "alert_updated" => Ok(Self::AlertUpdated(payload(kind, data)?)),
            "alert_cleared" => {
                let IdPayload { id } = payload(kind, data)?;
                Ok(Self::AlertCleared { id })
            }
            "asset_status" => Ok(Self::AssetStatusChanged(payload(kind, data)?)),
            "metrics_snapshot" => Ok(Self::MetricsSnapshot(payload(kind, data)?)),
            other => Err(ProtoError::UnknownKind(other.to_string())),
        }
    }

    pub fn to_envelope(&self, timestamp: u64) -> Result<Envelope, ProtoError> {
        let data = match self {
            Self::AuthSuccess { identity } => serde_json::to_value(identity),
            Self::AuthFailure { reason } => Ok(json!({ "reason": reason })),
            Self::HeartbeatAck => Ok(serde_json::Value::Null),
            Self::ProtocolError { code, message } => {
                Ok(json!({ "code": code, "message": message }))
            }
            Self::TransitCreated(record) | Self::TransitUpdated(record) => {
                serde_json::to_value(record)
            }
            Self::TransitDeleted { id } | Self::AlertCleared { id } => Ok(json!({ "id": id })),
            Self::AlertRaised(alert) | Self::AlertUpdated(alert) => serde_json::to_value(alert),
            Self::AssetStatusChanged(status) => serde_json::to_value(status),
            Self::MetricsSnapshot(metrics) => serde_json::to_value(metrics),
        }
        .map_err(|err| ProtoError::Encode(err.to_string()))?;
        Ok(Envelope::new(self.kind(), timestamp, data))
    }
}

/// Outbound messages sent over the event connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate { token: String },
    Heartbeat,
    AcknowledgeAlert { id: Uuid },
    UpdateTransit { record: TransitRecord },
    SubscribeDomains { domains: Vec<String> },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Heartbeat => "heartbeat",
            Self::AcknowledgeAlert { .. } => "acknowledge_alert",
            Self::UpdateTransit { .. } => "update_transit",
            Self::SubscribeDomains { .. } => "subscribe_domains",
        }
    }

    pub fn to_envelope(&self, timestamp: u64) -> Result<Envelope, ProtoError> {
        let data = match self {
            Self::Authenticate { token } => json!({ "token": token }),
            Self::Heartbeat => serde_json::Value::Null,
            Self::AcknowledgeAlert { id } => json!({ "id": id }),
            Self::UpdateTransit { record } => serde_json::to_value(record)
                .map_err(|err| ProtoError::Encode(err.to_string()))?,
            Self::SubscribeDomains { domains } => json!({ "domains": domains }),
        };
        Ok(Envelope::new(self.kind(), timestamp, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Severity, TransitStatus};

    fn sample_transit() -> TransitRecord {
        TransitRecord {
            id: Uuid::new_v4(),
            route: "12-crosstown".into(),
            status: TransitStatus::Pending,
            origin: "north-yard".into(),
            destination: "depot-7".into(),
            updated_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn domain_event_round_trips_through_envelope() {
        let event = ServerEvent::TransitUpdated(sample_transit());
        let envelope = event.to_envelope(42).unwrap();
        assert_eq!(envelope.kind, "transit_updated");
        let decoded = ServerEvent::from_envelope(&envelope).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn control_events_are_flagged() {
        let event = ServerEvent::AuthFailure {
            reason: "bad token".into(),
        };
        assert!(event.is_control());
        assert!(!ServerEvent::AlertCleared { id: Uuid::new_v4() }.is_control());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let envelope = Envelope::new("telemetry_v9", 1, serde_json::Value::Null);
        assert_eq!(
            ServerEvent::from_envelope(&envelope),
            Err(ProtoError::UnknownKind("telemetry_v9".into()))
        );
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let envelope = Envelope::new("alert_raised", 1, serde_json::json!({ "id": 7 }));
        assert!(matches!(
            ServerEvent::from_envelope(&envelope),
            Err(ProtoError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn alert_severity_orders_by_urgency() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let envelope = Envelope::decode(r#"{"type":"heartbeat_ack","timestamp":9}"#).unwrap();
        assert_eq!(envelope.data, serde_json::Value::Null);
        assert_eq!(
            ServerEvent::from_envelope(&envelope).unwrap(),
            ServerEvent::HeartbeatAck
        );
    }
}
