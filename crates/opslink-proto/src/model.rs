use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

/// One transit movement tracked by the operations backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitRecord {
    pub id: Uuid,
    pub route: String,
    pub status: TransitStatus,
    pub origin: String,
    pub destination: String,
    /// Unix millis of the last server-side change.
    pub updated_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetStatus {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_pct: Option<u8>,
    pub last_seen: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: Uuid,
    pub severity: Severity,
    pub message: String,
    pub source: String,
    pub acknowledged: bool,
    pub raised_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub active_connections: u64,
    pub events_per_second: f64,
    pub captured_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
    pub roles: Vec<String>,
}
