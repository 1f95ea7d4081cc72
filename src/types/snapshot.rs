use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of guest workload, used for threshold selection and scope equivalence
/// classes (SPEC_FULL.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestKind {
    Vm,
    Container,
    DockerContainer,
    KubernetesPod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub cpu_fraction: f64,
    pub mem_fraction: f64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestInfo {
    pub id: String,
    pub name: String,
    pub kind: GuestKind,
    pub node: String,
    pub cpu_fraction: f64,
    pub mem_fraction: f64,
    pub disk_fraction: f64,
    pub is_template: bool,
    pub is_running: bool,
    pub last_backup: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePoolInfo {
    pub id: String,
    pub name: String,
    pub node: Option<String>,
    pub usage_fraction: f64,
    pub days_to_full: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalDiskInfo {
    pub id: String,
    pub node: String,
    /// SMART health string; `"PASSED"` is the only non-critical value.
    pub health: String,
    pub wearout_remaining_pct: Option<f64>,
    pub temperature_c: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertInfo {
    pub id: String,
    pub resource_id: String,
    pub resource_type: String,
    pub level: AlertLevel,
    /// e.g. `"usage/cpu"`, `"usage/memory"`, `"offline"`, `"stopped"`.
    pub alert_type: String,
    pub metric: Option<String>,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealthInfo {
    pub resource_id: String,
    pub healthy: bool,
}

/// A days-until-event prediction surfaced by the recent-pattern/change
/// detector (SPEC_FULL.md §4.2 rule 8). The detector itself is an external
/// collaborator; the core only consumes its output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternPrediction {
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    pub category: super::severity::Category,
    pub days_until_event: f64,
    pub description: String,
}

/// Immutable, per-run fleet snapshot (SPEC_FULL.md §6 `StateProvider`).
///
/// Produced by the external `StateProvider` capability; the core never
/// mutates a snapshot once captured, so it is safe to share via `Arc` across
/// every reader of a single run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub nodes: Vec<NodeInfo>,
    pub guests: Vec<GuestInfo>,
    pub storage_pools: Vec<StoragePoolInfo>,
    pub physical_disks: Vec<PhysicalDiskInfo>,
    pub active_alerts: Vec<AlertInfo>,
    pub connection_health: Vec<ConnectionHealthInfo>,
    pub predictions: Vec<PatternPrediction>,
    /// Reachability probe results keyed by guest id, populated from
    /// `GuestProber::ping_guests` ahead of triage.
    pub guest_reachability: HashMap<String, bool>,
}
