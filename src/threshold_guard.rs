//! Inline finding validator guarding LLM output (SPEC_FULL.md §4.7).
//!
//! The LLM may assert "CPU high" on a resource whose current metric is 10%.
//! `ThresholdGuard` consults the live snapshot before a proposed finding is
//! accepted into `FindingsStore`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::baseline::ThresholdManager;
use crate::config::PatrolThresholds;
use crate::triage::normalize_percent;
use crate::types::{Category, Finding, GuestKind, Severity, Snapshot};

/// Resource-type-aware default thresholds used when config thresholds are
/// unavailable or the inferred metric has no configured counterpart
/// (SPEC_FULL.md §4.7 "falls back to defaults 50/60/70").
const DEFAULT_NODE_THRESHOLD: f64 = 50.0;
const DEFAULT_GUEST_THRESHOLD: f64 = 60.0;
const DEFAULT_STORAGE_THRESHOLD: f64 = 70.0;

pub struct ThresholdGuard {
    rejected_count: AtomicU64,
}

/// Why a proposed finding was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    MetricBelowThreshold { metric: String, value: f64, threshold: f64 },
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MetricBelowThreshold { metric, value, threshold } => {
                write!(f, "{metric} value {value:.1} is below the actionable threshold {threshold:.1}")
            }
        }
    }
}

impl Default for ThresholdGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ThresholdGuard {
    #[must_use]
    pub fn new() -> Self {
        Self { rejected_count: AtomicU64::new(0) }
    }

    #[must_use]
    pub fn rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }

    /// Decide whether `candidate` is actionable given the live `snapshot`.
    pub fn is_actionable(
        &self,
        candidate: &Finding,
        snapshot: &Snapshot,
        thresholds: &PatrolThresholds,
        baselines: &ThresholdManager,
    ) -> Result<(), RejectionReason> {
        // Always accept critical backup/reliability findings.
        if candidate.severity == Severity::Critical
            && matches!(candidate.category, Category::Backup | Category::Reliability)
        {
            return Ok(());
        }

        let Some(metric) = infer_metric(candidate) else {
            // Can't infer a metric to check — benefit of the doubt.
            return Ok(());
        };

        let Some(current_value) = lookup_metric(snapshot, &candidate.resource_id, &metric) else {
            return Ok(());
        };

        let anomaly = baselines.check(&candidate.resource_id, &metric, normalize_percent(current_value));
        if anomaly.level.at_least_medium() || anomaly.z_score.is_some_and(|z| z.abs() >= 2.5) {
            return Ok(());
        }

        let threshold = resolve_threshold(snapshot, &candidate.resource_id, &metric, thresholds);
        let value_pct = normalize_percent(current_value);
        if value_pct <= threshold {
            self.rejected_count.fetch_add(1, Ordering::Relaxed);
            return Err(RejectionReason::MetricBelowThreshold { metric, value: value_pct, threshold });
        }

        Ok(())
    }
}

/// Parse the finding key/title to infer which metric it is about.
fn infer_metric(candidate: &Finding) -> Option<String> {
    let haystack = format!("{} {}", candidate.key, candidate.title).to_lowercase();
    if haystack.contains("cpu") {
        Some("cpu".into())
    } else if haystack.contains("mem") {
        Some("memory".into())
    } else if haystack.contains("disk") || haystack.contains("storage") || haystack.contains("usage") {
        Some("disk".into())
    } else {
        None
    }
}

/// Look up the current value for `metric` on `resource_id`, by id then by name.
fn lookup_metric(snapshot: &Snapshot, resource_id: &str, metric: &str) -> Option<f64> {
    if let Some(node) = snapshot.nodes.iter().find(|n| n.id == resource_id || n.name == resource_id) {
        return match metric {
            "cpu" => Some(node.cpu_fraction * 100.0),
            "memory" => Some(node.mem_fraction * 100.0),
            _ => None,
        };
    }
    if let Some(guest) = snapshot.guests.iter().find(|g| g.id == resource_id || g.name == resource_id) {
        return match metric {
            "cpu" => Some(guest.cpu_fraction * 100.0),
            "memory" => Some(guest.mem_fraction * 100.0),
            "disk" => Some(guest.disk_fraction * 100.0),
            _ => None,
        };
    }
    if let Some(pool) = snapshot.storage_pools.iter().find(|s| s.id == resource_id || s.name == resource_id) {
        if metric == "disk" {
            return Some(pool.usage_fraction * 100.0);
        }
    }
    None
}

/// Resource-type-aware configured threshold (node CPU vs guest memory vs
/// storage usage), falling back to the §4.7 defaults.
fn resolve_threshold(snapshot: &Snapshot, resource_id: &str, metric: &str, thresholds: &PatrolThresholds) -> f64 {
    let resolved = thresholds.resolved();
    if snapshot.nodes.iter().any(|n| n.id == resource_id) {
        return match metric {
            "cpu" => resolved.node_cpu_warn,
            "memory" => resolved.node_mem_warn,
            _ => DEFAULT_NODE_THRESHOLD,
        };
    }
    if let Some(guest) = snapshot.guests.iter().find(|g| g.id == resource_id) {
        return match (metric, guest.kind) {
            ("memory", _) => resolved.guest_mem_warn,
            ("disk", _) => resolved.guest_disk_warn,
            (_, GuestKind::Vm | GuestKind::Container | GuestKind::DockerContainer | GuestKind::KubernetesPod) => {
                DEFAULT_GUEST_THRESHOLD
            }
        };
    }
    if snapshot.storage_pools.iter().any(|s| s.id == resource_id) {
        return resolved.storage_warn;
    }
    DEFAULT_STORAGE_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, NodeInfo, Severity};
    use chrono::Utc;

    #[test]
    fn rejects_cpu_finding_when_metric_is_low() {
        let guard = ThresholdGuard::new();
        let snapshot = Snapshot {
            nodes: vec![NodeInfo {
                id: "pve1".into(),
                name: "pve1".into(),
                cpu_fraction: 0.10,
                mem_fraction: 0.2,
                status: "online".into(),
            }],
            ..Snapshot::default()
        };
        let mut candidate = Finding::new("pve1", Category::Performance, "cpu-high", Severity::Warning, Utc::now());
        candidate.title = "CPU usage high".into();
        let baselines = ThresholdManager::new();
        let result = guard.is_actionable(&candidate, &snapshot, &PatrolThresholds::default(), &baselines);
        assert!(result.is_err());
    }

    #[test]
    fn accepts_critical_backup_regardless_of_metric() {
        let guard = ThresholdGuard::new();
        let snapshot = Snapshot::default();
        let candidate = Finding::new("vm/101", Category::Backup, "backup-missing", Severity::Critical, Utc::now());
        let baselines = ThresholdManager::new();
        let result = guard.is_actionable(&candidate, &snapshot, &PatrolThresholds::default(), &baselines);
        assert!(result.is_ok());
    }
}
