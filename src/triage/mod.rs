//! Deterministic triage pass (SPEC_FULL.md §4.2).
//!
//! A pure function of `(snapshot, scope, thresholds, baselines)`. Produces a
//! `TriageResult` the run dispatcher uses to decide whether the LLM pass
//! runs at all ("quiet" short-circuit) and to build the LLM's briefing.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::baseline::{resource_metrics, AnomalyLevel, ThresholdManager};
use crate::config::PatrolThresholds;
use crate::types::{
    AlertLevel, Category, GuestKind, PatternPrediction, Scope, Severity, Snapshot, TriageFlag,
};

/// Rank used purely for max-severity dedup within a `(resource_id, category, metric)` key.
fn severity_rank(s: Severity) -> u8 {
    s.rank()
}

/// Output of one triage pass (SPEC_FULL.md §4.2).
#[derive(Debug, Clone)]
pub struct TriageResult {
    pub flags: Vec<TriageFlag>,
    pub summary: String,
    pub is_quiet: bool,
    /// `(resource_id, category)` pairs that were flagged this run — used by
    /// stale reconciliation to know what is still "live".
    pub flagged_ids: HashSet<(String, Category)>,
}

/// Normalize a metric value to a 0-100 percent scale: fractions in `[0, 1]`
/// are multiplied by 100 (SPEC_FULL.md §8 boundary cases); anything else is
/// assumed already a percent.
#[must_use]
pub fn normalize_percent(value: f64) -> f64 {
    if (0.0..=1.0).contains(&value) {
        value * 100.0
    } else {
        value
    }
}

/// Half-open severity banding: `value == threshold` is not a flag,
/// `value > threshold` is (SPEC_FULL.md §8 boundary cases).
fn band(value: f64, warn: f64, watch: f64) -> Option<Severity> {
    if value > warn {
        Some(Severity::Warning)
    } else if value > watch {
        Some(Severity::Watch)
    } else {
        None
    }
}

pub struct TriageEvaluator;

impl TriageEvaluator {
    /// Run the full ordered rule set over `snapshot` restricted to `scope`,
    /// returning the deduplicated `TriageResult`.
    #[must_use]
    pub fn evaluate(
        snapshot: &Snapshot,
        scope: &Scope,
        thresholds: &PatrolThresholds,
        baselines: &ThresholdManager,
        active_findings_count: usize,
        now: DateTime<Utc>,
    ) -> TriageResult {
        let resolved = thresholds.resolved();
        let mut candidates: Vec<TriageFlag> = Vec::new();

        // Rule 1: threshold flags.
        for node in &snapshot.nodes {
            if !scope.matches(&node.id, "node") {
                continue;
            }
            let cpu = normalize_percent(node.cpu_fraction * 100.0);
            if let Some(sev) = band(cpu, resolved.node_cpu_warn, resolved.node_cpu_watch) {
                candidates.push(TriageFlag {
                    resource_id: node.id.clone(),
                    resource_name: node.name.clone(),
                    resource_type: "node".into(),
                    category: Category::Performance,
                    severity: sev,
                    reason: format!("CPU usage {cpu:.1}% exceeds threshold"),
                    metric: Some(resource_metrics::CPU.into()),
                    value: Some(cpu),
                    threshold: Some(resolved.node_cpu_warn),
                });
            }
            let mem = normalize_percent(node.mem_fraction * 100.0);
            if let Some(sev) = band(mem, resolved.node_mem_warn, resolved.node_mem_watch) {
                candidates.push(TriageFlag {
                    resource_id: node.id.clone(),
                    resource_name: node.name.clone(),
                    resource_type: "node".into(),
                    category: Category::Performance,
                    severity: sev,
                    reason: format!("Memory usage {mem:.1}% exceeds threshold"),
                    metric: Some(resource_metrics::MEMORY.into()),
                    value: Some(mem),
                    threshold: Some(resolved.node_mem_warn),
                });
            }
        }

        for guest in &snapshot.guests {
            let kind_tag = guest_kind_tag(guest.kind);
            if !scope.matches(&guest.id, kind_tag) {
                continue;
            }
            let mem = normalize_percent(guest.mem_fraction * 100.0);
            if let Some(sev) = band(mem, resolved.guest_mem_warn, resolved.guest_mem_watch) {
                candidates.push(TriageFlag {
                    resource_id: guest.id.clone(),
                    resource_name: guest.name.clone(),
                    resource_type: kind_tag.into(),
                    category: Category::Performance,
                    severity: sev,
                    reason: format!("Memory usage {mem:.1}% exceeds threshold"),
                    metric: Some(resource_metrics::MEMORY.into()),
                    value: Some(mem),
                    threshold: Some(resolved.guest_mem_warn),
                });
            }
            let disk = normalize_percent(guest.disk_fraction * 100.0);
            let disk_sev = if disk > resolved.guest_disk_critical {
                Some(Severity::Critical)
            } else {
                band(disk, resolved.guest_disk_warn, resolved.guest_disk_watch)
            };
            if let Some(sev) = disk_sev {
                candidates.push(TriageFlag {
                    resource_id: guest.id.clone(),
                    resource_name: guest.name.clone(),
                    resource_type: kind_tag.into(),
                    category: Category::Capacity,
                    severity: sev,
                    reason: format!("Disk usage {disk:.1}% exceeds threshold"),
                    metric: Some(resource_metrics::DISK.into()),
                    value: Some(disk),
                    threshold: Some(resolved.guest_disk_warn),
                });
            }

            // Rule 4: backup staleness, running non-template guests only.
            if guest.is_running && !guest.is_template {
                match guest.last_backup {
                    None => candidates.push(TriageFlag {
                        resource_id: guest.id.clone(),
                        resource_name: guest.name.clone(),
                        resource_type: kind_tag.into(),
                        category: Category::Backup,
                        severity: Severity::Warning,
                        reason: "Never backed up".into(),
                        metric: None,
                        value: None,
                        threshold: None,
                    }),
                    Some(last) => {
                        let age_hours = (now - last).num_hours();
                        if age_hours > 48 {
                            candidates.push(TriageFlag {
                                resource_id: guest.id.clone(),
                                resource_name: guest.name.clone(),
                                resource_type: kind_tag.into(),
                                category: Category::Backup,
                                severity: Severity::Warning,
                                reason: format!("Last backup {age_hours} hours ago"),
                                metric: None,
                                value: Some(age_hours as f64),
                                threshold: Some(48.0),
                            });
                        }
                    }
                }
            }
        }

        for pool in &snapshot.storage_pools {
            if !scope.matches(&pool.id, "storage") {
                continue;
            }
            let usage = normalize_percent(pool.usage_fraction * 100.0);
            let usage_sev = if usage > resolved.storage_critical {
                Some(Severity::Critical)
            } else {
                band(usage, resolved.storage_warn, resolved.storage_watch)
            };
            if let Some(sev) = usage_sev {
                candidates.push(TriageFlag {
                    resource_id: pool.id.clone(),
                    resource_name: pool.name.clone(),
                    resource_type: "storage".into(),
                    category: Category::Capacity,
                    severity: sev,
                    reason: format!("Storage usage {usage:.1}% exceeds threshold"),
                    metric: Some("usage".into()),
                    value: Some(usage),
                    threshold: Some(resolved.storage_warn),
                });
            }

            // Rule 3: capacity forecast.
            if let Some(days) = pool.days_to_full {
                let sev = if days <= 7.0 {
                    Some(Severity::Warning)
                } else if days <= 30.0 {
                    Some(Severity::Watch)
                } else {
                    None
                };
                if let Some(sev) = sev {
                    candidates.push(TriageFlag {
                        resource_id: pool.id.clone(),
                        resource_name: pool.name.clone(),
                        resource_type: "storage".into(),
                        category: Category::Capacity,
                        severity: sev,
                        reason: format!("Projected to fill in {days:.1} days"),
                        metric: Some("capacity_forecast".into()),
                        value: Some(days),
                        threshold: None,
                    });
                }
            }
        }

        // Rule 2: baseline anomalies (nodes + guests, cpu + memory).
        for node in &snapshot.nodes {
            if !scope.matches(&node.id, "node") {
                continue;
            }
            push_baseline_flag(&mut candidates, baselines, &node.id, &node.name, "node", node.cpu_fraction * 100.0, resource_metrics::CPU);
            push_baseline_flag(&mut candidates, baselines, &node.id, &node.name, "node", node.mem_fraction * 100.0, resource_metrics::MEMORY);
        }
        for guest in &snapshot.guests {
            let kind_tag = guest_kind_tag(guest.kind);
            if !scope.matches(&guest.id, kind_tag) {
                continue;
            }
            push_baseline_flag(&mut candidates, baselines, &guest.id, &guest.name, kind_tag, guest.cpu_fraction * 100.0, resource_metrics::CPU);
        }

        // Rule 5: physical disk health.
        for disk in &snapshot.physical_disks {
            if !scope.matches(&disk.id, "host") {
                continue;
            }
            if disk.health != "PASSED" {
                candidates.push(TriageFlag {
                    resource_id: disk.id.clone(),
                    resource_name: disk.id.clone(),
                    resource_type: "host".into(),
                    category: Category::Reliability,
                    severity: Severity::Critical,
                    reason: format!("SMART health: {}", disk.health),
                    metric: Some("smart_health".into()),
                    value: None,
                    threshold: None,
                });
            } else {
                if let Some(remaining) = disk.wearout_remaining_pct {
                    if remaining < 20.0 {
                        candidates.push(TriageFlag {
                            resource_id: disk.id.clone(),
                            resource_name: disk.id.clone(),
                            resource_type: "host".into(),
                            category: Category::Reliability,
                            severity: Severity::Warning,
                            reason: format!("SSD wearout remaining {remaining:.1}%"),
                            metric: Some("ssd_wearout".into()),
                            value: Some(remaining),
                            threshold: Some(20.0),
                        });
                    }
                }
                if let Some(temp) = disk.temperature_c {
                    if temp > 55.0 {
                        candidates.push(TriageFlag {
                            resource_id: disk.id.clone(),
                            resource_name: disk.id.clone(),
                            resource_type: "host".into(),
                            category: Category::Reliability,
                            severity: Severity::Warning,
                            reason: format!("Disk temperature {temp:.1}\u{b0}C"),
                            metric: Some("disk_temperature".into()),
                            value: Some(temp),
                            threshold: Some(55.0),
                        });
                    }
                }
            }
        }

        // Rule 6: active alerts.
        for alert in &snapshot.active_alerts {
            if !scope.matches(&alert.resource_id, &alert.resource_type) {
                continue;
            }
            let severity = match alert.level {
                AlertLevel::Critical => Severity::Critical,
                AlertLevel::Warning => Severity::Warning,
            };
            let category = alert_category(&alert.alert_type);
            candidates.push(TriageFlag {
                resource_id: alert.resource_id.clone(),
                resource_name: alert.resource_id.clone(),
                resource_type: alert.resource_type.clone(),
                category,
                severity,
                reason: alert.message.clone(),
                metric: alert.metric.clone(),
                value: alert.value,
                threshold: alert.threshold,
            });
        }

        // Rule 7: connectivity.
        for conn in &snapshot.connection_health {
            if !conn.healthy {
                candidates.push(TriageFlag {
                    resource_id: conn.resource_id.clone(),
                    resource_name: conn.resource_id.clone(),
                    resource_type: "node".into(),
                    category: Category::Reliability,
                    severity: Severity::Critical,
                    reason: "Connection unhealthy".into(),
                    metric: Some("connectivity".into()),
                    value: None,
                    threshold: None,
                });
            }
        }
        for (guest_id, reachable) in &snapshot.guest_reachability {
            if !reachable {
                if let Some(guest) = snapshot.guests.iter().find(|g| &g.id == guest_id) {
                    candidates.push(TriageFlag {
                        resource_id: guest.id.clone(),
                        resource_name: guest.name.clone(),
                        resource_type: guest_kind_tag(guest.kind).into(),
                        category: Category::Reliability,
                        severity: Severity::Warning,
                        reason: "Guest not reachable".into(),
                        metric: Some("reachability".into()),
                        value: None,
                        threshold: None,
                    });
                }
            }
        }

        // Rule 8: recent pattern/change predictions.
        for pred in &snapshot.predictions {
            if !scope.matches(&pred.resource_id, &pred.resource_type) {
                continue;
            }
            candidates.push(TriageFlag {
                resource_id: pred.resource_id.clone(),
                resource_name: pred.resource_name.clone(),
                resource_type: pred.resource_type.clone(),
                category: pred.category,
                severity: Severity::Watch,
                reason: pred.description.clone(),
                metric: Some("pattern_prediction".into()),
                value: Some(pred.days_until_event),
                threshold: None,
            });
        }

        let flags = dedup_flags(candidates);
        let flagged_ids: HashSet<(String, Category)> = flags
            .iter()
            .map(|f| (f.resource_id.clone(), f.category))
            .collect();
        let is_quiet = flags.is_empty() && active_findings_count == 0;
        let summary = summarize(&flags);

        TriageResult {
            flags,
            summary,
            is_quiet,
            flagged_ids,
        }
    }
}

fn push_baseline_flag(
    out: &mut Vec<TriageFlag>,
    baselines: &ThresholdManager,
    resource_id: &str,
    resource_name: &str,
    resource_type: &str,
    value_pct: f64,
    metric: &str,
) {
    let result = baselines.check(resource_id, metric, value_pct);
    let severity = match result.level {
        AnomalyLevel::High | AnomalyLevel::Critical => Some(Severity::Warning),
        AnomalyLevel::Medium => Some(Severity::Watch),
        _ => {
            if result.z_score.is_some_and(|z| z.abs() >= 2.5) {
                Some(Severity::Watch)
            } else {
                None
            }
        }
    };
    if let Some(severity) = severity {
        out.push(TriageFlag {
            resource_id: resource_id.to_string(),
            resource_name: resource_name.to_string(),
            resource_type: resource_type.to_string(),
            category: Category::Performance,
            severity,
            reason: format!(
                "{metric} deviates from learned baseline (z={:.2})",
                result.z_score.unwrap_or(0.0)
            ),
            metric: Some(format!("{metric}_baseline")),
            value: Some(value_pct),
            threshold: None,
        });
    }
}

fn guest_kind_tag(kind: GuestKind) -> &'static str {
    match kind {
        GuestKind::Vm => "vm",
        GuestKind::Container => "lxc",
        GuestKind::DockerContainer => "docker_container",
        GuestKind::KubernetesPod => "kubernetes",
    }
}

fn alert_category(alert_type: &str) -> Category {
    if alert_type.contains("backup") {
        Category::Backup
    } else if alert_type.contains("security") {
        Category::Security
    } else if alert_type.contains("usage") || alert_type.contains("cpu") || alert_type.contains("memory") {
        Category::Performance
    } else if alert_type.contains("offline") || alert_type.contains("stopped") {
        Category::Reliability
    } else {
        Category::General
    }
}

/// Keep the highest-severity flag per `(resource_id, category, metric)` key;
/// distinct metrics on the same resource/category stay as separate flags
/// (SPEC_FULL.md §4.2 dedup rule).
fn dedup_flags(flags: Vec<TriageFlag>) -> Vec<TriageFlag> {
    let mut best: HashMap<(String, Category, Option<String>), TriageFlag> = HashMap::new();
    for flag in flags {
        let key = flag.dedup_key();
        match best.get(&key) {
            Some(existing) if severity_rank(existing.severity) >= severity_rank(flag.severity) => {}
            _ => {
                best.insert(key, flag);
            }
        }
    }
    let mut out: Vec<TriageFlag> = best.into_values().collect();
    out.sort_by(|a, b| a.resource_id.cmp(&b.resource_id).then(a.category.to_string().cmp(&b.category.to_string())));
    out
}

fn summarize(flags: &[TriageFlag]) -> String {
    if flags.is_empty() {
        return "No triage flags raised.".to_string();
    }
    let critical = flags.iter().filter(|f| f.severity == Severity::Critical).count();
    let warning = flags.iter().filter(|f| f.severity == Severity::Warning).count();
    let watch = flags.iter().filter(|f| f.severity == Severity::Watch).count();
    format!("{} flags: {critical} critical, {warning} warning, {watch} watch", flags.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeInfo;

    fn thresholds() -> PatrolThresholds {
        PatrolThresholds {
            node_cpu_warn: 80.0,
            ..PatrolThresholds::default()
        }
    }

    #[test]
    fn node_cpu_crosses_threshold() {
        let snapshot = Snapshot {
            nodes: vec![NodeInfo {
                id: "pve1".into(),
                name: "pve1".into(),
                cpu_fraction: 0.92,
                mem_fraction: 0.30,
                status: "online".into(),
            }],
            ..Snapshot::default()
        };
        let baselines = ThresholdManager::new();
        let result = TriageEvaluator::evaluate(&snapshot, &Scope::default(), &thresholds(), &baselines, 0, Utc::now());
        assert!(!result.is_quiet);
        assert_eq!(result.flags.len(), 1);
        assert_eq!(result.flags[0].severity, Severity::Warning);
    }

    #[test]
    fn quiet_when_no_flags_and_no_active_findings() {
        let snapshot = Snapshot::default();
        let baselines = ThresholdManager::new();
        let result = TriageEvaluator::evaluate(&snapshot, &Scope::default(), &thresholds(), &baselines, 0, Utc::now());
        assert!(result.is_quiet);
    }

    #[test]
    fn guest_disk_above_critical_flags_critical_not_warning() {
        use crate::types::GuestKind;
        let snapshot = Snapshot {
            guests: vec![crate::types::GuestInfo {
                id: "vm/101".into(),
                name: "vm101".into(),
                kind: GuestKind::Vm,
                node: "pve1".into(),
                cpu_fraction: 0.10,
                mem_fraction: 0.10,
                disk_fraction: 0.97,
                is_template: false,
                is_running: true,
                last_backup: None,
            }],
            ..Snapshot::default()
        };
        let baselines = ThresholdManager::new();
        let result = TriageEvaluator::evaluate(&snapshot, &Scope::default(), &thresholds(), &baselines, 0, Utc::now());
        let disk_flag = result.flags.iter().find(|f| f.category == Category::Capacity).expect("disk flag raised");
        assert_eq!(disk_flag.severity, Severity::Critical);
    }

    #[test]
    fn storage_pool_above_critical_flags_critical_not_warning() {
        let snapshot = Snapshot {
            storage_pools: vec![crate::types::StoragePoolInfo {
                id: "pool1".into(),
                name: "pool1".into(),
                node: None,
                usage_fraction: 0.98,
                days_to_full: None,
            }],
            ..Snapshot::default()
        };
        let baselines = ThresholdManager::new();
        let result = TriageEvaluator::evaluate(&snapshot, &Scope::default(), &thresholds(), &baselines, 0, Utc::now());
        let usage_flag = result
            .flags
            .iter()
            .find(|f| f.metric.as_deref() == Some("usage"))
            .expect("usage flag raised");
        assert_eq!(usage_flag.severity, Severity::Critical);
    }

    #[test]
    fn threshold_is_half_open() {
        let snapshot = Snapshot {
            nodes: vec![NodeInfo {
                id: "pve1".into(),
                name: "pve1".into(),
                cpu_fraction: 0.80,
                mem_fraction: 0.0,
                status: "online".into(),
            }],
            ..Snapshot::default()
        };
        let baselines = ThresholdManager::new();
        let result = TriageEvaluator::evaluate(&snapshot, &Scope::default(), &thresholds(), &baselines, 0, Utc::now());
        assert!(result.flags.is_empty(), "value == threshold must not flag");
    }
}
