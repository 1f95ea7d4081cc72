//! Scenario 1: node CPU crosses threshold then clears (SPEC_FULL.md §8).

use std::sync::Arc;

use chrono::Utc;
use patrol_engine::baseline::ThresholdManager;
use patrol_engine::clock::FakeClock;
use patrol_engine::config::PatrolThresholds;
use patrol_engine::findings::FindingsStore;
use patrol_engine::types::{Category, Finding, NodeInfo, Scope, Severity, Snapshot};
use patrol_engine::triage::TriageEvaluator;

fn thresholds() -> PatrolThresholds {
    PatrolThresholds { node_cpu_warn: 80.0, ..PatrolThresholds::default() }
}

fn snapshot_with_cpu(cpu_fraction: f64) -> Snapshot {
    Snapshot {
        nodes: vec![NodeInfo {
            id: "pve1".into(),
            name: "pve1".into(),
            cpu_fraction,
            mem_fraction: 0.30,
            status: "online".into(),
        }],
        ..Snapshot::default()
    }
}

#[test]
fn node_cpu_crosses_then_clears_and_stale_reconciliation_resolves() {
    let clock = Arc::new(FakeClock::new(Utc::now()));
    let store = FindingsStore::new(clock.clone(), None);
    let baselines = ThresholdManager::new();

    // Run 1: CPU at 92%, above the 80% warn threshold.
    let hot = snapshot_with_cpu(0.92);
    let triage = TriageEvaluator::evaluate(&hot, &Scope::default(), &thresholds(), &baselines, 0, clock.now());
    assert!(!triage.is_quiet);
    assert_eq!(triage.flags.len(), 1);
    assert_eq!(triage.flags[0].severity, Severity::Warning);

    // LLM reports the flag as a finding.
    let finding = Finding::new("pve1", Category::Performance, "cpu-high", Severity::Warning, clock.now());
    assert!(store.add(finding.clone()));

    // Run 2: CPU has dropped; triage no longer flags it.
    let active_before = store.get_active(Severity::Info);
    let cool = snapshot_with_cpu(0.20);
    let triage2 = TriageEvaluator::evaluate(&cool, &Scope::default(), &thresholds(), &baselines, active_before.len(), clock.now());
    assert!(triage2.flags.is_empty());
    assert!(!triage2.flagged_ids.contains(&("pve1".to_string(), Category::Performance)));

    // Stale reconciliation: the LLM didn't re-report (times_raised unchanged),
    // and the resource/category isn't in this run's flagged set, so it resolves.
    for f in &active_before {
        if !triage2.flagged_ids.contains(&(f.resource_id.clone(), f.category)) {
            assert!(store.resolve_with_reason(f.id, "no longer detected"));
        }
    }

    let resolved = store.get(finding.id).expect("finding still present");
    assert!(resolved.resolved_at.is_some());
    assert_eq!(resolved.resolve_reason, "no longer detected");
}
