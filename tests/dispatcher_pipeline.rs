//! Scenarios 2 and 3: suppressed false positive, severity escalation
//! (SPEC_FULL.md §8), driven through the full `RunDispatcher` pipeline.

use std::sync::Arc;

use chrono::Utc;
use patrol_engine::alert_reviewer::AlertReviewer;
use patrol_engine::baseline::ThresholdManager;
use patrol_engine::capabilities::{ChatStreamChunk, PatrolToolCall};
use patrol_engine::circuit_breaker::CircuitBreaker;
use patrol_engine::clock::FakeClock;
use patrol_engine::config::{AutonomyLevel, ConfigSurface, PatrolConfig};
use patrol_engine::dispatcher::RunDispatcher;
use patrol_engine::findings::FindingsStore;
use patrol_engine::investigation::InvestigationTrigger;
use patrol_engine::stream::StreamBus;
use patrol_engine::testing::{
    FakeAlertResolver, FakeChatService, FakeFindingsPersistence, FakeInvestigationOrchestrator, FakeStateProvider,
};
use patrol_engine::threshold_guard::ThresholdGuard;
use patrol_engine::types::{Category, DismissReason, Finding, GuestInfo, GuestKind, NodeInfo, Severity, Snapshot};

fn node_snapshot(cpu_fraction: f64) -> Snapshot {
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

fn backup_missing_guest() -> Snapshot {
    Snapshot {
        guests: vec![GuestInfo {
            id: "vm/101".into(),
            name: "vm101".into(),
            kind: GuestKind::Vm,
            node: "pve1".into(),
            cpu_fraction: 0.10,
            mem_fraction: 0.10,
            disk_fraction: 0.10,
            is_template: false,
            is_running: true,
            last_backup: None,
        }],
        ..Snapshot::default()
    }
}

struct Harness {
    dispatcher: Arc<RunDispatcher>,
    findings: Arc<FindingsStore>,
    state_provider: Arc<FakeStateProvider>,
    chat: Arc<FakeChatService>,
}

fn build(snapshot: Snapshot, script: Vec<ChatStreamChunk>) -> Harness {
    let clock = Arc::new(FakeClock::new(Utc::now()));
    let config = ConfigSurface::new(PatrolConfig { autonomy_level: AutonomyLevel::Monitor, ..PatrolConfig::default() });
    let findings = FindingsStore::new(clock.clone(), None);
    let baselines = Arc::new(ThresholdManager::new());
    let guard = Arc::new(ThresholdGuard::new());
    let breaker = Arc::new(CircuitBreaker::new(clock.clone()));
    let stream = Arc::new(StreamBus::new(clock.clone()));
    let state_provider = Arc::new(FakeStateProvider::new(snapshot));
    let chat = Arc::new(FakeChatService::new(script));
    let orchestrator = Arc::new(FakeInvestigationOrchestrator::new());
    let alert_resolver = Arc::new(FakeAlertResolver::default());
    let investigation = Arc::new(InvestigationTrigger::new(findings.clone(), orchestrator, clock.clone()));
    let alert_reviewer = Arc::new(AlertReviewer::new(alert_resolver, None));

    let dispatcher = Arc::new(RunDispatcher::new(
        findings.clone(),
        baselines,
        guard,
        breaker,
        stream,
        investigation,
        alert_reviewer,
        state_provider.clone(),
        Some(chat.clone()),
        None,
        config,
        clock,
    ));
    Harness { dispatcher, findings, state_provider, chat }
}

fn backup_missing_finding(now: chrono::DateTime<Utc>) -> Finding {
    Finding::new("vm/101", Category::Backup, "backup-missing", Severity::Warning, now)
}

#[tokio::test]
async fn suppressed_false_positive_produces_no_new_finding() {
    let now = Utc::now();
    let harness = build(backup_missing_guest(), vec![
        ChatStreamChunk::ToolCall(PatrolToolCall::ReportFinding(Box::new(backup_missing_finding(now)))),
        ChatStreamChunk::Done { input_tokens: 10, output_tokens: 5 },
    ]);

    harness.dispatcher.run_full("test").await;
    let id = backup_missing_finding(now).id;
    harness.findings.dismiss(id, DismissReason::NotAnIssue, "known test VM");
    assert_eq!(harness.findings.get_active(Severity::Info).len(), 0);

    // Second run reports the identical finding again; it must stay suppressed.
    harness.dispatcher.run_full("test").await;
    assert_eq!(harness.findings.get_active(Severity::Info).len(), 0);
    let stored = harness.findings.get(id).expect("finding record retained");
    assert!(stored.times_raised >= 2, "times_raised should still update under suppression");
}

#[tokio::test]
async fn severity_escalation_reactivates_dismissed_finding() {
    let now = Utc::now();
    let warning = Finding::new("vm/101", Category::Performance, "cpu-high", Severity::Warning, now);
    let id = warning.id;

    let harness = build(backup_missing_guest(), vec![
        ChatStreamChunk::ToolCall(PatrolToolCall::ReportFinding(Box::new(warning))),
        ChatStreamChunk::Done { input_tokens: 10, output_tokens: 5 },
    ]);
    harness.dispatcher.run_full("test").await;
    harness.findings.dismiss(id, DismissReason::WillFixLater, "later");
    assert_eq!(harness.findings.get_active(Severity::Info).len(), 0);

    let critical = Finding::new("vm/101", Category::Performance, "cpu-high", Severity::Critical, now);
    assert_eq!(critical.id, id, "same identity triple must hash to the same id");
    harness.findings.add(critical);

    let active = harness.findings.get_active(Severity::Info);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].severity, Severity::Critical);
    assert!(active[0].dismissed_reason.is_none());
}

#[tokio::test]
async fn stale_reconciliation_resolves_with_the_spec_mandated_reason() {
    let now = Utc::now();
    let cpu_high = Finding::new("pve1", Category::Performance, "cpu-high", Severity::Warning, now);
    let id = cpu_high.id;

    let harness = build(node_snapshot(0.92), vec![
        ChatStreamChunk::ToolCall(PatrolToolCall::ReportFinding(Box::new(cpu_high))),
        ChatStreamChunk::Done { input_tokens: 10, output_tokens: 5 },
    ]);
    harness.dispatcher.run_full("test").await;
    assert_eq!(harness.findings.get_active(Severity::Info).len(), 1);

    // CPU drops back down and the LLM pass no longer re-reports it.
    harness.state_provider.set(node_snapshot(0.20));
    harness.chat.set_script(vec![ChatStreamChunk::Done { input_tokens: 1, output_tokens: 1 }]);
    harness.dispatcher.run_full("test").await;

    let resolved = harness.findings.get(id).expect("finding retained");
    assert!(resolved.resolved_at.is_some());
    assert_eq!(resolved.resolve_reason, "no longer detected");
}

#[tokio::test]
async fn last_completed_run_at_reflects_persisted_history_after_a_run() {
    let clock = Arc::new(FakeClock::new(Utc::now()));
    let config = ConfigSurface::new(PatrolConfig { autonomy_level: AutonomyLevel::Monitor, ..PatrolConfig::default() });
    let findings = FindingsStore::new(clock.clone(), None);
    let baselines = Arc::new(ThresholdManager::new());
    let guard = Arc::new(ThresholdGuard::new());
    let breaker = Arc::new(CircuitBreaker::new(clock.clone()));
    let stream = Arc::new(StreamBus::new(clock.clone()));
    let state_provider = Arc::new(FakeStateProvider::new(backup_missing_guest()));
    let chat = Arc::new(FakeChatService::new(vec![ChatStreamChunk::Done { input_tokens: 1, output_tokens: 1 }]));
    let orchestrator = Arc::new(FakeInvestigationOrchestrator::new());
    let alert_resolver = Arc::new(FakeAlertResolver::default());
    let investigation = Arc::new(InvestigationTrigger::new(findings.clone(), orchestrator, clock.clone()));
    let alert_reviewer = Arc::new(AlertReviewer::new(alert_resolver, None));
    let persistence = Arc::new(FakeFindingsPersistence::default());

    let dispatcher = Arc::new(RunDispatcher::new(
        findings,
        baselines,
        guard,
        breaker,
        stream,
        investigation,
        alert_reviewer,
        state_provider,
        Some(chat),
        Some(persistence),
        config,
        clock.clone(),
    ));

    assert!(dispatcher.last_completed_run_at().await.is_none());
    dispatcher.run_full("test").await;
    let completed = dispatcher.last_completed_run_at().await.expect("a completed run is on record");
    assert!(completed <= clock.now());
}
