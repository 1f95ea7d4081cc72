//! Scenario 6: investigation cooldown is shorter after a timeout than after
//! any other failure mode (SPEC_FULL.md §4.8, §8).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use patrol_engine::clock::FakeClock;
use patrol_engine::config::AutonomyLevel;
use patrol_engine::findings::FindingsStore;
use patrol_engine::investigation::InvestigationTrigger;
use patrol_engine::testing::FakeInvestigationOrchestrator;
use patrol_engine::types::{Category, Finding, InvestigationOutcome, InvestigationStatus, Severity};

fn failed_finding(outcome: Option<InvestigationOutcome>, last_investigated_at: chrono::DateTime<Utc>) -> Finding {
    let mut f = Finding::new("pve1", Category::Performance, "cpu-high", Severity::Warning, last_investigated_at);
    f.investigation_status = Some(InvestigationStatus::Failed);
    f.investigation_outcome = outcome;
    f.last_investigated_at = Some(last_investigated_at);
    f.investigation_attempts = 1;
    f
}

#[test]
fn timed_out_finding_retries_after_ten_minutes_not_sooner() {
    let base = Utc::now();
    let clock = Arc::new(FakeClock::new(base));
    let findings = FindingsStore::new(clock.clone(), None);
    let orchestrator = Arc::new(FakeInvestigationOrchestrator::new());
    let trigger = InvestigationTrigger::new(findings.clone(), orchestrator, clock.clone());

    let finding = failed_finding(Some(InvestigationOutcome::TimedOut), base);
    assert!(findings.add(finding.clone()));
    let stored = findings.get(finding.id).expect("finding stored");

    // At +5 minutes the cooldown after a timeout (10 minutes) hasn't elapsed.
    let at_5m = base + chrono::Duration::minutes(5);
    assert!(!trigger.should_investigate(&stored, AutonomyLevel::Full, at_5m));

    // At +15 minutes it has.
    let at_15m = base + chrono::Duration::minutes(15);
    assert!(trigger.should_investigate(&stored, AutonomyLevel::Full, at_15m));
}

#[test]
fn failed_without_timeout_outcome_waits_the_full_general_cooldown() {
    let base = Utc::now();
    let clock = Arc::new(FakeClock::new(base));
    let findings = FindingsStore::new(clock.clone(), None);
    let orchestrator = Arc::new(FakeInvestigationOrchestrator::new());
    let trigger = InvestigationTrigger::new(findings.clone(), orchestrator, clock.clone());

    // Failed with no recorded outcome: falls back to the general (60m) cooldown,
    // not the shorter post-timeout one.
    let finding = failed_finding(None, base);
    assert!(findings.add(finding.clone()));
    let stored = findings.get(finding.id).expect("finding stored");

    let at_15m = base + chrono::Duration::minutes(15);
    assert!(!trigger.should_investigate(&stored, AutonomyLevel::Full, at_15m));

    let at_61m = base + chrono::Duration::minutes(61);
    assert!(trigger.should_investigate(&stored, AutonomyLevel::Full, at_61m));
}

#[test]
fn monitor_autonomy_never_investigates() {
    let base = Utc::now();
    let clock = Arc::new(FakeClock::new(base));
    let findings = FindingsStore::new(clock.clone(), None);
    let orchestrator = Arc::new(FakeInvestigationOrchestrator::new());
    let trigger = InvestigationTrigger::new(findings, orchestrator, clock);

    let finding = Finding::new("pve1", Category::Performance, "cpu-high", Severity::Critical, base);
    assert!(!trigger.should_investigate(&finding, AutonomyLevel::Monitor, base + chrono::Duration::hours(2)));
}

#[tokio::test]
async fn dispatch_updates_investigation_state_without_bumping_times_raised() {
    let base = Utc::now();
    let clock = Arc::new(FakeClock::new(base));
    let findings = FindingsStore::new(clock.clone(), None);
    let orchestrator = Arc::new(FakeInvestigationOrchestrator::new());
    let trigger = InvestigationTrigger::new(findings.clone(), orchestrator, clock.clone());

    let finding = Finding::new("pve1", Category::Performance, "cpu-high", Severity::Critical, base);
    let id = finding.id;
    assert!(findings.add(finding.clone()));
    assert_eq!(findings.get(id).expect("stored").times_raised, 1);

    trigger.dispatch(finding, AutonomyLevel::Full).await;
    trigger.shutdown(Duration::from_secs(5)).await;

    let after = findings.get(id).expect("still stored");
    assert_eq!(after.times_raised, 1, "investigation transitions must not count as re-observations");
    assert_eq!(after.investigation_status, Some(InvestigationStatus::Completed));
    assert_eq!(after.investigation_outcome, Some(InvestigationOutcome::Resolved));
    assert_eq!(after.investigation_attempts, 1);
}
