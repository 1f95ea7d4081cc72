//! Autonomy-gated investigation fan-out and stuck recovery (SPEC_FULL.md §4.8).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;

use crate::capabilities::InvestigationOrchestrator;
use crate::clock::SharedClock;
use crate::config::AutonomyLevel;
use crate::findings::FindingsStore;
use crate::types::{Finding, InvestigationOutcome, InvestigationStatus, Severity};

/// Cooldown between investigation attempts: shorter after a timeout so the
/// system retries promptly, longer otherwise (SPEC_FULL.md §4.8, scenario 6).
const COOLDOWN_GENERAL: Duration = Duration::from_secs(60 * 60);
const COOLDOWN_AFTER_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Per-investigation task budget.
const INVESTIGATION_BUDGET: Duration = Duration::from_secs(10 * 60);
/// Findings stuck `running` longer than this are recovered (SPEC_FULL.md §4.8).
const STUCK_THRESHOLD: Duration = Duration::from_secs(15 * 60);
/// Attempt cap (SPEC_FULL.md §4.8).
const MAX_ATTEMPTS: u32 = 3;

pub struct InvestigationTrigger {
    findings: Arc<FindingsStore>,
    orchestrator: Arc<dyn InvestigationOrchestrator>,
    clock: SharedClock,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl InvestigationTrigger {
    #[must_use]
    pub fn new(findings: Arc<FindingsStore>, orchestrator: Arc<dyn InvestigationOrchestrator>, clock: SharedClock) -> Self {
        Self {
            findings,
            orchestrator,
            clock,
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Per-finding decision of whether an investigation should be started
    /// (SPEC_FULL.md §4.8).
    #[must_use]
    pub fn should_investigate(&self, finding: &Finding, autonomy: AutonomyLevel, now: DateTime<Utc>) -> bool {
        if matches!(autonomy, AutonomyLevel::Monitor) {
            return false;
        }
        if !finding.is_active(now) {
            return false;
        }
        if !matches!(finding.severity, Severity::Warning | Severity::Critical) {
            return false;
        }
        if matches!(finding.investigation_status, Some(InvestigationStatus::Running)) {
            return false;
        }
        if finding.investigation_attempts >= MAX_ATTEMPTS {
            return false;
        }
        if matches!(finding.investigation_outcome, Some(InvestigationOutcome::FixVerificationFailed)) {
            return false;
        }
        if !self.cooldown_elapsed(finding, now) {
            return false;
        }
        if !self.orchestrator.can_start_investigation() {
            return false;
        }
        true
    }

    fn cooldown_elapsed(&self, finding: &Finding, now: DateTime<Utc>) -> bool {
        let Some(last) = finding.last_investigated_at else {
            return true;
        };
        let cooldown = if matches!(finding.investigation_outcome, Some(InvestigationOutcome::TimedOut)) {
            COOLDOWN_AFTER_TIMEOUT
        } else {
            COOLDOWN_GENERAL
        };
        now - last >= chrono::Duration::from_std(cooldown).unwrap_or_default()
    }

    /// Dispatch an investigation for `finding` on a tracked background task
    /// with a 10-minute budget (SPEC_FULL.md §4.8).
    pub async fn dispatch(&self, finding: Finding, autonomy: AutonomyLevel) {
        let now = self.clock.now();
        if !self.findings.get(finding.id).is_some() {
            return;
        }

        {
            let mut guard = self.tasks.lock().await;
            let orchestrator = Arc::clone(&self.orchestrator);
            let findings = Arc::clone(&self.findings);
            let id = finding.id;
            guard.spawn(async move {
                mark_running(&findings, id, now);
                let outcome = tokio::time::timeout(INVESTIGATION_BUDGET, orchestrator.investigate_finding(&finding, autonomy)).await;
                match outcome {
                    Ok(Ok(())) => mark_completed(&findings, id),
                    Ok(Err(e)) => {
                        tracing::warn!(finding_id = id, error = %e, "[InvestigationTrigger] investigation failed");
                        mark_failed(&findings, id, InvestigationOutcome::NeedsAttention);
                    }
                    Err(_) => {
                        tracing::warn!(finding_id = id, "[InvestigationTrigger] investigation timed out");
                        mark_failed(&findings, id, InvestigationOutcome::TimedOut);
                    }
                }
            });
        }
    }

    /// Sweep active findings with `status = running` whose
    /// `last_investigated_at` is older than 15 minutes, transitioning them
    /// to `failed/timed_out` (SPEC_FULL.md §4.8).
    pub fn recover_stuck(&self, now: DateTime<Utc>) -> usize {
        let mut recovered = 0;
        for finding in self.findings.get_all(None) {
            if !matches!(finding.investigation_status, Some(InvestigationStatus::Running)) {
                continue;
            }
            let Some(last) = finding.last_investigated_at else { continue };
            if now - last > chrono::Duration::from_std(STUCK_THRESHOLD).unwrap_or_default() {
                mark_failed(&self.findings, finding.id, InvestigationOutcome::TimedOut);
                recovered += 1;
            }
        }
        recovered
    }

    /// Retry findings whose previous attempt timed out and whose cooldown
    /// has since elapsed, subject to the usual `should_investigate` gate.
    pub async fn retry_timed_out(&self, autonomy: AutonomyLevel, now: DateTime<Utc>) -> usize {
        let mut retried = 0;
        for finding in self.findings.get_all(None) {
            if !matches!(finding.investigation_outcome, Some(InvestigationOutcome::TimedOut)) {
                continue;
            }
            if self.should_investigate(&finding, autonomy, now) {
                self.dispatch(finding, autonomy).await;
                retried += 1;
            }
        }
        retried
    }

    /// Wait up to `budget` for in-flight investigations to drain
    /// (SPEC_FULL.md §4.1 `Stop`).
    pub async fn shutdown(&self, budget: Duration) {
        let mut guard = self.tasks.lock().await;
        let _ = tokio::time::timeout(budget, async {
            while guard.join_next().await.is_some() {}
        })
        .await;
        let _ = self.orchestrator.shutdown(budget).await;
    }
}

fn mark_running(findings: &FindingsStore, id: u64, now: DateTime<Utc>) {
    update_investigation(findings, id, |f| {
        f.investigation_status = Some(InvestigationStatus::Running);
        f.last_investigated_at = Some(now);
        f.investigation_attempts += 1;
    });
}

fn mark_completed(findings: &FindingsStore, id: u64) {
    update_investigation(findings, id, |f| {
        f.investigation_status = Some(InvestigationStatus::Completed);
        f.investigation_outcome = Some(InvestigationOutcome::Resolved);
    });
}

fn mark_failed(findings: &FindingsStore, id: u64, outcome: InvestigationOutcome) {
    update_investigation(findings, id, |f| {
        f.investigation_status = Some(InvestigationStatus::Failed);
        f.investigation_outcome = Some(outcome);
    });
}

fn update_investigation(findings: &FindingsStore, id: u64, mutate: impl FnOnce(&mut Finding)) {
    findings.update_investigation(id, mutate);
}
