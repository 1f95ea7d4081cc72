//! Run scheduling and the full/scoped patrol pipeline (SPEC_FULL.md §4.3, §4.4).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::alert_reviewer::AlertReviewer;
use crate::baseline::ThresholdManager;
use crate::capabilities::{ChatServiceProvider, ChatStreamChunk, FindingsPersistence, PatrolToolCall, StateProvider};
use crate::circuit_breaker::{classify_status, CircuitBreaker, FailureCategory};
use crate::config::ConfigSurface;
use crate::clock::SharedClock;
use crate::findings::FindingsStore;
use crate::investigation::InvestigationTrigger;
use crate::stream::{next_run_id, StreamBus};
use crate::threshold_guard::ThresholdGuard;
use crate::triage::{TriageEvaluator, TriageResult};
use crate::types::{Category, Finding, PatrolRunRecord, RunStatus, RunType, Scope, Severity};

/// Run exceeding this is force-recovered by the stuck-run guard (SPEC_FULL.md §5).
const STUCK_RUN_THRESHOLD: Duration = Duration::from_secs(20 * 60);
/// Scoped-run retry backoff schedule under contention (SPEC_FULL.md §7).
const SCOPED_RETRY_BACKOFF: [Duration; 2] = [Duration::from_secs(5), Duration::from_secs(15)];
const MAX_SCOPED_RETRIES: u32 = 2;
const STALE_FINDING_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

const AI_PATROL_ERROR_KEY: &str = "ai-patrol-error";

struct RunLock {
    running: AtomicBool,
    started_at_ms: AtomicI64,
    run_id: Mutex<String>,
}

impl RunLock {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            started_at_ms: AtomicI64::new(0),
            run_id: Mutex::new(String::new()),
        }
    }

    fn try_acquire(&self, run_id: &str, now: DateTime<Utc>) -> bool {
        if self.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            self.started_at_ms.store(now.timestamp_millis(), Ordering::Release);
            *self.run_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = run_id.to_string();
            true
        } else {
            false
        }
    }

    fn release(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Force-clear a run that has exceeded the stuck threshold, returning the
    /// abandoned run id if one was cleared.
    fn force_clear_if_stuck(&self, now: DateTime<Utc>) -> Option<String> {
        if !self.running.load(Ordering::Acquire) {
            return None;
        }
        let started = self.started_at_ms.load(Ordering::Acquire);
        if now.timestamp_millis() - started > STUCK_RUN_THRESHOLD.as_millis() as i64 {
            self.running.store(false, Ordering::Release);
            Some(self.run_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone())
        } else {
            None
        }
    }
}

/// Ties triage, the LLM reasoning pass, findings, investigation recovery,
/// alert review, and the circuit breaker into one run pipeline.
pub struct RunDispatcher {
    findings: Arc<FindingsStore>,
    baselines: Arc<ThresholdManager>,
    guard: Arc<ThresholdGuard>,
    breaker: Arc<CircuitBreaker>,
    stream: Arc<StreamBus>,
    investigation: Arc<InvestigationTrigger>,
    alert_reviewer: Arc<AlertReviewer>,
    state_provider: Arc<dyn StateProvider>,
    chat: Option<Arc<dyn ChatServiceProvider>>,
    persistence: Option<Arc<dyn FindingsPersistence>>,
    config: ConfigSurface,
    clock: SharedClock,
    lock: RunLock,
}

/// Outcome of one dispatch attempt, surfaced to the engine for logging/status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    Skipped,
    Enqueued,
}

#[allow(clippy::too_many_arguments)]
impl RunDispatcher {
    #[must_use]
    pub fn new(
        findings: Arc<FindingsStore>,
        baselines: Arc<ThresholdManager>,
        guard: Arc<ThresholdGuard>,
        breaker: Arc<CircuitBreaker>,
        stream: Arc<StreamBus>,
        investigation: Arc<InvestigationTrigger>,
        alert_reviewer: Arc<AlertReviewer>,
        state_provider: Arc<dyn StateProvider>,
        chat: Option<Arc<dyn ChatServiceProvider>>,
        persistence: Option<Arc<dyn FindingsPersistence>>,
        config: ConfigSurface,
        clock: SharedClock,
    ) -> Self {
        Self {
            findings,
            baselines,
            guard,
            breaker,
            stream,
            investigation,
            alert_reviewer,
            state_provider,
            chat,
            persistence,
            config,
            clock,
            lock: RunLock::new(),
        }
    }

    /// Completion timestamp of the most recent completed run in persisted
    /// history, if persistence is configured (SPEC_FULL.md §4.1).
    pub async fn last_completed_run_at(&self) -> Option<chrono::DateTime<Utc>> {
        let p = self.persistence.as_ref()?;
        match p.last_completed_run_at().await {
            Ok(ts) => ts,
            Err(e) => {
                tracing::warn!(error = %e, "[RunDispatcher] failed to query last completed run from history");
                None
            }
        }
    }

    /// Force-clear a stuck run if one has exceeded the 20-minute budget
    /// (SPEC_FULL.md §5, §7 `Stuck`). Call periodically from the engine loop.
    pub fn reap_stuck_run(&self) {
        if let Some(run_id) = self.lock.force_clear_if_stuck(self.clock.now()) {
            tracing::warn!(run_id = %run_id, "[RunDispatcher] force-clearing stuck run past 20m budget");
        }
    }

    /// Full unscoped patrol run. Skips outright (does not retry) if the run
    /// lock is held (SPEC_FULL.md §7 `Contention`).
    pub async fn run_full(&self, trigger_reason: &str) -> DispatchOutcome {
        let now = self.clock.now();
        let run_id = next_run_id();
        if !self.lock.try_acquire(&run_id, now) {
            tracing::info!(trigger_reason, "[RunDispatcher] full run skipped: another run in progress");
            return DispatchOutcome::Skipped;
        }
        self.execute(run_id, RunType::Patrol, trigger_reason, Scope::default()).await;
        DispatchOutcome::Completed
    }

    /// Scoped patrol run, e.g. triggered by an inbound alert. Enqueues with
    /// backoff under contention, up to `MAX_SCOPED_RETRIES` (SPEC_FULL.md §7).
    pub async fn run_scoped(&self, trigger_reason: &str, scope: Scope) -> DispatchOutcome {
        for attempt in 0..=MAX_SCOPED_RETRIES {
            let now = self.clock.now();
            let run_id = next_run_id();
            if self.lock.try_acquire(&run_id, now) {
                self.execute(run_id, RunType::Scoped, trigger_reason, scope).await;
                return DispatchOutcome::Completed;
            }
            if attempt < MAX_SCOPED_RETRIES {
                tracing::info!(trigger_reason, attempt, "[RunDispatcher] scoped run contended, backing off");
                tokio::time::sleep(SCOPED_RETRY_BACKOFF[attempt as usize]).await;
            }
        }
        tracing::warn!(trigger_reason, "[RunDispatcher] scoped run dropped after exhausting retries");
        DispatchOutcome::Enqueued
    }

    /// Inline scoped verification run used by `VerifyFixResolved`; bypasses
    /// the run lock entirely since it runs synchronously for the caller
    /// (SPEC_FULL.md §4.8).
    pub async fn verify_fix_resolved(&self, resource_id: &str, _resource_type: &str, finding_key: &str, finding_id: u64) -> bool {
        let scope = Scope::for_resource(resource_id);
        let snapshot = match self.state_provider.get_state().await {
            Ok(s) => scope.filter_snapshot(&s),
            Err(e) => {
                tracing::warn!(error = %e, "[RunDispatcher] verify_fix_resolved: failed to fetch state");
                return false;
            }
        };

        let config = self.config.load();
        let triage = TriageEvaluator::evaluate(
            &snapshot,
            &scope,
            &config.thresholds,
            &self.baselines,
            self.findings.get_active(Severity::Info).len(),
            self.clock.now(),
        );

        if !self.breaker.allow() {
            return !triage.flagged_ids.iter().any(|(rid, _)| rid == resource_id);
        }

        let run_id = format!("verify-{}", next_run_id());
        let mut record = PatrolRunRecord::new(run_id, RunType::Verification, "verify_fix", self.clock.now());
        let outcome = self.run_llm_pass(&snapshot, &scope, &triage, &mut record).await;
        if let Err(e) = &outcome {
            self.breaker.record_failure_with_category(classify_error(e));
        } else {
            self.breaker.record_success();
        }
        record.complete(self.clock.now());
        if let Some(p) = &self.persistence {
            let _ = p.append_run_record(&record).await;
        }

        !self.findings.get_all(None).iter().any(|f| {
            f.is_active(self.clock.now()) && (f.key == finding_key || f.resource_id == resource_id) && f.id != finding_id
        })
    }

    async fn execute(&self, run_id: String, run_type: RunType, trigger_reason: &str, scope: Scope) {
        let started_at = self.clock.now();
        self.stream.reset_for_run(run_id.clone());
        self.stream.set_phase("gathering_state");
        let mut record = PatrolRunRecord::new(run_id.clone(), run_type, trigger_reason, started_at);
        record.scope_resource_ids = scope.resource_ids.iter().cloned().collect();
        record.scope_resource_types = scope.resource_types.iter().cloned().collect();

        let snapshot = match self.state_provider.get_state().await {
            Ok(s) => scope.filter_snapshot(&s),
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "[RunDispatcher] failed to fetch fleet state");
                record.status = RunStatus::Error;
                record.complete(self.clock.now());
                if let Some(p) = &self.persistence {
                    let _ = p.append_run_record(&record).await;
                }
                self.lock.release();
                self.stream.set_phase("done");
                return;
            }
        };

        self.stream.set_phase("triage");
        let config = self.config.load();
        let active_before = self.findings.get_active(Severity::Info);
        let triage = TriageEvaluator::evaluate(
            &snapshot,
            &scope,
            &config.thresholds,
            &self.baselines,
            active_before.len(),
            self.clock.now(),
        );
        record.triage_flags = triage.flags.len() as u32;

        let had_error = if triage.is_quiet {
            record.triage_skipped_llm = true;
            record.findings_summary = triage.summary.clone();
            false
        } else {
            self.stream.set_phase("reasoning");
            match self.run_llm_pass(&snapshot, &scope, &triage, &mut record).await {
                Ok(()) => {
                    self.breaker.record_success();
                    false
                }
                Err(e) => {
                    self.handle_llm_error(&e, &record.id);
                    self.breaker.record_failure_with_category(classify_error(&e));
                    true
                }
            }
        };

        self.stream.set_phase("post_processing");
        if !had_error {
            self.reconcile_stale(&active_before, &triage.flagged_ids, &mut record, self.clock.now());
        }
        self.findings.cleanup(STALE_FINDING_MAX_AGE);
        let recovered = self.investigation.recover_stuck(self.clock.now());
        let retried = self.investigation.retry_timed_out(config.autonomy_level, self.clock.now()).await;
        if recovered > 0 || retried > 0 {
            tracing::info!(run_id = %record.id, recovered, retried, "[RunDispatcher] investigation sweep");
        }
        let _ = self.alert_reviewer.review(&snapshot, self.clock.now()).await;

        record.status = derive_status(&record, had_error);
        record.complete(self.clock.now());
        if let Some(p) = &self.persistence {
            if let Err(e) = p.append_run_record(&record).await {
                tracing::warn!(run_id = %record.id, error = %e, "[RunDispatcher] failed to persist run record");
            }
        }

        let mut done = crate::types::StreamEvent::new(crate::types::StreamEventType::Done);
        done.phase = Some("done".into());
        self.stream.broadcast(done);
        self.lock.release();
    }

    /// Drive the LLM reasoning pass over the triage briefing, applying each
    /// proposed tool call through `FindingsStore`/`ThresholdGuard`.
    async fn run_llm_pass(
        &self,
        snapshot: &crate::types::Snapshot,
        _scope: &Scope,
        triage: &TriageResult,
        record: &mut PatrolRunRecord,
    ) -> crate::error::PatrolResult<()> {
        let Some(chat) = &self.chat else {
            return Ok(());
        };
        if !self.breaker.allow() {
            return Err(crate::error::PatrolError::TransientUpstream("circuit breaker open".into()));
        }

        let briefing = build_briefing(triage);
        let stream = Arc::clone(&self.stream);
        let findings = Arc::clone(&self.findings);
        let guard = Arc::clone(&self.guard);
        let baselines = Arc::clone(&self.baselines);
        let config = self.config.load();
        let snapshot = snapshot.clone();
        let new_count = std::sync::atomic::AtomicU32::new(0);
        let existing_count = std::sync::atomic::AtomicU32::new(0);
        let rejected_count = std::sync::atomic::AtomicU32::new(0);

        chat.execute_patrol_stream(&briefing, &|chunk| match chunk {
            ChatStreamChunk::Content(text) => stream.append_content(&text),
            ChatStreamChunk::ToolCall(call) => match call {
                PatrolToolCall::ReportFinding(f) => {
                    if let Err(reason) = guard.is_actionable(&f, &snapshot, &config.thresholds, &baselines) {
                        rejected_count.fetch_add(1, Ordering::Relaxed);
                        let mut event = crate::types::StreamEvent::new(crate::types::StreamEventType::FindingRejected);
                        event.rejection_reason = Some(reason.to_string());
                        stream.broadcast(event);
                        return;
                    }
                    let is_new = findings.get(f.id).is_none();
                    findings.add((*f).clone());
                    if is_new {
                        new_count.fetch_add(1, Ordering::Relaxed);
                    } else {
                        existing_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
                PatrolToolCall::ResolveFinding { id, reason } => {
                    findings.resolve_with_reason(id, &reason);
                }
                PatrolToolCall::GetFindings => {}
            },
            ChatStreamChunk::Done { input_tokens, output_tokens } => {
                record.input_tokens = input_tokens;
                record.output_tokens = output_tokens;
            }
        })
        .await?;

        record.new_findings = new_count.load(Ordering::Relaxed);
        record.existing_findings = existing_count.load(Ordering::Relaxed);
        record.rejected_findings = rejected_count.load(Ordering::Relaxed);
        Ok(())
    }

    /// Translate a terminal LLM-pass error into the self-resolving
    /// `ai-patrol-error` finding (SPEC_FULL.md §4.4).
    fn handle_llm_error(&self, error: &crate::error::PatrolError, run_id: &str) {
        let (title, description, recommendation) = match error {
            crate::error::PatrolError::PermanentUpstream(msg) if msg.contains("credit") => (
                "AI provider out of credits",
                "The patrol reasoning pass could not run because the configured AI provider account has insufficient credits.",
                "Add credits to the AI provider account or switch providers in settings.",
            ),
            crate::error::PatrolError::PermanentUpstream(msg) if msg.contains("key") || msg.contains("auth") => (
                "AI provider credentials rejected",
                "The patrol reasoning pass could not authenticate with the configured AI provider.",
                "Check the configured API key and re-save settings.",
            ),
            crate::error::PatrolError::TransientUpstream(msg) if msg.contains("429") || msg.contains("rate") => (
                "AI provider rate limit reached",
                "The patrol reasoning pass was rate-limited by the configured AI provider.",
                "Reduce patrol frequency or increase the provider's rate limit.",
            ),
            _ => (
                "AI patrol reasoning pass failed",
                "The patrol reasoning pass encountered an unexpected error and could not complete this run.",
                "Check patrol engine logs for details.",
            ),
        };

        tracing::error!(run_id, error = %error, "[RunDispatcher] LLM pass failed");
        let mut finding = Finding::new("patrol-engine", Category::Reliability, AI_PATROL_ERROR_KEY, Severity::Warning, self.clock.now());
        finding.resource_name = "Patrol Engine".into();
        finding.resource_type = "system".into();
        finding.title = title.into();
        finding.description = description.into();
        finding.recommendation = recommendation.into();
        finding.source = "dispatcher".into();
        self.findings.add(finding);
    }

    /// Resolve active findings that were seeded into this run's LLM context
    /// but were neither re-reported nor explicitly resolved, only when the
    /// run had no errors (SPEC_FULL.md §4.4).
    fn reconcile_stale(
        &self,
        active_before: &[Finding],
        flagged_ids: &std::collections::HashSet<(String, Category)>,
        record: &mut PatrolRunRecord,
        now: DateTime<Utc>,
    ) {
        for f in active_before {
            if !f.is_active(now) {
                continue;
            }
            if flagged_ids.contains(&(f.resource_id.clone(), f.category)) {
                continue;
            }
            if self.findings.get(f.id).map(|cur| cur.times_raised) != Some(f.times_raised) {
                // re-reported this run (times_raised bumped) — not stale.
                continue;
            }
            if self.findings.resolve_with_reason(f.id, "no longer detected") {
                record.resolved_findings += 1;
                record.finding_ids.push(f.id);
            }
        }
    }
}

fn classify_error(error: &crate::error::PatrolError) -> FailureCategory {
    match error {
        crate::error::PatrolError::PermanentUpstream(_) => FailureCategory::NonTransient,
        crate::error::PatrolError::TransientUpstream(msg) => {
            if let Some(code) = msg.rsplit("status ").next().and_then(|s| s.parse::<u16>().ok()) {
                classify_status(code)
            } else {
                FailureCategory::Transient
            }
        }
        _ => FailureCategory::Transient,
    }
}

fn derive_status(record: &PatrolRunRecord, had_error: bool) -> RunStatus {
    if had_error {
        return RunStatus::Error;
    }
    if record.new_findings == 0 && record.existing_findings == 0 {
        return RunStatus::Healthy;
    }
    RunStatus::IssuesFound
}

/// Render the triage output into the prompt handed to the reasoning pass.
fn build_briefing(triage: &TriageResult) -> String {
    if triage.flags.is_empty() {
        return format!("Patrol summary: {}\n\nNo threshold or anomaly flags this cycle.", triage.summary);
    }
    let mut briefing = format!("Patrol summary: {}\n\nFlagged resources:\n", triage.summary);
    for flag in &triage.flags {
        briefing.push_str(&format!(
            "- [{:?}/{:?}] {} ({}): {}\n",
            flag.severity, flag.category, flag.resource_name, flag.resource_type, flag.reason
        ));
    }
    briefing
}
