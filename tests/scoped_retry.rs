//! Scenario 5: scoped run retries under contention, then drops after the
//! retry budget is exhausted (SPEC_FULL.md §8).
//!
//! Contention is simulated with a `StateProvider` whose first call blocks on
//! a `Notify` until released, so the run lock stays held for a controlled
//! window while a concurrent scoped run contends for it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use patrol_engine::alert_reviewer::AlertReviewer;
use patrol_engine::baseline::ThresholdManager;
use patrol_engine::capabilities::StateProvider;
use patrol_engine::circuit_breaker::CircuitBreaker;
use patrol_engine::clock::FakeClock;
use patrol_engine::config::{ConfigSurface, PatrolConfig};
use patrol_engine::dispatcher::{DispatchOutcome, RunDispatcher};
use patrol_engine::error::PatrolResult;
use patrol_engine::findings::FindingsStore;
use patrol_engine::investigation::InvestigationTrigger;
use patrol_engine::stream::StreamBus;
use patrol_engine::testing::{FakeAlertResolver, FakeInvestigationOrchestrator};
use patrol_engine::threshold_guard::ThresholdGuard;
use patrol_engine::types::{Scope, Snapshot};

/// Blocks the first `get_state` call on `gate` so a test can hold the run
/// lock open for a known duration; later calls return immediately.
struct GatedStateProvider {
    gate: Arc<tokio::sync::Notify>,
    gated_once: AtomicBool,
}

#[async_trait]
impl StateProvider for GatedStateProvider {
    async fn get_state(&self) -> PatrolResult<Snapshot> {
        if !self.gated_once.swap(true, Ordering::SeqCst) {
            self.gate.notified().await;
        }
        Ok(Snapshot::default())
    }
}

fn build_dispatcher(provider: Arc<dyn StateProvider>) -> Arc<RunDispatcher> {
    let clock = Arc::new(FakeClock::new(Utc::now()));
    let config = ConfigSurface::new(PatrolConfig::default());
    let findings = FindingsStore::new(clock.clone(), None);
    let baselines = Arc::new(ThresholdManager::new());
    let guard = Arc::new(ThresholdGuard::new());
    let breaker = Arc::new(CircuitBreaker::new(clock.clone()));
    let stream = Arc::new(StreamBus::new(clock.clone()));
    let orchestrator = Arc::new(FakeInvestigationOrchestrator::new());
    let alert_resolver = Arc::new(FakeAlertResolver::default());
    let investigation = Arc::new(InvestigationTrigger::new(findings.clone(), orchestrator, clock.clone()));
    let alert_reviewer = Arc::new(AlertReviewer::new(alert_resolver, None));

    Arc::new(RunDispatcher::new(
        findings, baselines, guard, breaker, stream, investigation, alert_reviewer, provider, None, None, config, clock,
    ))
}

#[tokio::test]
async fn scoped_run_succeeds_once_contention_clears() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let provider = Arc::new(GatedStateProvider { gate: gate.clone(), gated_once: AtomicBool::new(false) });
    let dispatcher = build_dispatcher(provider);

    let holder = dispatcher.clone();
    let full_run = tokio::spawn(async move { holder.run_full("initial-sweep").await });
    tokio::task::yield_now().await;

    // Release the lock while the scoped run is still backing off between
    // its first and second attempts (5s + up to 15s window).
    let releaser_gate = gate.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        releaser_gate.notify_one();
    });

    let scoped = dispatcher.run_scoped("alert:a1", Scope::for_resource("vm/101")).await;
    assert_eq!(scoped, DispatchOutcome::Completed);
    assert_eq!(full_run.await.expect("full run task"), DispatchOutcome::Completed);
}

#[tokio::test]
async fn scoped_run_drops_after_retries_exhausted() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let provider = Arc::new(GatedStateProvider { gate: gate.clone(), gated_once: AtomicBool::new(false) });
    let dispatcher = build_dispatcher(provider);

    let holder = dispatcher.clone();
    let full_run = tokio::spawn(async move { holder.run_full("initial-sweep").await });
    tokio::task::yield_now().await;

    // Never release the gate before the scoped run exhausts its retries;
    // the held lock outlives the whole 5s + 15s backoff window.
    let scoped = dispatcher.run_scoped("alert:a1", Scope::for_resource("vm/101")).await;
    assert_eq!(scoped, DispatchOutcome::Enqueued, "retries exhausted, run dropped");

    gate.notify_one();
    let _ = full_run.await.expect("full run task");
}
