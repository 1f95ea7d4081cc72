//! In-memory fakes of every inbound capability trait (SPEC_FULL.md §6).
//!
//! Used by unit/integration tests and by `demos/patrol_demo.rs`, which wires
//! a real `PatrolEngine` against these instead of a live fleet.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::capabilities::{
    AlertResolver, ChatServiceProvider, ChatStreamChunk, FindingsPersistence, GuestProber,
    InvestigationOrchestrator, MetricPoint, MetricsHistoryProvider, PingResult, StateProvider,
};
use crate::config::AutonomyLevel;
use crate::error::PatrolResult;
use crate::types::{AlertInfo, Finding, PatrolRunRecord, Snapshot, SuppressionRule};

/// Returns a fixed snapshot, settable at any time for multi-step scenarios.
pub struct FakeStateProvider {
    snapshot: Mutex<Snapshot>,
}

impl FakeStateProvider {
    #[must_use]
    pub fn new(snapshot: Snapshot) -> Self {
        Self { snapshot: Mutex::new(snapshot) }
    }

    pub fn set(&self, snapshot: Snapshot) {
        *self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = snapshot;
    }
}

#[async_trait]
impl StateProvider for FakeStateProvider {
    async fn get_state(&self) -> PatrolResult<Snapshot> {
        Ok(self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone())
    }
}

/// No history by default; tests can preload points per `(resource_id, metric)`.
#[derive(Default)]
pub struct FakeMetricsHistoryProvider {
    points: Mutex<HashMap<(String, String), Vec<MetricPoint>>>,
}

impl FakeMetricsHistoryProvider {
    pub fn seed(&self, resource_id: &str, metric: &str, points: Vec<MetricPoint>) {
        self.points
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((resource_id.to_string(), metric.to_string()), points);
    }
}

#[async_trait]
impl MetricsHistoryProvider for FakeMetricsHistoryProvider {
    async fn get_node_metrics(&self, node_id: &str, metric: &str, _duration: Duration) -> PatrolResult<Vec<MetricPoint>> {
        Ok(self
            .points
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(node_id.to_string(), metric.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_guest_metrics(&self, guest_id: &str, metric: &str, _duration: Duration) -> PatrolResult<Vec<MetricPoint>> {
        Ok(self
            .points
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(guest_id.to_string(), metric.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_all_guest_metrics(&self, _metric: &str, _duration: Duration) -> PatrolResult<HashMap<String, Vec<MetricPoint>>> {
        Ok(HashMap::new())
    }

    async fn get_all_storage_metrics(&self, _metric: &str, _duration: Duration) -> PatrolResult<HashMap<String, Vec<MetricPoint>>> {
        Ok(HashMap::new())
    }
}

/// Replays a scripted, fixed sequence of chunks on every call — enough for
/// deterministic scenario tests without a real LLM round-trip.
pub struct FakeChatService {
    script: Mutex<Vec<ChatStreamChunk>>,
}

impl FakeChatService {
    #[must_use]
    pub fn new(script: Vec<ChatStreamChunk>) -> Self {
        Self { script: Mutex::new(script) }
    }

    /// Replace the scripted response used by subsequent calls.
    pub fn set_script(&self, script: Vec<ChatStreamChunk>) {
        *self.script.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = script;
    }
}

#[async_trait]
impl ChatServiceProvider for FakeChatService {
    async fn execute_patrol_stream(&self, _briefing: &str, on_chunk: &(dyn Fn(ChatStreamChunk) + Send + Sync)) -> PatrolResult<()> {
        let script = self.script.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
        for chunk in script {
            on_chunk(chunk);
        }
        Ok(())
    }

    async fn create_session(&self) -> PatrolResult<String> {
        Ok("fake-session".into())
    }

    async fn delete_session(&self, _session_id: &str) -> PatrolResult<()> {
        Ok(())
    }

    async fn reload_config(&self) -> PatrolResult<()> {
        Ok(())
    }
}

/// Purely in-memory `FindingsPersistence`; state is lost on drop, which is
/// the point for tests and the demo binary.
#[derive(Default)]
pub struct FakeFindingsPersistence {
    findings: Mutex<HashMap<u64, Finding>>,
    rules: Mutex<Vec<SuppressionRule>>,
    runs: Mutex<Vec<PatrolRunRecord>>,
}

#[async_trait]
impl FindingsPersistence for FakeFindingsPersistence {
    async fn save_findings(&self, findings: &HashMap<u64, Finding>) -> PatrolResult<()> {
        *self.findings.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = findings.clone();
        Ok(())
    }

    async fn load_findings(&self) -> PatrolResult<HashMap<u64, Finding>> {
        Ok(self.findings.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone())
    }

    async fn save_suppression_rules(&self, rules: &[SuppressionRule]) -> PatrolResult<()> {
        *self.rules.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = rules.to_vec();
        Ok(())
    }

    async fn load_suppression_rules(&self) -> PatrolResult<Vec<SuppressionRule>> {
        Ok(self.rules.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone())
    }

    async fn append_run_record(&self, record: &PatrolRunRecord) -> PatrolResult<()> {
        self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(record.clone());
        Ok(())
    }

    async fn last_completed_run_at(&self) -> PatrolResult<Option<chrono::DateTime<chrono::Utc>>> {
        Ok(self
            .runs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .rev()
            .find_map(|r| r.completed_at))
    }
}

/// Always permits investigations, completes them instantly as a no-op.
#[derive(Default)]
pub struct FakeInvestigationOrchestrator {
    allow: std::sync::atomic::AtomicBool,
}

impl FakeInvestigationOrchestrator {
    #[must_use]
    pub fn new() -> Self {
        Self { allow: std::sync::atomic::AtomicBool::new(true) }
    }

    pub fn set_allowed(&self, allowed: bool) {
        self.allow.store(allowed, std::sync::atomic::Ordering::Relaxed);
    }
}

#[async_trait]
impl InvestigationOrchestrator for FakeInvestigationOrchestrator {
    async fn investigate_finding(&self, _finding: &Finding, _autonomy: AutonomyLevel) -> PatrolResult<()> {
        Ok(())
    }

    fn can_start_investigation(&self) -> bool {
        self.allow.load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn shutdown(&self, _budget: Duration) -> PatrolResult<()> {
        Ok(())
    }
}

/// Holds a settable list of active alerts; `resolve_alert` just removes one.
#[derive(Default)]
pub struct FakeAlertResolver {
    alerts: Mutex<Vec<AlertInfo>>,
}

impl FakeAlertResolver {
    pub fn set_alerts(&self, alerts: Vec<AlertInfo>) {
        *self.alerts.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = alerts;
    }
}

#[async_trait]
impl AlertResolver for FakeAlertResolver {
    async fn get_active_alerts(&self) -> PatrolResult<Vec<AlertInfo>> {
        Ok(self.alerts.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone())
    }

    async fn resolve_alert(&self, id: &str) -> PatrolResult<bool> {
        let mut alerts = self.alerts.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = alerts.len();
        alerts.retain(|a| a.id != id);
        Ok(alerts.len() < before)
    }
}

/// Reports every guest as reachable by default.
#[derive(Default)]
pub struct FakeGuestProber {
    reachable: Mutex<bool>,
}

impl FakeGuestProber {
    #[must_use]
    pub fn new() -> Self {
        Self { reachable: Mutex::new(true) }
    }

    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = reachable;
    }
}

#[async_trait]
impl GuestProber for FakeGuestProber {
    async fn get_agent_for_host(&self, hostname: &str) -> Option<String> {
        Some(format!("agent-{hostname}"))
    }

    async fn ping_guests(&self, _agent_id: &str, ips: &[String]) -> PatrolResult<HashMap<String, PingResult>> {
        let reachable = *self.reachable.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(ips.iter().map(|ip| (ip.clone(), PingResult { reachable })).collect())
    }
}
