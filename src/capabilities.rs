//! Inbound capability traits (SPEC_FULL.md §6).
//!
//! The core never talks to a concrete LLM, alert manager, or prober — it is
//! generic over these traits, constructed with `Arc<dyn Trait>` instances the
//! host process wires up. `testing` ships fakes of each for tests and demos.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::AutonomyLevel;
use crate::error::PatrolResult;
use crate::types::{AlertInfo, Finding, PatrolRunRecord, Snapshot, SuppressionRule};

/// Supplies the current fleet snapshot.
#[async_trait]
pub trait StateProvider: Send + Sync {
    async fn get_state(&self) -> PatrolResult<Snapshot>;
}

/// One historical metric sample, used for baseline learning.
#[derive(Debug, Clone, Copy)]
pub struct MetricPoint {
    pub ts: DateTime<Utc>,
    pub value: f64,
}

/// Supplies historical metric points for baseline learning (SPEC_FULL.md §6).
#[async_trait]
pub trait MetricsHistoryProvider: Send + Sync {
    async fn get_node_metrics(&self, node_id: &str, metric: &str, duration: Duration) -> PatrolResult<Vec<MetricPoint>>;
    async fn get_guest_metrics(&self, guest_id: &str, metric: &str, duration: Duration) -> PatrolResult<Vec<MetricPoint>>;
    async fn get_all_guest_metrics(&self, metric: &str, duration: Duration) -> PatrolResult<HashMap<String, Vec<MetricPoint>>>;
    async fn get_all_storage_metrics(&self, metric: &str, duration: Duration) -> PatrolResult<HashMap<String, Vec<MetricPoint>>>;
}

/// One proposed finding mutation surfaced by the LLM tool loop.
#[derive(Debug, Clone)]
pub enum PatrolToolCall {
    ReportFinding(Box<Finding>),
    ResolveFinding { id: u64, reason: String },
    GetFindings,
}

/// A single streamed chunk from the chat provider's patrol-analysis turn.
#[derive(Debug, Clone)]
pub enum ChatStreamChunk {
    Content(String),
    ToolCall(PatrolToolCall),
    Done { input_tokens: u64, output_tokens: u64 },
}

/// Drives the LLM reasoning pass over a streaming callback.
#[async_trait]
pub trait ChatServiceProvider: Send + Sync {
    async fn execute_patrol_stream(
        &self,
        briefing: &str,
        on_chunk: &(dyn Fn(ChatStreamChunk) + Send + Sync),
    ) -> PatrolResult<()>;
    async fn create_session(&self) -> PatrolResult<String>;
    async fn delete_session(&self, session_id: &str) -> PatrolResult<()>;
    async fn reload_config(&self) -> PatrolResult<()>;
}

/// Reads/writes the three persisted blobs named in SPEC_FULL.md §6.
#[async_trait]
pub trait FindingsPersistence: Send + Sync {
    async fn save_findings(&self, findings: &HashMap<u64, Finding>) -> PatrolResult<()>;
    async fn load_findings(&self) -> PatrolResult<HashMap<u64, Finding>>;
    async fn save_suppression_rules(&self, rules: &[SuppressionRule]) -> PatrolResult<()>;
    async fn load_suppression_rules(&self) -> PatrolResult<Vec<SuppressionRule>>;
    async fn append_run_record(&self, record: &PatrolRunRecord) -> PatrolResult<()>;
    /// Completion timestamp of the most recent completed run in history, if
    /// any — lets a fresh process skip its startup run when one already ran
    /// recently (SPEC_FULL.md §4.1).
    async fn last_completed_run_at(&self) -> PatrolResult<Option<DateTime<Utc>>>;
}

/// Drives an external investigation for one finding.
#[async_trait]
pub trait InvestigationOrchestrator: Send + Sync {
    async fn investigate_finding(&self, finding: &Finding, autonomy: AutonomyLevel) -> PatrolResult<()>;
    fn can_start_investigation(&self) -> bool;
    async fn shutdown(&self, budget: Duration) -> PatrolResult<()>;
    async fn cleanup_investigation_store(&self, _max_age: Duration, _max_records: usize) -> PatrolResult<()> {
        Ok(())
    }
}

/// Reads/resolves alerts from the external alert manager.
#[async_trait]
pub trait AlertResolver: Send + Sync {
    async fn get_active_alerts(&self) -> PatrolResult<Vec<AlertInfo>>;
    async fn resolve_alert(&self, id: &str) -> PatrolResult<bool>;
}

/// Ping result for one guest IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingResult {
    pub reachable: bool,
}

/// Discovery/reachability probing, delegated to an external agent network.
#[async_trait]
pub trait GuestProber: Send + Sync {
    async fn get_agent_for_host(&self, hostname: &str) -> Option<String>;
    async fn ping_guests(&self, agent_id: &str, ips: &[String]) -> PatrolResult<HashMap<String, PingResult>>;
}
