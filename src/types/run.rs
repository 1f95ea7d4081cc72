use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Patrol,
    Scoped,
    Verification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Healthy,
    IssuesFound,
    Critical,
    Error,
}

/// One record per completed (or blocked/dropped) patrol run (SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolRunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub run_type: RunType,
    pub trigger_reason: String,
    pub scope_resource_ids: Vec<String>,
    pub scope_resource_types: Vec<String>,
    pub resource_counts: HashMap<String, u32>,
    pub new_findings: u32,
    pub existing_findings: u32,
    pub resolved_findings: u32,
    pub rejected_findings: u32,
    pub triage_flags: u32,
    pub triage_skipped_llm: bool,
    pub finding_ids: Vec<u64>,
    pub status: RunStatus,
    pub findings_summary: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: Vec<String>,
    pub ai_analysis: String,
}

/// Upper bound on `tool_calls` retained per run record.
pub const MAX_TOOL_CALLS_RETAINED: usize = 200;

impl PatrolRunRecord {
    #[must_use]
    pub fn new(id: impl Into<String>, run_type: RunType, trigger_reason: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            started_at,
            completed_at: None,
            duration: None,
            run_type,
            trigger_reason: trigger_reason.into(),
            scope_resource_ids: Vec::new(),
            scope_resource_types: Vec::new(),
            resource_counts: HashMap::new(),
            new_findings: 0,
            existing_findings: 0,
            resolved_findings: 0,
            rejected_findings: 0,
            triage_flags: 0,
            triage_skipped_llm: false,
            finding_ids: Vec::new(),
            status: RunStatus::Healthy,
            findings_summary: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            tool_calls: Vec::new(),
            ai_analysis: String::new(),
        }
    }

    pub fn record_tool_call(&mut self, call: impl Into<String>) {
        if self.tool_calls.len() >= MAX_TOOL_CALLS_RETAINED {
            self.tool_calls.remove(0);
        }
        self.tool_calls.push(call.into());
    }

    pub fn complete(&mut self, completed_at: DateTime<Utc>) {
        self.completed_at = Some(completed_at);
        self.duration = (completed_at - self.started_at).to_std().ok();
    }
}
