use super::severity::{Category, Severity};
use serde::{Deserialize, Serialize};

/// Ephemeral per-run triage output (SPEC_FULL.md §3). Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageFlag {
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    pub category: Category,
    pub severity: Severity,
    pub reason: String,
    pub metric: Option<String>,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
}

impl TriageFlag {
    /// Dedup key: `(resource_id, category)` unless a metric is present, in
    /// which case distinct metrics (cpu vs memory) remain distinct flags
    /// (SPEC_FULL.md §4.2 dedup rule).
    #[must_use]
    pub fn dedup_key(&self) -> (String, Category, Option<String>) {
        (self.resource_id.clone(), self.category, self.metric.clone())
    }
}
