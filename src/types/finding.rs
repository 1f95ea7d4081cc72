use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use twox_hash::XxHash64;

use super::severity::{Category, Severity};

/// Why a finding was dismissed by a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DismissReason {
    NotAnIssue,
    ExpectedBehavior,
    WillFixLater,
}

impl std::fmt::Display for DismissReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotAnIssue => "not_an_issue",
            Self::ExpectedBehavior => "expected_behavior",
            Self::WillFixLater => "will_fix_later",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    NeedsAttention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationOutcome {
    Resolved,
    FixQueued,
    NeedsAttention,
    CannotFix,
    TimedOut,
    FixVerificationFailed,
}

/// One entry in a Finding's append-only lifecycle log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub at: DateTime<Utc>,
    pub event: String,
    pub detail: String,
}

/// Compute the stable 64-bit `Finding::id` from its identity triple.
///
/// Deterministic: two observations of the same logical issue produce the
/// same id regardless of process restarts (SPEC_FULL.md §3 invariants).
#[must_use]
pub fn finding_id(resource_id: &str, category: Category, normalized_key: &str) -> u64 {
    let content = format!("{resource_id}|{category}|{normalized_key}");
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(content.as_bytes());
    hasher.finish()
}

/// Normalize a free-form finding key into the lowercase-hyphenated slug form
/// used both for display and as part of the id hash input.
#[must_use]
pub fn normalize_key(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Persistent, deduplicated record of a discovered issue (SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: u64,
    pub key: String,
    pub severity: Severity,
    pub category: Category,
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    pub node: String,
    pub title: String,
    pub description: String,
    pub recommendation: String,
    pub evidence: String,
    pub source: String,
    pub detected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub auto_resolved: bool,
    pub resolve_reason: String,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub alert_id: Option<String>,
    pub dismissed_reason: Option<DismissReason>,
    pub user_note: String,
    pub times_raised: u32,
    pub suppressed: bool,
    pub investigation_session_id: Option<String>,
    pub investigation_status: Option<InvestigationStatus>,
    pub investigation_outcome: Option<InvestigationOutcome>,
    pub last_investigated_at: Option<DateTime<Utc>>,
    pub investigation_attempts: u32,
    pub loop_state: String,
    pub lifecycle: Vec<LifecycleEvent>,
    pub regression_count: u32,
    pub last_regression_at: Option<DateTime<Utc>>,
}

impl Finding {
    /// Construct a fresh finding with the identity fields filled in and every
    /// other field defaulted; callers then set title/description/etc.
    #[must_use]
    pub fn new(
        resource_id: impl Into<String>,
        category: Category,
        key: impl Into<String>,
        severity: Severity,
        now: DateTime<Utc>,
    ) -> Self {
        let resource_id = resource_id.into();
        let key = normalize_key(&key.into());
        let id = finding_id(&resource_id, category, &key);
        Self {
            id,
            key,
            severity,
            category,
            resource_id,
            resource_name: String::new(),
            resource_type: String::new(),
            node: String::new(),
            title: String::new(),
            description: String::new(),
            recommendation: String::new(),
            evidence: String::new(),
            source: String::new(),
            detected_at: now,
            last_seen_at: now,
            resolved_at: None,
            auto_resolved: false,
            resolve_reason: String::new(),
            acknowledged_at: None,
            snoozed_until: None,
            alert_id: None,
            dismissed_reason: None,
            user_note: String::new(),
            times_raised: 1,
            suppressed: false,
            investigation_session_id: None,
            investigation_status: None,
            investigation_outcome: None,
            last_investigated_at: None,
            investigation_attempts: 0,
            loop_state: String::new(),
            lifecycle: Vec::new(),
            regression_count: 0,
            last_regression_at: None,
        }
    }

    /// Active iff not resolved, not suppressed, not dismissed, and not
    /// currently snoozed (SPEC_FULL.md §3 invariants).
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.resolved_at.is_none()
            && !self.suppressed
            && self.dismissed_reason.is_none()
            && self.snoozed_until.is_none_or(|until| until < now)
    }

    pub fn push_lifecycle(&mut self, now: DateTime<Utc>, event: impl Into<String>, detail: impl Into<String>) {
        self.lifecycle.push(LifecycleEvent {
            at: now,
            event: event.into(),
            detail: detail.into(),
        });
    }
}

/// User-defined or dismissal-derived suppression of future findings for a
/// `(resource_id, category)` tuple. Empty string means wildcard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionRule {
    pub resource_id: String,
    pub category: Option<Category>,
    pub created_at: DateTime<Utc>,
    pub source: String,
    pub description: String,
}

impl SuppressionRule {
    #[must_use]
    pub fn matches(&self, resource_id: &str, category: Category) -> bool {
        let resource_match = self.resource_id.is_empty() || self.resource_id == resource_id;
        let category_match = self.category.is_none_or(|c| c == category);
        resource_match && category_match
    }
}
