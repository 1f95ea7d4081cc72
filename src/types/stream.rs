use serde::{Deserialize, Serialize};

/// Taxonomy of outbound stream events (SPEC_FULL.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    Content,
    Phase,
    ToolStart,
    ToolEnd,
    FindingRejected,
    Snapshot,
    Done,
    Error,
}

/// Why a synthetic `snapshot` event was emitted to a (re)subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncReason {
    StaleLastEventId,
    BufferRotated,
    LateJoiner,
}

/// Cap applied to `content`/`tool_input`/`tool_raw_input`/`tool_output`
/// string fields before broadcast (SPEC_FULL.md §4.5).
pub const STREAM_FIELD_CAP_BYTES: usize = 8 * 1024;

pub const TRUNCATION_SUFFIX: &str = "\u{2026}[truncated]";

/// Truncate `s` to `STREAM_FIELD_CAP_BYTES`, respecting char boundaries,
/// appending the truncation suffix when truncation occurred. The returned
/// bool is whether `s` actually exceeded the cap, not a guess from the
/// resulting string's contents.
#[must_use]
pub fn cap_field(s: &str) -> (String, bool) {
    if s.len() <= STREAM_FIELD_CAP_BYTES {
        return (s.to_string(), false);
    }
    let mut end = STREAM_FIELD_CAP_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    (format!("{}{}", &s[..end], TRUNCATION_SUFFIX), true)
}

/// One event on the stream bus (SPEC_FULL.md §3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    pub run_id: String,
    pub seq: u64,
    pub ts_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_raw_input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finding_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resync_reason: Option<ResyncReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_start: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_end: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamEvent {
    /// Construct a bare event of `event_type`; `run_id`/`seq`/`ts_ms` get
    /// filled in by `StreamBus::broadcast` if left at their defaults.
    #[must_use]
    pub fn new(event_type: StreamEventType) -> Self {
        Self {
            event_type,
            run_id: String::new(),
            seq: 0,
            ts_ms: 0,
            content: None,
            phase: None,
            tool_name: None,
            tool_input: None,
            tool_raw_input: None,
            tool_output: None,
            finding_id: None,
            rejection_reason: None,
            resync_reason: None,
            buffer_start: None,
            buffer_end: None,
            content_truncated: None,
            error: None,
        }
    }

    /// Cap all string payload fields per SPEC_FULL.md §4.5, setting
    /// `content_truncated` from the real truncation result rather than
    /// leaving callers to infer it from the capped string.
    #[must_use]
    pub fn with_capped_fields(mut self) -> Self {
        if let Some(s) = self.content.take() {
            let (capped, truncated) = cap_field(&s);
            self.content = Some(capped);
            self.content_truncated = Some(truncated);
        }
        if let Some(s) = self.tool_input.take() {
            self.tool_input = Some(cap_field(&s).0);
        }
        if let Some(s) = self.tool_raw_input.take() {
            self.tool_raw_input = Some(cap_field(&s).0);
        }
        if let Some(s) = self.tool_output.take() {
            self.tool_output = Some(cap_field(&s).0);
        }
        self
    }
}
