//! Core data model shared by every component (SPEC_FULL.md §3).

mod finding;
mod flag;
mod run;
mod scope;
mod severity;
mod snapshot;
mod stream;

pub use finding::{
    finding_id, normalize_key, DismissReason, Finding, InvestigationOutcome, InvestigationStatus,
    LifecycleEvent, SuppressionRule,
};
pub use flag::TriageFlag;
pub use run::{PatrolRunRecord, RunStatus, RunType, MAX_TOOL_CALLS_RETAINED};
pub use scope::Scope;
pub use severity::{Category, Severity};
pub use snapshot::{
    AlertInfo, AlertLevel, ConnectionHealthInfo, GuestInfo, GuestKind, NodeInfo, PatternPrediction,
    PhysicalDiskInfo, Snapshot, StoragePoolInfo,
};
pub use stream::{cap_field, ResyncReason, StreamEvent, StreamEventType, STREAM_FIELD_CAP_BYTES};
