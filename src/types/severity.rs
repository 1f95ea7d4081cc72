use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Finding/flag severity, ordered `info < watch < warning < critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Watch,
    Warning,
    Critical,
}

impl Severity {
    /// Numeric rank used for max-severity dedup (SPEC_FULL.md §4.2).
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Info => 0,
            Self::Watch => 1,
            Self::Warning => 2,
            Self::Critical => 3,
        }
    }

    #[must_use]
    pub const fn at_least_medium(self) -> bool {
        matches!(self, Self::Warning | Self::Critical)
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Watch => "watch",
            Self::Warning => "warning",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Finding category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Performance,
    Capacity,
    Reliability,
    Backup,
    Security,
    General,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Performance => "performance",
            Self::Capacity => "capacity",
            Self::Reliability => "reliability",
            Self::Backup => "backup",
            Self::Security => "security",
            Self::General => "general",
        };
        write!(f, "{s}")
    }
}
