//! Hot-reloadable configuration surface (SPEC_FULL.md §6, §10.3).
//!
//! `PatrolConfig` is published behind an `ArcSwap` so every component reads
//! a lock-free atomic snapshot (`ConfigSurface::load`). Writers (the config
//! file watcher, an admin API, or a test) call `ConfigSurface::store`, and
//! the engine's scheduling loop is notified of interval changes over the
//! `ConfigChange` channel so it can reset its ticker.

pub mod watcher;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    /// Findings are recorded but never investigated.
    Monitor,
    /// Investigations run and propose fixes but never execute them.
    Approval,
    /// Investigations run and may execute fixes directly.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    /// `warn` equals the alerting threshold itself.
    Exact,
    /// `warn` = alert − 5, `watch` = alert − 15 (earlier warning).
    Proactive,
}

/// Tunable triage thresholds (SPEC_FULL.md §6, §4.2). A zero value on any
/// field means "use the built-in default for that field".
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PatrolThresholds {
    pub node_cpu_warn: f64,
    pub node_cpu_watch: f64,
    pub node_mem_warn: f64,
    pub node_mem_watch: f64,
    pub guest_mem_warn: f64,
    pub guest_mem_watch: f64,
    pub guest_disk_critical: f64,
    pub guest_disk_warn: f64,
    pub guest_disk_watch: f64,
    pub storage_critical: f64,
    pub storage_warn: f64,
    pub storage_watch: f64,
    pub mode: ThresholdMode,
}

impl Default for PatrolThresholds {
    fn default() -> Self {
        Self {
            node_cpu_warn: 80.0,
            node_cpu_watch: 70.0,
            node_mem_warn: 85.0,
            node_mem_watch: 75.0,
            guest_mem_warn: 85.0,
            guest_mem_watch: 75.0,
            guest_disk_critical: 95.0,
            guest_disk_warn: 85.0,
            guest_disk_watch: 75.0,
            storage_critical: 95.0,
            storage_warn: 90.0,
            storage_watch: 80.0,
            mode: ThresholdMode::Exact,
        }
    }
}

impl PatrolThresholds {
    /// Replace zeroed fields with the built-in defaults, then, under
    /// `ThresholdMode::Proactive`, lower `warn`/`watch` relative to the
    /// (now-resolved) alerting value (SPEC_FULL.md §6).
    #[must_use]
    pub fn resolved(&self) -> Self {
        let d = Self::default();
        let pick = |v: f64, default: f64| if v == 0.0 { default } else { v };
        let mut r = Self {
            node_cpu_warn: pick(self.node_cpu_warn, d.node_cpu_warn),
            node_cpu_watch: pick(self.node_cpu_watch, d.node_cpu_watch),
            node_mem_warn: pick(self.node_mem_warn, d.node_mem_warn),
            node_mem_watch: pick(self.node_mem_watch, d.node_mem_watch),
            guest_mem_warn: pick(self.guest_mem_warn, d.guest_mem_warn),
            guest_mem_watch: pick(self.guest_mem_watch, d.guest_mem_watch),
            guest_disk_critical: pick(self.guest_disk_critical, d.guest_disk_critical),
            guest_disk_warn: pick(self.guest_disk_warn, d.guest_disk_warn),
            guest_disk_watch: pick(self.guest_disk_watch, d.guest_disk_watch),
            storage_critical: pick(self.storage_critical, d.storage_critical),
            storage_warn: pick(self.storage_warn, d.storage_warn),
            storage_watch: pick(self.storage_watch, d.storage_watch),
            mode: self.mode,
        };
        if matches!(self.mode, ThresholdMode::Proactive) {
            r.node_cpu_watch = r.node_cpu_warn - 15.0;
            r.node_cpu_warn -= 5.0;
            r.node_mem_watch = r.node_mem_warn - 15.0;
            r.node_mem_warn -= 5.0;
            r.guest_mem_watch = r.guest_mem_warn - 15.0;
            r.guest_mem_warn -= 5.0;
            r.guest_disk_watch = r.guest_disk_warn - 15.0;
            r.guest_disk_warn -= 5.0;
            r.storage_watch = r.storage_warn - 15.0;
            r.storage_warn -= 5.0;
        }
        r
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AnalysisToggles {
    pub nodes: bool,
    pub guests: bool,
    pub docker: bool,
    pub storage: bool,
    pub pbs: bool,
    pub pmg: bool,
    pub hosts: bool,
    pub kubernetes: bool,
}

impl Default for AnalysisToggles {
    fn default() -> Self {
        Self {
            nodes: true,
            guests: true,
            docker: true,
            storage: true,
            pbs: true,
            pmg: true,
            hosts: true,
            kubernetes: true,
        }
    }
}

/// The full hot-reloadable configuration object (SPEC_FULL.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolConfig {
    pub analysis: AnalysisToggles,
    pub thresholds: PatrolThresholds,
    pub autonomy_level: AutonomyLevel,
    pub auto_fix: bool,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    pub event_triggers_enabled: bool,
}

impl Default for PatrolConfig {
    fn default() -> Self {
        Self {
            analysis: AnalysisToggles::default(),
            thresholds: PatrolThresholds::default(),
            autonomy_level: AutonomyLevel::Monitor,
            auto_fix: false,
            interval: Duration::from_secs(15 * 60),
            event_triggers_enabled: true,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Describes what changed between two config generations, emitted to the
/// scheduling loop so it can react (e.g. reset its interval ticker).
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub old_interval: Duration,
    pub new_interval: Duration,
    pub interval_changed: bool,
}

/// Lock-free hot-reloadable configuration handle (SPEC_FULL.md §10.3).
///
/// Readers call `load()` to get a cheap atomic snapshot; writers call
/// `store()` with a whole new config. There is no global/static instance —
/// per DESIGN NOTES §9, the engine is an explicitly constructed object and
/// owns its `ConfigSurface`.
#[derive(Debug, Clone)]
pub struct ConfigSurface {
    inner: Arc<ArcSwap<PatrolConfig>>,
}

impl ConfigSurface {
    #[must_use]
    pub fn new(initial: PatrolConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    #[must_use]
    pub fn load(&self) -> Arc<PatrolConfig> {
        self.inner.load_full()
    }

    /// Replace the configuration, returning a `ConfigChange` describing the
    /// delta relevant to the scheduling loop.
    pub fn store(&self, new: PatrolConfig) -> ConfigChange {
        let old = self.inner.load_full();
        let change = ConfigChange {
            old_interval: old.interval,
            new_interval: new.interval,
            interval_changed: old.interval != new.interval,
        };
        self.inner.store(Arc::new(new));
        change
    }
}

impl Default for ConfigSurface {
    fn default() -> Self {
        Self::new(PatrolConfig::default())
    }
}
