//! Learned per-resource baselines (SPEC_FULL.md §11).
//!
//! Online (Welford) mean/variance accumulation per `(resource_id, metric)`
//! key, classifying new observations by z-score. Backs both the
//! `TriageEvaluator`'s baseline-anomaly rule (§4.2 rule 2) and the
//! `ThresholdGuard`'s anomaly bypass (§4.7) — both call sites share one
//! implementation rather than re-deriving the same statistics twice.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("baseline key not found: {0}")]
    NotFound(String),
    #[error("insufficient samples to classify ({0} < {1})")]
    InsufficientSamples(usize, usize),
}

/// Minimum sample count before a baseline is considered "learned" enough to
/// classify anomalies against. Below this, callers treat the metric as
/// unknown rather than anomalous.
pub const MIN_SAMPLES_FOR_CLASSIFICATION: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyLevel {
    Normal,
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalyLevel {
    #[must_use]
    pub const fn at_least_medium(self) -> bool {
        matches!(self, Self::Medium | Self::High | Self::Critical)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LearningStatus {
    Learning,
    Learned,
}

/// Online Welford accumulator for one `(resource_id, metric)` time series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineAccumulator {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Default for BaselineAccumulator {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }
}

impl BaselineAccumulator {
    /// Incorporate a new observation (Welford's online algorithm).
    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    #[must_use]
    pub fn sample_count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn mean(&self) -> f64 {
        self.mean
    }

    #[must_use]
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    #[must_use]
    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Z-score of `value` against the learned distribution. `None` if the
    /// accumulator has zero variance (constant series) or too few samples.
    #[must_use]
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if (self.count as usize) < MIN_SAMPLES_FOR_CLASSIFICATION {
            return None;
        }
        let sd = self.stddev();
        if sd <= f64::EPSILON {
            return None;
        }
        Some((value - self.mean) / sd)
    }

    #[must_use]
    pub fn status(&self) -> LearningStatus {
        if (self.count as usize) >= MIN_SAMPLES_FOR_CLASSIFICATION {
            LearningStatus::Learned
        } else {
            LearningStatus::Learning
        }
    }
}

/// Classify a z-score magnitude into an `AnomalyLevel` (shared thresholds
/// used by both triage and the threshold guard).
#[must_use]
pub fn classify_z_score(z_abs: f64) -> AnomalyLevel {
    if z_abs >= 4.0 {
        AnomalyLevel::Critical
    } else if z_abs >= 3.0 {
        AnomalyLevel::High
    } else if z_abs >= 2.5 {
        AnomalyLevel::Medium
    } else if z_abs >= 1.5 {
        AnomalyLevel::Low
    } else {
        AnomalyLevel::Normal
    }
}

/// Result of checking one observation against its baseline.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyCheckResult {
    pub level: AnomalyLevel,
    pub z_score: Option<f64>,
}

/// Thread-safe store of baselines keyed by `(resource_id, metric)`.
#[derive(Debug, Default)]
pub struct ThresholdManager {
    accumulators: RwLock<HashMap<(String, String), BaselineAccumulator>>,
}

impl ThresholdManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, resource_id: &str, metric: &str, value: f64) {
        let mut guard = self
            .accumulators
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard
            .entry((resource_id.to_string(), metric.to_string()))
            .or_default()
            .observe(value);
    }

    /// Check `value` against the learned baseline for `(resource_id, metric)`.
    /// Returns `AnomalyLevel::Normal` with no z-score if unlearned or absent —
    /// callers treat that as "no opinion", not "definitely fine".
    #[must_use]
    pub fn check(&self, resource_id: &str, metric: &str, value: f64) -> AnomalyCheckResult {
        let guard = self
            .accumulators
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(acc) = guard.get(&(resource_id.to_string(), metric.to_string())) else {
            return AnomalyCheckResult {
                level: AnomalyLevel::Normal,
                z_score: None,
            };
        };
        match acc.z_score(value) {
            Some(z) => AnomalyCheckResult {
                level: classify_z_score(z.abs()),
                z_score: Some(z),
            },
            None => AnomalyCheckResult {
                level: AnomalyLevel::Normal,
                z_score: None,
            },
        }
    }

    /// Whether the baseline for `(resource_id, metric)` has learned enough
    /// samples to be trusted for classification.
    #[must_use]
    pub fn status(&self, resource_id: &str, metric: &str) -> Option<LearningStatus> {
        let guard = self
            .accumulators
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard
            .get(&(resource_id.to_string(), metric.to_string()))
            .map(BaselineAccumulator::status)
    }
}

/// Convenience accessors mirroring the common metric names triage looks up.
pub mod resource_metrics {
    pub const CPU: &str = "cpu";
    pub const MEMORY: &str = "memory";
    pub const DISK: &str = "disk";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_tracks_mean_and_variance() {
        let mut acc = BaselineAccumulator::default();
        for v in [10.0, 12.0, 11.0, 13.0, 9.0] {
            acc.observe(v);
        }
        assert!((acc.mean() - 11.0).abs() < 1e-9);
        assert!(acc.variance() > 0.0);
    }

    #[test]
    fn z_score_none_until_enough_samples() {
        let mut acc = BaselineAccumulator::default();
        for v in [10.0, 10.0, 10.0] {
            acc.observe(v);
        }
        assert!(acc.z_score(50.0).is_none());
    }

    #[test]
    fn classify_thresholds() {
        assert_eq!(classify_z_score(0.5), AnomalyLevel::Normal);
        assert_eq!(classify_z_score(2.6), AnomalyLevel::Medium);
        assert_eq!(classify_z_score(3.5), AnomalyLevel::High);
        assert_eq!(classify_z_score(5.0), AnomalyLevel::Critical);
    }

    #[test]
    fn manager_check_reports_anomaly_once_learned() {
        let mgr = ThresholdManager::new();
        for _ in 0..20 {
            mgr.observe("node/pve1", resource_metrics::CPU, 30.0);
        }
        let result = mgr.check("node/pve1", resource_metrics::CPU, 95.0);
        assert!(result.level.at_least_medium());
    }
}
