//! Thread-safe finding lifecycle + persistence (SPEC_FULL.md §4.3).
//!
//! `FindingsStore` exclusively owns the map of `Finding`s; nothing else in
//! the crate mutates a finding directly. The write path never suspends —
//! persistence is scheduled from a released lock via a debounce task.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::capabilities::FindingsPersistence;
use crate::clock::SharedClock;
use crate::types::{
    finding_id, normalize_key, Category, DismissReason, Finding, Severity, SuppressionRule,
};

#[derive(Debug, Error)]
pub enum FindingsError {
    #[error("finding not found: {0}")]
    NotFound(u64),
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Debounce window between the last mutation and a background save.
pub const SAVE_DEBOUNCE: Duration = Duration::from_secs(5);
/// Prefix marking a finding as demo data; never persisted (SPEC_FULL.md §4.3).
pub const DEMO_ID_PREFIX: &str = "demo-";

/// Summary of active findings by severity, computed dynamically so
/// time-based snooze expiry is always honored (SPEC_FULL.md §4.3).
#[derive(Debug, Clone, Default)]
pub struct FindingsSummary {
    pub by_severity: HashMap<Severity, u32>,
    pub total_active: u32,
}

struct Inner {
    findings: HashMap<u64, Finding>,
    by_resource: HashMap<String, HashSet<u64>>,
    suppression_rules: Vec<SuppressionRule>,
}

/// Thread-safe, reentrancy-free finding lifecycle store.
pub struct FindingsStore {
    inner: RwLock<Inner>,
    persistence: Option<Arc<dyn FindingsPersistence>>,
    clock: SharedClock,
    dirty: AtomicBool,
    last_mutation_ms: AtomicI64,
    save_error_count: AtomicI64,
    /// Self-reference so `&self` methods can spawn tasks holding an `Arc`
    /// without requiring every caller to thread an `Arc<FindingsStore>` through.
    self_ref: std::sync::Weak<FindingsStore>,
}

impl FindingsStore {
    #[must_use]
    pub fn new(clock: SharedClock, persistence: Option<Arc<dyn FindingsPersistence>>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            inner: RwLock::new(Inner {
                findings: HashMap::new(),
                by_resource: HashMap::new(),
                suppression_rules: Vec::new(),
            }),
            persistence,
            clock,
            dirty: AtomicBool::new(false),
            last_mutation_ms: AtomicI64::new(0),
            save_error_count: AtomicI64::new(0),
            self_ref: weak.clone(),
        })
    }

    /// Spawn the debounced-save background task. Cancelled via `cancel`.
    pub fn spawn_debounced_save(self: &Arc<Self>, cancel: CancellationToken) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if !store.dirty.load(Ordering::Acquire) {
                    continue;
                }
                let last = store.last_mutation_ms.load(Ordering::Acquire);
                let now_ms = store.clock.now().timestamp_millis();
                if now_ms - last >= SAVE_DEBOUNCE.as_millis() as i64 {
                    if let Err(e) = store.force_save().await {
                        tracing::warn!(error = %e, "[FindingsStore] debounced save failed");
                        store.save_error_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.last_mutation_ms
            .store(self.clock.now().timestamp_millis(), Ordering::Release);
    }

    /// Synchronous force-save, bypassing the debounce window. Crash-safety
    /// hook called on new warning/critical findings and at shutdown.
    pub async fn force_save(&self) -> Result<(), FindingsError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let (persistable, rules) = {
            let guard = self.read_lock();
            let persistable: HashMap<u64, Finding> = guard
                .findings
                .iter()
                .filter(|(_, f)| !f.resource_id.starts_with(DEMO_ID_PREFIX))
                .map(|(k, v)| (*k, v.clone()))
                .collect();
            (persistable, guard.suppression_rules.clone())
        };
        persistence
            .save_findings(&persistable)
            .await
            .map_err(|e| FindingsError::Persistence(e.to_string()))?;
        persistence
            .save_suppression_rules(&rules)
            .await
            .map_err(|e| FindingsError::Persistence(e.to_string()))?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Repopulate the store from persistence, rebuilding the resource index.
    pub async fn load(&self) -> Result<(), FindingsError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let loaded = persistence
            .load_findings()
            .await
            .map_err(|e| FindingsError::Persistence(e.to_string()))?;
        let rules = persistence
            .load_suppression_rules()
            .await
            .map_err(|e| FindingsError::Persistence(e.to_string()))?;
        let mut guard = self.write_lock();
        guard.by_resource.clear();
        for (id, finding) in &loaded {
            guard
                .by_resource
                .entry(finding.resource_id.clone())
                .or_default()
                .insert(*id);
        }
        guard.findings = loaded;
        guard.suppression_rules = rules;
        Ok(())
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn is_suppressed(inner: &Inner, resource_id: &str, category: Category) -> bool {
        inner.suppression_rules.iter().any(|r| r.matches(resource_id, category))
    }

    /// Add (or merge into an existing) finding. Returns `true` if this
    /// created a brand-new finding (SPEC_FULL.md §4.3 `Add`).
    pub fn add(&self, mut f: Finding) -> bool {
        let now = self.clock.now();
        let mut guard = self.write_lock();

        if Self::is_suppressed(&guard, &f.resource_id, f.category) && !guard.findings.contains_key(&f.id) {
            return false;
        }

        let is_new = match guard.findings.get_mut(&f.id) {
            Some(existing) => {
                existing.last_seen_at = now;
                existing.times_raised += 1;
                let escalated = f.severity.rank() > existing.severity.rank();

                if existing.resolved_at.is_some() {
                    existing.resolved_at = None;
                    existing.auto_resolved = false;
                    existing.resolve_reason.clear();
                    existing.severity = f.severity;
                    existing.push_lifecycle(now, "reopened", "re-observed after resolution");
                }

                if existing.dismissed_reason.is_some() || existing.suppressed {
                    if escalated {
                        existing.dismissed_reason = None;
                        existing.suppressed = false;
                        existing.severity = f.severity;
                        existing.regression_count += 1;
                        existing.last_regression_at = Some(now);
                        existing.push_lifecycle(now, "reactivated", "severity escalation cleared dismissal");
                    }
                    // else: only last_seen_at/times_raised already updated above.
                } else {
                    existing.severity = f.severity;
                    existing.title = f.title.clone();
                    existing.description = f.description.clone();
                    existing.recommendation = f.recommendation.clone();
                    existing.evidence = f.evidence.clone();
                }
                false
            }
            None => {
                if f.resource_type.is_empty() {
                    f.resource_type = infer_resource_type(&f.resource_id);
                }
                f.last_seen_at = now;
                f.detected_at = now;
                guard
                    .by_resource
                    .entry(f.resource_id.clone())
                    .or_default()
                    .insert(f.id);
                guard.findings.insert(f.id, f.clone());
                true
            }
        };
        drop(guard);
        self.mark_dirty();

        // New warning/critical findings get an immediate (non-blocking)
        // force-save for crash safety rather than waiting out the debounce
        // window (SPEC_FULL.md §4.3).
        if is_new && matches!(f.severity, Severity::Warning | Severity::Critical) && self.persistence.is_some() {
            self.request_immediate_save();
        }
        is_new
    }

    /// Trigger a force-save on a detached task without blocking the caller.
    fn request_immediate_save(&self) {
        let Some(store) = self.self_ref.upgrade() else { return };
        tokio::spawn(async move {
            if let Err(e) = store.force_save().await {
                tracing::warn!(error = %e, "[FindingsStore] immediate save failed");
            }
        });
    }

    /// Compute weighted similarity between a candidate and an existing
    /// active finding (SPEC_FULL.md §4.3 `AddWithDeduplication`).
    #[must_use]
    pub fn similarity(a: &Finding, b: &Finding) -> f64 {
        let resource = f64::from(a.resource_id == b.resource_id) * 0.3;
        let category = f64::from(a.category == b.category) * 0.2;
        let key = f64::from(a.key == b.key) * 0.4;
        let title = jaccard(&a.title, &b.title) * 0.2;
        let description = jaccard(&a.description, &b.description) * 0.1;
        (resource + category + key + title + description).min(1.0)
    }

    /// Insert `f`, merging into the most similar active finding if its
    /// similarity is at least `min_sim` (SPEC_FULL.md §4.3).
    pub fn add_with_deduplication(&self, f: Finding, min_sim: f64) -> bool {
        let now = self.clock.now();
        let best_match = {
            let guard = self.read_lock();
            guard
                .findings
                .values()
                .filter(|existing| existing.is_active(now))
                .map(|existing| (existing.id, Self::similarity(&f, existing)))
                .filter(|(_, sim)| *sim >= min_sim)
                .max_by(|a, b| a.1.total_cmp(&b.1))
        };

        let Some((match_id, _)) = best_match else {
            return self.add(f);
        };

        let mut guard = self.write_lock();
        if let Some(existing) = guard.findings.get_mut(&match_id) {
            existing.last_seen_at = now;
            existing.times_raised += 1;
            if f.severity.rank() > existing.severity.rank() {
                existing.severity = f.severity;
            }
            if !existing.evidence.contains(&f.evidence) && !f.evidence.is_empty() {
                existing.evidence.push_str("\n");
                existing.evidence.push_str(&f.evidence);
                existing.evidence.truncate(5000);
            }
        }
        drop(guard);
        self.mark_dirty();
        false
    }

    pub fn resolve(&self, id: u64, auto: bool) -> bool {
        self.resolve_with_reason_inner(id, auto, if auto { "auto-resolved" } else { "resolved" })
    }

    pub fn resolve_with_reason(&self, id: u64, reason: &str) -> bool {
        self.resolve_with_reason_inner(id, false, reason)
    }

    fn resolve_with_reason_inner(&self, id: u64, auto: bool, reason: &str) -> bool {
        let now = self.clock.now();
        let mut guard = self.write_lock();
        let Some(f) = guard.findings.get_mut(&id) else {
            return false;
        };
        if !f.is_active(now) {
            return false;
        }
        f.resolved_at = Some(now);
        f.auto_resolved = auto;
        f.resolve_reason = reason.to_string();
        f.push_lifecycle(now, "resolved", reason);
        drop(guard);
        self.mark_dirty();
        true
    }

    pub fn acknowledge(&self, id: u64) -> bool {
        let now = self.clock.now();
        let mut guard = self.write_lock();
        let Some(f) = guard.findings.get_mut(&id) else { return false };
        f.acknowledged_at = Some(now);
        drop(guard);
        self.mark_dirty();
        true
    }

    pub fn snooze(&self, id: u64, duration: Duration) -> bool {
        let now = self.clock.now();
        let until = now + chrono::Duration::from_std(duration).unwrap_or_default();
        let mut guard = self.write_lock();
        let Some(f) = guard.findings.get_mut(&id) else { return false };
        f.snoozed_until = Some(until);
        drop(guard);
        self.mark_dirty();
        true
    }

    /// Mutate just the investigation substate of one finding under a single
    /// write lock, leaving `times_raised`/content fields untouched — the
    /// dedicated atomic update path `InvestigationTrigger` uses instead of a
    /// read-then-`add()` round trip (SPEC_FULL.md §4.8).
    pub fn update_investigation(&self, id: u64, mutate: impl FnOnce(&mut Finding)) -> bool {
        let mut guard = self.write_lock();
        let Some(f) = guard.findings.get_mut(&id) else { return false };
        mutate(f);
        drop(guard);
        self.mark_dirty();
        true
    }

    pub fn unsnooze(&self, id: u64) -> bool {
        let mut guard = self.write_lock();
        let Some(f) = guard.findings.get_mut(&id) else { return false };
        f.snoozed_until = None;
        drop(guard);
        self.mark_dirty();
        true
    }

    /// Dismiss a finding. `"not_an_issue"` additionally suppresses it
    /// permanently and creates a matching `SuppressionRule` (SPEC_FULL.md
    /// §4.3, §9 Open Question (i): the dismissal note is copied into the
    /// rule's description only for `not_an_issue`, since that is the only
    /// reason that creates a rule at all).
    pub fn dismiss(&self, id: u64, reason: DismissReason, note: &str) -> bool {
        let now = self.clock.now();
        let mut guard = self.write_lock();
        let Some(f) = guard.findings.get_mut(&id) else { return false };
        f.acknowledged_at = Some(now);
        f.dismissed_reason = Some(reason);
        f.user_note = note.to_string();
        f.push_lifecycle(now, "dismissed", reason.to_string());
        let resource_id = f.resource_id.clone();
        let category = f.category;

        if matches!(reason, DismissReason::NotAnIssue) {
            f.suppressed = true;
            guard.suppression_rules.push(SuppressionRule {
                resource_id,
                category: Some(category),
                created_at: now,
                source: "dismiss".into(),
                description: note.to_string(),
            });
        }
        drop(guard);
        self.mark_dirty();
        true
    }

    pub fn suppress(&self, id: u64) -> bool {
        let now = self.clock.now();
        let mut guard = self.write_lock();
        let Some(f) = guard.findings.get_mut(&id) else { return false };
        f.suppressed = true;
        let resource_id = f.resource_id.clone();
        let category = f.category;
        guard.suppression_rules.push(SuppressionRule {
            resource_id,
            category: Some(category),
            created_at: now,
            source: "manual".into(),
            description: String::new(),
        });
        drop(guard);
        self.mark_dirty();
        true
    }

    #[must_use]
    pub fn get_active(&self, min_sev: Severity) -> Vec<Finding> {
        let now = self.clock.now();
        self.read_lock()
            .findings
            .values()
            .filter(|f| f.is_active(now) && f.severity.rank() >= min_sev.rank())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get_by_resource(&self, resource_id: &str) -> Vec<Finding> {
        let guard = self.read_lock();
        guard
            .by_resource
            .get(resource_id)
            .map(|ids| ids.iter().filter_map(|id| guard.findings.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get_all(&self, since: Option<DateTime<Utc>>) -> Vec<Finding> {
        self.read_lock()
            .findings
            .values()
            .filter(|f| since.is_none_or(|s| f.last_seen_at >= s))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<Finding> {
        self.read_lock().findings.get(&id).cloned()
    }

    #[must_use]
    pub fn get_summary(&self) -> FindingsSummary {
        let now = self.clock.now();
        let mut summary = FindingsSummary::default();
        for f in self.read_lock().findings.values() {
            if f.is_active(now) {
                *summary.by_severity.entry(f.severity).or_insert(0) += 1;
                summary.total_active += 1;
            }
        }
        summary
    }

    /// Remove resolved findings older than `max_age` and non-suppressed
    /// dismissed findings older than 30 days (SPEC_FULL.md §4.3 `Cleanup`).
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_default();
        let dismissed_max_age = chrono::Duration::days(30);
        let mut guard = self.write_lock();
        let to_remove: Vec<u64> = guard
            .findings
            .values()
            .filter(|f| {
                let resolved_stale = f.resolved_at.is_some_and(|r| now - r > max_age);
                let dismissed_stale =
                    f.dismissed_reason.is_some() && !f.suppressed && now - f.last_seen_at > dismissed_max_age;
                resolved_stale || dismissed_stale
            })
            .map(|f| f.id)
            .collect();
        for id in &to_remove {
            if let Some(f) = guard.findings.remove(id) {
                if let Some(set) = guard.by_resource.get_mut(&f.resource_id) {
                    set.remove(id);
                }
            }
        }
        let removed = to_remove.len();
        drop(guard);
        if removed > 0 {
            self.mark_dirty();
        }
        removed
    }

    /// Group active findings into clusters (primary + related ids) by
    /// pairwise similarity (SPEC_FULL.md §4.3 `FindingClusters`).
    #[must_use]
    pub fn find_clusters(&self, min_sim: f64) -> Vec<(u64, Vec<u64>)> {
        let now = self.clock.now();
        let actives: Vec<Finding> = self
            .read_lock()
            .findings
            .values()
            .filter(|f| f.is_active(now))
            .cloned()
            .collect();
        let mut clustered: HashSet<u64> = HashSet::new();
        let mut clusters = Vec::new();
        for primary in &actives {
            if clustered.contains(&primary.id) {
                continue;
            }
            let mut related = Vec::new();
            for other in &actives {
                if other.id == primary.id || clustered.contains(&other.id) {
                    continue;
                }
                if Self::similarity(primary, other) >= min_sim {
                    related.push(other.id);
                    clustered.insert(other.id);
                }
            }
            clustered.insert(primary.id);
            clusters.push((primary.id, related));
        }
        clusters
    }
}

fn jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<&str> = a.split_whitespace().collect();
    let set_b: HashSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn infer_resource_type(resource_id: &str) -> String {
    resource_id
        .split('/')
        .next()
        .unwrap_or("unknown")
        .to_string()
}

/// Construct the identity-stable id for a new finding given its logical key.
#[must_use]
pub fn compute_id(resource_id: &str, category: Category, raw_key: &str) -> u64 {
    finding_id(resource_id, category, &normalize_key(raw_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn store() -> Arc<FindingsStore> {
        let clock: SharedClock = Arc::new(FakeClock::new(Utc::now()));
        FindingsStore::new(clock, None)
    }

    fn finding(resource_id: &str, category: Category, key: &str, severity: Severity) -> Finding {
        Finding::new(resource_id, category, key, severity, Utc::now())
    }

    #[test]
    fn add_then_resolve_is_idempotent() {
        let store = store();
        let f = finding("node/pve1", Category::Performance, "cpu-high", Severity::Warning);
        assert!(store.add(f.clone()));
        assert!(store.resolve(f.id, false));
        assert!(!store.resolve(f.id, false), "second resolve must be a no-op");
    }

    #[test]
    fn repeated_observation_increments_times_raised_monotonically() {
        let store = store();
        let f = finding("vm/101", Category::Backup, "backup-missing", Severity::Warning);
        assert!(store.add(f.clone()));
        assert!(!store.add(f.clone()));
        assert!(!store.add(f));
        let stored = store.get_active(Severity::Info);
        assert_eq!(stored[0].times_raised, 3);
    }

    #[test]
    fn not_an_issue_dismissal_suppresses_same_tuple() {
        let store = store();
        let f = finding("vm/101", Category::Backup, "backup-missing", Severity::Warning);
        store.add(f.clone());
        store.dismiss(f.id, DismissReason::NotAnIssue, "known test VM");

        let repeat = finding("vm/101", Category::Backup, "backup-missing", Severity::Warning);
        assert!(!store.add(repeat), "suppressed tuple must not create a new finding");
        assert_eq!(store.get_active(Severity::Info).len(), 0);
    }

    #[test]
    fn severity_escalation_reactivates_dismissed_finding() {
        let store = store();
        let f = finding("vm/101", Category::Performance, "cpu-high", Severity::Warning);
        store.add(f.clone());
        store.dismiss(f.id, DismissReason::WillFixLater, "later");

        let escalated = finding("vm/101", Category::Performance, "cpu-high", Severity::Critical);
        store.add(escalated);

        let active = store.get_active(Severity::Info);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, Severity::Critical);
    }

    #[test]
    fn active_counts_match_dynamic_predicate() {
        let store = store();
        let a = finding("node/1", Category::Performance, "cpu-high", Severity::Warning);
        let b = finding("node/2", Category::Performance, "mem-high", Severity::Critical);
        store.add(a);
        store.add(b);
        let summary = store.get_summary();
        assert_eq!(summary.total_active, 2);
        assert_eq!(*summary.by_severity.get(&Severity::Critical).unwrap(), 1);
    }
}
