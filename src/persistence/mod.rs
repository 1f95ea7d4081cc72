//! Sled-backed `FindingsPersistence` (SPEC_FULL.md §6).
//!
//! Findings and suppression rules are small enough to round-trip as single
//! JSON blobs under fixed keys; run records get their own tree keyed by
//! big-endian start timestamp so they iterate in chronological order,
//! mirroring the history store's key scheme elsewhere in this codebase.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::capabilities::FindingsPersistence;
use crate::error::{PatrolError, PatrolResult};
use crate::types::{Finding, PatrolRunRecord, SuppressionRule};

const FINDINGS_KEY: &str = "findings";
const SUPPRESSION_RULES_KEY: &str = "suppression_rules";
const RUN_RECORDS_TREE: &str = "run_records";
/// Oldest run records are evicted past this count to bound disk growth.
const MAX_RETAINED_RUN_RECORDS: usize = 500;

pub struct SledFindingsPersistence {
    db: Arc<sled::Db>,
}

impl SledFindingsPersistence {
    pub fn open<P: AsRef<Path>>(path: P) -> PatrolResult<Self> {
        let db = sled::open(path).map_err(|e| PatrolError::PersistenceFailure(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn run_records_tree(&self) -> sled::Result<sled::Tree> {
        self.db.open_tree(RUN_RECORDS_TREE)
    }
}

#[async_trait]
impl FindingsPersistence for SledFindingsPersistence {
    async fn save_findings(&self, findings: &HashMap<u64, Finding>) -> PatrolResult<()> {
        let bytes = serde_json::to_vec(findings).map_err(|e| PatrolError::PersistenceFailure(e.to_string()))?;
        self.db
            .insert(FINDINGS_KEY, bytes)
            .map_err(|e| PatrolError::PersistenceFailure(e.to_string()))?;
        self.db.flush_async().await.map_err(|e| PatrolError::PersistenceFailure(e.to_string()))?;
        Ok(())
    }

    async fn load_findings(&self) -> PatrolResult<HashMap<u64, Finding>> {
        match self.db.get(FINDINGS_KEY).map_err(|e| PatrolError::PersistenceFailure(e.to_string()))? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| PatrolError::PersistenceFailure(e.to_string())),
            None => Ok(HashMap::new()),
        }
    }

    async fn save_suppression_rules(&self, rules: &[SuppressionRule]) -> PatrolResult<()> {
        let bytes = serde_json::to_vec(rules).map_err(|e| PatrolError::PersistenceFailure(e.to_string()))?;
        self.db
            .insert(SUPPRESSION_RULES_KEY, bytes)
            .map_err(|e| PatrolError::PersistenceFailure(e.to_string()))?;
        self.db.flush_async().await.map_err(|e| PatrolError::PersistenceFailure(e.to_string()))?;
        Ok(())
    }

    async fn load_suppression_rules(&self) -> PatrolResult<Vec<SuppressionRule>> {
        match self.db.get(SUPPRESSION_RULES_KEY).map_err(|e| PatrolError::PersistenceFailure(e.to_string()))? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| PatrolError::PersistenceFailure(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn append_run_record(&self, record: &PatrolRunRecord) -> PatrolResult<()> {
        let tree = self.run_records_tree().map_err(|e| PatrolError::PersistenceFailure(e.to_string()))?;
        let key = record.started_at.timestamp_millis().to_be_bytes();
        let value = serde_json::to_vec(record).map_err(|e| PatrolError::PersistenceFailure(e.to_string()))?;
        tree.insert(key, value).map_err(|e| PatrolError::PersistenceFailure(e.to_string()))?;

        if tree.len() > MAX_RETAINED_RUN_RECORDS {
            if let Some(Ok((oldest_key, _))) = tree.iter().next() {
                let _ = tree.remove(oldest_key);
            }
        }
        tree.flush_async().await.map_err(|e| PatrolError::PersistenceFailure(e.to_string()))?;
        Ok(())
    }

    async fn last_completed_run_at(&self) -> PatrolResult<Option<chrono::DateTime<chrono::Utc>>> {
        let tree = self.run_records_tree().map_err(|e| PatrolError::PersistenceFailure(e.to_string()))?;
        for entry in tree.iter().rev() {
            let (_, value) = entry.map_err(|e| PatrolError::PersistenceFailure(e.to_string()))?;
            let record: PatrolRunRecord =
                serde_json::from_slice(&value).map_err(|e| PatrolError::PersistenceFailure(e.to_string()))?;
            if let Some(completed_at) = record.completed_at {
                return Ok(Some(completed_at));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, Severity};
    use chrono::Utc;

    #[tokio::test]
    async fn round_trips_findings() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledFindingsPersistence::open(dir.path()).unwrap();
        let mut findings = HashMap::new();
        let f = Finding::new("node/1", Category::Performance, "cpu-high", Severity::Warning, Utc::now());
        findings.insert(f.id, f);
        store.save_findings(&findings).await.unwrap();
        let loaded = store.load_findings().await.unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn last_completed_run_at_skips_incomplete_records_and_picks_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledFindingsPersistence::open(dir.path()).unwrap();
        assert!(store.last_completed_run_at().await.unwrap().is_none());

        let started = Utc::now() - chrono::Duration::minutes(30);
        let mut older = PatrolRunRecord::new("run-1", crate::types::RunType::Patrol, "scheduled", started);
        let older_completed = started + chrono::Duration::seconds(5);
        older.complete(older_completed);
        store.append_run_record(&older).await.unwrap();

        let mut in_progress = PatrolRunRecord::new("run-2", crate::types::RunType::Patrol, "scheduled", Utc::now());
        in_progress.completed_at = None;
        store.append_run_record(&in_progress).await.unwrap();

        let last = store.last_completed_run_at().await.unwrap();
        assert_eq!(last, Some(older_completed));
    }

    #[tokio::test]
    async fn evicts_oldest_run_record_past_retention_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledFindingsPersistence::open(dir.path()).unwrap();
        for i in 0..(MAX_RETAINED_RUN_RECORDS + 5) {
            let started = Utc::now() + chrono::Duration::milliseconds(i as i64);
            let record = PatrolRunRecord::new(format!("run-{i}"), crate::types::RunType::Patrol, "scheduled", started);
            store.append_run_record(&record).await.unwrap();
        }
        let tree = store.run_records_tree().unwrap();
        assert!(tree.len() <= MAX_RETAINED_RUN_RECORDS + 1);
    }
}
