//! Persistent run-record store.
//!
//! The source system mutates an ad-hoc JSON document through generic
//! merge-patch RPCs, with `{k: null}` meaning "delete key `k`". Here the run
//! record is a typed [`conveyor_types::RunRecord`], so the deep-merge
//! contract is realized differently: moving a step to a new
//! [`conveyor_types::StepState`] variant *is* the merge-with-deletion, since
//! each variant only carries the fields that make sense for it (`Completed`
//! has no `retry` field to accidentally retain, `Failed` has no leftover
//! `ParseMergeState`). Application code is still forbidden from
//! read-modify-writing the whole record field by field — every mutation
//! goes through one of the methods below, each of which loads, patches
//! exactly one thing, and atomically rewrites the whole file.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use conveyor_retry::RetryRecord;
use conveyor_types::{
    CURRENT_RUN_SCHEMA_VERSION, MINIMUM_SUPPORTED_RUN_SCHEMA_VERSION, ParseMergeState, RunRecord, StepName,
    StepState,
};
use thiserror::Error;
use uuid::Uuid;

pub const RUN_FILE: &str = "run.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("run {0} not found")]
    NotFound(Uuid),
    #[error("unsupported run schema version {found}; minimum supported is {minimum}")]
    UnsupportedSchemaVersion { found: String, minimum: String },
    #[error("current_step invariant violated: {0}")]
    InvariantViolated(String),
}

pub fn run_dir(root: &Path, run_id: Uuid) -> PathBuf {
    root.join(run_id.to_string())
}

pub fn run_path(root: &Path, run_id: Uuid) -> PathBuf {
    run_dir(root, run_id).join(RUN_FILE)
}

/// Validate that a loaded record's schema version is one this build
/// understands. There is only one generation today (`conveyor.run.v1`);
/// the check exists so that a future `v2` migration has a single,
/// already-tested call site.
pub fn validate_schema_version(version: &str) -> Result<(), StoreError> {
    if version == CURRENT_RUN_SCHEMA_VERSION || version == MINIMUM_SUPPORTED_RUN_SCHEMA_VERSION {
        Ok(())
    } else {
        Err(StoreError::UnsupportedSchemaVersion {
            found: version.to_string(),
            minimum: MINIMUM_SUPPORTED_RUN_SCHEMA_VERSION.to_string(),
        })
    }
}

/// Filesystem-backed run record store. One JSON file per run, rewritten
/// atomically (tmp file + `fsync` + rename) on every mutation.
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn atomic_write(&self, path: &Path, record: &RunRecord) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(path, e))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;
        {
            let mut f = File::create(&tmp_path).map_err(|e| self.io_err(&tmp_path, e))?;
            f.write_all(json.as_bytes()).map_err(|e| self.io_err(&tmp_path, e))?;
            f.sync_all().map_err(|e| self.io_err(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, path).map_err(|e| self.io_err(path, e))?;
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    pub fn exists(&self, run_id: Uuid) -> bool {
        run_path(&self.root, run_id).exists()
    }

    pub fn load(&self, run_id: Uuid) -> Result<RunRecord, StoreError> {
        let path = run_path(&self.root, run_id);
        let data = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::Io {
                    path: path.clone(),
                    source: e,
                }
            } else {
                self.io_err(&path, e)
            }
        })?;
        let record: RunRecord = serde_json::from_str(&data)?;
        validate_schema_version(&record.schema_version)?;
        Ok(record)
    }

    pub fn try_load(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        if !self.exists(run_id) {
            return Ok(None);
        }
        self.load(run_id).map(Some)
    }

    /// Create and persist a brand-new run record. Fails if one already exists.
    pub fn create(&self, record: &RunRecord) -> Result<(), StoreError> {
        let path = run_path(&self.root, record.run_id);
        self.atomic_write(&path, record)
    }

    /// Unconditionally overwrite the full record. Used for bulk updates
    /// (metrics, warning_count, finalization) that touch more than one
    /// field at once; every call site still goes through this single
    /// chokepoint rather than a bespoke writer.
    pub fn save(&self, record: &RunRecord) -> Result<(), StoreError> {
        record
            .assert_current_step_consistent()
            .map_err(StoreError::InvariantViolated)?;
        let path = run_path(&self.root, record.run_id);
        self.atomic_write(&path, record)
    }

    /// `set_step_in_progress(run_id, step)`: idempotently sets
    /// `current_step = step` and merges `{status: in_progress}` into
    /// `steps[step]`, preserving any existing `ParseMergeState` inner
    /// payload so a step already mid-chunk does not lose its cursor.
    pub fn set_step_in_progress(&self, run_id: Uuid, step: StepName) -> Result<RunRecord, StoreError> {
        let mut record = self.load(run_id)?;
        let inner = match record.steps.get(&step) {
            Some(StepState::InProgress { inner }) => inner.clone(),
            Some(StepState::RetryDelay { inner, .. }) => inner.clone(),
            _ => None,
        };
        record.steps.insert(step, StepState::InProgress { inner });
        record.current_step = Some(step);
        record.assert_current_step_consistent().map_err(StoreError::InvariantViolated)?;
        self.save(&record)?;
        Ok(record)
    }

    /// `merge_sync_run_step` specialization for `parse_merge`'s chunked
    /// body: replace the whole inner payload (the step runner always
    /// recomputes it wholesale each tick from the previous inner plus the
    /// newly fetched bytes, so there is nothing partial to deep-merge here).
    pub fn merge_parse_merge_inner(&self, run_id: Uuid, inner: ParseMergeState) -> Result<(), StoreError> {
        let mut record = self.load(run_id)?;
        record.steps.insert(StepName::ParseMerge, StepState::InProgress { inner: Some(inner) });
        self.save(&record)
    }

    /// Mark a step completed, clearing any `retry` sub-key by construction
    /// (the `Completed` variant has no such field).
    pub fn complete_step(&self, run_id: Uuid, step: StepName) -> Result<RunRecord, StoreError> {
        let mut record = self.load(run_id)?;
        record.steps.insert(step, StepState::Completed);
        if let Some(next) = step.next() {
            record.current_step = Some(next);
        }
        self.save(&record)?;
        Ok(record)
    }

    /// Mark a step definitively failed.
    pub fn fail_step(&self, run_id: Uuid, step: StepName, reason: impl Into<String>) -> Result<RunRecord, StoreError> {
        let mut record = self.load(run_id)?;
        record.steps.insert(step, StepState::Failed { reason: reason.into() });
        self.save(&record)?;
        Ok(record)
    }

    /// Schedule a `WORKER_LIMIT` retry, carrying forward whatever
    /// `parse_merge` progress was already persisted for this step so the
    /// resumed tick doesn't restart the sub-phase machine from scratch.
    pub fn schedule_retry(&self, run_id: Uuid, step: StepName, retry: RetryRecord) -> Result<RunRecord, StoreError> {
        let mut record = self.load(run_id)?;
        let inner = match record.steps.get(&step) {
            Some(StepState::InProgress { inner }) => inner.clone(),
            _ => None,
        };
        record.steps.insert(step, StepState::RetryDelay { retry, inner });
        self.save(&record)?;
        Ok(record)
    }

    /// Finalize the run's terminal status, recomputing `runtime_ms` and
    /// stamping `finished_at`. Caller has already decided `status` and
    /// `warning_count`.
    pub fn finalize(
        &self,
        run_id: Uuid,
        status: conveyor_types::RunStatus,
        warning_count: u32,
        error_message: Option<String>,
    ) -> Result<RunRecord, StoreError> {
        let mut record = self.load(run_id)?;
        let now = Utc::now();
        record.status = status;
        record.warning_count = warning_count;
        record.error_message = error_message;
        record.finished_at = Some(now);
        record.runtime_ms = Some((now - record.started_at).num_milliseconds().max(0) as u64);
        self.save(&record)?;
        Ok(record)
    }

    pub fn clear(&self, run_id: Uuid) -> Result<(), StoreError> {
        let dir = run_dir(&self.root, run_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| self.io_err(&dir, e))?;
        }
        Ok(())
    }

    /// List all run ids with a persisted record, used by the tick scheduler
    /// to find "the most recent running run".
    pub fn list_run_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| self.io_err(&self.root, e))? {
            let entry = entry.map_err(|e| self.io_err(&self.root, e))?;
            if let Ok(id) = entry.file_name().to_string_lossy().parse::<Uuid>() {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Fold freshly-published file timestamps into `file_manifest`. The
    /// step runner computes the per-file timestamps and hands them to the
    /// orchestrator rather than writing `RunRecord` directly, keeping this
    /// the one chokepoint for the field.
    pub fn update_file_manifest(
        &self,
        run_id: Uuid,
        entries: BTreeMap<String, DateTime<Utc>>,
    ) -> Result<RunRecord, StoreError> {
        let mut record = self.load(run_id)?;
        record.file_manifest.extend(entries);
        self.save(&record)?;
        Ok(record)
    }

    /// Fold `parse_merge` row counters into `metrics` once the step completes
    /// (`product_count`, `skipped_no_stock`, ...). Additive: a resumed run
    /// that re-completes `parse_merge` never happens (steps are idempotent
    /// once `completed`), so overwrite rather than accumulate.
    pub fn update_metrics(&self, run_id: Uuid, metrics: BTreeMap<String, u64>) -> Result<RunRecord, StoreError> {
        let mut record = self.load(run_id)?;
        record.metrics.extend(metrics);
        self.save(&record)?;
        Ok(record)
    }

    /// Fold stock-location ingest warnings (`orphan_4255` counts per Matnr
    /// bucket) into `location_warnings`.
    pub fn update_location_warnings(&self, run_id: Uuid, warnings: BTreeMap<String, u64>) -> Result<RunRecord, StoreError> {
        let mut record = self.load(run_id)?;
        record.location_warnings.extend(warnings);
        self.save(&record)?;
        Ok(record)
    }

    /// Mark a run for cooperative cancellation.
    /// Checked by the orchestrator at the next step boundary, never
    /// mid-sub-call.
    pub fn request_cancel(&self, run_id: Uuid) -> Result<RunRecord, StoreError> {
        let mut record = self.load(run_id)?;
        record.cancel_requested = true;
        self.save(&record)?;
        Ok(record)
    }

    /// Stamp `cancelled_by_user` ahead of finalizing a cooperatively
    /// cancelled run as `Failed` (the run's terminal status stays in the
    /// `{success, success_with_warning, failed}` family; this flag is the
    /// only thing that distinguishes "failed because cancelled" from any
    /// other failure).
    pub fn mark_cancelled_by_user(&self, run_id: Uuid) -> Result<RunRecord, StoreError> {
        let mut record = self.load(run_id)?;
        record.cancelled_by_user = true;
        self.save(&record)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_types::{ParseMergeSubPhase, RunStatus, TriggerType};
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, RunStore) {
        let td = tempdir().unwrap();
        let store = RunStore::new(td.path());
        (td, store)
    }

    #[test]
    fn create_then_load_round_trips() {
        let (_td, store) = store();
        let run_id = Uuid::new_v4();
        let record = RunRecord::new(run_id, TriggerType::Manual, Utc::now());
        store.create(&record).unwrap();

        let loaded = store.load(run_id).unwrap();
        assert_eq!(loaded.run_id, run_id);
        assert_eq!(loaded.current_step, Some(StepName::ImportFtp));
    }

    #[test]
    fn load_missing_run_errors() {
        let (_td, store) = store();
        assert!(store.load(Uuid::new_v4()).is_err());
    }

    #[test]
    fn set_step_in_progress_preserves_existing_parse_merge_inner() {
        let (_td, store) = store();
        let run_id = Uuid::new_v4();
        let record = RunRecord::new(run_id, TriggerType::Manual, Utc::now());
        store.create(&record).unwrap();

        let inner = ParseMergeState {
            sub_phase: ParseMergeSubPhase::InProgress,
            cursor_pos: 4096,
            ..ParseMergeState::default()
        };
        store.merge_parse_merge_inner(run_id, inner.clone()).unwrap();

        let updated = store.set_step_in_progress(run_id, StepName::ParseMerge).unwrap();
        match updated.steps.get(&StepName::ParseMerge) {
            Some(StepState::InProgress { inner: Some(i) }) => assert_eq!(i.cursor_pos, 4096),
            other => panic!("expected preserved inner, got {other:?}"),
        }
    }

    #[test]
    fn complete_step_advances_current_step_and_clears_retry() {
        let (_td, store) = store();
        let run_id = Uuid::new_v4();
        let record = RunRecord::new(run_id, TriggerType::Manual, Utc::now());
        store.create(&record).unwrap();

        let retry = RetryRecord {
            retry_attempt: 1,
            next_retry_at: Utc::now(),
            last_http_status: 546,
            last_error: "worker_limit_546".into(),
        };
        store.schedule_retry(run_id, StepName::ImportFtp, retry).unwrap();
        let updated = store.complete_step(run_id, StepName::ImportFtp).unwrap();

        assert_eq!(updated.steps.get(&StepName::ImportFtp), Some(&StepState::Completed));
        assert_eq!(updated.current_step, Some(StepName::ParseMerge));
    }

    #[test]
    fn finalize_computes_runtime_and_sets_terminal_status() {
        let (_td, store) = store();
        let run_id = Uuid::new_v4();
        let started = Utc::now() - chrono::Duration::seconds(5);
        let mut record = RunRecord::new(run_id, TriggerType::Manual, started);
        for step in conveyor_types::CANONICAL_STEPS {
            record.steps.insert(step, StepState::Completed);
        }
        store.create(&record).unwrap();

        let finalized = store.finalize(run_id, RunStatus::Success, 0, None).unwrap();
        assert_eq!(finalized.status, RunStatus::Success);
        assert!(finalized.finished_at.is_some());
        assert!(finalized.runtime_ms.unwrap() >= 5000);
    }

    #[test]
    fn clear_removes_run_directory() {
        let (_td, store) = store();
        let run_id = Uuid::new_v4();
        let record = RunRecord::new(run_id, TriggerType::Manual, Utc::now());
        store.create(&record).unwrap();
        assert!(store.exists(run_id));
        store.clear(run_id).unwrap();
        assert!(!store.exists(run_id));
    }

    #[test]
    fn list_run_ids_returns_every_created_run() {
        let (_td, store) = store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.create(&RunRecord::new(a, TriggerType::Manual, Utc::now())).unwrap();
        store.create(&RunRecord::new(b, TriggerType::Cron, Utc::now())).unwrap();

        let mut ids = store.list_run_ids().unwrap();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn validate_schema_version_rejects_unknown_generation() {
        assert!(validate_schema_version("conveyor.run.v1").is_ok());
        assert!(validate_schema_version("conveyor.run.v99").is_err());
    }

    #[test]
    fn update_file_manifest_merges_without_dropping_other_entries() {
        let (_td, store) = store();
        let run_id = Uuid::new_v4();
        store.create(&RunRecord::new(run_id, TriggerType::Manual, Utc::now())).unwrap();

        let mut first = BTreeMap::new();
        first.insert("outputs/latest/Catalogo EAN.xlsx".to_string(), Utc::now());
        store.update_file_manifest(run_id, first).unwrap();

        let mut second = BTreeMap::new();
        second.insert("outputs/latest/amazon_listing_loader.xlsm".to_string(), Utc::now());
        let updated = store.update_file_manifest(run_id, second).unwrap();

        assert_eq!(updated.file_manifest.len(), 2);
    }

    #[test]
    fn update_metrics_merges_counters() {
        let (_td, store) = store();
        let run_id = Uuid::new_v4();
        store.create(&RunRecord::new(run_id, TriggerType::Manual, Utc::now())).unwrap();

        let mut metrics = BTreeMap::new();
        metrics.insert("product_count".to_string(), 3);
        let updated = store.update_metrics(run_id, metrics).unwrap();

        assert_eq!(updated.metrics.get("product_count"), Some(&3));
    }

    #[test]
    fn request_cancel_sets_flag() {
        let (_td, store) = store();
        let run_id = Uuid::new_v4();
        store.create(&RunRecord::new(run_id, TriggerType::Manual, Utc::now())).unwrap();

        let updated = store.request_cancel(run_id).unwrap();
        assert!(updated.cancel_requested);
    }
}
