//! Core data model for the catalog synchronization pipeline.
//!
//! The source system kept the run record as an ad-hoc JSON map. Here the
//! canonical 13-step pipeline, its per-step state machine, and the lock and
//! event records are all typed sum types, so that an invalid step status or
//! a mismatched `current_step` is a compile error in application code and a
//! deserialize error at the storage boundary, never a silent `undefined`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use conveyor_retry::RetryRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CURRENT_RUN_SCHEMA_VERSION: &str = "conveyor.run.v1";
pub const MINIMUM_SUPPORTED_RUN_SCHEMA_VERSION: &str = "conveyor.run.v1";

/// The canonical, totally ordered list of pipeline steps.
pub const CANONICAL_STEPS: [StepName; 13] = [
    StepName::ImportFtp,
    StepName::ParseMerge,
    StepName::EanMapping,
    StepName::Pricing,
    StepName::OverrideProducts,
    StepName::ExportEan,
    StepName::ExportEanXlsx,
    StepName::ExportAmazon,
    StepName::ExportMediaworld,
    StepName::ExportEprice,
    StepName::UploadSftp,
    StepName::Versioning,
    StepName::Notification,
];

/// Warning messages the completeness gate never counts toward `warning_count`.
pub const WARNING_WHITELIST: &[&str] = &[
    "orchestrator_yield_scheduled",
    "drain_loop_incomplete",
    "step_retry_scheduled",
    "resume_failed_http",
    "lock_ownership_lost",
    "yielded_locked",
    "multiple_running_detected",
    "cron_auth_failed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    ImportFtp,
    ParseMerge,
    EanMapping,
    Pricing,
    OverrideProducts,
    ExportEan,
    ExportEanXlsx,
    ExportAmazon,
    ExportMediaworld,
    ExportEprice,
    UploadSftp,
    Versioning,
    Notification,
}

impl StepName {
    /// Index of this step in [`CANONICAL_STEPS`], used to compute "from
    /// `current_step` onward" iteration in the tick loop.
    pub fn position(self) -> usize {
        CANONICAL_STEPS.iter().position(|s| *s == self).expect("exhaustive enum")
    }

    pub fn next(self) -> Option<StepName> {
        CANONICAL_STEPS.get(self.position() + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::ImportFtp => "import_ftp",
            StepName::ParseMerge => "parse_merge",
            StepName::EanMapping => "ean_mapping",
            StepName::Pricing => "pricing",
            StepName::OverrideProducts => "override_products",
            StepName::ExportEan => "export_ean",
            StepName::ExportEanXlsx => "export_ean_xlsx",
            StepName::ExportAmazon => "export_amazon",
            StepName::ExportMediaworld => "export_mediaworld",
            StepName::ExportEprice => "export_eprice",
            StepName::UploadSftp => "upload_sftp",
            StepName::Versioning => "versioning",
            StepName::Notification => "notification",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-phases of the `parse_merge` step. Every other step only ever
/// occupies [`StepStatus::Pending`], [`StepStatus::InProgress`] (with no
/// sub-phase distinction), [`StepStatus::Completed`] or [`StepStatus::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMergeSubPhase {
    BuildingStockIndex,
    BuildingPriceIndex,
    PreparingMaterial,
    InProgress,
    Finalizing,
}

/// The material body fetch strategy decided during `preparing_material`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    Range,
    ChunkFiles,
}

/// Row-skip counters accumulated during `parse_merge` body processing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCounts {
    #[serde(default)]
    pub no_stock: u64,
    #[serde(default)]
    pub no_price: u64,
    #[serde(default)]
    pub low_stock: u64,
    #[serde(default)]
    pub no_valid: u64,
}

impl SkippedCounts {
    pub fn total(&self) -> u64 {
        self.no_stock + self.no_price + self.low_stock + self.no_valid
    }
}

/// Private, step-specific payload for `parse_merge`'s `in_progress`/`finalizing`
/// sub-phases. Opaque to the orchestrator; read and written only by the step
/// runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseMergeState {
    pub sub_phase: ParseMergeSubPhase,
    #[serde(default)]
    pub cursor_pos: u64,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default)]
    pub partial_line: String,
    pub mode: Option<FetchMode>,
    #[serde(default)]
    pub finalize_chunk_idx: u32,
    pub material_bytes: Option<u64>,
    #[serde(default)]
    pub product_count: u64,
    #[serde(default)]
    pub skipped: SkippedCounts,
    pub material_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub header_end_pos: Option<u64>,
    pub delimiter: Option<char>,
}

impl Default for ParseMergeState {
    fn default() -> Self {
        Self {
            sub_phase: ParseMergeSubPhase::BuildingStockIndex,
            cursor_pos: 0,
            chunk_index: 0,
            partial_line: String::new(),
            mode: None,
            finalize_chunk_idx: 0,
            material_bytes: None,
            product_count: 0,
            skipped: SkippedCounts::default(),
            material_path: None,
            started_at: None,
            header_end_pos: None,
            delimiter: None,
        }
    }
}

/// The per-step state machine: a typed sum type replacing
/// the source's ad-hoc JSON map. `retry` is cleared (set to `None`) on any
/// transition away from `RetryDelay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepState {
    Pending,
    InProgress {
        #[serde(default)]
        inner: Option<ParseMergeState>,
    },
    RetryDelay {
        retry: RetryRecord,
        /// Whatever `parse_merge` progress was already persisted before the
        /// fault that triggered this retry; `None` for every other step.
        /// Carried so a resumed tick picks up `cursor_pos` where it left
        /// off instead of restarting the sub-phase machine from scratch.
        #[serde(default)]
        inner: Option<ParseMergeState>,
    },
    Completed,
    Failed {
        reason: String,
    },
}

impl StepState {
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, StepState::Completed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Completed | StepState::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    SuccessWithWarning,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Cron,
}

/// The persisted run record, keyed externally by `run_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub run_id: Uuid,
    pub status: RunStatus,
    pub trigger_type: TriggerType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub runtime_ms: Option<u64>,
    pub current_step: Option<StepName>,
    pub steps: BTreeMap<StepName, StepState>,
    #[serde(default)]
    pub metrics: BTreeMap<String, u64>,
    #[serde(default)]
    pub location_warnings: BTreeMap<String, u64>,
    #[serde(default)]
    pub warning_count: u32,
    #[serde(default)]
    pub file_manifest: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub cancelled_by_user: bool,
    pub error_message: Option<String>,
}

fn default_schema_version() -> String {
    CURRENT_RUN_SCHEMA_VERSION.to_string()
}

impl RunRecord {
    pub fn new(run_id: Uuid, trigger_type: TriggerType, started_at: DateTime<Utc>) -> Self {
        let mut steps = BTreeMap::new();
        for step in CANONICAL_STEPS {
            steps.insert(step, StepState::Pending);
        }
        Self {
            schema_version: CURRENT_RUN_SCHEMA_VERSION.to_string(),
            run_id,
            status: RunStatus::Running,
            trigger_type,
            started_at,
            finished_at: None,
            runtime_ms: None,
            current_step: Some(StepName::ImportFtp),
            steps,
            metrics: BTreeMap::new(),
            location_warnings: BTreeMap::new(),
            warning_count: 0,
            file_manifest: BTreeMap::new(),
            cancel_requested: false,
            cancelled_by_user: false,
            error_message: None,
        }
    }

    /// Asserts that if `current_step` is set, its entry exists in `steps`.
    pub fn assert_current_step_consistent(&self) -> Result<(), String> {
        if let Some(step) = self.current_step {
            if !self.steps.contains_key(&step) {
                return Err(format!("current_step {step} missing from steps map"));
            }
        }
        Ok(())
    }

    /// The completeness gate: a run is terminally successful only if every
    /// canonical step reached `Completed`.
    pub fn all_steps_completed(&self) -> bool {
        CANONICAL_STEPS
            .iter()
            .all(|s| matches!(self.steps.get(s), Some(StepState::Completed)))
    }
}

/// Lock record. Ownership is the pair `(run_id, invocation_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub run_id: Uuid,
    pub invocation_id: Uuid,
    pub lease_until: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// A single append-only event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub run_id: Uuid,
    pub level: EventLevel,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// The orchestrator HTTP surface's response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStatus {
    Completed,
    FailedDefinitive,
    Yielded,
    RetryDelay,
    AlreadyFinished,
    YieldedLocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickResponse {
    pub status: TickStatus,
    pub run_id: Uuid,
    pub current_step: Option<StepName>,
    pub needs_resume: bool,
    pub wait_seconds: Option<u64>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Error classification, mirrored from the retry/permanent/ambiguous
/// split used throughout the orchestrator's outcome dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Permanent,
    Ambiguous,
}

/// Result of `normalizeEAN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEan {
    pub ok: bool,
    pub value: Option<String>,
    pub reason: Option<String>,
}

/// Stock location bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockSource {
    It,
    EuFallback,
}

/// Result of `resolveMarketplaceStock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceStockResolution {
    pub qty: i64,
    pub source: StockSource,
    pub should_export: bool,
    pub lead_days: u32,
}
