//! Step runner dispatch. One function per canonical step;
//! the orchestrator tick loop owns retry/yield classification, these
//! functions only ever report what happened on this one call.

mod downstream;
mod export_marketplace;
mod parse_merge;
mod upload_sftp;
mod versioning;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use conveyor_config::{ConveyorConfig, SftpEnvConfig};
use conveyor_events::EventLog;
use conveyor_storage::{HttpRangeFetcher, StorageBackend};
use conveyor_types::{ParseMergeState, StepName};
use conveyor_webhook::{Notifier, RunSummary};

use crate::sources::FeedSource;

/// Per-step wall-clock guardrail inside `parse_merge`'s `in_progress` and
/// `finalizing` sub-phases. Distinct from the
/// invocation-level budget: a single chunk fetch or finalize append must
/// yield well before the orchestrator's own 25s/50s budget expires, leaving
/// room to persist state and return cleanly.
pub const SUB_PHASE_TIME_BUDGET_MS: u64 = 8_000;

pub const MAX_TOTAL_CHUNKS: u32 = 50;
pub const MAX_FETCH_BYTES: u64 = 2 * 1024 * 1024;
pub const MAX_PARTIAL_LINE_BYTES: usize = 256 * 1024;
pub const MAX_TOTAL_SIZE_BYTES: u64 = 40 * 1024 * 1024;

/// Everything a step runner needs, bundled once per tick by the orchestrator.
pub struct StepContext<'a> {
    pub run_id: Uuid,
    pub storage: &'a dyn StorageBackend,
    pub fetcher: &'a HttpRangeFetcher,
    pub feeds: &'a dyn FeedSource,
    pub notifier: &'a dyn Notifier,
    pub sftp: &'a SftpEnvConfig,
    pub config: &'a ConveyorConfig,
    pub now: DateTime<Utc>,
    /// Wall-clock deadline for this invocation's whole tick, not just this
    /// step.
    pub invocation_deadline: Instant,
    pub events: RefCell<&'a mut EventLog>,
}

impl<'a> StepContext<'a> {
    pub fn time_remaining_ms(&self) -> u64 {
        self.invocation_deadline.saturating_duration_since(Instant::now()).as_millis() as u64
    }

    fn state_key(&self, suffix: &str) -> String {
        format!("state/{}/{}", self.run_id, suffix)
    }

    pub fn log_info(&self, message: impl Into<String>, details: serde_json::Value) {
        self.events.borrow_mut().info(self.run_id, message, details);
    }

    pub fn log_warn(&self, message: impl Into<String>, details: serde_json::Value) {
        self.events.borrow_mut().warn(self.run_id, message, details);
    }

    pub fn log_error(&self, message: impl Into<String>, details: serde_json::Value) {
        self.events.borrow_mut().error(self.run_id, message, details);
    }
}

/// Outcome of a single step-runner invocation, before the orchestrator's
/// tick loop classifies it into a `StepState` transition.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed,
    /// `parse_merge` finalized: `products_total` plus the per-reason skip
    /// counters, merged onto the run record's `metrics` map.
    CompletedWithMetrics(BTreeMap<String, u64>),
    /// `versioning` published its whitelisted artifacts: output filename ->
    /// version timestamp, merged onto the run record's `file_manifest` map.
    CompletedWithFileManifest(BTreeMap<String, DateTime<Utc>>),
    /// `import_ftp` built a location index: named warning counters, merged
    /// onto the run record's `location_warnings` map.
    CompletedWithLocationWarnings(BTreeMap<String, u64>),
    InProgress { inner: Option<ParseMergeState> },
    WorkerLimit { http_status: u16, message: String },
    Failed { reason: String },
}

/// Dispatch one canonical step for one tick. `prior_inner` is `steps[step].status == in_progress`'s
/// carried `ParseMergeState`, if any — only ever populated for `parse_merge`.
pub fn run_step(step: StepName, ctx: &StepContext, prior_inner: Option<ParseMergeState>) -> StepOutcome {
    match step {
        StepName::ImportFtp => downstream::run_import_ftp(ctx),
        StepName::ParseMerge => parse_merge::run(ctx, prior_inner),
        StepName::EanMapping => downstream::run_ean_mapping(ctx),
        StepName::Pricing => downstream::run_pricing(ctx),
        StepName::OverrideProducts => downstream::run_override_products(ctx),
        StepName::ExportEan => downstream::run_export_ean(ctx),
        StepName::ExportEanXlsx => downstream::run_export_ean_xlsx(ctx),
        StepName::ExportAmazon => export_marketplace::run_amazon(ctx),
        StepName::ExportMediaworld => export_marketplace::run_mediaworld(ctx),
        StepName::ExportEprice => export_marketplace::run_eprice(ctx),
        StepName::UploadSftp => upload_sftp::run(ctx),
        StepName::Versioning => versioning::run(ctx),
        StepName::Notification => run_notification(ctx),
    }
}

/// One notification per run; a delivery failure here fails the step.
fn run_notification(ctx: &StepContext) -> StepOutcome {
    let key = ctx.state_key("run_summary.json");
    let summary: RunSummary = match ctx.storage.read(&key) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => return StepOutcome::Failed { reason: format!("corrupt run_summary.json: {e}") },
        },
        Err(_) => {
            return StepOutcome::Failed { reason: "run_summary.json missing; cannot notify".to_string() };
        }
    };

    match ctx.notifier.notify(&summary) {
        Ok(()) => StepOutcome::Completed,
        Err(e) => StepOutcome::Failed { reason: format!("notification_failed: {e}") },
    }
}
