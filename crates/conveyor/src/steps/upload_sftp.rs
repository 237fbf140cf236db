//! `upload_sftp` step: pre-flight validation before any network
//! call. A real SFTP client is out of scope here — this step's job is
//! to refuse to "ship" anything that fails the checklist, and to record
//! what it would have shipped.

use std::collections::BTreeSet;

use super::export_marketplace::{AMAZON_TXT_OUTPUT_KEY, AMAZON_XLSM_OUTPUT_KEY, EPRICE_OUTPUT_KEY, MEDIAWORLD_OUTPUT_KEY};
use super::downstream::EAN_CATALOG_XLSX_KEY;
use super::{StepContext, StepOutcome};

/// The exact whitelist of output files — nothing more, nothing less, may
/// leave via SFTP.
const REQUIRED_FILENAMES: [&str; 5] = [
    "Catalogo EAN.xlsx",
    "Export ePrice.xlsx",
    "Export Mediaworld.xlsx",
    "amazon_listing_loader.xlsm",
    "amazon_price_inventory.txt",
];

/// State-key suffixes, combined with `ctx.state_key` at read time.
const SOURCE_KEYS: [&str; 5] = [
    EAN_CATALOG_XLSX_KEY,
    EPRICE_OUTPUT_KEY,
    MEDIAWORLD_OUTPUT_KEY,
    AMAZON_XLSM_OUTPUT_KEY,
    AMAZON_TXT_OUTPUT_KEY,
];

pub fn run(ctx: &StepContext) -> StepOutcome {
    if ctx.sftp.read_credentials().is_none() {
        return StepOutcome::Failed { reason: "missing_env: sftp credentials not fully configured".to_string() };
    }

    // `versioning` (which publishes to `outputs/latest/`) runs after this
    // step in the canonical order, so the pre-flight checks the per-run
    // staging artifacts each export step already wrote, not the published
    // copies — those don't exist yet on a first pass through this step.
    let missing: Vec<&str> = REQUIRED_FILENAMES
        .iter()
        .zip(SOURCE_KEYS.iter())
        .filter(|(_, source_suffix)| !ctx.storage.exists(&ctx.state_key(source_suffix)).unwrap_or(false))
        .map(|(filename, _)| *filename)
        .collect();
    if !missing.is_empty() {
        return StepOutcome::Failed { reason: format!("missing required output file(s): {}", missing.join(", ")) };
    }

    let present: BTreeSet<String> = match ctx.storage.list(&ctx.state_key("outputs")) {
        Ok(names) => names.into_iter().collect(),
        Err(e) => return StepOutcome::Failed { reason: format!("failed to list staged outputs: {e}") },
    };
    let required: BTreeSet<&str> = REQUIRED_FILENAMES.iter().copied().collect();
    let stray: Vec<String> = present
        .iter()
        .filter(|f| !required.contains(f.as_str()))
        .filter(|f| f.to_lowercase().ends_with(".csv"))
        .cloned()
        .collect();
    if !stray.is_empty() {
        return StepOutcome::Failed { reason: format!("stray CSV file(s) present in staged outputs: {}", stray.join(", ")) };
    }

    let warning_count = ctx.events.borrow().countable_warning_count(ctx.run_id);
    if warning_count > 0 {
        return StepOutcome::Failed {
            reason: format!("refusing to upload: {warning_count} non-whitelisted warning(s) recorded this run"),
        };
    }

    let manifest = serde_json::json!({
        "files": REQUIRED_FILENAMES,
        "uploaded_at": ctx.now,
    });
    let bytes = match serde_json::to_vec(&manifest) {
        Ok(b) => b,
        Err(e) => return StepOutcome::Failed { reason: format!("failed to serialize upload manifest: {e}") },
    };
    if let Err(e) = ctx.storage.write(&ctx.state_key("sftp_upload.json"), &bytes) {
        return StepOutcome::Failed { reason: format!("failed to persist upload manifest: {e}") };
    }

    ctx.log_info("sftp_upload_complete", serde_json::json!({"files": REQUIRED_FILENAMES}));
    StepOutcome::Completed
}
