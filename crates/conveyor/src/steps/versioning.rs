//! `versioning` step: copy the five whitelisted output artifacts into
//! `outputs/latest/` and a timestamped `outputs/versions/{ts}/` snapshot,
//! then enforce retention — keep the 3 newest versions of each file, and
//! only delete an older one once it is also more than 7 days past its
//! version timestamp.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::export_marketplace::{AMAZON_TXT_OUTPUT_KEY, AMAZON_XLSM_OUTPUT_KEY, EPRICE_OUTPUT_KEY, MEDIAWORLD_OUTPUT_KEY};
use super::downstream::EAN_CATALOG_XLSX_KEY;
use super::{StepContext, StepOutcome};

const RETENTION_KEEP_NEWEST: usize = 3;
const RETENTION_MAX_AGE_DAYS: i64 = 7;
const RETENTION_BATCH_SIZE: usize = 20;

/// State-key suffix -> whitelisted output filename. Suffixes are combined with `ctx.state_key` at read time.
const OUTPUT_ARTIFACTS: [(&str, &str); 5] = [
    (EAN_CATALOG_XLSX_KEY, "Catalogo EAN.xlsx"),
    (EPRICE_OUTPUT_KEY, "Export ePrice.xlsx"),
    (MEDIAWORLD_OUTPUT_KEY, "Export Mediaworld.xlsx"),
    (AMAZON_XLSM_OUTPUT_KEY, "amazon_listing_loader.xlsm"),
    (AMAZON_TXT_OUTPUT_KEY, "amazon_price_inventory.txt"),
];

fn version_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

pub fn run(ctx: &StepContext) -> StepOutcome {
    let ts = version_timestamp(ctx.now);
    let mut manifest: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();

    for (source_suffix, filename) in OUTPUT_ARTIFACTS {
        let bytes = match ctx.storage.read(&ctx.state_key(source_suffix)) {
            Ok(b) => b,
            Err(_) => continue, // step not run this pipeline, nothing to version.
        };

        let latest_key = format!("outputs/latest/{filename}");
        if let Err(e) = ctx.storage.write(&latest_key, &bytes) {
            return StepOutcome::Failed { reason: format!("failed to write {latest_key}: {e}") };
        }

        let versioned_key = format!("outputs/versions/{ts}/{filename}");
        if let Err(e) = ctx.storage.write(&versioned_key, &bytes) {
            return StepOutcome::Failed { reason: format!("failed to write {versioned_key}: {e}") };
        }

        manifest.insert(filename.to_string(), ctx.now);
    }

    if let Err(reason) = stage_manifest(ctx, &manifest) {
        return StepOutcome::Failed { reason };
    }

    if let Err(reason) = enforce_retention(ctx) {
        // Retention failures are not fatal to the run: the freshly-written
        // latest/ and versioned copies are already durable. Surface as a
        // warning so operators notice housekeeping is falling behind.
        ctx.log_warn("version_retention_failed", serde_json::json!({"reason": reason}));
    }

    StepOutcome::CompletedWithFileManifest(manifest)
}

fn stage_manifest(ctx: &StepContext, manifest: &BTreeMap<String, DateTime<Utc>>) -> Result<(), String> {
    let bytes = serde_json::to_vec(manifest).map_err(|e| format!("failed to serialize file manifest: {e}"))?;
    ctx.storage
        .write(&ctx.state_key("file_manifest.json"), &bytes)
        .map_err(|e| format!("failed to stage file manifest: {e}"))
}

/// Keep the newest [`RETENTION_KEEP_NEWEST`] versions of each file
/// regardless of age; among the rest, delete only those whose version
/// timestamp is also more than [`RETENTION_MAX_AGE_DAYS`] old. Deletes are
/// issued in batches of [`RETENTION_BATCH_SIZE`] to bound per-tick I/O.
fn enforce_retention(ctx: &StepContext) -> Result<(), String> {
    let version_dirs = ctx.storage.list("outputs/versions").map_err(|e| format!("failed to list versions: {e}"))?;
    let mut parsed: Vec<(DateTime<Utc>, String)> = version_dirs
        .iter()
        .filter_map(|name| {
            DateTime::parse_from_str(&format!("{name} +0000"), "%Y%m%d_%H%M%S %z")
                .ok()
                .map(|dt| (dt.with_timezone(&Utc), name.clone()))
        })
        .collect();
    parsed.sort_by(|a, b| b.0.cmp(&a.0)); // newest first.

    if parsed.len() <= RETENTION_KEEP_NEWEST {
        return Ok(());
    }

    let cutoff = ctx.now - chrono::Duration::days(RETENTION_MAX_AGE_DAYS);
    let candidates: Vec<&str> = parsed[RETENTION_KEEP_NEWEST..]
        .iter()
        .filter(|(dt, _)| *dt < cutoff)
        .map(|(_, name)| name.as_str())
        .collect();

    for batch in candidates.chunks(RETENTION_BATCH_SIZE) {
        for name in batch {
            for (_, filename) in OUTPUT_ARTIFACTS {
                let key = format!("outputs/versions/{name}/{filename}");
                if ctx.storage.exists(&key).unwrap_or(false) {
                    ctx.storage.delete(&key).map_err(|e| format!("failed to delete {key}: {e}"))?;
                }
            }
        }
    }

    Ok(())
}
