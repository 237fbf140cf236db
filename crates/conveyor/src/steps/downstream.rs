//! Downstream per-step handlers after `parse_merge`: ingest
//! staging, EAN mapping, pricing, manual overrides, and the two EAN-catalog
//! export artifacts. Each reads the prior step's TSV artifact, streams
//! through it once, and writes a new one — the same read-once/write-once
//! discipline `parse_merge`'s finalize pass uses, just without the chunking
//! (these files are already bounded to catalog size by the time they get
//! here).

use std::collections::BTreeMap;

use rust_xlsxwriter::{Format, Workbook};

use conveyor_pricing::{PriceInputs, compute_price_ladder, normalize_ean, parse_locale_number};

use super::{StepContext, StepOutcome};

/// Per-run state-key suffixes (combined with [`StepContext::state_key`] at
/// every call site, the same convention `parse_merge`'s `OUTPUT_KEY` uses).
pub(super) const PARSE_MERGE_OUTPUT_KEY: &str = "outputs/products.tsv";
const EAN_MAPPING_OUTPUT_KEY: &str = "outputs/products_ean.tsv";
const PRICING_OUTPUT_KEY: &str = "outputs/products_priced.tsv";
pub(super) const OVERRIDE_OUTPUT_KEY: &str = "outputs/products_overridden.tsv";
const EAN_CATALOG_TSV_KEY: &str = "outputs/ean_catalog.tsv";
pub(super) const EAN_CATALOG_XLSX_KEY: &str = "outputs/Catalogo EAN.xlsx";

const EAN_MAPPING_INPUT_KEY_SUFFIX: &str = "ean_mapping.tsv";
const OVERRIDES_INPUT_KEY_SUFFIX: &str = "overrides.tsv";

/// A parsed row of `products.tsv`.
#[derive(Debug, Clone)]
pub(super) struct ProductRow {
    pub matnr: String,
    pub mpn: String,
    pub ean: String,
    pub desc: String,
    pub stock: i64,
    pub lp: f64,
    pub cbp: f64,
    pub sur: f64,
}

/// A [`ProductRow`] plus the two money columns `pricing` appends.
#[derive(Debug, Clone)]
pub(super) struct PricedRow {
    pub product: ProductRow,
    pub price_final_cents: i64,
    pub list_with_fee_cents: i64,
}

fn parse_product_rows(bytes: &[u8]) -> Result<Vec<ProductRow>, String> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines();
    lines.next(); // header
    let mut rows = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let f: Vec<&str> = line.split('\t').collect();
        if f.len() < 8 {
            return Err(format!("malformed product row: {line}"));
        }
        rows.push(ProductRow {
            matnr: f[0].to_string(),
            mpn: f[1].to_string(),
            ean: f[2].to_string(),
            desc: f[3].to_string(),
            stock: f[4].parse().unwrap_or(0),
            lp: f[5].parse().unwrap_or(0.0),
            cbp: f[6].parse().unwrap_or(0.0),
            sur: f[7].parse().unwrap_or(0.0),
        });
    }
    Ok(rows)
}

fn write_product_rows(rows: &[ProductRow]) -> Vec<u8> {
    let mut out = String::from("Matnr\tMPN\tEAN\tDesc\tStock\tLP\tCBP\tSur\n");
    for r in rows {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            r.matnr, r.mpn, r.ean, r.desc, r.stock, r.lp, r.cbp, r.sur
        ));
    }
    out.into_bytes()
}

pub(super) fn parse_priced_rows(bytes: &[u8]) -> Result<Vec<PricedRow>, String> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines();
    lines.next();
    let mut rows = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let f: Vec<&str> = line.split('\t').collect();
        if f.len() < 10 {
            return Err(format!("malformed priced row: {line}"));
        }
        rows.push(PricedRow {
            product: ProductRow {
                matnr: f[0].to_string(),
                mpn: f[1].to_string(),
                ean: f[2].to_string(),
                desc: f[3].to_string(),
                stock: f[4].parse().unwrap_or(0),
                lp: f[5].parse().unwrap_or(0.0),
                cbp: f[6].parse().unwrap_or(0.0),
                sur: f[7].parse().unwrap_or(0.0),
            },
            price_final_cents: f[8].parse().unwrap_or(0),
            list_with_fee_cents: f[9].parse().unwrap_or(0),
        });
    }
    Ok(rows)
}

pub(super) fn write_priced_rows(rows: &[PricedRow]) -> Vec<u8> {
    let mut out = String::from("Matnr\tMPN\tEAN\tDesc\tStock\tLP\tCBP\tSur\tPriceFinalCents\tListWithFeeCents\n");
    for r in rows {
        let p = &r.product;
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            p.matnr, p.mpn, p.ean, p.desc, p.stock, p.lp, p.cbp, p.sur, r.price_final_cents, r.list_with_fee_cents
        ));
    }
    out.into_bytes()
}

/// Format integer cents as an IT-style `X,YY` string, used on every
/// marketplace-facing artifact (never on intermediate TSVs, which keep
/// cents as a plain integer column).
pub(super) fn cents_to_comma(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.abs();
    format!("{sign}{},{:02}", abs / 100, abs % 100)
}

/// Run-scoped key for an externally-supplied auxiliary input (an operator
/// drops these alongside the trigger, before the run starts), distinct from
/// `ctx.state_key`'s pipeline-internal scratch space.
fn run_key(run_id: uuid::Uuid, suffix: &str) -> String {
    format!("inputs/runs/{run_id}/{suffix}")
}

// ---------------------------------------------------------------------------
// import_ftp
// ---------------------------------------------------------------------------

/// Validates every feed is reachable before `parse_merge`'s long chunked
/// pass begins, and builds the location index `parse_merge` doesn't need but
/// the marketplace export steps do. `parse_merge` re-fetches stock/price
/// directly from `ctx.feeds` itself, so only the location feed's derived
/// index is worth persisting here.
pub fn run_import_ftp(ctx: &StepContext) -> StepOutcome {
    if let Err(e) = ctx.feeds.fetch_stock_feed() {
        return StepOutcome::Failed { reason: format!("stock feed unavailable: {e}") };
    }
    if let Err(e) = ctx.feeds.fetch_price_feed() {
        return StepOutcome::Failed { reason: format!("price feed unavailable: {e}") };
    }
    if let Err(e) = ctx.feeds.material_url() {
        return StepOutcome::Failed { reason: format!("material source unavailable: {e}") };
    }

    if let Ok(location_bytes) = ctx.feeds.fetch_location_feed() {
        match build_location_index(ctx, &location_bytes) {
            Ok(warnings) if !warnings.is_empty() => return StepOutcome::CompletedWithLocationWarnings(warnings),
            Ok(_) => {}
            Err(reason) => return StepOutcome::Failed { reason },
        }
    }

    StepOutcome::Completed
}

/// Per-Matnr IT/EU stock aggregation. `4255`
/// without a paired `4254` is an `orphan_4255` warning; everything else is
/// tallied by bucket and persisted for the marketplace export steps.
fn build_location_index(ctx: &StepContext, bytes: &[u8]) -> Result<BTreeMap<String, u64>, String> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines();
    let header = lines.next().ok_or_else(|| "location feed is empty".to_string())?;
    let delim = [',', ';', '\t', '|']
        .iter()
        .copied()
        .max_by_key(|d| header.matches(*d).count())
        .unwrap_or(',');
    let fields: Vec<&str> = header.split(delim).collect();
    let matnr_col = fields
        .iter()
        .position(|f| f.trim().eq_ignore_ascii_case("matnr"))
        .ok_or_else(|| "location feed missing Matnr column".to_string())?;
    let location_col = fields
        .iter()
        .position(|f| f.trim().eq_ignore_ascii_case("locationid"))
        .ok_or_else(|| "location feed missing LocationID column".to_string())?;
    let stock_col = fields
        .iter()
        .position(|f| f.trim().eq_ignore_ascii_case("stock"))
        .ok_or_else(|| "location feed missing Stock column".to_string())?;

    let mut it: BTreeMap<String, i64> = BTreeMap::new();
    let mut eu: BTreeMap<String, i64> = BTreeMap::new();
    let mut saw_4255: BTreeMap<String, bool> = BTreeMap::new();
    let mut saw_4254: BTreeMap<String, bool> = BTreeMap::new();

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let row: Vec<&str> = line.split(delim).collect();
        let Some(matnr) = row.get(matnr_col) else { continue };
        let matnr = matnr.trim().to_string();
        if matnr.is_empty() {
            continue;
        }
        let location_id: u32 = row.get(location_col).and_then(|v| v.trim().parse().ok()).unwrap_or(0);
        let qty = row.get(stock_col).map(|v| parse_locale_number(v)).filter(|v| v.is_finite()).unwrap_or(0.0) as i64;

        match conveyor_pricing::location_bucket(location_id) {
            Some(conveyor_types::StockSource::It) => {
                *it.entry(matnr.clone()).or_insert(0) += qty;
                saw_4254.insert(matnr, true);
            }
            Some(conveyor_types::StockSource::EuFallback) => {
                *eu.entry(matnr.clone()).or_insert(0) += qty;
            }
            None if location_id == 4255 => {
                saw_4255.insert(matnr, true);
            }
            None => {}
        }
    }

    let mut location_warnings: BTreeMap<String, u64> = BTreeMap::new();
    let mut orphan_count: u64 = 0;
    for matnr in saw_4255.keys() {
        if !saw_4254.contains_key(matnr) {
            orphan_count += 1;
            ctx.log_warn("orphan_4255", serde_json::json!({"matnr": matnr}));
        }
    }
    if orphan_count > 0 {
        location_warnings.insert("orphan_4255".to_string(), orphan_count);
    }

    let mut index: BTreeMap<String, (i64, i64)> = BTreeMap::new();
    for matnr in it.keys().chain(eu.keys()) {
        index.entry(matnr.clone()).or_insert((0, 0));
    }
    for (matnr, slot) in index.iter_mut() {
        slot.0 = it.get(matnr).copied().unwrap_or(0);
        slot.1 = eu.get(matnr).copied().unwrap_or(0);
    }

    let bytes = serde_json::to_vec(&index).map_err(|e| format!("failed to serialize location index: {e}"))?;
    ctx.storage
        .write(&ctx.state_key("location_index.json"), &bytes)
        .map_err(|e| format!("failed to persist location index: {e}"))?;

    if !location_warnings.is_empty() {
        let bytes = serde_json::to_vec(&location_warnings).map_err(|e| format!("failed to serialize location warnings: {e}"))?;
        ctx.storage
            .write(&ctx.state_key("location_warnings.json"), &bytes)
            .map_err(|e| format!("failed to persist location warnings: {e}"))?;
    }

    Ok(location_warnings)
}

/// Read `state/{run_id}/location_index.json` if `import_ftp` built one.
/// Absence means no location feed was supplied; marketplace exports then
/// treat every Matnr as IT-only with `stockEU = 0`.
pub(super) fn load_location_index(ctx: &StepContext) -> BTreeMap<String, (i64, i64)> {
    ctx.storage
        .read(&ctx.state_key("location_index.json"))
        .ok()
        .and_then(|b| serde_json::from_slice(&b).ok())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// ean_mapping
// ---------------------------------------------------------------------------

/// `^[+-]?\d+(?:[.,]\d+)?[eE][+-]?\d+$` without pulling in `regex` for one
/// shape: a manual scan is cheaper than a dependency for a single pattern.
fn looks_like_scientific_notation(s: &str) -> bool {
    let Some(e_pos) = s.find(|c| c == 'e' || c == 'E') else { return false };
    let (mantissa, exponent) = (&s[..e_pos], &s[e_pos + 1..]);
    let mantissa = mantissa.strip_prefix(['+', '-']).unwrap_or(mantissa);
    let exponent = exponent.strip_prefix(['+', '-']).unwrap_or(exponent);
    if mantissa.is_empty() || exponent.is_empty() || !exponent.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let digits_and_one_sep = mantissa.chars().filter(|c| *c == '.' || *c == ',').count() <= 1;
    digits_and_one_sep && mantissa.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',')
}

pub fn run_ean_mapping(ctx: &StepContext) -> StepOutcome {
    let bytes = match ctx.storage.read(&ctx.state_key(PARSE_MERGE_OUTPUT_KEY)) {
        Ok(b) => b,
        Err(e) => return StepOutcome::Failed { reason: format!("products.tsv missing: {e}") },
    };
    let mut rows = match parse_product_rows(&bytes) {
        Ok(r) => r,
        Err(reason) => return StepOutcome::Failed { reason },
    };

    // Build MPN -> EAN mapping, classifying conflicts (Case 2A/2B/2C/3).
    // Case 2A: the material feed already has an EAN — mapping never wins.
    // Case 2B/2C: every mapping row for an MPN normalizes to the same EAN.
    // Case 3: two mapping rows for the same MPN normalize to different EANs
    // — ambiguous, refuse to prefill.
    let mapping_bytes = ctx.storage.read(&run_key(ctx.run_id, EAN_MAPPING_INPUT_KEY_SUFFIX)).ok();
    let mut mapping: BTreeMap<String, Option<String>> = BTreeMap::new();
    if let Some(bytes) = mapping_bytes {
        let text = String::from_utf8_lossy(&bytes);
        let mut lines = text.lines();
        lines.next();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let f: Vec<&str> = line.split('\t').collect();
            let (Some(mpn), Some(ean)) = (f.first(), f.get(1)) else { continue };
            let normalized = normalize_ean(ean);
            if !normalized.ok {
                continue;
            }
            let value = normalized.value;
            mapping
                .entry(mpn.trim().to_string())
                .and_modify(|existing| {
                    if *existing != value {
                        *existing = None; // Case 3: mark ambiguous.
                    }
                })
                .or_insert(value);
        }
    }

    for row in rows.iter_mut() {
        if looks_like_scientific_notation(row.mpn.trim()) {
            ctx.log_warn("mpnScientificNotation", serde_json::json!({"mpn": row.mpn, "matnr": row.matnr}));
        } else if row.mpn.contains("E+") {
            ctx.log_info("mpn_contains_e_plus", serde_json::json!({"mpn": row.mpn, "matnr": row.matnr}));
        }

        if !row.ean.trim().is_empty() {
            continue; // Case 2A: material wins, never rewritten.
        }
        match mapping.get(row.mpn.trim()) {
            Some(Some(ean)) => row.ean = ean.clone(),
            Some(None) => {
                ctx.log_warn("ean_mapping_ambiguous", serde_json::json!({"mpn": row.mpn, "matnr": row.matnr}));
            }
            None => {}
        }
    }

    let out = write_product_rows(&rows);
    if let Err(e) = ctx.storage.write(&ctx.state_key(EAN_MAPPING_OUTPUT_KEY), &out) {
        return StepOutcome::Failed { reason: format!("failed to write {EAN_MAPPING_OUTPUT_KEY}: {e}") };
    }
    StepOutcome::Completed
}

// ---------------------------------------------------------------------------
// pricing
// ---------------------------------------------------------------------------

pub fn run_pricing(ctx: &StepContext) -> StepOutcome {
    let bytes = match ctx.storage.read(&ctx.state_key(EAN_MAPPING_OUTPUT_KEY)) {
        Ok(b) => b,
        Err(e) => return StepOutcome::Failed { reason: format!("{EAN_MAPPING_OUTPUT_KEY} missing: {e}") },
    };
    let rows = match parse_product_rows(&bytes) {
        Ok(r) => r,
        Err(reason) => return StepOutcome::Failed { reason },
    };

    let fee = ctx.config.pricing;
    let priced: Vec<PricedRow> = rows
        .into_iter()
        .map(|product| {
            let ladder = compute_price_ladder(PriceInputs {
                list_price: product.lp,
                cust_best_price: product.cbp,
                surcharge: product.sur,
                shipping: fee.shipping,
                vat_percent: fee.vat_percent,
                fee_drev: fee.fee_drev,
                fee_mkt: fee.fee_mkt,
            });
            PricedRow {
                product,
                price_final_cents: ladder.final_cents,
                list_with_fee_cents: ladder.list_with_fee_cents,
            }
        })
        .collect();

    let out = write_priced_rows(&priced);
    if let Err(e) = ctx.storage.write(&ctx.state_key(PRICING_OUTPUT_KEY), &out) {
        return StepOutcome::Failed { reason: format!("failed to write {PRICING_OUTPUT_KEY}: {e}") };
    }
    StepOutcome::Completed
}

// ---------------------------------------------------------------------------
// override_products
// ---------------------------------------------------------------------------

pub fn run_override_products(ctx: &StepContext) -> StepOutcome {
    let bytes = match ctx.storage.read(&ctx.state_key(PRICING_OUTPUT_KEY)) {
        Ok(b) => b,
        Err(e) => return StepOutcome::Failed { reason: format!("{PRICING_OUTPUT_KEY} missing: {e}") },
    };
    let mut rows = match parse_priced_rows(&bytes) {
        Ok(r) => r,
        Err(reason) => return StepOutcome::Failed { reason },
    };

    if let Ok(override_bytes) = ctx.storage.read(&run_key(ctx.run_id, OVERRIDES_INPUT_KEY_SUFFIX)) {
        let text = String::from_utf8_lossy(&override_bytes);
        let mut lines = text.lines();
        lines.next();
        let mut by_matnr: BTreeMap<String, (Option<i64>, Option<i64>)> = BTreeMap::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let f: Vec<&str> = line.split('\t').collect();
            let Some(matnr) = f.first() else { continue };
            let stock = f.get(1).and_then(|v| v.trim().parse::<i64>().ok());
            let price_cents = f.get(2).and_then(|v| v.trim().parse::<i64>().ok());
            by_matnr.insert(matnr.trim().to_string(), (stock, price_cents));
        }
        for row in rows.iter_mut() {
            if let Some((stock, price_cents)) = by_matnr.get(&row.product.matnr) {
                if let Some(stock) = stock {
                    row.product.stock = *stock;
                }
                if let Some(price_cents) = price_cents {
                    row.price_final_cents = conveyor_pricing::to_comma99_cents(*price_cents);
                    ctx.log_info(
                        "price_override_applied",
                        serde_json::json!({"matnr": row.product.matnr, "price_final_cents": row.price_final_cents}),
                    );
                }
            }
        }
    }

    let out = write_priced_rows(&rows);
    if let Err(e) = ctx.storage.write(&ctx.state_key(OVERRIDE_OUTPUT_KEY), &out) {
        return StepOutcome::Failed { reason: format!("failed to write {OVERRIDE_OUTPUT_KEY}: {e}") };
    }
    StepOutcome::Completed
}

// ---------------------------------------------------------------------------
// export_ean / export_ean_xlsx
// ---------------------------------------------------------------------------

/// Deduplicated, normalized-EAN catalog row shared by the CSV and XLSX
/// exports.
pub(super) struct EanCatalogRow {
    pub ean: String,
    pub desc: String,
    pub price_final_cents: i64,
}

fn dedupe_by_ean(rows: &[PricedRow]) -> Vec<EanCatalogRow> {
    let mut best: BTreeMap<String, EanCatalogRow> = BTreeMap::new();
    for row in rows {
        let normalized = normalize_ean(&row.product.ean);
        let Some(ean) = normalized.value.filter(|_| normalized.ok) else { continue };
        let candidate = EanCatalogRow { ean: ean.clone(), desc: row.product.desc.clone(), price_final_cents: row.price_final_cents };
        match best.get(&ean) {
            Some(existing) if existing.price_final_cents >= candidate.price_final_cents => {}
            _ => {
                best.insert(ean, candidate);
            }
        }
    }
    best.into_values().collect()
}

pub fn run_export_ean(ctx: &StepContext) -> StepOutcome {
    let bytes = match ctx.storage.read(&ctx.state_key(OVERRIDE_OUTPUT_KEY)) {
        Ok(b) => b,
        Err(e) => return StepOutcome::Failed { reason: format!("{OVERRIDE_OUTPUT_KEY} missing: {e}") },
    };
    let rows = match parse_priced_rows(&bytes) {
        Ok(r) => r,
        Err(reason) => return StepOutcome::Failed { reason },
    };
    let catalog = dedupe_by_ean(&rows);

    let mut out = String::from("EAN,Description,PriceFinal\n");
    for row in &catalog {
        out.push_str(&format!("\"{}\",\"{}\",{}\n", row.ean, row.desc.replace('"', "'"), cents_to_comma(row.price_final_cents)));
    }
    if let Err(e) = ctx.storage.write(&ctx.state_key(EAN_CATALOG_TSV_KEY), out.as_bytes()) {
        return StepOutcome::Failed { reason: format!("failed to write {EAN_CATALOG_TSV_KEY}: {e}") };
    }
    StepOutcome::Completed
}

pub fn run_export_ean_xlsx(ctx: &StepContext) -> StepOutcome {
    let bytes = match ctx.storage.read(&ctx.state_key(OVERRIDE_OUTPUT_KEY)) {
        Ok(b) => b,
        Err(e) => return StepOutcome::Failed { reason: format!("{OVERRIDE_OUTPUT_KEY} missing: {e}") },
    };
    let rows = match parse_priced_rows(&bytes) {
        Ok(r) => r,
        Err(reason) => return StepOutcome::Failed { reason },
    };
    let catalog = dedupe_by_ean(&rows);

    let mut workbook = Workbook::new();
    let text_format = Format::new().set_num_format("@"); // forced text, preserves leading zeros.
    let sheet = workbook.add_worksheet();
    if let Err(e) = sheet
        .write_string(0, 0, "EAN")
        .and_then(|s| s.write_string(0, 1, "Description"))
        .and_then(|s| s.write_string(0, 2, "PriceFinal"))
    {
        return StepOutcome::Failed { reason: format!("failed to write EAN catalog header: {e}") };
    }
    for (i, row) in catalog.iter().enumerate() {
        let r = (i + 1) as u32;
        if let Err(e) = sheet
            .write_string_with_format(r, 0, &row.ean, &text_format)
            .and_then(|s| s.write_string(r, 1, &row.desc))
            .and_then(|s| s.write_string(r, 2, &cents_to_comma(row.price_final_cents)))
        {
            return StepOutcome::Failed { reason: format!("failed to write EAN catalog row {i}: {e}") };
        }
    }

    let xlsx_bytes = match workbook.save_to_buffer() {
        Ok(b) => b,
        Err(e) => return StepOutcome::Failed { reason: format!("failed to render {EAN_CATALOG_XLSX_KEY}: {e}") },
    };
    if let Err(e) = ctx.storage.write(&ctx.state_key(EAN_CATALOG_XLSX_KEY), &xlsx_bytes) {
        return StepOutcome::Failed { reason: format!("failed to write {EAN_CATALOG_XLSX_KEY}: {e}") };
    }
    StepOutcome::Completed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scientific_notation_matches_bare_exponent_form() {
        assert!(looks_like_scientific_notation("1.23E+10"));
        assert!(looks_like_scientific_notation("7e5"));
        assert!(!looks_like_scientific_notation("ABC123"));
    }

    #[test]
    fn e_plus_substring_alone_is_not_scientific_notation() {
        assert!(!looks_like_scientific_notation("PART-E+-CONNECTOR"));
    }

    #[test]
    fn product_rows_round_trip_through_tsv() {
        let rows = vec![ProductRow {
            matnr: "M1".into(),
            mpn: "MPN1".into(),
            ean: "1234567890123".into(),
            desc: "Widget".into(),
            stock: 5,
            lp: 10.0,
            cbp: 0.0,
            sur: 0.0,
        }];
        let bytes = write_product_rows(&rows);
        let parsed = parse_product_rows(&bytes).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].matnr, "M1");
        assert_eq!(parsed[0].stock, 5);
    }

    #[test]
    fn dedupe_by_ean_keeps_highest_price() {
        let mk = |ean: &str, cents: i64| PricedRow {
            product: ProductRow {
                matnr: ean.to_string(),
                mpn: String::new(),
                ean: ean.to_string(),
                desc: "d".into(),
                stock: 5,
                lp: 1.0,
                cbp: 0.0,
                sur: 0.0,
            },
            price_final_cents: cents,
            list_with_fee_cents: cents,
        };
        let rows = vec![mk("1234567890123", 1099), mk("1234567890123", 2099)];
        let catalog = dedupe_by_ean(&rows);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].price_final_cents, 2099);
    }

    #[test]
    fn cents_to_comma_formats_it_locale() {
        assert_eq!(cents_to_comma(1099), "10,99");
        assert_eq!(cents_to_comma(5), "0,05");
    }
}
