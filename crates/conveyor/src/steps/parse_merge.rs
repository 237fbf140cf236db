//! Chunked `parse_merge`: ingest stock, price, and material feeds
//! into one `products.tsv` without ever holding the material body fully in
//! memory. One tick performs exactly one unit of sub-phase work — one index
//! build, one Range fetch, or one finalize append — then persists and
//! returns, the same "never block on more than one sub-call" discipline the
//! orchestrator applies to whole steps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use conveyor_pricing::parse_locale_number;
use conveyor_storage::RangeFetchOutcome;
use conveyor_types::{FetchMode, ParseMergeState, ParseMergeSubPhase, SkippedCounts};

use super::{StepContext, StepOutcome, MAX_FETCH_BYTES, MAX_PARTIAL_LINE_BYTES, MAX_TOTAL_CHUNKS, MAX_TOTAL_SIZE_BYTES};

const DELIMS: [char; 4] = ['\t', ';', ',', '|'];
const HEADER_PROBE_BYTES: u64 = 8191;
const HEADER_ALIAS_MARGIN: u64 = 64 * 1024;

const STOCK_INDEX_KEY: &str = "stock_index.json";
const PRICE_INDEX_KEY: &str = "price_index.json";
const MATERIAL_META_KEY: &str = "material_meta.json";
const FINALIZE_PARTIAL_KEY: &str = "finalize_partial.tsv";
const OUTPUT_KEY: &str = "outputs/products.tsv";
const CHUNKS_PREFIX: &str = "parse_merge_chunks";
const TSV_HEADER: &str = "Matnr\tMPN\tEAN\tDesc\tStock\tLP\tCBP\tSur\n";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ColumnIndices {
    matnr: usize,
    mpn: Option<usize>,
    ean: Option<usize>,
    desc: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MaterialMeta {
    delimiter: char,
    columns: ColumnIndices,
    header_end_pos: u64,
    total_bytes: u64,
    source_url: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct PriceEntry {
    list_price: f64,
    cust_best_price: f64,
    surcharge: f64,
}

pub fn run(ctx: &StepContext, prior: Option<ParseMergeState>) -> StepOutcome {
    let mut state = prior.unwrap_or_default();
    let result = match state.sub_phase {
        ParseMergeSubPhase::BuildingStockIndex => build_stock_index(ctx, &mut state),
        ParseMergeSubPhase::BuildingPriceIndex => build_price_index(ctx, &mut state),
        ParseMergeSubPhase::PreparingMaterial => prepare_material(ctx, &mut state),
        ParseMergeSubPhase::InProgress => process_body(ctx, &mut state),
        ParseMergeSubPhase::Finalizing => finalize(ctx, &mut state),
    };
    result.unwrap_or_else(|reason| StepOutcome::Failed { reason })
}

fn detect_delimiter(header_line: &str) -> char {
    DELIMS
        .iter()
        .copied()
        .max_by_key(|d| header_line.matches(*d).count())
        .unwrap_or('\t')
}

fn find_column(fields: &[&str], aliases: &[&str]) -> Option<usize> {
    fields.iter().position(|f| {
        let lower = f.trim().to_ascii_lowercase();
        aliases.iter().any(|a| *a == lower)
    })
}

const MATNR_ALIASES: &[&str] = &["matnr", "mat_nr", "sku", "material", "material_number"];
const MPN_ALIASES: &[&str] = &["mpn", "manufpartnr", "manuf_part_nr", "partnumber"];
const EAN_ALIASES: &[&str] = &["ean", "gtin", "barcode"];
const DESC_ALIASES: &[&str] = &["desc", "description", "name", "title"];
const STOCK_ALIASES: &[&str] = &["stock", "qty", "quantity"];
const LIST_PRICE_ALIASES: &[&str] = &["price", "listprice", "list_price"];
const CBP_ALIASES: &[&str] = &["cbp", "custbestprice", "cust_best_price", "best_price"];
const SURCHARGE_ALIASES: &[&str] = &["surcharge", "sur", "fee"];

// ---------------------------------------------------------------------------
// building_stock_index / building_price_index
// ---------------------------------------------------------------------------

fn build_stock_index(ctx: &StepContext, state: &mut ParseMergeState) -> Result<StepOutcome, String> {
    let bytes = ctx.feeds.fetch_stock_feed().map_err(|e| format!("stock feed unavailable: {e}"))?;
    let text = String::from_utf8_lossy(&bytes);
    let mut lines = text.lines();
    let header = lines.next().ok_or_else(|| "stock feed is empty".to_string())?;
    let delim = detect_delimiter(header);
    let fields: Vec<&str> = header.split(delim).collect();
    let matnr_col = find_column(&fields, MATNR_ALIASES).ok_or_else(|| "stock feed missing Matnr column".to_string())?;
    let stock_col = find_column(&fields, STOCK_ALIASES).ok_or_else(|| "stock feed missing Stock column".to_string())?;

    let mut index: BTreeMap<String, i64> = BTreeMap::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let row: Vec<&str> = line.split(delim).collect();
        let Some(matnr) = row.get(matnr_col) else { continue };
        if matnr.trim().is_empty() {
            continue;
        }
        let raw_stock = row.get(stock_col).copied().unwrap_or("");
        let parsed = parse_locale_number(raw_stock);
        let qty = if parsed.is_finite() { parsed as i64 } else {
            ctx.log_warn(
                "invalid_stock_value",
                serde_json::json!({"matnr": matnr, "raw": raw_stock}),
            );
            0
        };
        index.insert(matnr.trim().to_string(), qty);
    }

    let bytes = serde_json::to_vec(&index).map_err(|e| format!("failed to serialize stock index: {e}"))?;
    ctx.storage.write(&ctx.state_key(STOCK_INDEX_KEY), &bytes).map_err(|e| format!("failed to persist stock index: {e}"))?;

    state.sub_phase = ParseMergeSubPhase::BuildingPriceIndex;
    Ok(StepOutcome::InProgress { inner: Some(state.clone()) })
}

fn build_price_index(ctx: &StepContext, state: &mut ParseMergeState) -> Result<StepOutcome, String> {
    let bytes = ctx.feeds.fetch_price_feed().map_err(|e| format!("price feed unavailable: {e}"))?;
    let text = String::from_utf8_lossy(&bytes);
    let mut lines = text.lines();
    let header = lines.next().ok_or_else(|| "price feed is empty".to_string())?;
    let delim = detect_delimiter(header);
    let fields: Vec<&str> = header.split(delim).collect();
    let matnr_col = find_column(&fields, MATNR_ALIASES).ok_or_else(|| "price feed missing Matnr column".to_string())?;
    let lp_col = find_column(&fields, LIST_PRICE_ALIASES);
    let cbp_col = find_column(&fields, CBP_ALIASES);
    let sur_col = find_column(&fields, SURCHARGE_ALIASES);

    let mut index: BTreeMap<String, PriceEntry> = BTreeMap::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let row: Vec<&str> = line.split(delim).collect();
        let Some(matnr) = row.get(matnr_col) else { continue };
        if matnr.trim().is_empty() {
            continue;
        }
        let entry = PriceEntry {
            list_price: lp_col.and_then(|c| row.get(c)).map(|v| parse_locale_number(v)).filter(|v| v.is_finite()).unwrap_or(0.0),
            cust_best_price: cbp_col.and_then(|c| row.get(c)).map(|v| parse_locale_number(v)).filter(|v| v.is_finite()).unwrap_or(0.0),
            surcharge: sur_col.and_then(|c| row.get(c)).map(|v| parse_locale_number(v)).filter(|v| v.is_finite()).unwrap_or(0.0),
        };
        index.insert(matnr.trim().to_string(), entry);
    }

    let bytes = serde_json::to_vec(&index).map_err(|e| format!("failed to serialize price index: {e}"))?;
    ctx.storage.write(&ctx.state_key(PRICE_INDEX_KEY), &bytes).map_err(|e| format!("failed to persist price index: {e}"))?;

    state.sub_phase = ParseMergeSubPhase::PreparingMaterial;
    Ok(StepOutcome::InProgress { inner: Some(state.clone()) })
}

// ---------------------------------------------------------------------------
// preparing_material
// ---------------------------------------------------------------------------

fn prepare_material(ctx: &StepContext, state: &mut ParseMergeState) -> Result<StepOutcome, String> {
    let url = ctx.feeds.material_url().map_err(|e| format!("material source unavailable: {e}"))?;
    let probe = ctx.fetcher.probe(&url).map_err(|e| format!("HEAD probe failed: {e}"))?;
    if probe.status == conveyor_retry::WORKER_LIMIT_HTTP_STATUS {
        return Ok(StepOutcome::WorkerLimit { http_status: probe.status, message: "HEAD probe hit WORKER_LIMIT".to_string() });
    }

    let header_fetch = ctx
        .fetcher
        .fetch_range(&url, 0, HEADER_PROBE_BYTES, 0, MAX_FETCH_BYTES)
        .map_err(|e| format!("header probe fetch failed: {e}"))?;

    let (header_bytes, header_range_honored) = match header_fetch {
        RangeFetchOutcome::Partial { bytes, http_status } => (bytes, http_status == 206),
        RangeFetchOutcome::Eof => return Err("material file is empty".to_string()),
        RangeFetchOutcome::FullBodyRefused { .. } => {
            return Err("material_unrangeable: server will not honor Range requests".to_string());
        }
        RangeFetchOutcome::WorkerLimit { http_status, body_excerpt } => {
            return Ok(StepOutcome::WorkerLimit { http_status, message: body_excerpt });
        }
        RangeFetchOutcome::RangeNotHonored { http_status, .. } => {
            return Err(format!("material source returned unexpected status {http_status}"));
        }
    };

    let header_end = header_bytes.iter().position(|b| *b == b'\n').ok_or_else(|| "header_line_too_long".to_string())?;
    let header_end_pos = (header_end + 1) as u64;
    let header_line = String::from_utf8_lossy(&header_bytes[..header_end]).to_string();
    let delimiter = detect_delimiter(&header_line);
    let fields: Vec<&str> = header_line.split(delimiter).collect();
    let matnr = find_column(&fields, MATNR_ALIASES).ok_or_else(|| "material feed missing Matnr column".to_string())?;
    let columns = ColumnIndices {
        matnr,
        mpn: find_column(&fields, MPN_ALIASES),
        ean: find_column(&fields, EAN_ALIASES),
        desc: find_column(&fields, DESC_ALIASES),
    };

    let total_bytes = probe.content_length.unwrap_or(header_bytes.len() as u64).max(header_end_pos);

    let meta = MaterialMeta { delimiter, columns, header_end_pos, total_bytes, source_url: url };
    let meta_bytes = serde_json::to_vec(&meta).map_err(|e| format!("failed to serialize material meta: {e}"))?;
    ctx.storage.write(&ctx.state_key(MATERIAL_META_KEY), &meta_bytes).map_err(|e| format!("failed to persist material meta: {e}"))?;

    state.sub_phase = ParseMergeSubPhase::InProgress;
    state.cursor_pos = header_end_pos;
    state.chunk_index = 0;
    state.partial_line.clear();
    // §4.2.2 step 5: a genuine 206 always means `range` mode, regardless of
    // size. Only a 200 (Range ignored but tolerated because the whole file
    // fit in the header probe's window) on a file past the threshold falls
    // back to the stricter `chunk_files` mode.
    state.mode = Some(if header_range_honored || total_bytes <= MAX_FETCH_BYTES + HEADER_ALIAS_MARGIN {
        FetchMode::Range
    } else {
        FetchMode::ChunkFiles
    });
    state.material_bytes = Some(total_bytes);
    state.header_end_pos = Some(header_end_pos);
    state.delimiter = Some(delimiter);
    state.material_path = Some(meta.source_url.clone());
    state.started_at.get_or_insert(ctx.now);

    Ok(StepOutcome::InProgress { inner: Some(state.clone()) })
}

// ---------------------------------------------------------------------------
// in_progress body processing
// ---------------------------------------------------------------------------

fn load_meta(ctx: &StepContext) -> Result<MaterialMeta, String> {
    let bytes = ctx.storage.read(&ctx.state_key(MATERIAL_META_KEY)).map_err(|e| format!("material meta missing: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("corrupt material meta: {e}"))
}

fn load_stock_index(ctx: &StepContext) -> Result<BTreeMap<String, i64>, String> {
    let bytes = ctx.storage.read(&ctx.state_key(STOCK_INDEX_KEY)).map_err(|e| format!("stock index missing: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("corrupt stock index: {e}"))
}

fn load_price_index(ctx: &StepContext) -> Result<BTreeMap<String, PriceEntry>, String> {
    let bytes = ctx.storage.read(&ctx.state_key(PRICE_INDEX_KEY)).map_err(|e| format!("price index missing: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("corrupt price index: {e}"))
}

fn flush_end_of_file(ctx: &StepContext, state: &mut ParseMergeState, meta: &MaterialMeta) -> Result<(), String> {
    let stock = load_stock_index(ctx)?;
    let price = load_price_index(ctx)?;
    let mut buffer = String::new();
    if !state.partial_line.trim().is_empty() {
        append_row(&mut buffer, &state.partial_line, meta, &stock, &price, &mut state.skipped, &mut state.product_count);
    }
    if !buffer.is_empty() {
        let key = ctx.state_key(&format!("{CHUNKS_PREFIX}/{}.tsv", state.chunk_index));
        ctx.storage.write(&key, buffer.as_bytes()).map_err(|e| format!("failed to persist final chunk: {e}"))?;
        state.chunk_index += 1;
    }
    state.partial_line.clear();
    state.sub_phase = ParseMergeSubPhase::Finalizing;
    state.finalize_chunk_idx = 0;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn append_row(
    buffer: &mut String,
    line: &str,
    meta: &MaterialMeta,
    stock: &BTreeMap<String, i64>,
    price: &BTreeMap<String, PriceEntry>,
    skipped: &mut SkippedCounts,
    product_count: &mut u64,
) {
    let row: Vec<&str> = line.split(meta.delimiter).collect();
    let Some(matnr) = row.get(meta.columns.matnr).map(|s| s.trim()) else { return };
    if matnr.is_empty() {
        return;
    }

    let Some(qty) = stock.get(matnr) else {
        skipped.no_stock += 1;
        return;
    };
    let Some(p) = price.get(matnr) else {
        skipped.no_price += 1;
        return;
    };
    if *qty < 2 {
        skipped.low_stock += 1;
        return;
    }
    if p.list_price <= 0.0 && p.cust_best_price <= 0.0 {
        skipped.no_valid += 1;
        return;
    }

    let mpn = meta.columns.mpn.and_then(|c| row.get(c)).copied().unwrap_or("");
    let ean = meta.columns.ean.and_then(|c| row.get(c)).copied().unwrap_or("");
    let desc = meta.columns.desc.and_then(|c| row.get(c)).copied().unwrap_or("");

    buffer.push_str(&format!(
        "{matnr}\t{mpn}\t{ean}\t{desc}\t{qty}\t{}\t{}\t{}\n",
        p.list_price, p.cust_best_price, p.surcharge
    ));
    *product_count += 1;
}

fn process_body(ctx: &StepContext, state: &mut ParseMergeState) -> Result<StepOutcome, String> {
    if state.chunk_index > MAX_TOTAL_CHUNKS {
        return Err("too_many_chunks".to_string());
    }

    let meta = load_meta(ctx)?;
    let total_bytes = state.material_bytes.unwrap_or(meta.total_bytes);

    if state.cursor_pos >= total_bytes {
        flush_end_of_file(ctx, state, &meta)?;
        return Ok(StepOutcome::InProgress { inner: Some(state.clone()) });
    }

    let end = (state.cursor_pos + MAX_FETCH_BYTES - 1).min(total_bytes.saturating_sub(1));
    let outcome = ctx
        .fetcher
        .fetch_range(&meta.source_url, state.cursor_pos, end, state.cursor_pos, MAX_FETCH_BYTES)
        .map_err(|e| format!("range fetch failed: {e}"))?;

    let body = match outcome {
        RangeFetchOutcome::Partial { bytes, http_status } => {
            // `chunk_files` mode's stricter failure semantics (§4.2.2 step
            // 5, glossary): this mode only exists because the header probe
            // already found the server unwilling to honor Range on this
            // file, so a merely-tolerated 200 fallback here (rather than a
            // genuine 206) is not given the same pass `range` mode gives it.
            if state.mode == Some(FetchMode::ChunkFiles) && http_status != 206 {
                ctx.log_error(
                    "range_not_honored",
                    serde_json::json!({"http_status": http_status, "mode": "chunk_files", "cursor_pos": state.cursor_pos}),
                );
                return Err("range_not_honored".to_string());
            }
            bytes
        }
        RangeFetchOutcome::Eof => {
            flush_end_of_file(ctx, state, &meta)?;
            return Ok(StepOutcome::InProgress { inner: Some(state.clone()) });
        }
        RangeFetchOutcome::RangeNotHonored { http_status, content_range, content_length } => {
            ctx.log_error(
                "range_not_honored",
                serde_json::json!({"http_status": http_status, "content_range": content_range, "content_length": content_length}),
            );
            return Err("range_not_honored".to_string());
        }
        RangeFetchOutcome::FullBodyRefused { bytes_fetched } => {
            return Err(format!("full_body_refused: {bytes_fetched} bytes at cursor_pos={}", state.cursor_pos));
        }
        RangeFetchOutcome::WorkerLimit { http_status, body_excerpt } => {
            return Ok(StepOutcome::WorkerLimit { http_status, message: body_excerpt });
        }
    };
    let bytes_fetched = body.len() as u64;

    let stock = load_stock_index(ctx)?;
    let price = load_price_index(ctx)?;

    let decoded = String::from_utf8_lossy(&body);
    let text = format!("{}{}", state.partial_line, decoded);

    let mut buffer = String::new();
    let mut rest = text.as_str();
    while let Some(idx) = rest.find('\n') {
        let line = &rest[..idx];
        append_row(&mut buffer, line, &meta, &stock, &price, &mut state.skipped, &mut state.product_count);
        rest = &rest[idx + 1..];
    }
    state.partial_line = rest.to_string();
    if state.partial_line.len() > MAX_PARTIAL_LINE_BYTES {
        return Err("partial_line_too_large".to_string());
    }

    state.cursor_pos += bytes_fetched;
    if !buffer.is_empty() {
        let key = ctx.state_key(&format!("{CHUNKS_PREFIX}/{}.tsv", state.chunk_index));
        ctx.storage.write(&key, buffer.as_bytes()).map_err(|e| format!("failed to persist chunk: {e}"))?;
        state.chunk_index += 1;
    }

    ctx.log_info(
        "parse_merge_chunk_progress",
        serde_json::json!({
            "cursor_pos": state.cursor_pos,
            "chunk_index": state.chunk_index,
            "bytes_fetched": bytes_fetched,
            "product_count": state.product_count,
        }),
    );

    Ok(StepOutcome::InProgress { inner: Some(state.clone()) })
}

// ---------------------------------------------------------------------------
// finalizing
// ---------------------------------------------------------------------------

fn finalize(ctx: &StepContext, state: &mut ParseMergeState) -> Result<StepOutcome, String> {
    let loop_start = std::time::Instant::now();
    let mut buffer = if ctx.storage.exists(&ctx.state_key(FINALIZE_PARTIAL_KEY)).unwrap_or(false) {
        let bytes = ctx.storage.read(&ctx.state_key(FINALIZE_PARTIAL_KEY)).map_err(|e| format!("failed to read finalize partial: {e}"))?;
        String::from_utf8_lossy(&bytes).to_string()
    } else {
        TSV_HEADER.to_string()
    };

    let mut cumulative = buffer.len() as u64;
    let mut i = state.finalize_chunk_idx;
    while i < state.chunk_index {
        let sub_phase_elapsed = loop_start.elapsed().as_millis() as u64 >= super::SUB_PHASE_TIME_BUDGET_MS;
        if sub_phase_elapsed || ctx.time_remaining_ms() < 1_000 {
            ctx.storage
                .write(&ctx.state_key(FINALIZE_PARTIAL_KEY), buffer.as_bytes())
                .map_err(|e| format!("failed to persist finalize partial: {e}"))?;
            state.finalize_chunk_idx = i;
            return Ok(StepOutcome::InProgress { inner: Some(state.clone()) });
        }

        let key = ctx.state_key(&format!("{CHUNKS_PREFIX}/{i}.tsv"));
        let chunk = ctx.storage.read(&key).map_err(|e| format!("failed to read chunk {i}: {e}"))?;
        cumulative += chunk.len() as u64;
        if cumulative > MAX_TOTAL_SIZE_BYTES {
            return Err("finalization_too_large".to_string());
        }
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        i += 1;
    }

    ctx.storage.write(&ctx.state_key(OUTPUT_KEY), buffer.as_bytes()).map_err(|e| format!("failed to write products.tsv: {e}"))?;

    ctx.storage.delete(&ctx.state_key(STOCK_INDEX_KEY)).ok();
    ctx.storage.delete(&ctx.state_key(PRICE_INDEX_KEY)).ok();
    ctx.storage.delete(&ctx.state_key(MATERIAL_META_KEY)).ok();
    ctx.storage.delete(&ctx.state_key(FINALIZE_PARTIAL_KEY)).ok();
    for j in 0..state.chunk_index {
        ctx.storage.delete(&ctx.state_key(&format!("{CHUNKS_PREFIX}/{j}.tsv"))).ok();
    }

    let mut metrics = BTreeMap::new();
    metrics.insert("products_total".to_string(), state.product_count);
    metrics.insert("skipped_no_stock".to_string(), state.skipped.no_stock);
    metrics.insert("skipped_no_price".to_string(), state.skipped.no_price);
    metrics.insert("skipped_low_stock".to_string(), state.skipped.low_stock);
    metrics.insert("skipped_no_valid".to_string(), state.skipped.no_valid);

    Ok(StepOutcome::CompletedWithMetrics(metrics))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_delimiter_picks_the_most_frequent_separator() {
        assert_eq!(detect_delimiter("a;b;c"), ';');
        assert_eq!(detect_delimiter("a\tb\tc"), '\t');
    }

    #[test]
    fn find_column_is_case_insensitive_and_alias_aware() {
        let fields = vec!["MatNr", "MPN", "ListPrice"];
        assert_eq!(find_column(&fields, MATNR_ALIASES), Some(0));
        assert_eq!(find_column(&fields, LIST_PRICE_ALIASES), Some(2));
        assert_eq!(find_column(&fields, EAN_ALIASES), None);
    }

    #[test]
    fn append_row_skips_without_stock_entry() {
        let meta = MaterialMeta {
            delimiter: '\t',
            columns: ColumnIndices { matnr: 0, mpn: None, ean: None, desc: None },
            header_end_pos: 0,
            total_bytes: 0,
            source_url: String::new(),
        };
        let mut skipped = SkippedCounts::default();
        let mut count = 0u64;
        let mut buffer = String::new();
        append_row(&mut buffer, "X1", &meta, &BTreeMap::new(), &BTreeMap::new(), &mut skipped, &mut count);
        assert_eq!(skipped.no_stock, 1);
        assert_eq!(count, 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn append_row_emits_a_row_when_stock_and_price_are_present() {
        let meta = MaterialMeta {
            delimiter: '\t',
            columns: ColumnIndices { matnr: 0, mpn: Some(1), ean: None, desc: None },
            header_end_pos: 0,
            total_bytes: 0,
            source_url: String::new(),
        };
        let mut stock = BTreeMap::new();
        stock.insert("X1".to_string(), 5);
        let mut price = BTreeMap::new();
        price.insert("X1".to_string(), PriceEntry { list_price: 10.0, cust_best_price: 0.0, surcharge: 0.0 });
        let mut skipped = SkippedCounts::default();
        let mut count = 0u64;
        let mut buffer = String::new();
        append_row(&mut buffer, "X1\tMPN-1", &meta, &stock, &price, &mut skipped, &mut count);
        assert_eq!(count, 1);
        assert!(buffer.starts_with("X1\tMPN-1\t\t\t5\t10"));
    }
}
