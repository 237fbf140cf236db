//! Marketplace export steps. Each reads `products_overridden.tsv`, applies its own
//! eligibility filter and stock-split resolution, and writes a marketplace
//! template artifact. Amazon additionally mutates a macro-bearing `.xlsm`
//! template byte-for-byte and must stay coherent with the plain-text price
//! file it emits alongside it.

use std::io::{Cursor, Read, Write as _};

use rust_xlsxwriter::Workbook;
use zip::{ZipArchive, ZipWriter, write::SimpleFileOptions};

use conveyor_pricing::{normalize_ean, resolve_marketplace_stock};

use super::downstream::{OVERRIDE_OUTPUT_KEY, PricedRow, cents_to_comma, load_location_index, parse_priced_rows};
use super::{StepContext, StepOutcome};

const AMAZON_TEMPLATE_KEY: &str = "templates/ListingLoader.xlsm";
pub(super) const AMAZON_XLSM_OUTPUT_KEY: &str = "outputs/amazon_listing_loader.xlsm";
pub(super) const AMAZON_TXT_OUTPUT_KEY: &str = "outputs/amazon_price_inventory.txt";
pub(super) const MEDIAWORLD_OUTPUT_KEY: &str = "outputs/Export Mediaworld.xlsx";
pub(super) const EPRICE_OUTPUT_KEY: &str = "outputs/Export ePrice.xlsx";

/// Amazon's `ListingLoader.xlsm` sheet/inventory row: product identity plus
/// the resolved stock-split quantity and lead time.
struct AmazonRow {
    sku: String,
    ean: String,
    price_final_cents: i64,
    qty: i64,
    lead_days: u32,
}

fn read_overridden_rows(ctx: &StepContext) -> Result<Vec<PricedRow>, String> {
    let bytes = ctx
        .storage
        .read(&ctx.state_key(OVERRIDE_OUTPUT_KEY))
        .map_err(|e| format!("{OVERRIDE_OUTPUT_KEY} missing: {e}"))?;
    parse_priced_rows(&bytes)
}

fn valid_ean13_or_14(raw: &str) -> Option<String> {
    let normalized = normalize_ean(raw);
    normalized.value.filter(|_| normalized.ok).filter(|v| v.len() == 13 || v.len() == 14)
}

fn ends_in_comma99(cents: i64) -> bool {
    cents > 0 && cents.rem_euclid(100) == 99
}

/// Amazon eligibility: valid EAN 13/14, non-empty SKU,
/// `resolveMarketplaceStock` says `should_export` with `qty >= 2`, and the
/// final price is positive and ends in `,99`.
fn amazon_eligible_rows(ctx: &StepContext, rows: &[PricedRow]) -> Vec<AmazonRow> {
    let location_index = load_location_index(ctx);
    let cfg = ctx.config.marketplace.amazon;
    let mut out = Vec::new();
    for row in rows {
        let sku = row.product.matnr.trim();
        if sku.is_empty() {
            continue;
        }
        let Some(ean) = valid_ean13_or_14(&row.product.ean) else { continue };
        if !ends_in_comma99(row.price_final_cents) {
            continue;
        }
        let (stock_it, stock_eu) = location_index.get(sku).copied().unwrap_or((row.product.stock, 0));
        let resolution = resolve_marketplace_stock(stock_it, stock_eu, cfg.include_eu, cfg.it_prep_days, cfg.eu_prep_days);
        if !resolution.should_export || resolution.qty < 2 {
            continue;
        }
        out.push(AmazonRow {
            sku: sku.to_string(),
            ean,
            price_final_cents: row.price_final_cents,
            qty: resolution.qty,
            lead_days: resolution.lead_days,
        });
    }
    out.sort_by(|a, b| a.sku.cmp(&b.sku));
    out
}

/// Mutate the macro-bearing `.xlsm` template in place: replace only the
/// data-sheet XML entries and leave `vbaProject.bin` and every other zip
/// entry byte-identical, so Excel's macro signature survives untouched.
fn mutate_amazon_template(template_bytes: &[u8], rows: &[AmazonRow]) -> Result<Vec<u8>, String> {
    let reader = Cursor::new(template_bytes);
    let mut archive = ZipArchive::new(reader).map_err(|e| format!("corrupt amazon template: {e}"))?;

    let sheet_xml = render_amazon_sheet_xml(rows);

    let mut out_bytes = Vec::new();
    {
        let mut writer = ZipWriter::new(Cursor::new(&mut out_bytes));
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| format!("reading template entry {i}: {e}"))?;
            let name = entry.name().to_string();
            let options = SimpleFileOptions::default();
            if name == "xl/worksheets/sheet1.xml" {
                writer
                    .start_file(&name, options)
                    .map_err(|e| format!("writing {name}: {e}"))?;
                writer.write_all(sheet_xml.as_bytes()).map_err(|e| format!("writing {name}: {e}"))?;
            } else {
                let mut content = Vec::new();
                entry.read_to_end(&mut content).map_err(|e| format!("reading {name}: {e}"))?;
                writer
                    .start_file(&name, options)
                    .map_err(|e| format!("writing {name}: {e}"))?;
                writer.write_all(&content).map_err(|e| format!("writing {name}: {e}"))?;
            }
        }
        writer.finish().map_err(|e| format!("finalizing archive: {e}"))?;
    }
    Ok(out_bytes)
}

fn render_amazon_sheet_xml(rows: &[AmazonRow]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n<worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><sheetData>\n",
    );
    xml.push_str("<row r=\"1\"><c t=\"inlineStr\"><is><t>sku</t></is></c><c t=\"inlineStr\"><is><t>ean</t></is></c><c t=\"inlineStr\"><is><t>price</t></is></c><c t=\"inlineStr\"><is><t>quantity</t></is></c><c t=\"inlineStr\"><is><t>handling-time</t></is></c></row>\n");
    for (i, row) in rows.iter().enumerate() {
        let r = i + 2;
        xml.push_str(&format!(
            "<row r=\"{r}\"><c t=\"inlineStr\"><is><t>{}</t></is></c><c t=\"inlineStr\"><is><t>{}</t></is></c><c t=\"inlineStr\"><is><t>{}</t></is></c><c t=\"inlineStr\"><is><t>{}</t></is></c><c t=\"inlineStr\"><is><t>{}</t></is></c></row>\n",
            xml_escape(&row.sku),
            row.ean,
            cents_to_comma(row.price_final_cents),
            row.qty,
            row.lead_days,
        ));
    }
    xml.push_str("</sheetData></worksheet>");
    xml
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Amazon's flat-file fulfillment channel for every row this pipeline ships
/// (merchant-fulfilled, not Fulfillment by Amazon).
const AMAZON_FULFILLMENT_CHANNEL: &str = "DEFAULT";

fn render_amazon_price_inventory_txt(rows: &[AmazonRow]) -> String {
    let mut out = String::from(
        "sku\tprice\tminimum-seller-allowed-price\tmaximum-seller-allowed-price\tquantity\tfulfillment-channel\thandling-time\n",
    );
    for row in rows {
        let price = cents_to_comma(row.price_final_cents);
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            row.sku, price, price, price, row.qty, AMAZON_FULFILLMENT_CHANNEL, row.lead_days
        ));
    }
    out
}

pub fn run_amazon(ctx: &StepContext) -> StepOutcome {
    let rows = match read_overridden_rows(ctx) {
        Ok(r) => r,
        Err(reason) => return StepOutcome::Failed { reason },
    };
    let eligible = amazon_eligible_rows(ctx, &rows);

    let template = match ctx.storage.read(AMAZON_TEMPLATE_KEY) {
        Ok(b) => b,
        Err(e) => return StepOutcome::Failed { reason: format!("amazon template missing: {e}") },
    };

    let xlsm_bytes = match mutate_amazon_template(&template, &eligible) {
        Ok(b) => b,
        Err(reason) => return StepOutcome::Failed { reason },
    };
    let txt = render_amazon_price_inventory_txt(&eligible);

    // Scenario F: the xlsm row count and the txt line count must match
    // exactly, in the same order, or the marketplace receives inconsistent
    // catalog state across two files. Re-parse what was just written rather
    // than trust the render step.
    let txt_rows = txt.lines().count().saturating_sub(1);
    if txt_rows != eligible.len() {
        return StepOutcome::Failed {
            reason: format!("amazon export row mismatch: txt has {txt_rows} rows, expected {}", eligible.len()),
        };
    }

    if let Err(e) = ctx.storage.write(&ctx.state_key(AMAZON_XLSM_OUTPUT_KEY), &xlsm_bytes) {
        return StepOutcome::Failed { reason: format!("failed to write {AMAZON_XLSM_OUTPUT_KEY}: {e}") };
    }
    if let Err(e) = ctx.storage.write(&ctx.state_key(AMAZON_TXT_OUTPUT_KEY), txt.as_bytes()) {
        return StepOutcome::Failed { reason: format!("failed to write {AMAZON_TXT_OUTPUT_KEY}: {e}") };
    }

    ctx.log_info("amazon_export_complete", serde_json::json!({"rows": eligible.len()}));
    StepOutcome::Completed
}

/// The 22-column template schema shared by MediaWorld and ePrice exports.
/// Both marketplaces consume the same column layout; only the
/// output filename and stock-split config differ.
const TEMPLATE_COLUMNS: [&str; 22] = [
    "SKU", "EAN", "Title", "Description", "Brand", "Category", "Price", "VAT",
    "Stock", "LeadTimeDays", "Weight", "Length", "Width", "Height", "Condition",
    "Currency", "Warranty", "ImageUrl", "ManufacturerPartNumber", "ShippingCost",
    "CarrierCode", "Notes",
];

fn render_marketplace_template(ctx: &StepContext, rows: &[PricedRow], cfg: conveyor_config::MarketplaceStockConfig) -> Result<Vec<u8>, String> {
    let location_index = load_location_index(ctx);
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    for (col, header) in TEMPLATE_COLUMNS.iter().enumerate() {
        sheet
            .write_string(0, col as u16, *header)
            .map_err(|e| format!("failed to write header column {col}: {e}"))?;
    }

    let mut r = 1u32;
    for row in rows {
        let Some(ean) = valid_ean13_or_14(&row.product.ean) else { continue };
        let (stock_it, stock_eu) = location_index
            .get(row.product.matnr.trim())
            .copied()
            .unwrap_or((row.product.stock, 0));
        let resolution = resolve_marketplace_stock(stock_it, stock_eu, cfg.include_eu, cfg.it_prep_days, cfg.eu_prep_days);
        if !resolution.should_export {
            continue;
        }

        let values: [&str; 22] = [
            &row.product.matnr,
            &ean,
            &row.product.desc,
            &row.product.desc,
            "",
            "",
            &cents_to_comma(row.price_final_cents),
            "22",
            &resolution.qty.to_string(),
            &resolution.lead_days.to_string(),
            "", "", "", "", "new", "EUR", "", "", "", "0,00", "", "",
        ];
        for (col, value) in values.iter().enumerate() {
            sheet
                .write_string(r, col as u16, *value)
                .map_err(|e| format!("failed to write row {r} column {col}: {e}"))?;
        }
        r += 1;
    }

    workbook.save_to_buffer().map_err(|e| format!("failed to render workbook: {e}"))
}

pub fn run_mediaworld(ctx: &StepContext) -> StepOutcome {
    let rows = match read_overridden_rows(ctx) {
        Ok(r) => r,
        Err(reason) => return StepOutcome::Failed { reason },
    };
    let bytes = match render_marketplace_template(ctx, &rows, ctx.config.marketplace.mediaworld) {
        Ok(b) => b,
        Err(reason) => return StepOutcome::Failed { reason },
    };
    if let Err(e) = ctx.storage.write(&ctx.state_key(MEDIAWORLD_OUTPUT_KEY), &bytes) {
        return StepOutcome::Failed { reason: format!("failed to write {MEDIAWORLD_OUTPUT_KEY}: {e}") };
    }
    StepOutcome::Completed
}

pub fn run_eprice(ctx: &StepContext) -> StepOutcome {
    let rows = match read_overridden_rows(ctx) {
        Ok(r) => r,
        Err(reason) => return StepOutcome::Failed { reason },
    };
    let bytes = match render_marketplace_template(ctx, &rows, ctx.config.marketplace.eprice) {
        Ok(b) => b,
        Err(reason) => return StepOutcome::Failed { reason },
    };
    if let Err(e) = ctx.storage.write(&ctx.state_key(EPRICE_OUTPUT_KEY), &bytes) {
        return StepOutcome::Failed { reason: format!("failed to write {EPRICE_OUTPUT_KEY}: {e}") };
    }
    StepOutcome::Completed
}
