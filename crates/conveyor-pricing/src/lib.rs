//! Pricing, EAN, and stock-split pure functions.
//!
//! Every function here is a pure, total function over plain values — no I/O,
//! no step state. They are the leaves of the dependency graph and are
//! exercised directly by property-based tests.

use conveyor_types::{MarketplaceStockResolution, NormalizedEan, StockSource};

// ---------------------------------------------------------------------------
// Locale-tolerant numeric parser
// ---------------------------------------------------------------------------

/// Parse a loosely-formatted numeric string, tolerating IT-locale
/// thousands/decimal separators and a trailing `%`. Returns `NaN` for
/// anything unparseable, matching the source's "never throw" contract.
pub fn parse_locale_number(raw: &str) -> f64 {
    let trimmed = raw.trim();

    let filtered: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | ' ' | '%' | '-'))
        .collect();

    let token = filtered.split_whitespace().next().unwrap_or("");
    let token = token.trim_end_matches('%');

    if token.is_empty() {
        return f64::NAN;
    }

    let has_dot = token.contains('.');
    let has_comma = token.contains(',');

    let normalized = if has_dot && has_comma {
        // IT format: "1.234,56" -> drop thousands dots, comma becomes decimal point.
        token.replace('.', "").replace(',', ".")
    } else {
        token.replace(',', ".")
    };

    normalized.parse::<f64>().unwrap_or(f64::NAN)
}

// ---------------------------------------------------------------------------
// Integer-cents arithmetic
// ---------------------------------------------------------------------------

/// The smallest integer-cents value `>= cents` whose last two digits are `99`.
pub fn to_comma99_cents(cents: i64) -> i64 {
    if cents.rem_euclid(100) == 99 {
        return cents;
    }
    let e = cents.div_euclid(100);
    let mut t = e * 100 + 99;
    if t < cents {
        t = (e + 1) * 100 + 99;
    }
    t
}

/// `round-half-up-away-from-zero`, the rounding mode used throughout the
/// price ladder.
fn round_half_away_from_zero(value: f64) -> i64 {
    if value >= 0.0 {
        (value + 0.5).floor() as i64
    } else {
        (value - 0.5).ceil() as i64
    }
}

/// Euro amount to integer cents, rounding half away from zero.
pub fn euros_to_cents(euros: f64) -> i64 {
    round_half_away_from_zero(euros * 100.0)
}

/// Inputs to the per-product price ladder.
#[derive(Debug, Clone, Copy)]
pub struct PriceInputs {
    pub list_price: f64,
    pub cust_best_price: f64,
    pub surcharge: f64,
    pub shipping: f64,
    pub vat_percent: f64,
    pub fee_drev: f64,
    pub fee_mkt: f64,
}

/// Output of the price ladder: the customer-facing `,99` price and the
/// integer-euro "list price with fee" ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLadderResult {
    pub final_cents: i64,
    pub list_with_fee_cents: i64,
}

/// Compute `PriceFinal` and `ListPriceWithFee` per the fee/shipping/VAT price ladder.
pub fn compute_price_ladder(inputs: PriceInputs) -> PriceLadderResult {
    let base_cents = if inputs.cust_best_price > 0.0 {
        euros_to_cents(inputs.cust_best_price + inputs.surcharge)
    } else {
        euros_to_cents(inputs.list_price)
    };

    let after1 = base_cents + euros_to_cents(inputs.shipping);
    let after2 = round_half_away_from_zero(after1 as f64 * (100.0 + inputs.vat_percent) / 100.0);
    let after3 = round_half_away_from_zero(after2 as f64 * inputs.fee_drev);
    let after4 = round_half_away_from_zero(after3 as f64 * inputs.fee_mkt);

    let final_cents = to_comma99_cents(after4);
    let list_with_fee_cents = ((after4 + 99) / 100) * 100; // ceil(after4/100)*100

    PriceLadderResult { final_cents, list_with_fee_cents }
}

// ---------------------------------------------------------------------------
// EAN normalization
// ---------------------------------------------------------------------------

/// Normalize an EAN/GTIN candidate to its canonical 13 (or, for genuine
/// GTIN-14s, 14) digit form.
pub fn normalize_ean(raw: &str) -> NormalizedEan {
    let collapsed: String = raw.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();

    if collapsed.is_empty() || !collapsed.chars().all(|c| c.is_ascii_digit()) {
        return NormalizedEan {
            ok: false,
            value: None,
            reason: Some(format!("invalid_length_{}", collapsed.len())),
        };
    }

    match collapsed.len() {
        12 => NormalizedEan {
            ok: true,
            value: Some(format!("0{collapsed}")),
            reason: None,
        },
        13 => NormalizedEan { ok: true, value: Some(collapsed), reason: None },
        14 => {
            if let Some(rest) = collapsed.strip_prefix('0') {
                NormalizedEan { ok: true, value: Some(rest.to_string()), reason: None }
            } else {
                NormalizedEan { ok: true, value: Some(collapsed), reason: None }
            }
        }
        n => NormalizedEan { ok: false, value: None, reason: Some(format!("invalid_length_{n}")) },
    }
}

// ---------------------------------------------------------------------------
// IT/EU stock split
// ---------------------------------------------------------------------------

/// `resolveMarketplaceStock`: pure total function over the IT/EU stock split.
pub fn resolve_marketplace_stock(
    stock_it: i64,
    stock_eu: i64,
    include_eu: bool,
    days_it: u32,
    days_eu: u32,
) -> MarketplaceStockResolution {
    if !include_eu {
        let should_export = stock_it >= 2;
        return MarketplaceStockResolution {
            qty: stock_it,
            source: StockSource::It,
            should_export,
            lead_days: if should_export { days_it } else { 0 },
        };
    }

    if stock_it >= 2 {
        return MarketplaceStockResolution {
            qty: stock_it,
            source: StockSource::It,
            should_export: true,
            lead_days: days_it,
        };
    }

    let qty = stock_it + stock_eu;
    let should_export = qty >= 2;
    MarketplaceStockResolution {
        qty,
        source: StockSource::EuFallback,
        should_export,
        lead_days: if should_export { days_eu } else { 0 },
    }
}

/// Location id bucketing for the stock-location ingest. Returns
/// `None` for the ignored `4255` bucket.
pub fn location_bucket(location_id: u32) -> Option<StockSource> {
    match location_id {
        4242 => Some(StockSource::It),
        4254 => Some(StockSource::EuFallback),
        4255 => None,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_handles_it_locale_thousands_and_decimal() {
        assert_eq!(parse_locale_number("1.234,56"), 1234.56);
    }

    #[test]
    fn parser_handles_us_locale_already_dotted() {
        assert_eq!(parse_locale_number("1,234.56"), 1234.56);
    }

    #[test]
    fn parser_strips_percent_sign() {
        assert_eq!(parse_locale_number("22%"), 22.0);
    }

    #[test]
    fn parser_returns_nan_for_garbage() {
        assert!(parse_locale_number("abc").is_nan());
    }

    #[test]
    fn comma99_pushes_up_to_next_99_ending() {
        assert_eq!(to_comma99_cents(1050), 1099);
        assert_eq!(to_comma99_cents(1099), 1099);
        assert_eq!(to_comma99_cents(1100), 1199);
        assert_eq!(to_comma99_cents(0), 99);
    }

    #[test]
    fn normalize_ean_pads_twelve_digits() {
        let r = normalize_ean("123456789012");
        assert!(r.ok);
        assert_eq!(r.value.unwrap().len(), 13);
    }

    #[test]
    fn normalize_ean_trims_leading_zero_gtin14() {
        let r = normalize_ean("01234567890128");
        assert!(r.ok);
        assert_eq!(r.value.unwrap(), "1234567890128");
    }

    #[test]
    fn normalize_ean_keeps_genuine_gtin14() {
        let r = normalize_ean("11234567890128");
        assert!(r.ok);
        assert_eq!(r.value.unwrap().len(), 14);
    }

    #[test]
    fn normalize_ean_rejects_non_digits() {
        let r = normalize_ean("12A456789012");
        assert!(!r.ok);
    }

    #[test]
    fn normalize_ean_rejects_bad_length() {
        let r = normalize_ean("123");
        assert!(!r.ok);
        assert_eq!(r.reason.unwrap(), "invalid_length_3");
    }

    #[test]
    fn resolve_marketplace_stock_six_golden_cases() {
        // includeEU=false, any stockIT
        assert_eq!(
            resolve_marketplace_stock(5, 0, false, 3, 7),
            MarketplaceStockResolution { qty: 5, source: StockSource::It, should_export: true, lead_days: 3 }
        );
        assert_eq!(
            resolve_marketplace_stock(1, 0, false, 3, 7),
            MarketplaceStockResolution { qty: 1, source: StockSource::It, should_export: false, lead_days: 0 }
        );
        // includeEU=true, stockIT >= 2
        assert_eq!(
            resolve_marketplace_stock(10, 3, true, 3, 7),
            MarketplaceStockResolution { qty: 10, source: StockSource::It, should_export: true, lead_days: 3 }
        );
        // includeEU=true, stockIT < 2, combined >= 2
        assert_eq!(
            resolve_marketplace_stock(1, 5, true, 3, 7),
            MarketplaceStockResolution { qty: 6, source: StockSource::EuFallback, should_export: true, lead_days: 7 }
        );
        // includeEU=true, stockIT < 2, combined < 2
        assert_eq!(
            resolve_marketplace_stock(0, 1, true, 3, 7),
            MarketplaceStockResolution { qty: 1, source: StockSource::EuFallback, should_export: false, lead_days: 0 }
        );
        // includeEU=true, stockIT == 0, stockEU == 0
        assert_eq!(
            resolve_marketplace_stock(0, 0, true, 3, 7),
            MarketplaceStockResolution { qty: 0, source: StockSource::EuFallback, should_export: false, lead_days: 0 }
        );
    }

    #[test]
    fn location_bucket_ignores_4255() {
        assert_eq!(location_bucket(4242), Some(StockSource::It));
        assert_eq!(location_bucket(4254), Some(StockSource::EuFallback));
        assert_eq!(location_bucket(4255), None);
    }

    proptest::proptest! {
        #[test]
        fn comma99_is_never_less_than_input(cents in -1_000_000i64..1_000_000) {
            let out = to_comma99_cents(cents);
            prop_assert!(out >= cents);
            prop_assert!(out - cents < 100);
            prop_assert_eq!(out.rem_euclid(100), 99);
        }

        #[test]
        fn comma99_is_idempotent_on_already_99_values(cents in -1_000_000i64..1_000_000) {
            let once = to_comma99_cents(cents);
            let twice = to_comma99_cents(once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn normalize_ean_is_idempotent_on_valid_output(digits in "[0-9]{12,14}") {
            let first = normalize_ean(&digits);
            if first.ok {
                let value = first.value.clone().unwrap();
                let second = normalize_ean(&value);
                prop_assert!(second.ok);
                prop_assert_eq!(second.value, first.value);
            }
        }

        #[test]
        fn resolve_marketplace_stock_should_export_matches_qty_threshold(
            stock_it in -5i64..20,
            stock_eu in -5i64..20,
            include_eu in proptest::bool::ANY,
        ) {
            let r = resolve_marketplace_stock(stock_it.max(0), stock_eu.max(0), include_eu, 1, 1);
            prop_assert_eq!(r.should_export, r.qty >= 2);
        }
    }
}
