//! Per-source extractors, looked up by the `parser` name in the source registry.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use serde_json::Value as JsonValue;
use vdv_core::{
    contains_any, fold_label, match_label, normalize, parse_term_label, RawRecord, RawValue,
    SeriesTable, CENTRAL_RATE_LABELS, CENTRAL_RATE_TABLE_MARKERS, POLICY_RATE_LABELS,
};

use crate::{
    element_text, json_at, json_raw_value, json_str, page_text, selector, table_rows,
    text_or_none, ExtractScope, ExtractionError,
};

static TERM_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d{1,2})\s*(?:tháng|months?)[^\d]*?(\d+[.,]\d+)").expect("term regex")
});
static NO_TERM_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)không kỳ hạn[^\d]*?(\d+[.,]\d+)").expect("no-term regex"));
static VND_AMOUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\d.,]+)\s*VND").expect("vnd amount regex"));
static DMY_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{2})/(\d{2})/(\d{4})").expect("dd/mm/yyyy regex"));
static CENTRAL_RATE_TEXT: Lazy<[Regex; 3]> = Lazy::new(|| {
    [
        Regex::new(r"(?i)Đô la Mỹ[^\d]*([\d.,]+)\s*VND").expect("central rate regex"),
        Regex::new(r"(?i)USD[^\d]*(\d{2}[.,]\d{3})\s*VND").expect("central rate regex"),
        Regex::new(r"(?i)1\s*(?:Đô la Mỹ|USD)\s*=\s*([\d.,]+)").expect("central rate regex"),
    ]
});

/// Currencies kept from the bank exchange-rate boards.
const FOCUS_CURRENCIES: &[&str] = &[
    "USD", "EUR", "JPY", "GBP", "CNY", "AUD", "SGD", "KRW", "THB", "CAD", "CHF", "HKD", "NZD",
    "TWD", "MYR",
];

/// Interbank API term labels and their column suffixes.
const INTERBANK_TERMS: &[(&str, &str)] = &[
    ("qua đêm", "quadem"),
    ("1 tuần", "1w"),
    ("2 tuần", "2w"),
    ("1 tháng", "1m"),
    ("3 tháng", "3m"),
    ("6 tháng", "6m"),
    ("9 tháng", "9m"),
];

pub trait HtmlExtractor: Send + Sync {
    fn extract(
        &self,
        document: &Html,
        scope: &ExtractScope<'_>,
    ) -> Result<Vec<RawRecord>, ExtractionError>;
}

pub trait JsonExtractor: Send + Sync {
    fn extract(
        &self,
        payload: &JsonValue,
        scope: &ExtractScope<'_>,
    ) -> Result<Vec<RawRecord>, ExtractionError>;
}

pub fn html_extractor(parser: &str) -> Option<Box<dyn HtmlExtractor>> {
    match parser {
        "gold_24h" => Some(Box::new(Gold24h)),
        "term_deposit" => Some(Box::new(TermDeposit)),
        "policy_rates" => Some(Box::new(PolicyRates)),
        "central_rate" => Some(Box::new(CentralRate)),
        _ => None,
    }
}

pub fn json_extractor(parser: &str) -> Option<Box<dyn JsonExtractor>> {
    match parser {
        "sbv_interbank" => Some(Box::new(SbvInterbank)),
        "giabac_silver" => Some(Box::new(GiabacSilver)),
        "yahoo_chart" => Some(Box::new(YahooChart)),
        "vcb_exchange_rates" => Some(Box::new(VcbExchangeRates)),
        "vnappmob_exchange_rates" => Some(Box::new(VnAppMobExchangeRates)),
        _ => None,
    }
}

/// Brand rows of the 24h.com.vn gold table; prices are quoted in thousands of VND.
#[derive(Debug, Clone, Copy)]
pub struct Gold24h;

impl HtmlExtractor for Gold24h {
    fn extract(
        &self,
        document: &Html,
        scope: &ExtractScope<'_>,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let brand_sel = selector("h2")?;
        let price_sel = selector("span.fixW")?;
        let price_in = |cell: scraper::ElementRef<'_>| {
            cell.select(&price_sel)
                .next()
                .map(element_text)
                .or_else(|| element_text(cell).split(' ').next().map(str::to_string))
                .and_then(text_or_none)
        };

        let mut records = Vec::new();
        for row in table_rows(document)? {
            if row.cells.len() < 3 {
                continue;
            }
            let Some(brand) = row.cells[0].select(&brand_sel).next().map(element_text) else {
                continue;
            };
            let mut record = RawRecord::new(SeriesTable::Gold24h, brand, scope.url);
            for (index, field) in [(1, "buy_price"), (2, "sell_price")] {
                if let Some(price) = price_in(row.cells[index]) {
                    record.insert(field, RawValue::Text(price), row.pointer(index));
                }
            }
            records.push(record);
        }
        Ok(records)
    }
}

/// Bank deposit rate tables keyed by term label, with a page-text scan fallback.
#[derive(Debug, Clone, Copy)]
pub struct TermDeposit;

impl TermDeposit {
    fn from_tables(
        document: &Html,
        record: &mut RawRecord,
    ) -> Result<(), ExtractionError> {
        for row in table_rows(document)? {
            let Some(column) = row.text(0).as_deref().and_then(parse_term_label) else {
                continue;
            };
            let Some(definition) = SeriesTable::BankTermDeposit.column(column) else {
                continue;
            };
            let rate_cell = (1..row.cells.len()).find_map(|index| {
                let text = row.text(index)?;
                normalize(definition, &RawValue::text(text.clone()))
                    .ok()
                    .map(|_| (index, text))
            });
            if let Some((index, text)) = rate_cell {
                record.insert(column, RawValue::Text(text), row.pointer(index));
            }
        }
        Ok(())
    }

    fn from_text(document: &Html, record: &mut RawRecord) {
        let text = page_text(document);
        if let Some(caps) = NO_TERM_TEXT.captures(&text) {
            record.insert("term_noterm", RawValue::text(&caps[1]), "text:không kỳ hạn");
        }
        for caps in TERM_TEXT.captures_iter(&text) {
            let label = format!("{} tháng", &caps[1]);
            if let Some(column) = parse_term_label(&label) {
                record.insert(column, RawValue::text(&caps[2]), format!("text:{label}"));
            }
        }
    }
}

impl HtmlExtractor for TermDeposit {
    fn extract(
        &self,
        document: &Html,
        scope: &ExtractScope<'_>,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let code = scope.code_or(&scope.descriptor.source_id.to_uppercase());
        let mut record = RawRecord::new(SeriesTable::BankTermDeposit, code, scope.url);
        Self::from_tables(document, &mut record)?;
        if record.is_empty() {
            Self::from_text(document, &mut record);
        }
        Ok(vec![record])
    }
}

/// Policy rate label/value rows, matched in Vietnamese or English.
#[derive(Debug, Clone, Copy)]
pub struct PolicyRates;

impl HtmlExtractor for PolicyRates {
    fn extract(
        &self,
        document: &Html,
        scope: &ExtractScope<'_>,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let mut record = RawRecord::new(SeriesTable::BankTermDeposit, scope.code_or("SBV"), scope.url);
        for row in table_rows(document)? {
            if row.cells.len() < 2 {
                continue;
            }
            let Some(field) = row.text(0).as_deref().and_then(|l| match_label(POLICY_RATE_LABELS, l))
            else {
                continue;
            };
            let Some(value) = row.text(1).and_then(text_or_none) else {
                continue;
            };
            // The last numeric row for a label wins; header rows never displace a number.
            let replace = record.fields.get(field).is_some_and(|existing| {
                looks_numeric(&RawValue::text(value.clone())) || !looks_numeric(&existing.value)
            });
            if replace {
                record.fields.remove(field);
            }
            record.insert(field, RawValue::Text(value), row.pointer(1));
        }
        Ok(vec![record])
    }
}

fn looks_numeric(value: &RawValue) -> bool {
    match value {
        RawValue::Number(_) => true,
        RawValue::Text(text) => vdv_core::parse_decimal(text).is_some(),
    }
}

/// USD/VND central rate: structured table first, then page-text patterns.
#[derive(Debug, Clone, Copy)]
pub struct CentralRate;

impl CentralRate {
    fn structured(document: &Html, record: &mut RawRecord) -> Result<(), ExtractionError> {
        let rows = table_rows(document)?;
        for row in &rows {
            if row.cells.len() < 2 || !contains_any(&element_text(row.table), CENTRAL_RATE_TABLE_MARKERS)
            {
                continue;
            }
            let (Some(label), Some(value)) = (row.text(0), row.text(1)) else {
                continue;
            };
            match match_label(CENTRAL_RATE_LABELS, &label) {
                Some("usd_vnd_rate") => {
                    if let Some(caps) = VND_AMOUNT.captures(&value) {
                        record.insert("usd_vnd_rate", RawValue::text(&caps[1]), row.pointer(1));
                    }
                }
                Some("issue_date") => {
                    if record.date.is_none() {
                        record.date = dmy_date(&value);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn heuristic(document: &Html, record: &mut RawRecord) {
        let text = page_text(document);
        let Some(definition) = SeriesTable::SbvCentralRate.column("usd_vnd_rate") else {
            return;
        };
        let candidate = CENTRAL_RATE_TEXT.iter().find_map(|pattern| {
            let caps = pattern.captures(&text)?;
            let raw = caps[1].to_string();
            normalize(definition, &RawValue::text(raw.clone())).ok().map(|_| raw)
        });
        if let Some(raw) = candidate {
            record.insert("usd_vnd_rate", RawValue::Text(raw), "text:central-rate");
            if record.date.is_none() {
                record.date = dmy_date(&text);
            }
        }
    }
}

impl HtmlExtractor for CentralRate {
    fn extract(
        &self,
        document: &Html,
        scope: &ExtractScope<'_>,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let mut record = RawRecord::new(SeriesTable::SbvCentralRate, scope.code_or("USD"), scope.url);
        Self::structured(document, &mut record)?;
        if record.is_empty() {
            record.date = None;
            Self::heuristic(document, &mut record);
        }
        Ok(vec![record])
    }
}

fn dmy_date(text: &str) -> Option<NaiveDate> {
    let caps = DMY_DATE.captures(text)?;
    NaiveDate::from_ymd_opt(caps[3].parse().ok()?, caps[2].parse().ok()?, caps[1].parse().ok()?)
}

/// Latest item of the SBV headless-delivery interbank rate feed.
#[derive(Debug, Clone, Copy)]
pub struct SbvInterbank;

impl JsonExtractor for SbvInterbank {
    fn extract(
        &self,
        payload: &JsonValue,
        scope: &ExtractScope<'_>,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let Some(fields) = json_at(payload, &["items", "0", "contentFields"]).and_then(JsonValue::as_array)
        else {
            return Ok(Vec::new());
        };

        let mut record = RawRecord::new(SeriesTable::SbvInterbank, scope.code_or("SBV"), scope.url);
        for (index, field) in fields.iter().enumerate() {
            match json_str(field, &["name"]) {
                Some("ngayApDung") => {
                    record.date = json_str(field, &["contentFieldValue", "data"])
                        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                        .map(|instant| scope.ctx.local_date(instant.with_timezone(&Utc)));
                }
                Some("laiSuatThiTruongNganHangs") => {
                    let pointer = format!("/items/0/contentFields/{index}");
                    interbank_term(field, &pointer, &mut record);
                }
                _ => {}
            }
        }
        Ok(vec![record])
    }
}

fn interbank_term(field: &JsonValue, pointer: &str, record: &mut RawRecord) {
    let Some(nested) = field.get("nestedContentFields").and_then(JsonValue::as_array) else {
        return;
    };
    let value_of = |name: &str| {
        nested.iter().enumerate().find_map(|(index, f)| {
            (json_str(f, &["name"]) == Some(name)).then(|| {
                let value = json_at(f, &["contentFieldValue", "data"]).and_then(json_raw_value);
                (value, format!("{pointer}/nestedContentFields/{index}"))
            })
        })
    };

    let Some((Some(RawValue::Text(term)), _)) = value_of("thoihan") else {
        return;
    };
    let folded = fold_label(&term);
    let Some((_, suffix)) = INTERBANK_TERMS.iter().find(|(label, _)| *label == folded) else {
        return;
    };
    for (source, prefix) in [("laiSuatBQLienNganHang", "ls"), ("doanhSo", "doanhso")] {
        if let Some((Some(value), at)) = value_of(source) {
            record.insert(&format!("{prefix}_{suffix}"), value, at);
        }
    }
}

/// giabac.vn chart feed: parallel `Dates` / `LastBuyPrices` / `LastSellPrices` arrays.
#[derive(Debug, Clone, Copy)]
pub struct GiabacSilver;

impl JsonExtractor for GiabacSilver {
    fn extract(
        &self,
        payload: &JsonValue,
        scope: &ExtractScope<'_>,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let array = |name: &str| {
            payload
                .get(name)
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default()
        };
        let (dates, buys, sells) = (array("Dates"), array("LastBuyPrices"), array("LastSellPrices"));
        let code = scope.code_or("PHUQUY");

        let mut records = Vec::new();
        for (index, date) in dates.iter().enumerate() {
            let Some(date) = date.as_str().and_then(loose_date) else {
                continue;
            };
            let mut record = RawRecord::new(SeriesTable::SilverPhuQuy, code.clone(), scope.url)
                .with_date(date);
            for (values, field, name) in [
                (&buys, "buy_price", "LastBuyPrices"),
                (&sells, "sell_price", "LastSellPrices"),
            ] {
                if let Some(value) = values.get(index).and_then(json_raw_value) {
                    record.insert(field, value, format!("/{name}/{index}"));
                }
            }
            records.push(record);
        }
        Ok(records)
    }
}

fn loose_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").map(|dt| dt.date()))
        .ok()
        .or_else(|| raw.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()))
}

/// Yahoo Finance v8 chart: one record per trading day with a close.
#[derive(Debug, Clone, Copy)]
pub struct YahooChart;

impl JsonExtractor for YahooChart {
    fn extract(
        &self,
        payload: &JsonValue,
        scope: &ExtractScope<'_>,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let Some(result) = json_at(payload, &["chart", "result", "0"]) else {
            return Ok(Vec::new());
        };
        let code = scope
            .descriptor
            .code
            .clone()
            .or_else(|| json_str(result, &["meta", "symbol"]).map(str::to_string))
            .unwrap_or_else(|| scope.descriptor.source_id.clone());
        let offset = json_at(result, &["meta", "gmtoffset"])
            .and_then(JsonValue::as_i64)
            .unwrap_or(0);
        let timestamps = result
            .get("timestamp")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let closes = json_at(result, &["indicators", "quote", "0", "close"])
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();

        let mut records = Vec::new();
        for (index, ts) in timestamps.iter().enumerate() {
            let Some(secs) = ts.as_i64() else {
                continue;
            };
            let local = secs
                .checked_add(offset)
                .ok_or_else(|| ExtractionError::Undecodable {
                    source_id: scope.descriptor.source_id.clone(),
                    reason: format!("timestamp {secs} with gmtoffset {offset} is out of range"),
                })?;
            let Some(date) = DateTime::from_timestamp(local, 0).map(|dt| dt.date_naive()) else {
                continue;
            };
            let Some(close) = closes.get(index).and_then(json_raw_value) else {
                continue;
            };
            let mut record =
                RawRecord::new(SeriesTable::GlobalMacro, code.clone(), scope.url).with_date(date);
            record.insert(
                "close_price",
                close,
                format!("/chart/result/0/indicators/quote/0/close/{index}"),
            );
            records.push(record);
        }
        Ok(records)
    }
}

/// Vietcombank exchange-rate board; the `date` query selects a past day.
#[derive(Debug, Clone, Copy)]
pub struct VcbExchangeRates;

impl JsonExtractor for VcbExchangeRates {
    fn extract(
        &self,
        payload: &JsonValue,
        scope: &ExtractScope<'_>,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let bank = scope.code_or("VCB");
        let date = json_str(payload, &["Date"]).and_then(loose_date);
        let Some(items) = payload.get("Data").and_then(JsonValue::as_array) else {
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let Some(currency) = json_str(item, &["currencyCode"]).and_then(focus_currency) else {
                continue;
            };
            let mut record =
                RawRecord::new(SeriesTable::BankExchangeRate, format!("{bank}:{currency}"), scope.url);
            if let Some(date) = date {
                record = record.with_date(date);
            }
            for (source, field) in [
                ("cash", "buy_cash"),
                ("transfer", "buy_transfer"),
                ("sell", "sell_rate"),
            ] {
                if let Some(value) = item.get(source).and_then(quote_value) {
                    record.insert(field, value, format!("/Data/{index}/{source}"));
                }
            }
            if has_quote(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// VNAppMob exchange-rate feed for one bank; current day only, may repeat a currency.
#[derive(Debug, Clone, Copy)]
pub struct VnAppMobExchangeRates;

impl JsonExtractor for VnAppMobExchangeRates {
    fn extract(
        &self,
        payload: &JsonValue,
        scope: &ExtractScope<'_>,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let bank = scope.code_or(&scope.descriptor.source_id.to_uppercase());
        let Some(items) = payload.get("results").and_then(JsonValue::as_array) else {
            return Ok(Vec::new());
        };

        // Several rows per currency (note denominations); the best transfer rate wins.
        let mut best: BTreeMap<String, (f64, RawRecord)> = BTreeMap::new();
        for (index, item) in items.iter().enumerate() {
            let Some(currency) = json_str(item, &["currency"]).and_then(focus_currency) else {
                continue;
            };
            let mut record =
                RawRecord::new(SeriesTable::BankExchangeRate, format!("{bank}:{currency}"), scope.url);
            for (source, field) in [
                ("buy_cash", "buy_cash"),
                ("buy_transfer", "buy_transfer"),
                ("sell", "sell_rate"),
            ] {
                if let Some(value) = item.get(source).and_then(quote_value) {
                    record.insert(field, value, format!("/results/{index}/{source}"));
                }
            }
            if !has_quote(&record) {
                continue;
            }
            let transfer = record
                .fields
                .get("buy_transfer")
                .and_then(|f| quote_number(&f.value))
                .unwrap_or(0.0);
            if best.get(&currency).is_some_and(|(kept, _)| transfer <= *kept) {
                continue;
            }
            best.insert(currency, (transfer, record));
        }
        Ok(best.into_values().map(|(_, record)| record).collect())
    }
}

/// `"USD (50,100)"` and `" usd"` both become `USD`; currencies outside the focus list are dropped.
fn focus_currency(raw: &str) -> Option<String> {
    let code = raw
        .trim()
        .split(['(', ' '])
        .next()
        .unwrap_or_default()
        .to_uppercase();
    FOCUS_CURRENCIES.contains(&code.as_str()).then_some(code)
}

/// Board quotes use `,` as a thousands separator. Blank, dash and zero mean "not quoted";
/// anything else that does not parse is kept as text for the normalizer to report.
fn quote_value(value: &JsonValue) -> Option<RawValue> {
    let raw = json_raw_value(value)?;
    let dash = matches!(&raw, RawValue::Text(text) if text.trim() == "-");
    match quote_number(&raw) {
        Some(n) if n > 0.0 => Some(RawValue::Number(n)),
        Some(_) => None,
        None if dash => None,
        None => Some(raw),
    }
}

fn quote_number(value: &RawValue) -> Option<f64> {
    match value {
        RawValue::Number(n) => Some(*n),
        RawValue::Text(text) => text.replace(',', "").trim().parse::<f64>().ok(),
    }
}

/// A row without a transfer or sell quote carries nothing worth storing.
fn has_quote(record: &RawRecord) -> bool {
    record.fields.contains_key("buy_transfer") || record.fields.contains_key("sell_rate")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AdapterContext;
    use std::path::PathBuf;
    use uuid::Uuid;
    use vdv_core::{normalize_record, SourceDescriptor, SourceShape, StepGroup};

    fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(name: &str) -> String {
        let path = workspace_root().join("fixtures").join(name);
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn descriptor(parser: &str, code: Option<&str>) -> SourceDescriptor {
        SourceDescriptor {
            source_id: format!("fixture-{parser}"),
            display_name: parser.into(),
            enabled: true,
            shape: SourceShape::StaticHtml,
            parser: parser.into(),
            step: StepGroup::Independent,
            endpoint: "https://fixture.test".into(),
            code: code.map(str::to_string),
            pacing_ms: 0,
            max_attempts: 1,
            render: None,
            auth: None,
            notes: None,
        }
    }

    fn ctx() -> AdapterContext {
        AdapterContext::new(Uuid::new_v4(), day(2026, 1, 18))
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    fn run_html(parser: &str, code: Option<&str>, html: &str) -> Vec<RawRecord> {
        let descriptor = descriptor(parser, code);
        let ctx = ctx();
        let scope = ExtractScope {
            descriptor: &descriptor,
            url: "https://fixture.test",
            ctx: &ctx,
        };
        html_extractor(parser)
            .expect("html extractor")
            .extract(&Html::parse_document(html), &scope)
            .expect("extract")
    }

    fn run_json(parser: &str, code: Option<&str>, json: &str) -> Vec<RawRecord> {
        try_json(parser, code, json).expect("extract")
    }

    fn try_json(
        parser: &str,
        code: Option<&str>,
        json: &str,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let descriptor = descriptor(parser, code);
        let ctx = ctx();
        let scope = ExtractScope {
            descriptor: &descriptor,
            url: "https://fixture.test",
            ctx: &ctx,
        };
        let payload: JsonValue = serde_json::from_str(json).expect("json fixture");
        json_extractor(parser)
            .expect("json extractor")
            .extract(&payload, &scope)
    }

    fn text(record: &RawRecord, field: &str) -> String {
        record.fields[field].value.to_string()
    }

    #[test]
    fn policy_rates_vietnamese_and_english_agree() {
        let vi = run_html("policy_rates", None, &fixture("sbv_policy_rates_vi.html"));
        let en = run_html("policy_rates", None, &fixture("sbv_policy_rates_en.html"));

        for records in [&vi, &en] {
            assert_eq!(records.len(), 1);
            let (fields, issues) = vdv_core::normalize_broadcast(&records[0]);
            assert!(issues.is_empty(), "{issues:?}");
            assert_eq!(fields.get("rediscount_rate"), Some(&3.0));
            assert_eq!(fields.get("refinancing_rate"), Some(&4.5));
        }
        assert_eq!(text(&vi[0], "rediscount_rate"), "3,000%");
        assert_eq!(text(&en[0], "refinancing_rate"), "4.500%");
    }

    #[test]
    fn policy_rates_take_the_last_numeric_row_per_label() {
        let html = "<table><tr><td>Lãi suất tái cấp vốn</td><td>Giá trị</td></tr>\
                    <tr><td>Lãi suất tái cấp vốn</td><td>5,000%</td></tr>\
                    <tr><td>Lãi suất tái cấp vốn</td><td>4,500%</td></tr>\
                    <tr><td>Lãi suất tái cấp vốn</td><td>&nbsp;</td></tr></table>";
        let records = run_html("policy_rates", None, html);
        assert_eq!(text(&records[0], "refinancing_rate"), "4,500%");
    }

    #[test]
    fn policy_rates_keep_unparsable_values_for_the_normalizer() {
        let html = "<table><tr><td>Lãi suất tái chiết khấu</td><td>abc%</td></tr>\
                    <tr><td>Lãi suất tái cấp vốn</td><td>4,5%</td></tr></table>";
        let records = run_html("policy_rates", None, html);
        let (fields, issues) = vdv_core::normalize_broadcast(&records[0]);
        assert_eq!(fields.get("refinancing_rate"), Some(&4.5));
        assert!(!fields.contains_key("rediscount_rate"));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "rediscount_rate");
    }

    #[test]
    fn gold_rows_carry_brand_and_thousand_vnd_prices() {
        let records = run_html("gold_24h", None, &fixture("gold_24h.html"));
        let brands: Vec<_> = records.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(brands, vec!["SJC", "DOJI HN", "PNJ TP.HCM"]);

        let doji = &records[1];
        assert_eq!(text(doji, "buy_price"), "161,500");
        let normalized = normalize_record(doji, day(2026, 1, 18), Utc::now());
        let record = normalized.record.expect("record");
        assert_eq!(record.value("buy_price"), Some(161_500_000.0));
        assert_eq!(record.value("sell_price"), Some(163_500_000.0));
    }

    #[test]
    fn term_deposit_table_rows_map_to_term_columns() {
        let records = run_html("term_deposit", Some("ACB"), &fixture("acb_term_deposit.html"));
        let record = &records[0];
        assert_eq!(record.code, "ACB");
        assert_eq!(text(record, "term_1m"), "3,10");
        assert_eq!(text(record, "term_12m"), "4,70");
        assert_eq!(text(record, "term_36m"), "4,90*");
        assert!(!record.fields.contains_key("term_7m"));
    }

    #[test]
    fn term_deposit_falls_back_to_page_text() {
        let html = "<div><p>Không kỳ hạn: 0,10%</p><p>1 tháng 2,40 %</p>\
                    <p>6 tháng 3,50 %</p><p>12 tháng 4,80 %</p></div>";
        let records = run_html("term_deposit", Some("CTG"), html);
        let record = &records[0];
        assert_eq!(text(record, "term_noterm"), "0,10");
        assert_eq!(text(record, "term_1m"), "2,40");
        assert_eq!(text(record, "term_6m"), "3,50");
        assert_eq!(text(record, "term_12m"), "4,80");
    }

    #[test]
    fn central_rate_structured_layer_reads_rate_and_issue_date() {
        let records = run_html("central_rate", None, &fixture("sbv_central_rate.html"));
        let record = &records[0];
        assert_eq!(record.code, "USD");
        assert_eq!(record.date, Some(day(2026, 1, 16)));
        assert_eq!(text(record, "usd_vnd_rate"), "25.069");
    }

    #[test]
    fn central_rate_heuristic_layer_scans_page_text() {
        let html = "<div><p>Ngày 17/01/2026</p><p>Tỷ giá: 1 Đô la Mỹ = 25.071 VND</p></div>";
        let records = run_html("central_rate", None, html);
        assert_eq!(text(&records[0], "usd_vnd_rate"), "25.071");
        assert_eq!(records[0].date, Some(day(2026, 1, 17)));
    }

    #[test]
    fn interbank_feed_uses_local_date_and_term_columns() {
        let records = run_json("sbv_interbank", None, &fixture("sbv_interbank.json"));
        let record = &records[0];
        assert_eq!(record.code, "SBV");
        // 2026-01-16T17:00:00Z is 2026-01-17 in Hanoi.
        assert_eq!(record.date, Some(day(2026, 1, 17)));
        assert_eq!(text(record, "ls_quadem"), "4,25");
        assert_eq!(text(record, "doanhso_quadem"), "512345");
        assert_eq!(text(record, "ls_1w"), "4,6");
        assert!(!record.fields.contains_key("ls_2w"));
        assert!(record.fields.contains_key("doanhso_2w"));
    }

    #[test]
    fn silver_feed_emits_one_record_per_day() {
        let json = r#"{"Dates":["2026-01-16","2026-01-17","bad"],
                       "LastBuyPrices":[1520000,1535000,1],
                       "LastSellPrices":[1570000,null,1]}"#;
        let records = run_json("giabac_silver", None, json);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].date, Some(day(2026, 1, 16)));
        assert_eq!(records[0].code, "PHUQUY");
        assert!(records[1].fields.contains_key("buy_price"));
        assert!(!records[1].fields.contains_key("sell_price"));
    }

    #[test]
    fn yahoo_chart_skips_null_closes() {
        let records = run_json("yahoo_chart", Some("GC=F"), &fixture("yahoo_gc.json"));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].code, "GC=F");
        assert_eq!(records[0].date, Some(day(2026, 1, 15)));
        assert_eq!(records[1].date, Some(day(2026, 1, 16)));
        assert_eq!(records[1].fields["close_price"].value, RawValue::Number(4601.5));
    }

    #[test]
    fn vcb_board_keeps_focus_currencies_with_a_quote() {
        let records = run_json("vcb_exchange_rates", Some("VCB"), &fixture("vcb_exchange_rates.json"));
        let codes: Vec<_> = records.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["VCB:AUD", "VCB:EUR", "VCB:JPY", "VCB:KRW", "VCB:USD"]);
        assert!(records.iter().all(|r| r.date == Some(day(2026, 1, 16))));

        let usd = &records[4];
        assert_eq!(usd.fields["buy_transfer"].value, RawValue::Number(26_080.0));
        assert_eq!(usd.fields["sell_rate"].pointer, "/Data/5/sell");
        let krw = &records[3];
        assert!(!krw.fields.contains_key("buy_cash"));
        assert_eq!(krw.fields["buy_transfer"].value, RawValue::Number(17.12));

        let normalized = normalize_record(usd, day(2026, 1, 18), Utc::now());
        assert!(normalized.issues.is_empty());
        assert_eq!(normalized.record.unwrap().value("buy_cash"), Some(26_050.0));
    }

    #[test]
    fn vcb_board_leaves_garbled_quotes_to_the_normalizer() {
        let json = r#"{"Date":"2026-01-16T00:00:00","Data":[
            {"currencyCode":"USD","cash":"n/a","transfer":"26,080.00","sell":"26,390.00"}]}"#;
        let records = run_json("vcb_exchange_rates", None, json);
        assert_eq!(records[0].code, "VCB:USD");
        let normalized = normalize_record(&records[0], day(2026, 1, 18), Utc::now());
        assert_eq!(normalized.issues.len(), 1);
        assert_eq!(normalized.issues[0].field, "buy_cash");
    }

    #[test]
    fn vnappmob_feed_keeps_the_best_transfer_row_per_currency() {
        let records = run_json(
            "vnappmob_exchange_rates",
            Some("BID"),
            &fixture("vnappmob_exchange_rates.json"),
        );
        let codes: Vec<_> = records.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["BID:CNY", "BID:EUR", "BID:USD"]);
        assert!(records.iter().all(|r| r.date.is_none()));

        let usd = &records[2];
        assert_eq!(usd.fields["buy_transfer"].value, RawValue::Number(26_080.0));
        assert_eq!(usd.fields["buy_transfer"].pointer, "/results/1/buy_transfer");
        let cny = &records[0];
        assert_eq!(cny.fields.keys().collect::<Vec<_>>(), vec!["sell_rate"]);
    }

    #[test]
    fn yahoo_chart_rejects_overflowing_timestamps() {
        let json = format!(
            r#"{{"chart":{{"result":[{{"meta":{{"gmtoffset":3600}},"timestamp":[{}],
                "indicators":{{"quote":[{{"close":[1.0]}}]}}}}]}}}}"#,
            i64::MAX
        );
        let err = try_json("yahoo_chart", Some("GC=F"), &json).unwrap_err();
        assert!(matches!(err, ExtractionError::Undecodable { .. }));
    }
}
