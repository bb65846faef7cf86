//! Core domain model, label vocabulary and value normalization for the vdv pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "vdv-core";

/// Retrieval/parsing strategy a source requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceShape {
    StaticHtml,
    Rendered,
    Api,
}

/// Position of a source in the daily step graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepGroup {
    Independent,
    TermDeposit,
    PolicyBroadcast,
    GlobalMacro,
    ExchangeRate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOptions {
    #[serde(default)]
    pub wait_selector: Option<String>,
    #[serde(default)]
    pub settle_ms: u64,
    #[serde(default = "default_render_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            wait_selector: None,
            settle_ms: 0,
            timeout_secs: default_render_timeout_secs(),
        }
    }
}

/// Bearer token requested from `token_endpoint` before the data request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAuth {
    pub token_endpoint: String,
    /// Top-level JSON string field of the token response holding the key.
    #[serde(default = "default_token_field")]
    pub token_field: String,
}

fn default_token_field() -> String {
    "results".to_string()
}

fn default_render_timeout_secs() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

fn default_pacing_ms() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    3
}

/// Static description of one external source, loaded once at process start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub shape: SourceShape,
    pub parser: String,
    pub step: StepGroup,
    /// URL template; `{date}` and any run variable such as `{range}` are substituted.
    pub endpoint: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub render: Option<RenderOptions>,
    #[serde(default)]
    pub auth: Option<TokenAuth>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceDescriptor {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Sources whose endpoint takes `{date}` can be asked for past days.
    pub fn is_dated(&self) -> bool {
        self.endpoint.contains("{date}")
    }

    pub fn resolve_endpoint(&self, date: NaiveDate, vars: &BTreeMap<String, String>) -> String {
        let mut url = self
            .endpoint
            .replace("{date}", &date.format("%Y-%m-%d").to_string());
        for (name, value) in vars {
            url = url.replace(&format!("{{{name}}}"), value);
        }
        url
    }
}

/// How a raw column value is turned into a number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueKind {
    /// Percentage points (`"3,000%"` -> `3.0`), comma decimals accepted.
    Rate { min: f64, max: f64 },
    /// Thousands-grouped integer (`"161.500"`), multiplied by `scale` after parsing.
    Grouped { scale: f64, min: f64, max: f64 },
    /// Plain decimal, comma decimals accepted.
    Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ValueKind,
}

const fn rate(name: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        kind: ValueKind::Rate { min: 0.0, max: 20.0 },
    }
}

const fn grouped(name: &'static str, scale: f64, min: f64, max: f64) -> ColumnSpec {
    ColumnSpec {
        name,
        kind: ValueKind::Grouped { scale, min, max },
    }
}

const fn decimal(name: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        kind: ValueKind::Decimal,
    }
}

// 24h.com.vn quotes in thousands of VND.
const GOLD_COLUMNS: &[ColumnSpec] = &[
    grouped("buy_price", 1_000.0, 0.0, 1.0e12),
    grouped("sell_price", 1_000.0, 0.0, 1.0e12),
];

const SILVER_COLUMNS: &[ColumnSpec] = &[
    grouped("buy_price", 1.0, 0.0, 1.0e12),
    grouped("sell_price", 1.0, 0.0, 1.0e12),
];

const INTERBANK_COLUMNS: &[ColumnSpec] = &[
    rate("ls_quadem"),
    decimal("doanhso_quadem"),
    rate("ls_1w"),
    decimal("doanhso_1w"),
    rate("ls_2w"),
    decimal("doanhso_2w"),
    rate("ls_1m"),
    decimal("doanhso_1m"),
    rate("ls_3m"),
    decimal("doanhso_3m"),
    rate("ls_6m"),
    decimal("doanhso_6m"),
    rate("ls_9m"),
    decimal("doanhso_9m"),
];

const CENTRAL_RATE_COLUMNS: &[ColumnSpec] = &[grouped("usd_vnd_rate", 1.0, 15_000.0, 40_000.0)];

const TERM_DEPOSIT_COLUMNS: &[ColumnSpec] = &[
    rate("term_noterm"),
    rate("term_1m"),
    rate("term_2m"),
    rate("term_3m"),
    rate("term_6m"),
    rate("term_9m"),
    rate("term_12m"),
    rate("term_13m"),
    rate("term_15m"),
    rate("term_18m"),
    rate("term_24m"),
    rate("term_36m"),
];

const POLICY_RATE_COLUMNS: &[ColumnSpec] = &[rate("rediscount_rate"), rate("refinancing_rate")];

const GLOBAL_MACRO_COLUMNS: &[ColumnSpec] = &[decimal("close_price")];

// VND per unit of foreign currency; JPY and KRW quote well below 1,000.
const EXCHANGE_RATE_COLUMNS: &[ColumnSpec] = &[
    decimal("buy_cash"),
    decimal("buy_transfer"),
    decimal("sell_rate"),
];

/// One relational table per series; every table is keyed by `(date, code column)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SeriesTable {
    #[serde(rename = "vn_gold_24h_hist")]
    Gold24h,
    #[serde(rename = "vn_silver_phuquy_hist")]
    SilverPhuQuy,
    #[serde(rename = "vn_sbv_interbankrate")]
    SbvInterbank,
    #[serde(rename = "vn_sbv_centralrate")]
    SbvCentralRate,
    #[serde(rename = "vn_bank_termdepo")]
    BankTermDeposit,
    #[serde(rename = "global_macro")]
    GlobalMacro,
    /// Keyed by `pair`, `BANK:CCY`; the database splits it into `bank` and `currency`.
    #[serde(rename = "vn_bank_exchange_rate")]
    BankExchangeRate,
}

impl SeriesTable {
    pub const ALL: [SeriesTable; 7] = [
        SeriesTable::Gold24h,
        SeriesTable::SilverPhuQuy,
        SeriesTable::SbvInterbank,
        SeriesTable::SbvCentralRate,
        SeriesTable::BankTermDeposit,
        SeriesTable::GlobalMacro,
        SeriesTable::BankExchangeRate,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            SeriesTable::Gold24h => "vn_gold_24h_hist",
            SeriesTable::SilverPhuQuy => "vn_silver_phuquy_hist",
            SeriesTable::SbvInterbank => "vn_sbv_interbankrate",
            SeriesTable::SbvCentralRate => "vn_sbv_centralrate",
            SeriesTable::BankTermDeposit => "vn_bank_termdepo",
            SeriesTable::GlobalMacro => "global_macro",
            SeriesTable::BankExchangeRate => "vn_bank_exchange_rate",
        }
    }

    pub fn code_column(self) -> &'static str {
        match self {
            SeriesTable::Gold24h | SeriesTable::SilverPhuQuy => "type",
            SeriesTable::SbvInterbank => "code",
            SeriesTable::SbvCentralRate => "currency",
            SeriesTable::BankTermDeposit => "bank_code",
            SeriesTable::GlobalMacro => "instrument",
            SeriesTable::BankExchangeRate => "pair",
        }
    }

    /// Columns written by insert-if-absent.
    pub fn columns(self) -> &'static [ColumnSpec] {
        match self {
            SeriesTable::Gold24h => GOLD_COLUMNS,
            SeriesTable::SilverPhuQuy => SILVER_COLUMNS,
            SeriesTable::SbvInterbank => INTERBANK_COLUMNS,
            SeriesTable::SbvCentralRate => CENTRAL_RATE_COLUMNS,
            SeriesTable::BankTermDeposit => TERM_DEPOSIT_COLUMNS,
            SeriesTable::GlobalMacro => GLOBAL_MACRO_COLUMNS,
            SeriesTable::BankExchangeRate => EXCHANGE_RATE_COLUMNS,
        }
    }

    /// Nullable columns only ever set by a broadcast update.
    pub fn broadcast_columns(self) -> &'static [ColumnSpec] {
        match self {
            SeriesTable::BankTermDeposit => POLICY_RATE_COLUMNS,
            _ => &[],
        }
    }

    pub fn column(self, name: &str) -> Option<&'static ColumnSpec> {
        self.columns()
            .iter()
            .chain(self.broadcast_columns())
            .find(|c| c.name == name)
    }

    pub fn is_broadcast_column(self, name: &str) -> bool {
        self.broadcast_columns().iter().any(|c| c.name == name)
    }
}

impl fmt::Display for SeriesTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    /// Observation date, the date the value is valid for.
    pub date: NaiveDate,
    pub code: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.date, self.code)
    }
}

/// Normalized observation ready for the upsert writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub table: SeriesTable,
    pub key: RecordKey,
    pub crawl_time: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl CanonicalRecord {
    pub fn value(&self, column: &str) -> Option<f64> {
        self.values.get(column).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

impl RawValue {
    pub fn text(value: impl Into<String>) -> Self {
        RawValue::Text(value.into())
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Number(n) => write!(f, "{n}"),
            RawValue::Text(s) => f.write_str(s),
        }
    }
}

/// Raw extracted value plus where in the payload it was found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawField {
    pub value: RawValue,
    pub pointer: String,
}

/// Partially-typed field map handed from adapters to the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub table: SeriesTable,
    /// Observation date when the payload carries one; the run date otherwise.
    pub date: Option<NaiveDate>,
    pub code: String,
    pub source_url: String,
    pub fields: BTreeMap<String, RawField>,
}

impl RawRecord {
    pub fn new(table: SeriesTable, code: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            table,
            date: None,
            code: code.into(),
            source_url: source_url.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    /// First value found for a field wins.
    pub fn insert(&mut self, field: &str, value: RawValue, pointer: impl Into<String>) {
        self.fields.entry(field.to_string()).or_insert(RawField {
            value,
            pointer: pointer.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Accepted language variants of one semantic field label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelVocabulary {
    pub field: &'static str,
    pub variants: &'static [&'static str],
}

pub const POLICY_RATE_LABELS: &[LabelVocabulary] = &[
    LabelVocabulary {
        field: "rediscount_rate",
        variants: &["tái chiết khấu", "rediscount"],
    },
    LabelVocabulary {
        field: "refinancing_rate",
        variants: &["tái cấp vốn", "refinancing"],
    },
];

pub const CENTRAL_RATE_LABELS: &[LabelVocabulary] = &[
    LabelVocabulary {
        field: "usd_vnd_rate",
        variants: &["đô la mỹ", "us dollar", "usd"],
    },
    LabelVocabulary {
        field: "issue_date",
        variants: &["ngày ban hành", "ngày áp dụng", "issue date", "effective date"],
    },
];

/// Text that marks a table as the central exchange rate table.
pub const CENTRAL_RATE_TABLE_MARKERS: &[&str] = &[
    "tỷ giá trung tâm",
    "central exchange rate",
    "central rate",
    "đô la mỹ",
];

const NO_TERM_LABELS: &[&str] = &["không kỳ hạn", "no term", "non-term", "demand"];

const TERM_UNITS: &[&str] = &["tháng", "months", "month"];

/// Lowercase (Unicode) and collapse every whitespace run, including NBSP, to one space.
pub fn fold_label(text: &str) -> String {
    text.split(|c: char| c.is_whitespace() || c == '\u{a0}')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Case-insensitive substring match of `label` against every variant of every field.
pub fn match_label(vocabulary: &[LabelVocabulary], label: &str) -> Option<&'static str> {
    let folded = fold_label(label);
    vocabulary
        .iter()
        .find(|entry| entry.variants.iter().any(|v| folded.contains(v)))
        .map(|entry| entry.field)
}

pub fn contains_any(text: &str, needles: &[&str]) -> bool {
    let folded = fold_label(text);
    needles.iter().any(|n| folded.contains(n))
}

/// Map a deposit term label (`"1 tháng"`, `"12 months"`, `"6T"`, `"Không kỳ hạn"`) to its column.
pub fn parse_term_label(label: &str) -> Option<&'static str> {
    let folded = fold_label(label);
    if NO_TERM_LABELS.iter().any(|v| folded.contains(v)) {
        return SeriesTable::BankTermDeposit
            .column("term_noterm")
            .map(|c| c.name);
    }

    let digits: String = folded.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let rest = folded[digits.len()..].trim_start();
    let unit_ok = TERM_UNITS.iter().any(|u| rest.starts_with(u)) || {
        let mut chars = rest.chars();
        matches!(chars.next(), Some('t' | 'm')) && !chars.next().is_some_and(char::is_alphabetic)
    };
    if !unit_ok {
        return None;
    }

    let months: u32 = digits.parse().ok()?;
    let column = format!("term_{months}m");
    SeriesTable::BankTermDeposit
        .columns()
        .iter()
        .find(|c| c.name == column)
        .map(|c| c.name)
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum NormalizationError {
    #[error("field `{field}`: unparsable value {raw:?}")]
    Unparsable { field: String, raw: String },
    #[error("field `{field}`: value {value} outside [{min}, {max}]")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("field `{field}` is not a writable column of {table}")]
    UnknownField { table: String, field: String },
}

/// Strip `%`, `*` and whitespace, turn a comma decimal into a period, then parse.
pub fn parse_decimal(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '%' | '*' | '\u{a0}'))
        .collect();
    let cleaned = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a thousands-grouped integer such as `"161.500"` or `"25,069"`.
pub fn parse_grouped(text: &str) -> Option<f64> {
    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '.' | ',' | '\u{a0}'))
        .collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<f64>().ok()
}

pub fn normalize(column: &ColumnSpec, raw: &RawValue) -> Result<f64, NormalizationError> {
    let unparsable = || NormalizationError::Unparsable {
        field: column.name.to_string(),
        raw: raw.to_string(),
    };
    let (value, bounds) = match (column.kind, raw) {
        (ValueKind::Rate { min, max }, RawValue::Number(n)) => (*n, Some((min, max))),
        (ValueKind::Rate { min, max }, RawValue::Text(t)) => {
            (parse_decimal(t).ok_or_else(unparsable)?, Some((min, max)))
        }
        (ValueKind::Grouped { scale, min, max }, RawValue::Number(n)) => (n * scale, Some((min, max))),
        (ValueKind::Grouped { scale, min, max }, RawValue::Text(t)) => {
            (parse_grouped(t).ok_or_else(unparsable)? * scale, Some((min, max)))
        }
        (ValueKind::Decimal, RawValue::Number(n)) => (*n, None),
        (ValueKind::Decimal, RawValue::Text(t)) => (parse_decimal(t).ok_or_else(unparsable)?, None),
    };

    if !value.is_finite() {
        return Err(unparsable());
    }
    if let Some((min, max)) = bounds {
        if value < min || value > max {
            return Err(NormalizationError::OutOfRange {
                field: column.name.to_string(),
                value,
                min,
                max,
            });
        }
    }
    Ok(value)
}

/// A field left unset, with the payload location it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldIssue {
    pub field: String,
    pub pointer: String,
    pub error: NormalizationError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    /// `None` when no field survived normalization.
    pub record: Option<CanonicalRecord>,
    pub issues: Vec<FieldIssue>,
}

fn normalize_fields(
    table: SeriesTable,
    fields: &BTreeMap<String, RawField>,
    allowed: &[ColumnSpec],
) -> (BTreeMap<String, f64>, Vec<FieldIssue>) {
    let mut values = BTreeMap::new();
    let mut issues = Vec::new();
    for (name, field) in fields {
        let result = match allowed.iter().find(|c| c.name == name) {
            Some(column) => normalize(column, &field.value),
            None => Err(NormalizationError::UnknownField {
                table: table.to_string(),
                field: name.clone(),
            }),
        };
        match result {
            Ok(value) => {
                values.insert(name.clone(), value);
            }
            Err(error) => issues.push(FieldIssue {
                field: name.clone(),
                pointer: field.pointer.clone(),
                error,
            }),
        }
    }
    (values, issues)
}

pub fn normalize_record(
    raw: &RawRecord,
    default_date: NaiveDate,
    crawl_time: DateTime<Utc>,
) -> NormalizedRecord {
    let (values, issues) = normalize_fields(raw.table, &raw.fields, raw.table.columns());
    let record = (!values.is_empty()).then(|| CanonicalRecord {
        table: raw.table,
        key: RecordKey {
            date: raw.date.unwrap_or(default_date),
            code: raw.code.clone(),
        },
        crawl_time,
        values,
    });
    NormalizedRecord { record, issues }
}

/// Normalize fields destined for a broadcast update; only broadcast columns are accepted.
pub fn normalize_broadcast(raw: &RawRecord) -> (BTreeMap<String, f64>, Vec<FieldIssue>) {
    normalize_fields(raw.table, &raw.fields, raw.table.broadcast_columns())
}

/// Error taxonomy used in step reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Extraction,
    Normalization,
    WriteConflict,
    DependencyOrder,
    Store,
    Config,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Transport => "transport",
            FailureKind::Extraction => "extraction",
            FailureKind::Normalization => "normalization",
            FailureKind::WriteConflict => "write_conflict",
            FailureKind::DependencyOrder => "dependency_order",
            FailureKind::Store => "store",
            FailureKind::Config => "config",
        };
        f.write_str(name)
    }
}

/// Summarizer output persisted per date, replacing any earlier artifact for that date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisArtifact {
    pub date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub content: String,
    pub global_data_points: i32,
    pub domestic_data_points: i32,
}
