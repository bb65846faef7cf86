//! Source adapter contracts, the three shape variants and the shared extraction helpers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;
use vdv_core::{FailureKind, RawRecord, RawValue, SourceDescriptor, SourceShape, TokenAuth};
use vdv_storage::{FetchError, FetchRequest, HttpFetcher, RawFetchResult};

pub mod extract;
pub mod render;

pub use extract::{html_extractor, json_extractor, HtmlExtractor, JsonExtractor};
pub use render::{ChromiumRenderer, PageRenderer, RenderConfig, RenderError};

pub const CRATE_NAME: &str = "vdv-adapters";

const HTML_ACCEPT: &str = "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8";
const JSON_ACCEPT: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    /// Endpoint template variables besides `{date}`, e.g. `range`.
    pub vars: BTreeMap<String, String>,
    /// Local offset used to turn source instants into observation dates.
    pub utc_offset_hours: i32,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, run_date: NaiveDate) -> Self {
        Self {
            run_id,
            run_date,
            vars: BTreeMap::from([("range".to_string(), "5d".to_string())]),
            utc_offset_hours: 7,
        }
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        (instant + ChronoDuration::hours(i64::from(self.utc_offset_hours))).date_naive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("{source_id}: none of the expected fields were found ({detail})")]
    FieldsMissing { source_id: String, detail: String },
    #[error("{source_id}: payload could not be decoded: {reason}")]
    Undecodable { source_id: String, reason: String },
    #[error("invalid selector `{css}`: {reason}")]
    InvalidSelector { css: String, reason: String },
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("adapter configuration for {source_id}: {reason}")]
    Config { source_id: String, reason: String },
}

impl AdapterError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AdapterError::Transport(_) => FailureKind::Transport,
            AdapterError::Extraction(_) => FailureKind::Extraction,
            AdapterError::Config { .. } => FailureKind::Config,
        }
    }
}

/// What an extractor knows about the payload it is reading.
#[derive(Debug, Clone, Copy)]
pub struct ExtractScope<'a> {
    pub descriptor: &'a SourceDescriptor,
    pub url: &'a str,
    pub ctx: &'a AdapterContext,
}

impl ExtractScope<'_> {
    /// Series code from the descriptor, or `fallback` when the source does not set one.
    pub fn code_or(&self, fallback: &str) -> String {
        self.descriptor
            .code
            .clone()
            .unwrap_or_else(|| fallback.to_string())
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;

    fn shape(&self) -> SourceShape;

    fn source_id(&self) -> &str {
        &self.descriptor().source_id
    }

    async fn retrieve(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<RawFetchResult, AdapterError>;

    /// Never returns an empty list: a payload with nothing usable is `FieldsMissing`.
    fn extract(
        &self,
        raw: &RawFetchResult,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, ExtractionError>;
}

fn endpoint(descriptor: &SourceDescriptor, ctx: &AdapterContext) -> String {
    descriptor.resolve_endpoint(ctx.run_date, &ctx.vars)
}

fn non_empty(
    descriptor: &SourceDescriptor,
    mut records: Vec<RawRecord>,
) -> Result<Vec<RawRecord>, ExtractionError> {
    records.retain(|r| !r.is_empty());
    if records.is_empty() {
        return Err(ExtractionError::FieldsMissing {
            source_id: descriptor.source_id.clone(),
            detail: format!("parser `{}` matched nothing", descriptor.parser),
        });
    }
    debug!(
        source_id = %descriptor.source_id,
        records = records.len(),
        "extracted raw records"
    );
    Ok(records)
}

fn extract_html(
    descriptor: &SourceDescriptor,
    extractor: &dyn HtmlExtractor,
    raw: &RawFetchResult,
    ctx: &AdapterContext,
) -> Result<Vec<RawRecord>, ExtractionError> {
    let document = Html::parse_document(&raw.text());
    let scope = ExtractScope {
        descriptor,
        url: &raw.final_url,
        ctx,
    };
    non_empty(descriptor, extractor.extract(&document, &scope)?)
}

pub struct StaticHtmlAdapter {
    descriptor: SourceDescriptor,
    extractor: Box<dyn HtmlExtractor>,
}

impl StaticHtmlAdapter {
    pub fn new(descriptor: SourceDescriptor, extractor: Box<dyn HtmlExtractor>) -> Self {
        Self {
            descriptor,
            extractor,
        }
    }
}

#[async_trait]
impl SourceAdapter for StaticHtmlAdapter {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn shape(&self) -> SourceShape {
        SourceShape::StaticHtml
    }

    async fn retrieve(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<RawFetchResult, AdapterError> {
        let request = FetchRequest::get(endpoint(&self.descriptor, ctx)).accept(HTML_ACCEPT);
        Ok(http.fetch(ctx.run_id, &self.descriptor, request).await?)
    }

    fn extract(
        &self,
        raw: &RawFetchResult,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        extract_html(&self.descriptor, self.extractor.as_ref(), raw, ctx)
    }
}

/// Headless-browser retrieval; the rendered DOM goes through the same HTML extractors.
pub struct RenderedPageAdapter {
    descriptor: SourceDescriptor,
    extractor: Box<dyn HtmlExtractor>,
    renderer: Arc<dyn PageRenderer>,
}

impl RenderedPageAdapter {
    pub fn new(
        descriptor: SourceDescriptor,
        extractor: Box<dyn HtmlExtractor>,
        renderer: Arc<dyn PageRenderer>,
    ) -> Self {
        Self {
            descriptor,
            extractor,
            renderer,
        }
    }
}

#[async_trait]
impl SourceAdapter for RenderedPageAdapter {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn shape(&self) -> SourceShape {
        SourceShape::Rendered
    }

    async fn retrieve(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<RawFetchResult, AdapterError> {
        let url = endpoint(&self.descriptor, ctx);
        let options = self.descriptor.render.clone().unwrap_or_default();
        let span = info_span!(
            "render",
            run_id = %ctx.run_id,
            source_id = %self.descriptor.source_id,
            url = %url
        );

        let retried = http
            .run_with_retries(
                &url,
                self.descriptor.pacing(),
                self.descriptor.max_attempts(),
                |_| {
                    let renderer = Arc::clone(&self.renderer);
                    let url = url.clone();
                    let options = options.clone();
                    async move {
                        renderer
                            .render(&url, &options)
                            .await
                            .map_err(RenderError::into_attempt_failure)
                    }
                },
            )
            .instrument(span)
            .await?;

        let mut fetched = RawFetchResult::from_body(
            self.descriptor.source_id.clone(),
            url,
            Some("text/html"),
            retried.value.into_bytes(),
        );
        fetched.attempts = retried.attempts;
        fetched.retry_delays = retried.retry_delays;
        Ok(fetched)
    }

    fn extract(
        &self,
        raw: &RawFetchResult,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        extract_html(&self.descriptor, self.extractor.as_ref(), raw, ctx)
    }
}

pub struct RestAdapter {
    descriptor: SourceDescriptor,
    extractor: Box<dyn JsonExtractor>,
}

impl RestAdapter {
    pub fn new(descriptor: SourceDescriptor, extractor: Box<dyn JsonExtractor>) -> Self {
        Self {
            descriptor,
            extractor,
        }
    }

    /// Short-lived API key issued by the provider's token endpoint, fetched once per run.
    async fn request_token(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        auth: &TokenAuth,
    ) -> Result<String, AdapterError> {
        let request = FetchRequest::get(auth.token_endpoint.clone()).accept(JSON_ACCEPT);
        let issued = http.fetch(ctx.run_id, &self.descriptor, request).await?;
        let token = serde_json::from_slice::<JsonValue>(&issued.body)
            .ok()
            .and_then(|body| json_str(&body, &[auth.token_field.as_str()]).map(str::to_string))
            .and_then(text_or_none);
        token.ok_or_else(|| {
            AdapterError::Transport(FetchError::Permanent {
                url: auth.token_endpoint.clone(),
                attempts: issued.attempts,
                status: Some(issued.status),
                reason: format!("token response has no `{}` string", auth.token_field),
            })
        })
    }
}

#[async_trait]
impl SourceAdapter for RestAdapter {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn shape(&self) -> SourceShape {
        SourceShape::Api
    }

    async fn retrieve(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<RawFetchResult, AdapterError> {
        let mut request = FetchRequest::get(endpoint(&self.descriptor, ctx)).accept(JSON_ACCEPT);
        if let Some(auth) = &self.descriptor.auth {
            request = request.bearer(self.request_token(http, ctx, auth).await?);
        }
        Ok(http.fetch(ctx.run_id, &self.descriptor, request).await?)
    }

    fn extract(
        &self,
        raw: &RawFetchResult,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let payload: JsonValue =
            serde_json::from_slice(&raw.body).map_err(|err| ExtractionError::Undecodable {
                source_id: self.descriptor.source_id.clone(),
                reason: err.to_string(),
            })?;
        let scope = ExtractScope {
            descriptor: &self.descriptor,
            url: &raw.final_url,
            ctx,
        };
        non_empty(&self.descriptor, self.extractor.extract(&payload, &scope)?)
    }
}

/// Pick the shape variant named by the descriptor and wire in its extractor.
pub fn adapter_for(
    descriptor: &SourceDescriptor,
    renderer: Option<Arc<dyn PageRenderer>>,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    let config_error = |reason: String| AdapterError::Config {
        source_id: descriptor.source_id.clone(),
        reason,
    };
    let unknown_parser = || {
        config_error(format!(
            "parser `{}` is not available for shape {:?}",
            descriptor.parser, descriptor.shape
        ))
    };

    match descriptor.shape {
        SourceShape::StaticHtml => {
            let extractor = html_extractor(&descriptor.parser).ok_or_else(unknown_parser)?;
            Ok(Box::new(StaticHtmlAdapter::new(descriptor.clone(), extractor)))
        }
        SourceShape::Rendered => {
            let extractor = html_extractor(&descriptor.parser).ok_or_else(unknown_parser)?;
            let renderer = renderer
                .ok_or_else(|| config_error("no page renderer configured".to_string()))?;
            Ok(Box::new(RenderedPageAdapter::new(
                descriptor.clone(),
                extractor,
                renderer,
            )))
        }
        SourceShape::Api => {
            let extractor = json_extractor(&descriptor.parser).ok_or_else(unknown_parser)?;
            Ok(Box::new(RestAdapter::new(descriptor.clone(), extractor)))
        }
    }
}

pub fn selector(css: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|err| ExtractionError::InvalidSelector {
        css: css.to_string(),
        reason: err.to_string(),
    })
}

/// Element text with whitespace runs (NBSP included) collapsed to single spaces.
pub fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split(|c: char| c.is_whitespace() || c == '\u{a0}')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub fn page_text(document: &Html) -> String {
    collapse_whitespace(&document.root_element().text().collect::<Vec<_>>().join(" "))
}

/// One `tr` with its `td`/`th` cells, addressed by table and row index.
#[derive(Debug, Clone)]
pub struct TableRow<'a> {
    pub table: ElementRef<'a>,
    pub table_index: usize,
    pub row_index: usize,
    pub cells: Vec<ElementRef<'a>>,
}

impl TableRow<'_> {
    pub fn text(&self, cell: usize) -> Option<String> {
        self.cells.get(cell).map(|c| element_text(*c))
    }

    pub fn pointer(&self, cell: usize) -> String {
        format!(
            "table[{}]/tr[{}]/td[{}]",
            self.table_index, self.row_index, cell
        )
    }
}

/// Every table row in document order.
pub fn table_rows(document: &Html) -> Result<Vec<TableRow<'_>>, ExtractionError> {
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("td, th")?;

    let mut rows = Vec::new();
    for (table_index, table) in document.select(&table_sel).enumerate() {
        for (row_index, row) in table.select(&row_sel).enumerate() {
            rows.push(TableRow {
                table,
                table_index,
                row_index,
                cells: row.select(&cell_sel).collect(),
            });
        }
    }
    Ok(rows)
}

/// JSON scalar as a raw value; null, empty strings and containers are treated as absent.
pub fn json_raw_value(value: &JsonValue) -> Option<RawValue> {
    match value {
        JsonValue::Number(n) => n.as_f64().map(RawValue::Number),
        JsonValue::String(s) => text_or_none(s.clone()).map(RawValue::Text),
        _ => None,
    }
}

pub fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = match segment.parse::<usize>() {
            Ok(index) => cur.get(index)?,
            Err(_) => cur.get(*segment)?,
        };
    }
    Some(cur)
}

pub fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}
