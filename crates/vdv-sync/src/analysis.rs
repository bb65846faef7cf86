//! Downstream trigger: build the recent-history window and hand it to the summarizer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};
use vdv_core::{AnalysisArtifact, SeriesTable};

use crate::store::{SeriesStore, StoreError};

/// Instruments pivoted into the global series, by column of [`GlobalObservation`].
pub const GLOBAL_GOLD: &str = "GC=F";
pub const GLOBAL_SILVER: &str = "SI=F";
pub const GLOBAL_NASDAQ: &str = "^IXIC";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalObservation {
    pub date: NaiveDate,
    pub gold: Option<f64>,
    pub silver: Option<f64>,
    pub nasdaq: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceObservation {
    pub date: NaiveDate,
    pub code: String,
    pub buy_price: Option<f64>,
    pub sell_price: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DomesticSeries {
    pub gold: Vec<PriceObservation>,
    pub silver: Vec<PriceObservation>,
}

impl DomesticSeries {
    pub fn is_empty(&self) -> bool {
        self.gold.is_empty() && self.silver.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisWindow {
    pub run_date: NaiveDate,
    pub days: usize,
    pub global_series: Vec<GlobalObservation>,
    pub domestic_series: DomesticSeries,
}

impl AnalysisWindow {
    pub fn global_points(&self) -> usize {
        self.global_series.len()
    }

    pub fn domestic_points(&self) -> usize {
        self.domestic_series.gold.len() + self.domestic_series.silver.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SummarizeError {
    #[error("summarizer request failed: {0}")]
    Request(String),
    #[error("summarizer timed out after {0:?}")]
    Timeout(Duration),
    #[error("summarizer returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("summarizer reply contained no text")]
    EmptyReply,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, window: &AnalysisWindow) -> Result<String, SummarizeError>;
}

#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gemini-2.5-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Gemini `generateContent` client. One attempt per call.
#[derive(Debug, Clone)]
pub struct GeminiSummarizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl GeminiSummarizer {
    /// `None` when no API key is configured.
    pub fn from_config(config: &SummarizerConfig) -> anyhow::Result<Option<Self>> {
        let Some(api_key) = config.api_key.clone().filter(|k| !k.trim().is_empty()) else {
            return Ok(None);
        };
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = format!(
            "{}/v1beta/models/{}:generateContent",
            config.base_url.trim_end_matches('/'),
            config.model
        );
        Ok(Some(Self {
            client,
            endpoint,
            api_key,
            timeout,
        }))
    }
}

#[async_trait]
impl Summarizer for GeminiSummarizer {
    async fn summarize(&self, window: &AnalysisWindow) -> Result<String, SummarizeError> {
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": build_prompt(window) }] }]
        });
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    SummarizeError::Timeout(self.timeout)
                } else {
                    SummarizeError::Request(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SummarizeError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        let reply: JsonValue = response
            .json()
            .await
            .map_err(|err| SummarizeError::Request(err.to_string()))?;
        let text = reply_text(&reply).ok_or(SummarizeError::EmptyReply)?;
        Ok(strip_code_fences(&text))
    }
}

fn reply_text(reply: &JsonValue) -> Option<String> {
    let parts = reply
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(JsonValue::as_str))
        .collect::<Vec<_>>()
        .join("");
    (!text.trim().is_empty()).then_some(text)
}

/// Drop a surrounding Markdown code fence (```markdown ... ```) if the model added one.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
        .to_string()
}

pub fn percent_change(first: f64, last: f64) -> Option<f64> {
    (first != 0.0).then(|| (last - first) / first * 100.0)
}

fn series_change<T>(points: &[T], value: impl Fn(&T) -> Option<f64>) -> Option<f64> {
    let first = points.iter().find_map(&value)?;
    let last = points.iter().rev().find_map(&value)?;
    percent_change(first, last)
}

pub fn build_prompt(window: &AnalysisWindow) -> String {
    let global = &window.global_series;
    let domestic = &window.domestic_series;
    let changes = [
        ("Global gold (GC=F)", series_change(global, |o| o.gold)),
        ("Global silver (SI=F)", series_change(global, |o| o.silver)),
        ("NASDAQ composite", series_change(global, |o| o.nasdaq)),
        (
            "Domestic gold, sell",
            series_change(&domestic.gold, |o| o.sell_price),
        ),
        (
            "Domestic silver, sell",
            series_change(&domestic.silver, |o| o.sell_price),
        ),
    ];
    let change_lines = changes
        .iter()
        .map(|(label, change)| match change {
            Some(pct) => format!("- {label}: {pct:+.2}%"),
            None => format!("- {label}: n/a"),
        })
        .collect::<Vec<_>>()
        .join("\n");
    let data = serde_json::to_string_pretty(&json!({
        "global_series": global,
        "domestic_series": domestic,
    }))
    .unwrap_or_default();

    format!(
        "You are a market analyst covering Vietnamese precious metals.\n\
         Write a short Markdown report for {date} comparing the last {days} days of \
         global gold, silver and NASDAQ prices with domestic gold and silver prices. \
         Point out divergences between the domestic and global moves.\n\n\
         ## Change over the window\n{change_lines}\n\n## Data\n```json\n{data}\n```\n",
        date = window.run_date,
        days = window.days,
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisReport {
    Completed {
        date: NaiveDate,
        global_data_points: usize,
        domestic_data_points: usize,
    },
    Skipped {
        reason: String,
    },
    MissingData {
        global_data_points: usize,
        domestic_data_points: usize,
    },
    Failed {
        reason: String,
    },
}

pub struct DownstreamTrigger {
    store: Arc<dyn SeriesStore>,
    summarizer: Option<Arc<dyn Summarizer>>,
    days: usize,
    gold_code: String,
    timeout: Duration,
}

impl DownstreamTrigger {
    pub fn new(
        store: Arc<dyn SeriesStore>,
        summarizer: Option<Arc<dyn Summarizer>>,
        days: usize,
        gold_code: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            summarizer,
            days: days.max(1),
            gold_code: gold_code.into(),
            timeout,
        }
    }

    pub async fn build_window(&self, run_date: NaiveDate) -> Result<AnalysisWindow, StoreError> {
        let mut pivot: BTreeMap<NaiveDate, GlobalObservation> = BTreeMap::new();
        for instrument in [GLOBAL_GOLD, GLOBAL_SILVER, GLOBAL_NASDAQ] {
            let rows = self
                .store
                .recent_records(SeriesTable::GlobalMacro, Some(instrument), run_date, self.days)
                .await?;
            for row in rows {
                let entry = pivot.entry(row.key.date).or_insert(GlobalObservation {
                    date: row.key.date,
                    gold: None,
                    silver: None,
                    nasdaq: None,
                });
                let close = row.value("close_price");
                match instrument {
                    GLOBAL_GOLD => entry.gold = close,
                    GLOBAL_SILVER => entry.silver = close,
                    _ => entry.nasdaq = close,
                }
            }
        }
        let mut global_series = pivot.into_values().collect::<Vec<_>>();
        let excess = global_series.len().saturating_sub(self.days);
        global_series.drain(..excess);

        let prices = |rows: Vec<vdv_core::CanonicalRecord>| {
            rows.into_iter()
                .map(|row| PriceObservation {
                    buy_price: row.value("buy_price"),
                    sell_price: row.value("sell_price"),
                    date: row.key.date,
                    code: row.key.code,
                })
                .collect::<Vec<_>>()
        };
        let gold = self
            .store
            .recent_records(SeriesTable::Gold24h, Some(&self.gold_code), run_date, self.days)
            .await?;
        let silver = self
            .store
            .recent_records(SeriesTable::SilverPhuQuy, None, run_date, self.days)
            .await?;

        Ok(AnalysisWindow {
            run_date,
            days: self.days,
            global_series,
            domestic_series: DomesticSeries {
                gold: prices(gold),
                silver: prices(silver),
            },
        })
    }

    /// Never fails the caller: every outcome, including errors, is a report variant.
    pub async fn run(&self, run_date: NaiveDate) -> AnalysisReport {
        let Some(summarizer) = self.summarizer.as_ref() else {
            info!(%run_date, "no summarizer configured, analysis skipped");
            return AnalysisReport::Skipped {
                reason: "no summarizer configured".to_string(),
            };
        };

        let window = match self.build_window(run_date).await {
            Ok(window) => window,
            Err(err) => {
                warn!(%run_date, error = %err, "building analysis window failed");
                return AnalysisReport::Failed {
                    reason: err.to_string(),
                };
            }
        };
        let global_data_points = window.global_points();
        let domestic_data_points = window.domestic_points();
        if window.global_series.is_empty() || window.domestic_series.is_empty() {
            warn!(
                %run_date,
                global_data_points, domestic_data_points, "analysis window incomplete"
            );
            return AnalysisReport::MissingData {
                global_data_points,
                domestic_data_points,
            };
        }

        let content = match tokio::time::timeout(self.timeout, summarizer.summarize(&window)).await {
            Ok(Ok(content)) => content,
            Ok(Err(err)) => {
                warn!(%run_date, error = %err, "summarizer failed");
                return AnalysisReport::Failed {
                    reason: err.to_string(),
                };
            }
            Err(_) => {
                let err = SummarizeError::Timeout(self.timeout);
                warn!(%run_date, error = %err, "summarizer failed");
                return AnalysisReport::Failed {
                    reason: err.to_string(),
                };
            }
        };

        let artifact = AnalysisArtifact {
            date: run_date,
            generated_at: Utc::now(),
            content,
            global_data_points: i32::try_from(global_data_points).unwrap_or(i32::MAX),
            domestic_data_points: i32::try_from(domestic_data_points).unwrap_or(i32::MAX),
        };
        if let Err(err) = self.store.upsert_analysis(&artifact).await {
            warn!(%run_date, error = %err, "storing analysis failed");
            return AnalysisReport::Failed {
                reason: err.to_string(),
            };
        }
        info!(%run_date, global_data_points, domestic_data_points, "analysis stored");
        AnalysisReport::Completed {
            date: run_date,
            global_data_points,
            domestic_data_points,
        }
    }
}
