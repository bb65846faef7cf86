//! Daily ingestion run: source registry, step graph, upserts, run reports and the analysis trigger.

pub mod analysis;
pub mod store;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use vdv_adapters::{
    adapter_for, AdapterContext, AdapterError, ChromiumRenderer, PageRenderer, RenderConfig,
};
use vdv_core::{
    normalize_broadcast, normalize_record, FailureKind, FieldIssue, RawRecord, SeriesTable,
    SourceDescriptor, StepGroup,
};
use vdv_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, RawArchive, RawFetchResult,
};

pub use analysis::{
    AnalysisReport, AnalysisWindow, DownstreamTrigger, GeminiSummarizer, Summarizer,
    SummarizerConfig, SummarizeError,
};
pub use store::{BroadcastOutcome, InMemoryStore, PgStore, SeriesStore, StoreError, WriteOutcome};

pub const CRATE_NAME: &str = "vdv-sync";

const BUILTIN_SOURCES: &str = include_str!("../../../sources.yaml");

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceDescriptor>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text).context("parsing source registry")?;
        let mut seen = std::collections::BTreeSet::new();
        for source in &registry.sources {
            anyhow::ensure!(
                seen.insert(source.source_id.as_str()),
                "duplicate source_id `{}` in registry",
                source.source_id
            );
        }
        Ok(registry)
    }

    /// Registry compiled into the binary, used when no sources file is present.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_SOURCES)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            warn!(path = %path.display(), "sources file not found, using built-in registry");
            return Self::builtin();
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn in_step(&self, step: StepGroup) -> Vec<&SourceDescriptor> {
        self.enabled().filter(|s| s.step == step).collect()
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: Option<String>,
    pub sources_file: PathBuf,
    pub reports_dir: PathBuf,
    pub raw_archive_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_workers: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub utc_offset_hours: i32,
    pub chrome_bin: Option<PathBuf>,
    pub summarizer: SummarizerConfig,
    pub analysis_days: usize,
    pub analysis_gold_code: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            sources_file: PathBuf::from("sources.yaml"),
            reports_dir: PathBuf::from("./reports"),
            raw_archive_dir: None,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) vdv-ingest/0.1".to_string(),
            http_timeout_secs: 20,
            max_workers: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            utc_offset_hours: 7,
            chrome_bin: None,
            summarizer: SummarizerConfig::default(),
            analysis_days: 7,
            analysis_gold_code: "DOJI HN".to_string(),
        }
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_opt(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let summarizer_defaults = defaults.summarizer.clone();
        Self {
            database_url: env_opt("DATABASE_URL"),
            sources_file: env_opt("VDV_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            reports_dir: env_opt("VDV_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            raw_archive_dir: env_opt("VDV_RAW_ARCHIVE_DIR").map(PathBuf::from),
            user_agent: env_opt("VDV_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("VDV_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            max_workers: env_parse("VDV_MAX_WORKERS", defaults.max_workers).max(1),
            backoff_base_ms: env_parse("VDV_BACKOFF_BASE_MS", defaults.backoff_base_ms),
            backoff_max_ms: env_parse("VDV_BACKOFF_MAX_MS", defaults.backoff_max_ms),
            utc_offset_hours: env_parse("VDV_UTC_OFFSET_HOURS", defaults.utc_offset_hours),
            chrome_bin: env_opt("CHROME_BIN").map(PathBuf::from),
            summarizer: SummarizerConfig {
                api_key: env_opt("GEMINI_API_KEY"),
                model: env_opt("GEMINI_MODEL").unwrap_or(summarizer_defaults.model),
                base_url: env_opt("GEMINI_BASE_URL").unwrap_or(summarizer_defaults.base_url),
                timeout_secs: env_parse(
                    "VDV_SUMMARIZER_TIMEOUT_SECS",
                    summarizer_defaults.timeout_secs,
                ),
            },
            analysis_days: env_parse("VDV_ANALYSIS_DAYS", defaults.analysis_days),
            analysis_gold_code: env_opt("VDV_ANALYSIS_GOLD_CODE")
                .unwrap_or(defaults.analysis_gold_code),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.max_workers.max(1),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
                ..BackoffPolicy::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::PartiallyFailed | StepStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: StepStatus) -> bool {
        match self {
            StepStatus::Pending => next == StepStatus::Running,
            StepStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal step transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: StepStatus,
    pub to: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsetField {
    pub code: String,
    pub field: String,
    pub pointer: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub source_id: String,
    pub step: StepGroup,
    pub status: StepStatus,
    pub failure: Option<StepFailure>,
    pub attempts: u32,
    pub records_extracted: usize,
    pub rows_written: usize,
    pub rows_skipped: usize,
    /// Rows updated by a broadcast step.
    pub rows_touched: u64,
    pub fields_unset: Vec<UnsetField>,
    pub write_conflicts: Vec<String>,
    pub warnings: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepReport {
    pub fn pending(descriptor: &SourceDescriptor) -> Self {
        Self {
            source_id: descriptor.source_id.clone(),
            step: descriptor.step,
            status: StepStatus::Pending,
            failure: None,
            attempts: 0,
            records_extracted: 0,
            rows_written: 0,
            rows_skipped: 0,
            rows_touched: 0,
            fields_unset: Vec::new(),
            write_conflicts: Vec::new(),
            warnings: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn transition(&mut self, next: StepStatus) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        match next {
            StepStatus::Running => self.started_at = Some(Utc::now()),
            _ => self.finished_at = Some(Utc::now()),
        }
        self.status = next;
        Ok(())
    }

    fn fail(&mut self, kind: FailureKind, message: impl Into<String>) {
        let message = message.into();
        warn!(source_id = %self.source_id, %kind, error = %message, "step failure");
        self.failure = Some(StepFailure { kind, message });
    }

    fn note_issues(&mut self, code: &str, issues: Vec<FieldIssue>) {
        for issue in issues {
            warn!(
                source_id = %self.source_id,
                code,
                field = %issue.field,
                pointer = %issue.pointer,
                error = %issue.error,
                "field left unset"
            );
            self.fields_unset.push(UnsetField {
                code: code.to_string(),
                field: issue.field,
                pointer: issue.pointer,
                reason: issue.error.to_string(),
            });
        }
    }

    /// Terminal status from what was recorded while the step ran.
    pub fn outcome(&self) -> StepStatus {
        match &self.failure {
            Some(failure)
                if matches!(
                    failure.kind,
                    FailureKind::Transport | FailureKind::Store | FailureKind::Config
                ) =>
            {
                StepStatus::Failed
            }
            Some(_) => StepStatus::PartiallyFailed,
            None if !self.fields_unset.is_empty() || !self.write_conflicts.is_empty() => {
                StepStatus::PartiallyFailed
            }
            None => StepStatus::Succeeded,
        }
    }

    fn advance(&mut self, next: StepStatus) {
        if let Err(err) = self.transition(next) {
            warn!(source_id = %self.source_id, error = %err, "step tracker rejected transition");
        }
    }

    fn conclude(mut self) -> Self {
        let outcome = self.outcome();
        self.advance(outcome);
        info!(
            source_id = %self.source_id,
            status = ?self.status,
            attempts = self.attempts,
            rows_written = self.rows_written,
            rows_skipped = self.rows_skipped,
            rows_touched = self.rows_touched,
            fields_unset = self.fields_unset.len(),
            "step finished"
        );
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl RunStatus {
    /// `Failed` only when every step failed; an empty run counts as succeeded.
    pub fn from_steps(steps: &[StepReport]) -> Self {
        if steps.iter().all(|s| s.status == StepStatus::Succeeded) {
            RunStatus::Succeeded
        } else if steps.iter().all(|s| s.status == StepStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::PartiallyFailed
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub sources_attempted: usize,
    pub rows_written: usize,
    pub rows_skipped: usize,
    pub rows_touched: u64,
    pub fields_unset: usize,
    pub broadcast_warnings: usize,
}

impl RunTotals {
    pub fn from_steps(steps: &[StepReport]) -> Self {
        steps.iter().fold(Self::default(), |mut totals, step| {
            totals.sources_attempted += 1;
            totals.rows_written += step.rows_written;
            totals.rows_skipped += step.rows_skipped;
            totals.rows_touched += step.rows_touched;
            totals.fields_unset += step.fields_unset.len();
            if step.step == StepGroup::PolicyBroadcast {
                totals.broadcast_warnings += step.warnings.len();
            }
            totals
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Daily,
    GlobalBackfill,
    ExchangeRateBackfill,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub totals: RunTotals,
    pub steps: Vec<StepReport>,
    pub analysis: Option<AnalysisReport>,
}

impl RunReport {
    pub fn step(&self, source_id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.source_id == source_id)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub skip_analysis: bool,
}

/// Returned only by the term-deposit phase; the policy broadcast cannot run without it.
#[derive(Debug)]
pub struct TermDepositPhase {
    run_date: NaiveDate,
    banks_written: Vec<String>,
}

impl TermDepositPhase {
    pub fn run_date(&self) -> NaiveDate {
        self.run_date
    }

    pub fn banks_written(&self) -> &[String] {
        &self.banks_written
    }
}

const MAX_FAILED_BACKFILL_DAYS: u32 = 10;

/// Monday to Friday dates in `(until - days, until]`, newest first.
pub fn backfill_weekdays(until: NaiveDate, days: u32) -> Vec<NaiveDate> {
    (0..u64::from(days))
        .filter_map(|offset| until.checked_sub_days(Days::new(offset)))
        .filter(|d| d.weekday().num_days_from_monday() < 5)
        .collect()
}

pub struct IngestPipeline {
    config: IngestConfig,
    registry: SourceRegistry,
    http: HttpFetcher,
    store: Arc<dyn SeriesStore>,
    renderer: Option<Arc<dyn PageRenderer>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    archive: Option<RawArchive>,
    workers: Arc<Semaphore>,
}

impl IngestPipeline {
    pub fn new(
        config: IngestConfig,
        registry: SourceRegistry,
        store: Arc<dyn SeriesStore>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config()).context("building HTTP client")?;
        let renderer: Arc<dyn PageRenderer> = Arc::new(ChromiumRenderer::new(RenderConfig {
            chrome_executable: config.chrome_bin.clone(),
        }));
        let summarizer = GeminiSummarizer::from_config(&config.summarizer)
            .context("building summarizer client")?
            .map(|s| Arc::new(s) as Arc<dyn Summarizer>);
        let archive = config.raw_archive_dir.clone().map(RawArchive::new);
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Ok(Self {
            config,
            registry,
            http,
            store,
            renderer: Some(renderer),
            summarizer,
            archive,
            workers,
        })
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Option<Arc<dyn Summarizer>>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn SeriesStore> {
        &self.store
    }

    pub fn trigger(&self) -> DownstreamTrigger {
        DownstreamTrigger::new(
            self.store.clone(),
            self.summarizer.clone(),
            self.config.analysis_days,
            self.config.analysis_gold_code.clone(),
            Duration::from_secs(self.config.summarizer.timeout_secs.max(1)),
        )
    }

    fn context(&self, run_id: Uuid, run_date: NaiveDate) -> AdapterContext {
        let mut ctx = AdapterContext::new(run_id, run_date);
        ctx.utc_offset_hours = self.config.utc_offset_hours;
        ctx
    }

    /// One daily run. Errors only when the store is unreachable at start; step failures
    /// are recorded in the returned report.
    pub async fn run_once(&self, run_date: NaiveDate, options: RunOptions) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let ctx = self.context(run_id, run_date);

        async {
            self.store
                .ping()
                .await
                .context("series store unreachable at run start")?;
            info!(sources = self.registry.enabled().count(), "run started");

            let (parallel, sequential) = tokio::join!(
                self.run_parallel_lane(
                    &ctx,
                    &[StepGroup::Independent, StepGroup::GlobalMacro, StepGroup::ExchangeRate]
                ),
                self.run_term_deposit_lane(&ctx),
            );
            let mut steps = parallel;
            steps.extend(sequential);

            let status = RunStatus::from_steps(&steps);
            let analysis = if options.skip_analysis || status == RunStatus::Failed {
                None
            } else {
                Some(self.trigger().run(run_date).await)
            };

            let report = RunReport {
                run_id,
                run_date,
                mode: RunMode::Daily,
                started_at,
                finished_at: Utc::now(),
                status,
                totals: RunTotals::from_steps(&steps),
                steps,
                analysis,
            };
            self.finish_run(&report).await;
            Ok::<_, anyhow::Error>(report)
        }
        .instrument(info_span!("run", %run_id, %run_date))
        .await
    }

    /// Re-fetch the global macro series over a wider range. Existing rows are left alone.
    pub async fn run_global_backfill(&self, run_date: NaiveDate, range: &str) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let ctx = self.context(run_id, run_date).with_var("range", range);

        async {
            self.store
                .ping()
                .await
                .context("series store unreachable at run start")?;
            let steps = self.run_parallel_lane(&ctx, &[StepGroup::GlobalMacro]).await;
            let report = RunReport {
                run_id,
                run_date,
                mode: RunMode::GlobalBackfill,
                started_at,
                finished_at: Utc::now(),
                status: RunStatus::from_steps(&steps),
                totals: RunTotals::from_steps(&steps),
                steps,
                analysis: None,
            };
            self.finish_run(&report).await;
            Ok::<_, anyhow::Error>(report)
        }
        .instrument(info_span!("backfill", %run_id, range))
        .await
    }

    /// Walk weekdays back from `until` over `days` calendar days for every dated
    /// exchange-rate source, newest first. Gives up after a run of failed days.
    pub async fn run_exchange_rate_backfill(&self, until: NaiveDate, days: u32) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        async {
            self.store
                .ping()
                .await
                .context("series store unreachable at run start")?;
            let descriptors = self
                .registry
                .in_step(StepGroup::ExchangeRate)
                .into_iter()
                .filter(|s| s.is_dated())
                .collect::<Vec<_>>();

            let mut steps = Vec::new();
            let mut failed_days = 0;
            for date in backfill_weekdays(until, days) {
                let ctx = self.context(run_id, date);
                let day_steps = stream::iter(descriptors.iter().copied())
                    .map(|descriptor| self.run_ingest_step(descriptor, &ctx))
                    .buffer_unordered(self.config.max_workers.max(1))
                    .collect::<Vec<_>>()
                    .await;
                if day_steps.iter().all(|s| s.status == StepStatus::Failed) {
                    failed_days += 1;
                } else {
                    failed_days = 0;
                }
                steps.extend(day_steps);
                if failed_days > MAX_FAILED_BACKFILL_DAYS {
                    warn!(%date, failed_days, "exchange-rate backfill stopped after consecutive failures");
                    break;
                }
            }

            let report = RunReport {
                run_id,
                run_date: until,
                mode: RunMode::ExchangeRateBackfill,
                started_at,
                finished_at: Utc::now(),
                status: RunStatus::from_steps(&steps),
                totals: RunTotals::from_steps(&steps),
                steps,
                analysis: None,
            };
            self.finish_run(&report).await;
            Ok::<_, anyhow::Error>(report)
        }
        .instrument(info_span!("fx_backfill", %run_id, %until, days))
        .await
    }

    async fn finish_run(&self, report: &RunReport) {
        let totals = &report.totals;
        info!(
            status = ?report.status,
            sources_attempted = totals.sources_attempted,
            rows_written = totals.rows_written,
            rows_skipped = totals.rows_skipped,
            fields_unset = totals.fields_unset,
            broadcast_warnings = totals.broadcast_warnings,
            "run finished"
        );
        if let Err(err) = write_run_report(&self.config.reports_dir, report).await {
            warn!(error = %err, "writing run report failed");
        }
    }

    async fn run_parallel_lane(&self, ctx: &AdapterContext, groups: &[StepGroup]) -> Vec<StepReport> {
        let descriptors = self
            .registry
            .enabled()
            .filter(|s| groups.contains(&s.step))
            .collect::<Vec<_>>();
        stream::iter(descriptors)
            .map(|descriptor| self.run_ingest_step(descriptor, ctx))
            .buffer_unordered(self.config.max_workers.max(1))
            .collect()
            .await
    }

    async fn run_term_deposit_lane(&self, ctx: &AdapterContext) -> Vec<StepReport> {
        let (mut steps, phase) = self.run_term_deposit_phase(ctx).await;
        for descriptor in self.registry.in_step(StepGroup::PolicyBroadcast) {
            steps.push(self.run_broadcast_step(descriptor, ctx, &phase).await);
        }
        steps
    }

    async fn run_term_deposit_phase(&self, ctx: &AdapterContext) -> (Vec<StepReport>, TermDepositPhase) {
        let steps: Vec<StepReport> = stream::iter(self.registry.in_step(StepGroup::TermDeposit))
            .map(|descriptor| self.run_ingest_step(descriptor, ctx))
            .buffer_unordered(self.config.max_workers.max(1))
            .collect()
            .await;
        let banks_written = steps
            .iter()
            .filter(|s| s.rows_written + s.rows_skipped > 0)
            .map(|s| s.source_id.clone())
            .collect();
        let phase = TermDepositPhase {
            run_date: ctx.run_date,
            banks_written,
        };
        (steps, phase)
    }

    /// Retrieve and extract; `None` means the step already recorded its failure.
    async fn fetch_records(
        &self,
        descriptor: &SourceDescriptor,
        ctx: &AdapterContext,
        report: &mut StepReport,
    ) -> Option<Vec<RawRecord>> {
        let adapter = match adapter_for(descriptor, self.renderer.clone()) {
            Ok(adapter) => adapter,
            Err(err) => {
                report.fail(err.kind(), err.to_string());
                return None;
            }
        };

        let raw = {
            let Ok(_permit) = self.workers.acquire().await else {
                report.fail(FailureKind::Config, "worker pool closed");
                return None;
            };
            match adapter.retrieve(&self.http, ctx).await {
                Ok(raw) => raw,
                Err(err) => {
                    report.attempts = match &err {
                        AdapterError::Transport(fetch) => fetch.attempts(),
                        AdapterError::Extraction(_) | AdapterError::Config { .. } => 0,
                    };
                    report.fail(err.kind(), err.to_string());
                    return None;
                }
            }
        };
        report.attempts = raw.attempts;
        self.archive_payload(&raw).await;

        match adapter.extract(&raw, ctx) {
            Ok(records) => {
                report.records_extracted = records.len();
                Some(records)
            }
            Err(err) => {
                report.fail(FailureKind::Extraction, err.to_string());
                None
            }
        }
    }

    async fn archive_payload(&self, raw: &RawFetchResult) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive.archive(raw).await {
            Ok(stored) => info!(
                source_id = %raw.source_id,
                path = %stored.relative_path.display(),
                deduplicated = stored.deduplicated,
                "raw payload archived"
            ),
            Err(err) => warn!(source_id = %raw.source_id, error = %err, "archiving raw payload failed"),
        }
    }

    async fn run_ingest_step(&self, descriptor: &SourceDescriptor, ctx: &AdapterContext) -> StepReport {
        let span = info_span!("step", source_id = %descriptor.source_id, step = ?descriptor.step);
        async {
            let mut report = StepReport::pending(descriptor);
            report.advance(StepStatus::Running);
            let Some(records) = self.fetch_records(descriptor, ctx, &mut report).await else {
                return report.conclude();
            };

            let crawl_time = Utc::now();
            for raw in &records {
                let normalized = normalize_record(raw, ctx.run_date, crawl_time);
                report.note_issues(&raw.code, normalized.issues);
                let Some(record) = normalized.record else {
                    continue;
                };
                match self.store.insert_if_absent(&record).await {
                    Ok(WriteOutcome::Inserted) => report.rows_written += 1,
                    Ok(WriteOutcome::SkippedDuplicate) => report.rows_skipped += 1,
                    Err(err @ StoreError::WriteConflict { .. }) => {
                        warn!(key = %record.key, error = %err, "row rejected by store");
                        report.write_conflicts.push(err.to_string());
                    }
                    Err(err) => {
                        report.fail(err.kind(), err.to_string());
                        break;
                    }
                }
            }
            report.conclude()
        }
        .instrument(span)
        .await
    }

    async fn run_broadcast_step(
        &self,
        descriptor: &SourceDescriptor,
        ctx: &AdapterContext,
        phase: &TermDepositPhase,
    ) -> StepReport {
        let span = info_span!("step", source_id = %descriptor.source_id, step = ?descriptor.step);
        async {
            let mut report = StepReport::pending(descriptor);
            report.advance(StepStatus::Running);
            let Some(records) = self.fetch_records(descriptor, ctx, &mut report).await else {
                return report.conclude();
            };

            let mut fields = BTreeMap::new();
            for raw in &records {
                let (values, issues) = normalize_broadcast(raw);
                report.note_issues(&raw.code, issues);
                for (field, value) in values {
                    fields.entry(field).or_insert(value);
                }
            }
            if fields.is_empty() {
                report.fail(FailureKind::Normalization, "no policy rate survived normalization");
                return report.conclude();
            }

            let table = SeriesTable::BankTermDeposit;
            let date = phase.run_date();
            match self.store.broadcast_update(table, date, &fields).await {
                Ok(BroadcastOutcome::Applied { codes, rows }) => {
                    info!(%table, %date, ?codes, rows, "policy rates broadcast");
                    report.rows_touched = rows;
                }
                Ok(BroadcastOutcome::NoTargets) => {
                    let message = format!(
                        "{}: no {table} rows for {date}; policy rates not applied",
                        FailureKind::DependencyOrder
                    );
                    warn!(
                        %table,
                        %date,
                        banks_written = phase.banks_written().len(),
                        "broadcast found no target rows"
                    );
                    report.warnings.push(message);
                }
                Err(err) => report.fail(err.kind(), err.to_string()),
            }
            report.conclude()
        }
        .instrument(span)
        .await
    }
}

pub async fn write_run_report(reports_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(dir.join("run_report.json"), json)
        .await
        .context("writing run_report.json")?;
    fs::write(dir.join("run_summary.md"), render_run_summary(report))
        .await
        .context("writing run_summary.md")?;
    Ok(dir)
}

pub fn render_run_summary(report: &RunReport) -> String {
    let totals = &report.totals;
    let mut lines = vec![
        "# Ingestion Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Run date: {}", report.run_date),
        format!("- Mode: {:?}", report.mode),
        format!("- Status: {:?}", report.status),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Sources attempted: {}", totals.sources_attempted),
        format!("- Rows written: {}", totals.rows_written),
        format!("- Rows skipped: {}", totals.rows_skipped),
        format!("- Rows touched by broadcast: {}", totals.rows_touched),
        format!("- Fields unset: {}", totals.fields_unset),
        format!("- Broadcast warnings: {}", totals.broadcast_warnings),
        String::new(),
        "## Steps".to_string(),
        String::new(),
        "| source | step | status | attempts | written | skipped | unset | failure |".to_string(),
        "|---|---|---|---|---|---|---|---|".to_string(),
    ];
    for step in &report.steps {
        let failure = step
            .failure
            .as_ref()
            .map(|f| format!("{}: {}", f.kind, f.message.replace('|', "/")))
            .unwrap_or_default();
        lines.push(format!(
            "| {} | {:?} | {:?} | {} | {} | {} | {} | {} |",
            step.source_id,
            step.step,
            step.status,
            step.attempts,
            step.rows_written,
            step.rows_skipped,
            step.fields_unset.len(),
            failure
        ));
    }
    let warnings = report
        .steps
        .iter()
        .flat_map(|s| s.warnings.iter().map(move |w| format!("- {}: {w}", s.source_id)))
        .collect::<Vec<_>>();
    if !warnings.is_empty() {
        lines.push(String::new());
        lines.push("## Warnings".to_string());
        lines.extend(warnings);
    }
    if let Some(analysis) = &report.analysis {
        lines.push(String::new());
        lines.push(format!("## Analysis\n- {analysis:?}"));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown digest of the most recent `runs` reports under `reports_root`.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Ingestion Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let path = dir.path().join("run_report.json");
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        let report: RunReport =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let failed = report
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.source_id.as_str())
            .collect::<Vec<_>>();

        lines.push(format!("## Run `{}` ({})", report.run_id, report.run_date));
        lines.push(format!("- status: {:?}", report.status));
        lines.push(format!("- rows written: {}", report.totals.rows_written));
        lines.push(format!("- rows skipped: {}", report.totals.rows_skipped));
        lines.push(format!("- fields unset: {}", report.totals.fields_unset));
        if !failed.is_empty() {
            lines.push(format!("- failed sources: {}", failed.join(", ")));
        }
        lines.push(format!("- report: `{}`", path.display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn descriptor(source_id: &str, step: StepGroup) -> SourceDescriptor {
        serde_yaml::from_str(&format!(
            "source_id: {source_id}\ndisplay_name: test\nshape: static_html\nparser: policy_rates\nstep: {}\nendpoint: http://localhost/\n",
            serde_yaml::to_string(&step).unwrap().trim()
        ))
        .unwrap()
    }

    fn finished(source_id: &str, status: StepStatus) -> StepReport {
        let mut report = StepReport::pending(&descriptor(source_id, StepGroup::Independent));
        report.transition(StepStatus::Running).unwrap();
        report.transition(status).unwrap();
        report
    }

    #[test]
    fn step_tracker_rejects_illegal_transitions() {
        let mut report = StepReport::pending(&descriptor("a", StepGroup::Independent));
        assert!(report.transition(StepStatus::Succeeded).is_err());
        report.transition(StepStatus::Running).unwrap();
        assert!(report.transition(StepStatus::Pending).is_err());
        report.transition(StepStatus::Failed).unwrap();
        let err = report.transition(StepStatus::Succeeded).unwrap_err();
        assert_eq!(err.from, StepStatus::Failed);
        assert!(report.started_at.is_some() && report.finished_at.is_some());
    }

    #[test]
    fn outcome_follows_failure_kind() {
        let mut report = StepReport::pending(&descriptor("a", StepGroup::Independent));
        assert_eq!(report.outcome(), StepStatus::Succeeded);
        report.fields_unset.push(UnsetField {
            code: "ACB".into(),
            field: "term_1m".into(),
            pointer: "table[0]/row[1]/cell[1]".into(),
            reason: "unparsable".into(),
        });
        assert_eq!(report.outcome(), StepStatus::PartiallyFailed);
        report.fail(FailureKind::Extraction, "nothing matched");
        assert_eq!(report.outcome(), StepStatus::PartiallyFailed);
        report.fail(FailureKind::Transport, "503");
        assert_eq!(report.outcome(), StepStatus::Failed);
    }

    #[test]
    fn run_status_aggregates_steps() {
        let ok = finished("a", StepStatus::Succeeded);
        let partial = finished("b", StepStatus::PartiallyFailed);
        let failed = finished("c", StepStatus::Failed);

        assert_eq!(RunStatus::from_steps(&[ok.clone(), ok.clone()]), RunStatus::Succeeded);
        assert_eq!(
            RunStatus::from_steps(&[ok.clone(), failed.clone()]),
            RunStatus::PartiallyFailed
        );
        assert_eq!(RunStatus::from_steps(&[partial]), RunStatus::PartiallyFailed);
        assert_eq!(RunStatus::from_steps(&[failed.clone(), failed]), RunStatus::Failed);
    }

    #[test]
    fn backfill_skips_weekends_and_walks_backwards() {
        // 2026-01-19 is a Monday.
        let monday = NaiveDate::from_ymd_opt(2026, 1, 19).unwrap();
        let dates = backfill_weekdays(monday, 4);
        assert_eq!(
            dates,
            vec![monday, NaiveDate::from_ymd_opt(2026, 1, 16).unwrap()]
        );
        assert!(backfill_weekdays(monday, 0).is_empty());
    }

    #[test]
    fn builtin_registry_covers_every_step_group() {
        let registry = SourceRegistry::builtin().unwrap();
        for group in [
            StepGroup::Independent,
            StepGroup::TermDeposit,
            StepGroup::PolicyBroadcast,
            StepGroup::GlobalMacro,
            StepGroup::ExchangeRate,
        ] {
            assert!(!registry.in_step(group).is_empty(), "{group:?} has no sources");
        }
        for source in registry.enabled() {
            assert!(
                vdv_adapters::adapter_for(source, None).is_ok()
                    || source.shape == vdv_core::SourceShape::Rendered,
                "{} has no adapter",
                source.source_id
            );
        }
    }

    #[test]
    fn duplicate_source_ids_are_rejected() {
        let yaml = "sources:\n  - {source_id: a, display_name: A, shape: api, parser: yahoo_chart, step: global_macro, endpoint: 'http://x/'}\n  - {source_id: a, display_name: B, shape: api, parser: yahoo_chart, step: global_macro, endpoint: 'http://y/'}\n";
        let err = SourceRegistry::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate source_id"));
    }

    #[test]
    fn summary_lists_steps_and_warnings() {
        let mut broadcast = finished("sbv-policy-rates", StepStatus::Succeeded);
        broadcast.step = StepGroup::PolicyBroadcast;
        broadcast.warnings.push("dependency_order: no rows".to_string());
        let steps = vec![finished("gold-24h", StepStatus::Succeeded), broadcast];
        let report = RunReport {
            run_id: Uuid::nil(),
            run_date: NaiveDate::from_ymd_opt(2026, 1, 18).unwrap(),
            mode: RunMode::Daily,
            started_at: Utc.with_ymd_and_hms(2026, 1, 18, 1, 0, 0).single().unwrap(),
            finished_at: Utc.with_ymd_and_hms(2026, 1, 18, 1, 2, 0).single().unwrap(),
            status: RunStatus::from_steps(&steps),
            totals: RunTotals::from_steps(&steps),
            steps,
            analysis: None,
        };
        assert_eq!(report.totals.broadcast_warnings, 1);
        let md = render_run_summary(&report);
        assert!(md.contains("| gold-24h | Independent | Succeeded |"));
        assert!(md.contains("## Warnings"));
    }

    #[tokio::test]
    async fn reports_round_trip_through_the_digest() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![finished("gold-24h", StepStatus::Failed)];
        let report = RunReport {
            run_id: Uuid::new_v4(),
            run_date: NaiveDate::from_ymd_opt(2026, 1, 18).unwrap(),
            mode: RunMode::Daily,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            status: RunStatus::from_steps(&steps),
            totals: RunTotals::from_steps(&steps),
            steps,
            analysis: Some(AnalysisReport::Skipped {
                reason: "no summarizer configured".to_string(),
            }),
        };
        let written = write_run_report(dir.path(), &report).await.unwrap();
        assert!(written.join("run_summary.md").exists());

        let digest = report_markdown(5, dir.path()).unwrap();
        assert!(digest.contains(&report.run_id.to_string()));
        assert!(digest.contains("failed sources: gold-24h"));
    }

    #[test]
    fn config_defaults_match_documented_values() {
        let config = IngestConfig::default();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.analysis_days, 7);
        let http = config.http_client_config();
        assert_eq!(http.backoff.base_delay, Duration::from_millis(500));
        assert_eq!(http.backoff.max_delay, Duration::from_secs(30));
    }
}
