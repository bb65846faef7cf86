use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tempfile::TempDir;
use vdv_adapters::{PageRenderer, RenderError};
use vdv_core::{FailureKind, RenderOptions, SeriesTable};
use vdv_sync::{
    AnalysisReport, AnalysisWindow, InMemoryStore, IngestConfig, IngestPipeline, RunOptions,
    RunStatus, SeriesStore, SourceRegistry, StepStatus, SummarizeError, Summarizer,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, 18).unwrap()
}

fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/html; charset=utf-8")
}

async fn serve(server: &MockServer, route: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(response)
        .mount(server)
        .await;
}

fn source(id: &str, shape: &str, parser: &str, step: &str, endpoint: &str, code: Option<&str>) -> String {
    let code = code.map(|c| format!("    code: \"{c}\"\n")).unwrap_or_default();
    format!(
        "  - source_id: {id}\n    display_name: {id}\n    shape: {shape}\n    parser: {parser}\n    \
         step: {step}\n    endpoint: \"{endpoint}\"\n    pacing_ms: 0\n    max_attempts: 2\n{code}"
    )
}

fn registry(entries: &[String]) -> SourceRegistry {
    SourceRegistry::from_yaml(&format!("sources:\n{}", entries.concat())).unwrap()
}

fn gold(base: &str) -> String {
    source("gold-24h", "static_html", "gold_24h", "independent", &format!("{base}/gold?d={{date}}"), None)
}

fn bank(base: &str, code: &str) -> String {
    let id = format!("{}-termdepo", code.to_lowercase());
    source(
        &id,
        "static_html",
        "term_deposit",
        "term_deposit",
        &format!("{base}/bank/{}", code.to_lowercase()),
        Some(code),
    )
}

fn policy(base: &str) -> String {
    source(
        "sbv-policy-rates",
        "static_html",
        "policy_rates",
        "policy_broadcast",
        &format!("{base}/policy"),
        Some("SBV"),
    )
}

fn yahoo_gold(base: &str) -> String {
    source(
        "yahoo-gold",
        "api",
        "yahoo_chart",
        "global_macro",
        &format!("{base}/yahoo/gc?range={{range}}"),
        Some("GC=F"),
    )
}

struct FixtureRenderer(String);

#[async_trait]
impl PageRenderer for FixtureRenderer {
    async fn render(&self, _url: &str, _options: &RenderOptions) -> Result<String, RenderError> {
        Ok(self.0.clone())
    }
}

struct CannedSummarizer(Result<String, SummarizeError>);

#[async_trait]
impl Summarizer for CannedSummarizer {
    async fn summarize(&self, _window: &AnalysisWindow) -> Result<String, SummarizeError> {
        self.0.clone()
    }
}

fn pipeline(registry: SourceRegistry, store: Arc<InMemoryStore>, reports: &TempDir) -> IngestPipeline {
    let config = IngestConfig {
        reports_dir: reports.path().to_path_buf(),
        backoff_base_ms: 10,
        backoff_max_ms: 50,
        http_timeout_secs: 5,
        ..IngestConfig::default()
    };
    IngestPipeline::new(config, registry, store)
        .unwrap()
        .with_renderer(Arc::new(FixtureRenderer(fixture("acb_term_deposit.html"))))
        .with_summarizer(None)
}

#[tokio::test]
async fn rerunning_a_date_writes_nothing_new() {
    let server = MockServer::start().await;
    serve(&server, "/gold", html(fixture("gold_24h.html"))).await;
    serve(&server, "/bank/acb", html(fixture("acb_term_deposit.html"))).await;
    serve(&server, "/policy", html(fixture("sbv_policy_rates_vi.html"))).await;

    let base = server.uri();
    let store = Arc::new(InMemoryStore::new());
    let reports = tempfile::tempdir().unwrap();
    let pipeline = pipeline(
        registry(&[gold(&base), bank(&base, "ACB"), policy(&base)]),
        store.clone(),
        &reports,
    );

    let first = pipeline.run_once(run_date(), RunOptions::default()).await.unwrap();
    assert_eq!(first.status, RunStatus::Succeeded, "{first:#?}");
    assert_eq!(first.totals.rows_written, 4);
    assert_eq!(first.totals.rows_skipped, 0);
    let gold_rows = store.count_rows(SeriesTable::Gold24h).await.unwrap();
    let bank_rows = store.count_rows(SeriesTable::BankTermDeposit).await.unwrap();

    let second = pipeline.run_once(run_date(), RunOptions::default()).await.unwrap();
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(second.totals.rows_written, 0);
    assert_eq!(second.totals.rows_skipped, 4);
    assert_eq!(store.count_rows(SeriesTable::Gold24h).await.unwrap(), gold_rows);
    assert_eq!(store.count_rows(SeriesTable::BankTermDeposit).await.unwrap(), bank_rows);

    let rows = store
        .records_for_date(SeriesTable::BankTermDeposit, run_date())
        .await
        .unwrap();
    assert_eq!(rows[0].value("rediscount_rate"), Some(3.0));

    for report in [&first, &second] {
        let dir = reports.path().join(report.run_id.to_string());
        assert!(dir.join("run_report.json").exists());
        assert!(dir.join("run_summary.md").exists());
    }
}

#[tokio::test]
async fn policy_rates_broadcast_to_every_bank_row_of_the_date() {
    let server = MockServer::start().await;
    for code in ["acb", "ctg", "bid", "tcb"] {
        serve(&server, &format!("/bank/{code}"), html(fixture("acb_term_deposit.html"))).await;
    }
    serve(&server, "/policy", html(fixture("sbv_policy_rates_en.html"))).await;

    let base = server.uri();
    let mut entries = ["ACB", "CTG", "BID", "TCB"]
        .iter()
        .map(|code| bank(&base, code))
        .collect::<Vec<_>>();
    entries.push(
        source(
            "vcb-termdepo",
            "rendered",
            "term_deposit",
            "term_deposit",
            &format!("{base}/bank/vcb"),
            Some("VCB"),
        ),
    );
    entries.push(policy(&base));

    let store = Arc::new(InMemoryStore::new());
    let reports = tempfile::tempdir().unwrap();
    let report = pipeline(registry(&entries), store.clone(), &reports)
        .run_once(run_date(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded, "{report:#?}");
    let broadcast = report.step("sbv-policy-rates").unwrap();
    assert_eq!(broadcast.rows_touched, 5);
    assert!(broadcast.warnings.is_empty());

    let rows = store
        .records_for_date(SeriesTable::BankTermDeposit, run_date())
        .await
        .unwrap();
    let mut codes = rows.iter().map(|r| r.key.code.as_str()).collect::<Vec<_>>();
    codes.sort_unstable();
    assert_eq!(codes, vec!["ACB", "BID", "CTG", "TCB", "VCB"]);
    for row in &rows {
        assert_eq!(row.value("rediscount_rate"), Some(3.0));
        assert_eq!(row.value("refinancing_rate"), Some(4.5));
        assert_eq!(row.value("term_1m"), Some(3.1));
        assert_eq!(row.value("term_12m"), Some(4.7));
        assert_eq!(row.value("term_36m"), Some(4.9));
    }
}

#[tokio::test]
async fn rerun_with_a_partial_policy_page_keeps_the_date_uniform() {
    let server = MockServer::start().await;
    serve(&server, "/bank/acb", html(fixture("acb_term_deposit.html"))).await;
    serve(&server, "/bank/ctg", html(fixture("acb_term_deposit.html"))).await;
    serve(&server, "/policy", html(fixture("sbv_policy_rates_vi.html"))).await;
    let partial = "<table><tr><td>Lãi suất tái chiết khấu</td><td>n/a</td></tr>\
                   <tr><td>Lãi suất tái cấp vốn</td><td>4,500%</td></tr></table>";
    serve(&server, "/policy-partial", html(partial.to_string())).await;

    let base = server.uri();
    let store = Arc::new(InMemoryStore::new());
    let reports = tempfile::tempdir().unwrap();

    let first = pipeline(registry(&[bank(&base, "ACB"), policy(&base)]), store.clone(), &reports)
        .run_once(run_date(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Succeeded, "{first:#?}");

    let partial_policy = source(
        "sbv-policy-rates",
        "static_html",
        "policy_rates",
        "policy_broadcast",
        &format!("{base}/policy-partial"),
        Some("SBV"),
    );
    let second = pipeline(
        registry(&[bank(&base, "ACB"), bank(&base, "CTG"), partial_policy]),
        store.clone(),
        &reports,
    )
    .run_once(run_date(), RunOptions::default())
    .await
    .unwrap();

    let broadcast = second.step("sbv-policy-rates").unwrap();
    assert_eq!(broadcast.status, StepStatus::PartiallyFailed);
    assert_eq!(broadcast.rows_touched, 2);

    let rows = store
        .records_for_date(SeriesTable::BankTermDeposit, run_date())
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.value("rediscount_rate"), None, "{}", row.key);
        assert_eq!(row.value("refinancing_rate"), Some(4.5), "{}", row.key);
    }
}

#[tokio::test]
async fn broadcast_without_bank_rows_is_a_dependency_warning() {
    let server = MockServer::start().await;
    serve(&server, "/bank/acb", ResponseTemplate::new(404)).await;
    serve(&server, "/policy", html(fixture("sbv_policy_rates_vi.html"))).await;

    let base = server.uri();
    let store = Arc::new(InMemoryStore::new());
    let reports = tempfile::tempdir().unwrap();
    let report = pipeline(registry(&[bank(&base, "ACB"), policy(&base)]), store.clone(), &reports)
        .run_once(run_date(), RunOptions::default())
        .await
        .unwrap();

    let bank_step = report.step("acb-termdepo").unwrap();
    assert_eq!(bank_step.status, StepStatus::Failed);
    assert_eq!(bank_step.failure.as_ref().unwrap().kind, FailureKind::Transport);
    assert_eq!(bank_step.attempts, 1);

    let broadcast = report.step("sbv-policy-rates").unwrap();
    assert_eq!(broadcast.status, StepStatus::Succeeded);
    assert_eq!(broadcast.rows_touched, 0);
    assert!(broadcast.warnings[0].starts_with("dependency_order"));
    assert_eq!(report.totals.broadcast_warnings, 1);
    assert_eq!(report.status, RunStatus::PartiallyFailed);
    assert_eq!(store.count_rows(SeriesTable::BankTermDeposit).await.unwrap(), 0);
}

#[tokio::test]
async fn one_failing_source_does_not_stop_the_others() {
    let server = MockServer::start().await;
    serve(&server, "/gold", html(fixture("gold_24h.html"))).await;
    Mock::given(method("GET"))
        .and(path("/yahoo/gc"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let base = server.uri();
    let store = Arc::new(InMemoryStore::new());
    let reports = tempfile::tempdir().unwrap();
    let report = pipeline(registry(&[gold(&base), yahoo_gold(&base)]), store.clone(), &reports)
        .run_once(run_date(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::PartiallyFailed);
    let failed = report.step("yahoo-gold").unwrap();
    assert_eq!(failed.status, StepStatus::Failed);
    assert_eq!(failed.failure.as_ref().unwrap().kind, FailureKind::Transport);
    assert_eq!(failed.attempts, 2);
    assert_eq!(report.step("gold-24h").unwrap().status, StepStatus::Succeeded);
    assert_eq!(store.count_rows(SeriesTable::Gold24h).await.unwrap(), 3);
    assert_eq!(store.count_rows(SeriesTable::GlobalMacro).await.unwrap(), 0);
}

#[tokio::test]
async fn permanent_failure_leaves_the_other_sources_written() {
    let server = MockServer::start().await;
    serve(&server, "/gold", html(fixture("gold_24h.html"))).await;
    serve(&server, "/bank/acb", html(fixture("acb_term_deposit.html"))).await;
    Mock::given(method("GET"))
        .and(path("/bank/ctg"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/yahoo/gc"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(fixture("yahoo_gc.json"), "application/json"),
        )
        .mount(&server)
        .await;

    let base = server.uri();
    let store = Arc::new(InMemoryStore::new());
    let reports = tempfile::tempdir().unwrap();
    let report = pipeline(
        registry(&[gold(&base), bank(&base, "ACB"), bank(&base, "CTG"), yahoo_gold(&base)]),
        store.clone(),
        &reports,
    )
    .run_once(run_date(), RunOptions::default())
    .await
    .unwrap();

    assert_eq!(report.status, RunStatus::PartiallyFailed, "{report:#?}");
    let failed = report.step("ctg-termdepo").unwrap();
    assert_eq!(failed.status, StepStatus::Failed);
    assert_eq!(failed.failure.as_ref().unwrap().kind, FailureKind::Transport);
    assert_eq!(failed.attempts, 1);
    for id in ["gold-24h", "acb-termdepo", "yahoo-gold"] {
        assert_eq!(report.step(id).unwrap().status, StepStatus::Succeeded, "{id}");
    }

    assert_eq!(store.count_rows(SeriesTable::Gold24h).await.unwrap(), 3);
    assert_eq!(store.count_rows(SeriesTable::GlobalMacro).await.unwrap(), 2);
    let banks = store
        .records_for_date(SeriesTable::BankTermDeposit, run_date())
        .await
        .unwrap();
    assert_eq!(banks.len(), 1);
    assert_eq!(banks[0].key.code, "ACB");
}

#[tokio::test]
async fn every_step_failing_fails_the_run() {
    let server = MockServer::start().await;
    let base = server.uri();
    let store = Arc::new(InMemoryStore::new());
    let reports = tempfile::tempdir().unwrap();
    let report = pipeline(registry(&[gold(&base), yahoo_gold(&base)]), store, &reports)
        .run_once(run_date(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.analysis.is_none());
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Failed));
}

#[tokio::test]
async fn unreachable_store_aborts_before_fetching() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(html(fixture("gold_24h.html")))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    store.set_unavailable(true);
    let reports = tempfile::tempdir().unwrap();
    let result = pipeline(registry(&[gold(&server.uri())]), store, &reports)
        .run_once(run_date(), RunOptions::default())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn unparsable_fields_make_the_step_partial() {
    let server = MockServer::start().await;
    let page = "<table><tr><td>Lãi suất tái chiết khấu</td><td>abc%</td></tr>\
                <tr><td>Lãi suất tái cấp vốn</td><td>4,500%</td></tr></table>";
    serve(&server, "/bank/acb", html(fixture("acb_term_deposit.html"))).await;
    serve(&server, "/policy", html(page.to_string())).await;

    let base = server.uri();
    let store = Arc::new(InMemoryStore::new());
    let reports = tempfile::tempdir().unwrap();
    let report = pipeline(registry(&[bank(&base, "ACB"), policy(&base)]), store.clone(), &reports)
        .run_once(run_date(), RunOptions::default())
        .await
        .unwrap();

    let broadcast = report.step("sbv-policy-rates").unwrap();
    assert_eq!(broadcast.status, StepStatus::PartiallyFailed);
    assert_eq!(broadcast.fields_unset.len(), 1);
    assert_eq!(broadcast.fields_unset[0].field, "rediscount_rate");

    let rows = store
        .records_for_date(SeriesTable::BankTermDeposit, run_date())
        .await
        .unwrap();
    assert_eq!(rows[0].value("refinancing_rate"), Some(4.5));
    assert_eq!(rows[0].value("rediscount_rate"), None);
}

#[tokio::test]
async fn summarizer_failure_keeps_ingested_rows() {
    let server = MockServer::start().await;
    serve(&server, "/gold", html(fixture("gold_24h.html"))).await;
    Mock::given(method("GET"))
        .and(path("/yahoo/gc"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(fixture("yahoo_gc.json"), "application/json"),
        )
        .mount(&server)
        .await;

    let base = server.uri();
    let store = Arc::new(InMemoryStore::new());
    let reports = tempfile::tempdir().unwrap();
    let report = pipeline(registry(&[gold(&base), yahoo_gold(&base)]), store.clone(), &reports)
        .with_summarizer(Some(Arc::new(CannedSummarizer(Err(SummarizeError::Request(
            "connection reset".to_string(),
        ))))))
        .run_once(run_date(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(matches!(report.analysis, Some(AnalysisReport::Failed { .. })));
    assert_eq!(store.count_rows(SeriesTable::Gold24h).await.unwrap(), 3);
    assert_eq!(store.count_rows(SeriesTable::GlobalMacro).await.unwrap(), 2);
    assert!(store.analysis_for(run_date()).await.unwrap().is_none());
}

#[tokio::test]
async fn analysis_is_stored_after_ingestion() {
    let server = MockServer::start().await;
    serve(&server, "/gold", html(fixture("gold_24h.html"))).await;
    Mock::given(method("GET"))
        .and(path("/yahoo/gc"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(fixture("yahoo_gc.json"), "application/json"),
        )
        .mount(&server)
        .await;

    let base = server.uri();
    let store = Arc::new(InMemoryStore::new());
    let reports = tempfile::tempdir().unwrap();
    let pipeline = pipeline(registry(&[gold(&base), yahoo_gold(&base)]), store.clone(), &reports)
        .with_summarizer(Some(Arc::new(CannedSummarizer(Ok("# Market".to_string())))));

    let skipped = pipeline
        .run_once(run_date(), RunOptions { skip_analysis: true })
        .await
        .unwrap();
    assert!(skipped.analysis.is_none());

    let report = pipeline.run_once(run_date(), RunOptions::default()).await.unwrap();
    assert_eq!(
        report.analysis,
        Some(AnalysisReport::Completed {
            date: run_date(),
            global_data_points: 2,
            domestic_data_points: 1,
        })
    );
    let stored = store.analysis_for(run_date()).await.unwrap().unwrap();
    assert_eq!(stored.content, "# Market");
}

#[tokio::test]
async fn global_backfill_requests_the_wider_range_only() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/yahoo/gc"))
        .and(query_param("range", "1y"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(fixture("yahoo_gc.json"), "application/json"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gold"))
        .respond_with(html(fixture("gold_24h.html")))
        .expect(0)
        .mount(&server)
        .await;

    let base = server.uri();
    let store = Arc::new(InMemoryStore::new());
    let reports = tempfile::tempdir().unwrap();
    let report = pipeline(registry(&[gold(&base), yahoo_gold(&base)]), store.clone(), &reports)
        .run_global_backfill(run_date(), "1y")
        .await
        .unwrap();

    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(store.count_rows(SeriesTable::GlobalMacro).await.unwrap(), 2);
}

fn vcb_fx(base: &str) -> String {
    source(
        "vcb-fx",
        "api",
        "vcb_exchange_rates",
        "exchange_rate",
        &format!("{base}/fx/vcb?date={{date}}"),
        Some("VCB"),
    )
}

fn json(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "application/json")
}

#[tokio::test]
async fn exchange_rate_boards_land_keyed_by_bank_and_currency() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fx/vcb"))
        .and(query_param("date", "2026-01-18"))
        .respond_with(json(fixture("vcb_exchange_rates.json")))
        .expect(1)
        .mount(&server)
        .await;
    serve(&server, "/key", json(r#"{"results":"k-1"}"#.to_string())).await;
    serve(&server, "/fx/bid", json(fixture("vnappmob_exchange_rates.json"))).await;

    let base = server.uri();
    let bid = format!(
        "{}    auth:\n      token_endpoint: \"{base}/key\"\n",
        source("bid-fx", "api", "vnappmob_exchange_rates", "exchange_rate", &format!("{base}/fx/bid"), Some("BID"))
    );
    let store = Arc::new(InMemoryStore::new());
    let reports = tempfile::tempdir().unwrap();
    let report = pipeline(registry(&[vcb_fx(&base), bid]), store.clone(), &reports)
        .run_once(run_date(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded, "{report:#?}");
    assert_eq!(report.step("vcb-fx").unwrap().rows_written, 5);
    assert_eq!(report.step("bid-fx").unwrap().rows_written, 3);

    // The VCB board carries its own date; the VNAppMob feed is stamped with the run date.
    let vcb = store
        .records_for_date(SeriesTable::BankExchangeRate, NaiveDate::from_ymd_opt(2026, 1, 16).unwrap())
        .await
        .unwrap();
    assert_eq!(vcb.len(), 5);
    let bid = store
        .records_for_date(SeriesTable::BankExchangeRate, run_date())
        .await
        .unwrap();
    let usd = bid.iter().find(|r| r.key.code == "BID:USD").unwrap();
    assert_eq!(usd.value("buy_transfer"), Some(26_080.0));
    assert_eq!(usd.value("sell_rate"), Some(26_390.0));
}

#[tokio::test]
async fn exchange_rate_backfill_asks_for_each_weekday() {
    let server = MockServer::start().await;
    for date in ["2026-01-19", "2026-01-16"] {
        let body = fixture("vcb_exchange_rates.json")
            .replace("2026-01-16T00:00:00", &format!("{date}T00:00:00"));
        Mock::given(method("GET"))
            .and(path("/fx/vcb"))
            .and(query_param("date", date))
            .respond_with(json(body))
            .expect(1)
            .mount(&server)
            .await;
    }
    serve(&server, "/gold", html(fixture("gold_24h.html"))).await;

    let base = server.uri();
    let store = Arc::new(InMemoryStore::new());
    let reports = tempfile::tempdir().unwrap();
    let monday = NaiveDate::from_ymd_opt(2026, 1, 19).unwrap();
    let report = pipeline(registry(&[vcb_fx(&base), gold(&base)]), store.clone(), &reports)
        .run_exchange_rate_backfill(monday, 4)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded, "{report:#?}");
    assert_eq!(report.steps.len(), 2);
    assert!(report.steps.iter().all(|s| s.source_id == "vcb-fx"));
    assert_eq!(report.totals.rows_written, 10);
    assert_eq!(store.count_rows(SeriesTable::Gold24h).await.unwrap(), 0);
    assert_eq!(store.count_rows(SeriesTable::BankExchangeRate).await.unwrap(), 10);
}
