//! Fetch client (retries, backoff, per-host pacing) and the raw payload archive.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;
use vdv_core::SourceDescriptor;

pub const CRATE_NAME: &str = "vdv-storage";

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed, write-once store for fetched payloads.
#[derive(Debug, Clone)]
pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn payload_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn archive(&self, fetched: &RawFetchResult) -> anyhow::Result<ArchivedPayload> {
        self.store_bytes(
            fetched.fetched_at,
            &fetched.source_id,
            fetched.extension(),
            &fetched.body,
        )
        .await
    }

    /// Write via temp file + rename; an existing file with the same hash is reused.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.payload_relative_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("payload path {} has no parent", absolute_path.display()))?;

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let payload = |deduplicated| ArchivedPayload {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(payload(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp payload file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp payload file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp payload file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(payload(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(payload(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp payload {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

/// Outcome of one attempt inside the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    Permanent {
        status: Option<u16>,
        reason: String,
    },
}

impl AttemptFailure {
    pub fn transient(reason: impl Into<String>) -> Self {
        AttemptFailure::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        AttemptFailure::Permanent {
            status: None,
            reason: reason.into(),
        }
    }
}

pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> AttemptFailure {
    let reason = format!("http status {status}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AttemptFailure::Transient {
            reason,
            retry_after,
        }
    } else {
        AttemptFailure::Permanent {
            status: Some(status.as_u16()),
            reason,
        }
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> AttemptFailure {
    if err.is_builder() || err.is_redirect() {
        AttemptFailure::permanent(err.to_string())
    } else {
        AttemptFailure::transient(err.to_string())
    }
}

/// Only the delta-seconds form is honoured.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the nominal delay.
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.5,
        }
    }
}

impl BackoffPolicy {
    /// `base * 2^(retry-1)` for retry `1, 2, ...`, capped at `max_delay`.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let extra = nominal.mul_f64(ratio * rand::thread_rng().gen::<f64>());
        (nominal + extra).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Minimum interval between requests to the same host.
#[derive(Debug, Default)]
pub struct HostPacer {
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl HostPacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next slot for `host` under the lock, then sleep until it opens.
    pub async fn wait_turn(&self, host: &str, interval: Duration) -> Duration {
        let wait = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots
                .get(host)
                .copied()
                .filter(|slot| *slot > now)
                .unwrap_or(now);
            slots.insert(host.to_string(), slot + interval);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            debug!(host, wait_ms = wait.as_millis() as u64, "pacing request");
            tokio::time::sleep(wait).await;
        }
        wait
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub accept: Option<String>,
    pub bearer: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            accept: None,
            bearer: None,
        }
    }

    pub fn accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RawFetchResult {
    pub source_id: String,
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub attempts: u32,
    pub retry_delays: Vec<Duration>,
}

impl RawFetchResult {
    /// Single-attempt result for payloads that did not come through `HttpFetcher::fetch`.
    pub fn from_body(
        source_id: impl Into<String>,
        url: impl Into<String>,
        content_type: Option<&str>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        let url = url.into();
        Self {
            source_id: source_id.into(),
            final_url: url.clone(),
            url,
            status: 200,
            content_type: content_type.map(str::to_string),
            body: body.into(),
            fetched_at: Utc::now(),
            attempts: 1,
            retry_delays: Vec::new(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn extension(&self) -> &'static str {
        match self.content_type.as_deref() {
            Some(ct) if ct.contains("json") => "json",
            Some(ct) if ct.contains("html") => "html",
            Some(ct) if ct.contains("text") => "txt",
            _ => "bin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("transient failure fetching {url} after {attempts} attempt(s): {reason}")]
    Transient {
        url: String,
        attempts: u32,
        reason: String,
    },
    #[error("permanent failure fetching {url} after {attempts} attempt(s): {reason}")]
    Permanent {
        url: String,
        attempts: u32,
        status: Option<u16>,
        reason: String,
    },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    /// Attempts actually made; zero when the request never left the process.
    pub fn attempts(&self) -> u32 {
        match self {
            FetchError::Transient { attempts, .. } | FetchError::Permanent { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn url(&self) -> &str {
        match self {
            FetchError::Transient { url, .. } | FetchError::Permanent { url, .. } => url,
        }
    }
}

/// Value produced by `HttpFetcher::run_with_retries` plus the retry bookkeeping.
#[derive(Debug, Clone)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
    pub retry_delays: Vec<Duration>,
}

#[derive(Debug)]
struct HttpResponseParts {
    final_url: String,
    status: u16,
    content_type: Option<String>,
    body: Vec<u8>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    pacer: HostPacer,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            pacer: HostPacer::new(),
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Pacing, global concurrency limit and backoff around an arbitrary attempt.
    ///
    /// `op` receives the 1-based attempt number. The host pacing slot is taken before
    /// every attempt, the concurrency permit is held only while the attempt runs.
    pub async fn run_with_retries<T, F, Fut>(
        &self,
        url: &str,
        pacing: Duration,
        max_attempts: u32,
        mut op: F,
    ) -> Result<Retried<T>, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure>>,
    {
        let host = host_of(url)?;
        let max_attempts = max_attempts.max(1);
        let mut retry_delays = Vec::new();
        let mut attempt = 1u32;

        loop {
            self.pacer.wait_turn(&host, pacing).await;
            let result = {
                let _permit = self.global_limit.acquire().await.map_err(|_| {
                    FetchError::Transient {
                        url: url.to_string(),
                        attempts: attempt,
                        reason: "fetch limiter closed".to_string(),
                    }
                })?;
                op(attempt).await
            };

            match result {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                        retry_delays,
                    })
                }
                Err(AttemptFailure::Permanent { status, reason }) => {
                    warn!(attempt, ?status, %reason, "permanent fetch failure");
                    return Err(FetchError::Permanent {
                        url: url.to_string(),
                        attempts: attempt,
                        status,
                        reason,
                    });
                }
                Err(AttemptFailure::Transient {
                    reason,
                    retry_after,
                }) => {
                    if attempt >= max_attempts {
                        warn!(attempt, %reason, "transient fetch failure; attempts exhausted");
                        return Err(FetchError::Transient {
                            url: url.to_string(),
                            attempts: attempt,
                            reason,
                        });
                    }
                    let mut delay = self.backoff.jittered_delay(attempt);
                    if let Some(retry_after) = retry_after {
                        delay = delay.max(retry_after);
                    }
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "transient fetch failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    retry_delays.push(delay);
                    attempt += 1;
                }
            }
        }
    }

    pub async fn fetch(
        &self,
        run_id: Uuid,
        descriptor: &SourceDescriptor,
        request: FetchRequest,
    ) -> Result<RawFetchResult, FetchError> {
        let span = info_span!(
            "http_fetch",
            %run_id,
            source_id = %descriptor.source_id,
            url = %request.url
        );

        async {
            let url = Url::parse(&request.url).map_err(|err| FetchError::Permanent {
                url: request.url.clone(),
                attempts: 0,
                status: None,
                reason: format!("malformed url: {err}"),
            })?;

            let retried = self
                .run_with_retries(
                    &request.url,
                    descriptor.pacing(),
                    descriptor.max_attempts(),
                    |_| self.get_once(url.clone(), &request),
                )
                .await?;

            let parts = retried.value;
            debug!(
                status = parts.status,
                attempts = retried.attempts,
                bytes = parts.body.len(),
                "fetched"
            );
            Ok(RawFetchResult {
                source_id: descriptor.source_id.clone(),
                url: request.url.clone(),
                final_url: parts.final_url,
                status: parts.status,
                content_type: parts.content_type,
                body: parts.body,
                fetched_at: Utc::now(),
                attempts: retried.attempts,
                retry_delays: retried.retry_delays,
            })
        }
        .instrument(span)
        .await
    }

    async fn get_once(
        &self,
        url: Url,
        options: &FetchRequest,
    ) -> Result<HttpResponseParts, AttemptFailure> {
        let mut request = self.client.get(url);
        if let Some(accept) = options.accept.as_deref() {
            request = request.header(ACCEPT, accept);
        }
        if let Some(token) = options.bearer.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, retry_after(response.headers())));
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|err| classify_reqwest_error(&err))?
            .to_vec();

        Ok(HttpResponseParts {
            final_url,
            status: status.as_u16(),
            content_type,
            body,
        })
    }
}

fn host_of(url: &str) -> Result<String, FetchError> {
    let malformed = |reason: String| FetchError::Permanent {
        url: url.to_string(),
        attempts: 0,
        status: None,
        reason,
    };
    let parsed = Url::parse(url).map_err(|err| malformed(format!("malformed url: {err}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| malformed("url has no host".to_string()))?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
