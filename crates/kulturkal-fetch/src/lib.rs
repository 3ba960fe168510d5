//! HTTP fetch utilities for Kulturkal: rate-limited fetching with retry,
//! per-source circuit breaking, and a raw-payload snapshot cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn};

pub const CRATE_NAME: &str = "kulturkal-fetch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    /// Minimum spacing between requests against the same host.
    pub min_host_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 8,
            per_host_concurrency: 2,
            min_host_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("circuit open for source {source_id} until {until}")]
    CircuitOpen {
        source_id: String,
        until: DateTime<Utc>,
    },
}

pub fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// Per-host minimum-interval limiter. Callers hold no lock while sleeping.
#[derive(Debug)]
struct HostRateLimiter {
    min_interval: Duration,
    last_request: Mutex<HashMap<String, tokio::time::Instant>>,
}

impl HostRateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    async fn wait_for(&self, host: &str) {
        if self.min_interval.is_zero() {
            return;
        }
        loop {
            let sleep_until = {
                let mut map = self.last_request.lock().await;
                let now = tokio::time::Instant::now();
                match map.get(host) {
                    Some(last) if now.duration_since(*last) < self.min_interval => {
                        Some(*last + self.min_interval)
                    }
                    _ => {
                        map.insert(host.to_string(), now);
                        None
                    }
                }
            };
            match sleep_until {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => return,
            }
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limiter: HostRateLimiter,
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
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            rate_limiter: HostRateLimiter::new(config.min_host_interval),
            backoff: config.backoff,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let host = host_of(url);
        let per_host = self.per_host_semaphore(&host).await;
        let _host_permit = per_host.acquire().await.expect("semaphore not closed");

        self.rate_limiter.wait_for(&host).await;

        let span = info_span!("http_fetch", source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(ToString::to_string);

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Progressive cool-downs applied as consecutive failures keep mounting.
    pub cooldowns: Vec<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldowns: vec![
                Duration::from_secs(5 * 60),
                Duration::from_secs(15 * 60),
                Duration::from_secs(60 * 60),
            ],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceHealth {
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub open_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Tracks failures per source and refuses calls to sources that keep failing.
/// A success resets the counter and closes the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    sources: std::sync::Mutex<HashMap<String, SourceHealth>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            sources: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, source_id: &str) -> Result<(), FetchError> {
        self.check_at(source_id, Utc::now())
    }

    pub fn check_at(&self, source_id: &str, now: DateTime<Utc>) -> Result<(), FetchError> {
        let mut sources = self.sources.lock().expect("breaker lock poisoned");
        let health = sources.entry(source_id.to_string()).or_default();
        match health.open_until {
            Some(until) if now < until => Err(FetchError::CircuitOpen {
                source_id: source_id.to_string(),
                until,
            }),
            Some(_) => {
                // Cool-down elapsed; allow one probe through.
                health.open_until = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn record_success(&self, source_id: &str) {
        self.record_success_at(source_id, Utc::now());
    }

    pub fn record_success_at(&self, source_id: &str, now: DateTime<Utc>) {
        let mut sources = self.sources.lock().expect("breaker lock poisoned");
        let health = sources.entry(source_id.to_string()).or_default();
        health.consecutive_failures = 0;
        health.last_success = Some(now);
        health.open_until = None;
        health.last_error = None;
    }

    pub fn record_failure(&self, source_id: &str, error: &str) {
        self.record_failure_at(source_id, error, Utc::now());
    }

    pub fn record_failure_at(&self, source_id: &str, error: &str, now: DateTime<Utc>) {
        let mut sources = self.sources.lock().expect("breaker lock poisoned");
        let health = sources.entry(source_id.to_string()).or_default();
        health.consecutive_failures += 1;
        health.last_failure = Some(now);
        health.last_error = Some(error.to_string());

        if health.consecutive_failures >= self.config.failure_threshold {
            let step = (health.consecutive_failures - self.config.failure_threshold) as usize;
            let cooldown = self
                .config
                .cooldowns
                .get(step.min(self.config.cooldowns.len().saturating_sub(1)))
                .copied()
                .unwrap_or(Duration::from_secs(60 * 60));
            let until = now + chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::hours(1));
            health.open_until = Some(until);
            warn!(source_id, cooldown_secs = cooldown.as_secs(), "circuit opened after repeated failures");
        }
    }

    pub fn health(&self, source_id: &str) -> SourceHealth {
        let sources = self.sources.lock().expect("breaker lock poisoned");
        sources.get(source_id).cloned().unwrap_or_default()
    }

    pub fn all_health(&self) -> Vec<(String, SourceHealth)> {
        let sources = self.sources.lock().expect("breaker lock poisoned");
        let mut out: Vec<_> = sources.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed store for raw fetched payloads. One directory per
/// source with a `latest` pointer, so a source that goes dark can be
/// replayed from its most recent successful fetch.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
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

    fn snapshot_file_name(fetched_at: DateTime<Utc>, content_hash: &str, extension: &str) -> String {
        let stamp = fetched_at.format("%Y%m%dT%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        format!("{stamp}_{content_hash}.{ext}")
    }

    fn parse_stamp(file_name: &str) -> Option<DateTime<Utc>> {
        let stamp = file_name.split('_').next()?;
        NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H%M%S")
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Store bytes immutably using a hash-addressed path and atomic
    /// temp-file rename, then repoint `latest` at the stored file.
    pub async fn store_bytes(
        &self,
        source_id: &str,
        fetched_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let file_name = Self::snapshot_file_name(fetched_at, &content_hash, extension);
        let relative_path = PathBuf::from(source_id).join(&file_name);
        let absolute_path = self.root.join(&relative_path);
        let source_dir = self.root.join(source_id);

        fs::create_dir_all(&source_dir)
            .await
            .with_context(|| format!("creating snapshot directory {}", source_dir.display()))?;

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?;

        if !deduplicated {
            let temp_path = source_dir.join(format!(".{content_hash}.{}.tmp", bytes.len()));
            let mut file = fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&temp_path)
                .await
                .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
            file.write_all(bytes)
                .await
                .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
            drop(file);

            fs::rename(&temp_path, &absolute_path).await.with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            })?;
        }

        self.write_latest_pointer(&source_dir, &file_name).await?;

        Ok(StoredSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }

    async fn write_latest_pointer(&self, source_dir: &Path, file_name: &str) -> anyhow::Result<()> {
        let pointer = source_dir.join("latest");
        let temp = source_dir.join(".latest.tmp");
        fs::write(&temp, file_name)
            .await
            .with_context(|| format!("writing {}", temp.display()))?;
        fs::rename(&temp, &pointer)
            .await
            .with_context(|| format!("renaming {} -> {}", temp.display(), pointer.display()))?;
        Ok(())
    }

    /// Replay the most recent snapshot for a source if it is younger than
    /// `max_age`. Returns the payload and when it was originally fetched.
    pub async fn load_latest(
        &self,
        source_id: &str,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<(Vec<u8>, DateTime<Utc>)>> {
        let pointer = self.root.join(source_id).join("latest");
        if !fs::try_exists(&pointer)
            .await
            .with_context(|| format!("checking {}", pointer.display()))?
        {
            return Ok(None);
        }

        let file_name = fs::read_to_string(&pointer)
            .await
            .with_context(|| format!("reading {}", pointer.display()))?;
        let file_name = file_name.trim();
        let Some(fetched_at) = Self::parse_stamp(file_name) else {
            warn!(source_id, file_name, "snapshot pointer has an unparseable stamp");
            return Ok(None);
        };

        let age = now.signed_duration_since(fetched_at);
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::hours(24));
        if age > max_age {
            return Ok(None);
        }

        let path = self.root.join(source_id).join(file_name);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        Ok(Some((bytes, fetched_at)))
    }
}
