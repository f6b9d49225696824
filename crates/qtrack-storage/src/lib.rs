//! Year-partitioned Parquet storage + paced, retrying HTTP fetch utilities for qtrack.

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Context;
use qtrack_core::SourceKind;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub mod partition;

pub use partition::{
    ManifestFile, PartitionCensus, PartitionManifest, PartitionStore, StorageError,
};

pub const CRATE_NAME: &str = "qtrack-storage";

/// USAJobs throttling (429) and outages (5xx) clear up on their own.
pub fn status_is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Auth failures get their own error so callers can stop asking.
pub fn status_is_auth(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

pub fn transport_is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Exponential backoff between attempts of one request.
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the zero-based `attempt` failed: `base * 2^attempt`, capped.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = u32::try_from(attempt).unwrap_or(u32::MAX).min(31);
        self.base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }

    /// Hard ceiling on calls made by [`retry_transient`].
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Outcome of one attempt inside [`retry_transient`].
#[derive(Debug)]
pub enum Attempt<E> {
    Transient(E),
    Permanent(E),
}

#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted { attempts: usize, last: E },
    Permanent { attempts: usize, error: E },
}

/// Run `op` until it succeeds, fails permanently, or the policy's attempt cap is hit.
///
/// `op` receives the zero-based attempt index.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &BackoffPolicy,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(Attempt::Permanent(error)) => {
                return Err(RetryError::Permanent {
                    attempts: attempt + 1,
                    error,
                })
            }
            Err(Attempt::Transient(err)) => {
                if attempt >= policy.max_retries {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub min_request_interval: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            min_request_interval: Duration::from_millis(250),
        }
    }
}

/// Spaces consecutive requests at least `min_interval` apart.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// A GET request with extra headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream still failing after {attempts} attempts for {url}: {detail}")]
    Transient {
        attempts: usize,
        url: String,
        detail: String,
    },
    #[error("upstream refused credentials (http {status}) for {url}")]
    Auth { status: u16, url: String },
    #[error("http status {status} for {url}")]
    Rejected { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
}

#[derive(Debug)]
enum AttemptFailure {
    Status { status: StatusCode, url: String },
    Transport(reqwest::Error),
}

impl AttemptFailure {
    fn into_attempt(self) -> Attempt<Self> {
        let transient = match &self {
            AttemptFailure::Status { status, .. } => status_is_transient(*status),
            AttemptFailure::Transport(err) => transport_is_transient(err),
        };
        if transient {
            Attempt::Transient(self)
        } else {
            Attempt::Permanent(self)
        }
    }

    fn into_fetch_error(self) -> FetchError {
        match self {
            AttemptFailure::Status { status, url } if status_is_auth(status) => FetchError::Auth {
                status: status.as_u16(),
                url,
            },
            AttemptFailure::Status { status, url } => FetchError::Rejected {
                status: status.as_u16(),
                url,
            },
            AttemptFailure::Transport(err) => FetchError::Request(err),
        }
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::Status { status, url } => write!(f, "http status {status} for {url}"),
            AttemptFailure::Transport(err) => write!(f, "{err}"),
        }
    }
}

fn transport_attempt(err: reqwest::Error) -> Attempt<AttemptFailure> {
    AttemptFailure::Transport(err).into_attempt()
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let user_agent = config
            .user_agent
            .unwrap_or_else(|| format!("{CRATE_NAME}/{}", env!("CARGO_PKG_VERSION")));
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .context("building USAJobs http client")?;

        Ok(Self {
            client,
            pacer: RequestPacer::new(config.min_request_interval),
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub async fn fetch(
        &self,
        run_id: Uuid,
        source: SourceKind,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, %source, url = %request.url);
        self.fetch_with_retries(request).instrument(span).await
    }

    async fn attempt(
        &self,
        request: &FetchRequest,
        attempt: usize,
    ) -> Result<FetchedResponse, Attempt<AttemptFailure>> {
        self.pacer.wait().await;
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.send().await.map_err(transport_attempt)?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if status.is_success() {
            let body = resp.bytes().await.map_err(transport_attempt)?.to_vec();
            debug!(attempt = attempt + 1, bytes = body.len(), "fetched");
            return Ok(FetchedResponse {
                status,
                final_url,
                body,
                attempts: attempt + 1,
            });
        }

        Err(AttemptFailure::Status {
            status,
            url: final_url,
        }
        .into_attempt())
    }

    async fn fetch_with_retries(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        let outcome = retry_transient(&self.backoff, |attempt| self.attempt(request, attempt)).await;

        match outcome {
            Ok(resp) => Ok(resp),
            Err(RetryError::Exhausted { attempts, last }) => Err(FetchError::Transient {
                attempts,
                url: request.url.clone(),
                detail: last.to_string(),
            }),
            Err(RetryError::Permanent { error, .. }) => Err(error.into_fetch_error()),
        }
    }
}
