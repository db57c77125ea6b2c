//! Rate-limited, retrying provider client.
//!
//! Every provider owns a [`ProviderLimiter`]: a token bucket for admission, a
//! backoff state for retries, and a concurrency semaphore. Limiters are built
//! once from configuration and never removed, so saturation or failures on one
//! provider never slow another. A global semaphore caps calls actually on the
//! wire; it is not held while waiting for a token or sleeping through backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::{HttpMethod, ProviderRequest};

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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.delay_for_multiplier(factor)
    }

    fn delay_for_multiplier(&self, multiplier: u32) -> Duration {
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}

/// Per-provider retry state. Shared by every in-flight call to that provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    consecutive_failures: u32,
    multiplier: u32,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            multiplier: 1,
        }
    }
}

impl BackoffState {
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }

    /// Count a transient failure and return the delay before the next attempt.
    pub fn record_failure(&mut self, policy: &BackoffPolicy) -> Duration {
        let delay = policy.delay_for_multiplier(self.multiplier);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if delay < policy.max_delay {
            self.multiplier = self.multiplier.saturating_mul(2);
        }
        delay
    }

    pub fn record_success(&mut self) {
        *self = Self::default();
    }
}

/// Continuously refilling token bucket.
///
/// Tokens are fractional and bounded by `capacity`. A zero refill rate is valid:
/// the bucket then only grows through [`TokenBucket::replenish`].
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    state: parking_lot::Mutex<BucketState>,
    notify: Notify,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_second: if refill_per_second.is_finite() {
                refill_per_second.max(0.0)
            } else {
                0.0
            },
            state: parking_lot::Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.capacity);
        state.last_refill = now;
    }

    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a whole token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state, Instant::now());
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                (self.refill_per_second > 0.0).then(|| {
                    Duration::try_from_secs_f64((1.0 - state.tokens) / self.refill_per_second)
                        .unwrap_or(Duration::MAX)
                })
            };

            match wait {
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Add tokens by hand, waking every waiter to re-check.
    pub fn replenish(&self, tokens: f64) {
        {
            let mut state = self.state.lock();
            self.refill(&mut state, Instant::now());
            state.tokens = (state.tokens + tokens.max(0.0)).min(self.capacity);
        }
        self.notify.notify_waiters();
    }
}

#[derive(Debug, Clone)]
pub struct ProviderLimits {
    pub provider_id: String,
    pub capacity: u32,
    pub refill_per_second: f64,
    pub max_concurrency: usize,
}

#[derive(Debug)]
pub struct ProviderLimiter {
    provider_id: String,
    bucket: TokenBucket,
    backoff: parking_lot::Mutex<BackoffState>,
    concurrency: Arc<Semaphore>,
}

impl ProviderLimiter {
    pub fn new(limits: &ProviderLimits) -> Self {
        Self {
            provider_id: limits.provider_id.clone(),
            bucket: TokenBucket::new(limits.capacity, limits.refill_per_second),
            backoff: parking_lot::Mutex::new(BackoffState::default()),
            concurrency: Arc::new(Semaphore::new(limits.max_concurrency.max(1))),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    pub fn backoff(&self) -> BackoffState {
        *self.backoff.lock()
    }

    fn record_failure(&self, policy: &BackoffPolicy) -> Duration {
        self.backoff.lock().record_failure(policy)
    }

    fn record_success(&self) {
        self.backoff.lock().record_success();
    }
}

/// Limiters for every configured provider, fixed at construction.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: HashMap<String, Arc<ProviderLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new<'a>(limits: impl IntoIterator<Item = &'a ProviderLimits>) -> Self {
        let limiters = limits
            .into_iter()
            .map(|l| (l.provider_id.clone(), Arc::new(ProviderLimiter::new(l))))
            .collect();
        Self { limiters }
    }

    pub fn get(&self, provider: &str) -> Result<Arc<ProviderLimiter>, FetchError> {
        self.limiters
            .get(provider)
            .cloned()
            .ok_or_else(|| FetchError::UnknownProvider(provider.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub disposition: RetryDisposition,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            disposition: classify_reqwest_error(&err),
            message: err.to_string(),
        }
    }
}

/// Sends one request to a provider. The seam between the client and the network.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn send(&self, request: &ProviderRequest) -> Result<TransportResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProviderTransport for ReqwestTransport {
    async fn send(&self, request: &ProviderRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some((username, password)) = &request.basic_auth {
            builder = builder.basic_auth(username, Some(password));
        }
        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok(TransportResponse { status, body })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no rate limiter configured for provider {0}")]
    UnknownProvider(String),
    #[error("provider {provider} still rate limiting after {attempts} attempts")]
    RateLimitExceeded { provider: String, attempts: usize },
    #[error("provider {provider} failed after {attempts} attempts: {message}")]
    Provider {
        provider: String,
        attempts: usize,
        status: Option<u16>,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub status: StatusCode,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Clone)]
pub struct FetchClientConfig {
    pub attempt_timeout: Duration,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for FetchClientConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

struct AttemptFailure {
    message: String,
    status: Option<StatusCode>,
    retryable: bool,
}

pub struct FetchClient {
    transport: Arc<dyn ProviderTransport>,
    limiters: RateLimiterRegistry,
    global: Semaphore,
    config: FetchClientConfig,
}

impl FetchClient {
    pub fn new(
        transport: Arc<dyn ProviderTransport>,
        limiters: RateLimiterRegistry,
        config: FetchClientConfig,
    ) -> Self {
        Self {
            transport,
            limiters,
            global: Semaphore::new(config.global_concurrency.max(1)),
            config,
        }
    }

    pub fn limiters(&self) -> &RateLimiterRegistry {
        &self.limiters
    }

    /// Admit, send, and retry transient failures until success or the retry cap.
    pub async fn fetch(
        &self,
        provider: &str,
        request: &ProviderRequest,
    ) -> Result<FetchedPayload, FetchError> {
        let limiter = self.limiters.get(provider)?;
        let span = info_span!("provider_fetch", provider, url = %request.url);
        async {
            let closed = |_| FetchError::Provider {
                provider: provider.to_string(),
                attempts: 0,
                status: None,
                message: "fetch client is shutting down".to_string(),
            };
            let _slot = limiter.concurrency.acquire().await.map_err(closed)?;

            let mut attempts = 0usize;
            loop {
                limiter.bucket.acquire().await;
                attempts += 1;

                // The global permit covers the network call only, never token waits or backoff.
                let sent = {
                    let _global = self.global.acquire().await.map_err(closed)?;
                    tokio::time::timeout(self.config.attempt_timeout, self.transport.send(request))
                        .await
                };
                let failure = match sent {
                    Ok(Ok(response)) if response.status.is_success() => {
                        limiter.record_success();
                        return Ok(FetchedPayload {
                            status: response.status,
                            body: response.body,
                            attempts,
                        });
                    }
                    Ok(Ok(response)) => AttemptFailure {
                        message: format!("http status {}", response.status),
                        status: Some(response.status),
                        retryable: classify_status(response.status) == RetryDisposition::Retryable,
                    },
                    Ok(Err(err)) => AttemptFailure {
                        retryable: err.disposition == RetryDisposition::Retryable,
                        message: err.message,
                        status: None,
                    },
                    Err(_) => AttemptFailure {
                        message: format!("timed out after {:?}", self.config.attempt_timeout),
                        status: None,
                        retryable: true,
                    },
                };

                if !failure.retryable {
                    warn!(attempts, error = %failure.message, "permanent provider failure");
                    return Err(FetchError::Provider {
                        provider: provider.to_string(),
                        attempts,
                        status: failure.status.map(|s| s.as_u16()),
                        message: failure.message,
                    });
                }

                let delay = limiter.record_failure(&self.config.backoff);
                if attempts > self.config.backoff.max_retries {
                    warn!(attempts, error = %failure.message, "provider retries exhausted");
                    if failure.status == Some(StatusCode::TOO_MANY_REQUESTS) {
                        return Err(FetchError::RateLimitExceeded {
                            provider: provider.to_string(),
                            attempts,
                        });
                    }
                    return Err(FetchError::Provider {
                        provider: provider.to_string(),
                        attempts,
                        status: failure.status.map(|s| s.as_u16()),
                        message: failure.message,
                    });
                }

                debug!(attempts, ?delay, error = %failure.message, "transient provider failure; backing off");
                tokio::time::sleep(delay).await;
            }
        }
        .instrument(span)
        .await
    }
}
