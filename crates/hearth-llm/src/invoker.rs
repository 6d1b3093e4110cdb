//! Resilient model invocation: retry, circuit breaking, fallback and usage.
//!
//! [`ResilientInvoker`] wraps a primary backend and an optional fallback. The
//! primary is tried up to [`RetryPolicy::max_retries`] times with the policy's
//! backoff between attempts, as long as its circuit allows. Once the primary is
//! exhausted, the fallback gets exactly one attempt behind its own circuit. If
//! both fail, the primary's error is returned.
//!
//! Streaming calls apply the same policy to stream setup only. Once the first
//! event has been delivered, a later error ends the stream; switching providers
//! after partial output would splice two different answers together.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;

use crate::backend::{ResponseStream, SharedBackend, StreamEvent};
use crate::breaker::BreakerRegistry;
use crate::context::CallContext;
use crate::error::{LlmError, Result};
use crate::types::{CompletionRequest, CompletionResponse, Usage};
use crate::usage::{
    ActivityEvent, CallOutcome, PricingTable, TracingUsageSink, UsageRecord, UsageReporter,
    UsageSink,
};

/// Default number of primary attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delays between primary attempts.
pub const DEFAULT_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

// ─────────────────────────────────────────────────────────────────────────────
// Retry Policy
// ─────────────────────────────────────────────────────────────────────────────

/// How many times to try the primary and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total primary attempts (not additional retries).
    pub max_retries: u32,
    /// Delay after the n-th failed attempt. The last entry repeats.
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Vec<Duration>) -> Self {
        Self {
            max_retries: max_retries.max(1),
            backoff,
        }
    }

    /// Delay to wait after the failed attempt with the given zero-based index.
    pub fn delay(&self, attempt: usize) -> Duration {
        match self.backoff.len() {
            0 => Duration::ZERO,
            len => self.backoff[attempt.min(len - 1)],
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Invoker
// ─────────────────────────────────────────────────────────────────────────────

/// Which backend served a call.
struct Served<T> {
    value: T,
    provider: String,
    model: String,
    fallback_used: bool,
}

/// Primary + fallback backends behind retry and circuit breaking.
pub struct ResilientInvoker {
    primary: SharedBackend,
    fallback: Option<SharedBackend>,
    breakers: Arc<BreakerRegistry>,
    policy: RetryPolicy,
    pricing: Arc<PricingTable>,
    reporter: UsageReporter,
}

impl std::fmt::Debug for ResilientInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientInvoker")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.as_ref().map(|b| b.name()))
            .field("policy", &self.policy)
            .finish()
    }
}

impl ResilientInvoker {
    /// Create an invoker with default policy, a private breaker registry and
    /// tracing-based usage reporting.
    pub fn new(primary: SharedBackend) -> Self {
        Self {
            primary,
            fallback: None,
            breakers: Arc::new(BreakerRegistry::default()),
            policy: RetryPolicy::default(),
            pricing: Arc::new(PricingTable::default()),
            reporter: UsageReporter::new(Arc::new(TracingUsageSink)),
        }
    }

    /// Set the fallback backend.
    pub fn with_fallback(mut self, fallback: SharedBackend) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Share a breaker registry with other invokers.
    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the pricing table used for cost estimates.
    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = Arc::new(pricing);
        self
    }

    /// Set the usage/activity sink.
    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.reporter = UsageReporter::new(sink);
        self
    }

    /// The breaker registry in use.
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Provider id of the primary backend.
    pub fn primary_provider(&self) -> &str {
        self.primary.name()
    }

    /// Run a completion and return the full response.
    pub async fn invoke(
        &self,
        request: CompletionRequest,
        ctx: &CallContext,
    ) -> Result<CompletionResponse> {
        let started = Instant::now();
        self.reporter
            .activity(ActivityEvent::started(&request.model, ctx, false));

        let result = self
            .run_with_failover(&request, |backend, req| async move {
                backend.complete(req).await
            })
            .await;

        let latency_ms = elapsed_ms(started);
        match result {
            Ok(served) => {
                self.reporter.activity(ActivityEvent::finished(
                    &served.model,
                    ctx,
                    true,
                    latency_ms,
                ));
                self.reporter.usage(UsageRecord::build(
                    CallOutcome {
                        provider: &served.provider,
                        model: &served.model,
                        usage: served.value.usage,
                        latency_ms,
                        streaming: false,
                        fallback_used: served.fallback_used,
                    },
                    ctx,
                    &self.pricing,
                ));
                Ok(served.value)
            }
            Err(e) => {
                self.reporter.activity(ActivityEvent::finished(
                    &request.model,
                    ctx,
                    false,
                    latency_ms,
                ));
                Err(e)
            }
        }
    }

    /// Open a completion stream.
    ///
    /// Returns once a backend has produced its first event. Errors after that
    /// point surface as the stream's last item and are never retried. Dropping
    /// the stream early reports the call as unsuccessful.
    pub async fn invoke_stream(
        &self,
        request: CompletionRequest,
        ctx: &CallContext,
    ) -> Result<ResponseStream> {
        let started = Instant::now();
        let request = request.with_streaming();
        self.reporter
            .activity(ActivityEvent::started(&request.model, ctx, true));

        let setup = self
            .run_with_failover(&request, |backend, req| async move {
                let mut stream = backend.complete_stream(req).await?;
                let first = match stream.next().await.transpose()? {
                    Some(StreamEvent::Error { message }) => return Err(LlmError::Backend(message)),
                    other => other,
                };
                Ok::<_, LlmError>((first, stream))
            })
            .await;

        let served = match setup {
            Ok(served) => served,
            Err(e) => {
                self.reporter.activity(ActivityEvent::finished(
                    &request.model,
                    ctx,
                    false,
                    elapsed_ms(started),
                ));
                return Err(e);
            }
        };

        let (first, mut inner) = served.value;
        let breaker = self.breakers.breaker(&served.provider);
        let pricing = Arc::clone(&self.pricing);
        let provider = served.provider;
        let fallback_used = served.fallback_used;
        let mut finish = StreamFinish {
            reporter: self.reporter.clone(),
            model: served.model,
            ctx: ctx.clone(),
            started,
            reported: false,
        };

        let stream = async_stream::stream! {
            let mut usage = Usage::default();
            let mut success = true;

            if let Some(event) = first {
                if let StreamEvent::MessageDelta { usage: u, .. } = &event {
                    usage = *u;
                }
                yield Ok(event);
            }

            while let Some(item) = inner.next().await {
                match item {
                    Ok(StreamEvent::Error { message }) => {
                        breaker.record_failure();
                        success = false;
                        tracing::warn!(provider = %provider, error = %message, "Provider reported error mid-stream");
                        yield Err(LlmError::Backend(message));
                        break;
                    }
                    Ok(event) => {
                        if let StreamEvent::MessageDelta { usage: u, .. } = &event {
                            usage = *u;
                        }
                        yield Ok(event);
                    }
                    Err(e) => {
                        breaker.record_failure();
                        success = false;
                        tracing::warn!(provider = %provider, error = %e, "Stream failed after first event");
                        yield Err(e);
                        break;
                    }
                }
            }

            let latency_ms = finish.report(success);
            if success {
                finish.reporter.usage(UsageRecord::build(
                    CallOutcome {
                        provider: &provider,
                        model: &finish.model,
                        usage,
                        latency_ms,
                        streaming: true,
                        fallback_used,
                    },
                    &finish.ctx,
                    &pricing,
                ));
            }
        };

        Ok(Box::pin(stream))
    }

    /// Apply the retry/fallback policy to one call shape.
    async fn run_with_failover<T, F, Fut>(
        &self,
        request: &CompletionRequest,
        mut call: F,
    ) -> Result<Served<T>>
    where
        F: FnMut(SharedBackend, CompletionRequest) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let provider = self.primary.name().to_string();
        let breaker = self.breakers.breaker(&provider);
        let primary_request = routed_request(&self.primary, request);
        let mut last_error: Option<LlmError> = None;

        for attempt in 0..self.policy.max_retries as usize {
            if !breaker.can_attempt() {
                tracing::debug!(
                    provider = %provider,
                    attempt = attempt + 1,
                    "Circuit open, skipping remaining primary attempts"
                );
                break;
            }

            match call(Arc::clone(&self.primary), primary_request.clone()).await {
                Ok(value) => {
                    breaker.record_success();
                    if attempt > 0 {
                        tracing::info!(provider = %provider, attempt = attempt + 1, "Primary succeeded after retry");
                    }
                    return Ok(Served {
                        value,
                        provider,
                        model: primary_request.model,
                        fallback_used: false,
                    });
                }
                Err(e) => {
                    breaker.record_failure();
                    tracing::warn!(
                        provider = %provider,
                        attempt = attempt + 1,
                        max_retries = self.policy.max_retries,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Primary attempt failed"
                    );
                    last_error = Some(e);

                    let last_attempt = attempt + 1 >= self.policy.max_retries as usize;
                    if last_attempt || breaker.is_open() {
                        break;
                    }

                    let delay = self.policy.delay(attempt);
                    tracing::debug!(
                        provider = %provider,
                        backoff_ms = delay.as_millis() as u64,
                        "Backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let primary_error = last_error.unwrap_or_else(|| LlmError::circuit_open(&provider));

        if let Some(fallback) = &self.fallback {
            let fallback_provider = fallback.name().to_string();
            let fallback_breaker = self.breakers.breaker(&fallback_provider);

            if !fallback_breaker.can_attempt() {
                tracing::debug!(provider = %fallback_provider, "Fallback circuit open");
                return Err(primary_error);
            }

            tracing::info!(
                provider = %fallback_provider,
                primary = %provider,
                "Trying fallback provider"
            );
            let fallback_request = routed_request(fallback, request);
            match call(Arc::clone(fallback), fallback_request.clone()).await {
                Ok(value) => {
                    fallback_breaker.record_success();
                    tracing::info!(provider = %fallback_provider, "Fallback succeeded");
                    return Ok(Served {
                        value,
                        provider: fallback_provider,
                        model: fallback_request.model,
                        fallback_used: true,
                    });
                }
                Err(e) => {
                    fallback_breaker.record_failure();
                    tracing::warn!(
                        provider = %fallback_provider,
                        error = %e,
                        "Fallback failed, returning primary error"
                    );
                }
            }
        }

        Err(primary_error)
    }
}

/// Emits `Finished` for a stream exactly once.
///
/// A stream dropped by its consumer before the end is reported as unsuccessful
/// and produces no usage record.
struct StreamFinish {
    reporter: UsageReporter,
    model: String,
    ctx: CallContext,
    started: Instant,
    reported: bool,
}

impl StreamFinish {
    fn report(&mut self, success: bool) -> u64 {
        let latency_ms = elapsed_ms(self.started);
        if !self.reported {
            self.reported = true;
            self.reporter.activity(ActivityEvent::finished(
                &self.model,
                &self.ctx,
                success,
                latency_ms,
            ));
        }
        latency_ms
    }
}

impl Drop for StreamFinish {
    fn drop(&mut self) {
        if !self.reported {
            tracing::debug!(model = %self.model, "Stream dropped before completion");
            self.report(false);
        }
    }
}

/// The request as the given backend should receive it.
fn routed_request(backend: &SharedBackend, request: &CompletionRequest) -> CompletionRequest {
    let mut routed = request.clone();
    if let Some(model) = backend.model() {
        routed.model = model.to_string();
    }
    routed
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
