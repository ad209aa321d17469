//! Per-provider client: timeouts, retries, connection replacement, and
//! latency recording layered on top of a [`crate::pool::ConnectionPool`].
//!
//! The retry/backoff shape is grounded on `job-queue`'s `JobRunner::run`
//! (exponential-ish backoff, `tracing` error formatting with `{:#}`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{instrument, warn};

use crate::config::EngineLimits;
use crate::error::{ProviderError, TransportError};
use crate::limiter::OperationLimiter;
use crate::pool::ConnectionPool;
use crate::stats::BandwidthSink;
use crate::transport::{ArticleBody, YencHeader};
use crate::usage::UsageContext;

/// Fixed backoff between a transient failure and the next retry attempt on
/// the same provider.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
/// Floor for the dynamic per-operation timeout, regardless of rolling latency.
const MIN_TIMEOUT: Duration = Duration::from_secs(45);
/// Budget for the post-operation quiet-wait before a connection must be
/// returned (if quiet) or replaced (if not).
const QUIET_WAIT_BUDGET: Duration = Duration::from_millis(500);

/// Wraps one provider's [`ConnectionPool`] with the operation algorithm from
/// the dispatch/retry contract: acquire a permit, lease a connection, run
/// the operation under a dynamic deadline, retry transient failures with
/// backoff, and record latency.
pub struct ProviderClient {
    pub provider_index: usize,
    pool: ConnectionPool,
    limiter: Arc<OperationLimiter>,
    bandwidth: Arc<BandwidthSink>,
    retry_budget: u32,
    configured_timeout: Duration,
    rolling_avg_latency_ms: AtomicU64,
}

enum Outcome<T> {
    Success(T),
    Transient(TransportError),
    Permanent(TransportError),
}

impl ProviderClient {
    pub fn new(
        provider_index: usize,
        pool: ConnectionPool,
        limiter: Arc<OperationLimiter>,
        bandwidth: Arc<BandwidthSink>,
        limits: &EngineLimits,
    ) -> Self {
        Self {
            provider_index,
            pool,
            limiter,
            bandwidth,
            retry_budget: limits.retry_budget,
            configured_timeout: limits.operation_timeout,
            rolling_avg_latency_ms: AtomicU64::new(MIN_TIMEOUT.as_millis() as u64 / 4),
        }
    }

    fn dynamic_timeout(&self) -> Duration {
        let rolling = Duration::from_millis(self.rolling_avg_latency_ms.load(Ordering::Relaxed));
        (rolling * 4).clamp(MIN_TIMEOUT, self.configured_timeout)
    }

    fn record_latency(&self, elapsed: Duration) {
        let previous = self.rolling_avg_latency_ms.load(Ordering::Relaxed);
        let sample = elapsed.as_millis() as u64;
        // EWMA with alpha = 0.2, matching the affinity learner's smoothing.
        let updated = (sample / 5) + (previous * 4 / 5);
        self.rolling_avg_latency_ms.store(updated, Ordering::Relaxed);
    }

    #[instrument(skip(self, ctx), fields(provider = self.provider_index))]
    pub async fn stat(&self, message_id: &str, ctx: &UsageContext) -> Result<bool, ProviderError> {
        self.run(ctx, |transport| {
            let message_id = message_id.to_owned();
            Box::pin(async move { transport.stat(&message_id).await })
        })
        .await
    }

    #[instrument(skip(self, ctx), fields(provider = self.provider_index))]
    pub async fn head(&self, message_id: &str, ctx: &UsageContext) -> Result<YencHeader, ProviderError> {
        self.run(ctx, |transport| {
            let message_id = message_id.to_owned();
            Box::pin(async move { transport.head(&message_id).await })
        })
        .await
    }

    #[instrument(skip(self, ctx), fields(provider = self.provider_index))]
    pub async fn body(&self, message_id: &str, ctx: &UsageContext) -> Result<ArticleBody, ProviderError> {
        let body = self
            .run(ctx, |transport| {
                let message_id = message_id.to_owned();
                Box::pin(async move { transport.body(&message_id).await })
            })
            .await?;
        self.bandwidth.record_bytes(self.provider_index, body.bytes.len() as u64);
        Ok(body)
    }

    /// Runs `op` with the full acquire/timeout/retry/backoff/quiet-wait
    /// algorithm described by the engine's provider-client contract.
    async fn run<T, F>(&self, ctx: &UsageContext, mut op: F) -> Result<T, ProviderError>
    where
        T: Send + 'static,
        F: for<'a> FnMut(
            &'a mut crate::transport::BoxedTransport,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, TransportError>> + Send + 'a>>,
    {
        let mut attempt = 0;
        loop {
            let permit = self.limiter.acquire(ctx.kind().operation_class()).await;
            let timeout = self.dynamic_timeout();

            let mut lease = match tokio::time::timeout(timeout, self.pool.lease(timeout)).await {
                Ok(Ok(lease)) => lease,
                Ok(Err(pool_error)) => {
                    drop(permit);
                    self.handle_failure(&mut attempt, TransportError::from(pool_error)).await?;
                    continue;
                }
                Err(_) => {
                    drop(permit);
                    self.handle_failure(&mut attempt, TransportError::Timeout(timeout)).await?;
                    continue;
                }
            };

            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, op(lease.transport())).await {
                Ok(Ok(value)) => Outcome::Success(value),
                Ok(Err(err)) if err.is_permanent_segment_failure() => Outcome::Permanent(err),
                Ok(Err(err)) => Outcome::Transient(err),
                Err(_) => {
                    lease.transport().mark_dirty();
                    Outcome::Transient(TransportError::Timeout(timeout))
                }
            };
            let elapsed = started.elapsed();

            match outcome {
                Outcome::Success(value) => {
                    self.record_latency(elapsed);
                    // The quiet-wait can take up to `QUIET_WAIT_BUDGET`; run it
                    // detached so a successful call returns to its caller
                    // immediately instead of blocking on connection bookkeeping.
                    tokio::spawn(Self::quiet_wait_then_release(lease));
                    drop(permit);
                    return Ok(value);
                }
                Outcome::Permanent(err) => {
                    // Leave the connection for reuse: the article is simply
                    // absent, the connection itself is fine.
                    lease.return_to_pool().await;
                    drop(permit);
                    return Err(ProviderError::PermanentSegmentFailure {
                        provider_index: self.provider_index,
                        source: err,
                    });
                }
                Outcome::Transient(err) => {
                    lease.replace();
                    drop(permit);
                    self.handle_failure(&mut attempt, err).await?;
                }
            }
        }
    }

    /// Releases the operation permit (already dropped by the caller) and
    /// either sleeps for the backoff (retry budget remains: `Ok(())`, loop
    /// again) or surfaces the failure (`Err`, budget exhausted).
    async fn handle_failure(&self, attempt: &mut u32, err: TransportError) -> Result<(), ProviderError> {
        *attempt += 1;
        if *attempt > self.retry_budget {
            return Err(ProviderError::Transient {
                provider_index: self.provider_index,
                source: err,
            });
        }
        warn!(error = format!("{err:#}"), attempt, "transient failure, retrying provider");
        tokio::time::sleep(RETRY_BACKOFF).await;
        Ok(())
    }

    /// Spawned detached from [`Self::run`]'s success path so a caller never
    /// waits on this bookkeeping.
    async fn quiet_wait_then_release(mut lease: crate::pool::ConnectionLease) {
        // Give the connection a bounded window to settle (e.g. finish
        // draining a body stream's trailing bytes) before deciding whether
        // to return it or replace it.
        let deadline = Instant::now() + QUIET_WAIT_BUDGET;
        while Instant::now() < deadline {
            if lease.transport().state() != crate::transport::ConnectionState::InUse {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if lease.transport().state() == crate::transport::ConnectionState::Dirty {
            lease.replace();
        } else {
            lease.return_to_pool().await;
        }
    }
}

// Streaming/other callers that need a raw semaphore permit count (e.g. for
// dispatch ordering heuristics) can inspect pool/limiter state via these
// small accessors.
impl ProviderClient {
    /// Spare lease capacity on this provider's pool, used by the dispatcher
    /// to favor high-headroom providers under [`crate::dispatcher::OrderingPolicy::Sequential`].
    pub fn idle_connections(&self) -> usize {
        self.pool.available_permits()
    }

    /// This provider's configured connection cap, used to compute the
    /// available/max ratio under [`crate::dispatcher::OrderingPolicy::Balanced`].
    pub fn max_connections(&self) -> usize {
        self.pool.max_connections()
    }

    /// Spare capacity on the shared pooled-provider semaphore, used as a
    /// tiebreaker under [`crate::dispatcher::OrderingPolicy::Sequential`].
    pub fn shared_available_permits(&self) -> Option<usize> {
        self.pool.shared_available_permits()
    }
}
