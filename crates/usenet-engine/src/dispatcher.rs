//! Multi-provider ordering and fail-over.
//!
//! The fail-over loop generalizes the retry-N-times-then-give-up idiom from
//! `other_examples`'s NZB downloader to an arbitrary ordered list of
//! providers, consulting [`crate::affinity::AffinityStore`] for ordering
//! hints and recording misses to the [`crate::stats`] sinks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{instrument, warn};

use crate::affinity::AffinityStore;
use crate::config::ProviderKind;
use crate::error::{DispatchError, ProviderError};
use crate::provider_client::ProviderClient;
use crate::stats::{BandwidthSink, DynErrorSink, MissingArticleEvent};
use crate::transport::{ArticleBody, YencHeader};
use crate::usage::UsageContext;

/// How providers should be ordered for a given call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingPolicy {
    /// STAT/HEAD/one-shot BODY: favor idle, high-headroom pooled providers.
    Sequential,
    /// Buffered-streaming look-ahead: spread load across providers with
    /// the most spare capacity and lowest latency.
    Balanced,
}

struct ProviderEntry {
    client: Arc<ProviderClient>,
    kind: ProviderKind,
}

/// Coordinates an ordered set of [`ProviderClient`]s behind a single
/// logical "fetch this segment" API.
pub struct Dispatcher {
    providers: Vec<ProviderEntry>,
    affinity: Arc<AffinityStore>,
    bandwidth: Arc<BandwidthSink>,
    error_sink: DynErrorSink,
}

impl Dispatcher {
    pub fn new(
        providers: Vec<(Arc<ProviderClient>, ProviderKind)>,
        affinity: Arc<AffinityStore>,
        bandwidth: Arc<BandwidthSink>,
        error_sink: DynErrorSink,
    ) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|(client, kind)| ProviderEntry { client, kind })
                .collect(),
            affinity,
            bandwidth,
            error_sink,
        }
    }

    /// Builds the provider visit order for one call, per the ordering rules
    /// in the dispatch contract: forced provider short-circuits everything
    /// else; otherwise affinity hint and sticky last-successful provider are
    /// prepended, excluded providers are pushed to the tail (never
    /// dropped), and the remainder is ordered by kind and the requested
    /// [`OrderingPolicy`].
    fn build_order(&self, ctx: &UsageContext, policy: OrderingPolicy) -> Vec<usize> {
        if let Some(forced) = ctx.forced_provider_index() {
            return vec![forced];
        }

        let excluded: HashSet<usize> = ctx.excluded_provider_indices().into_iter().collect();
        let eligible: Vec<usize> = self
            .providers
            .iter()
            .enumerate()
            .filter(|(_, entry)| !matches!(entry.kind, ProviderKind::Disabled))
            .map(|(index, _)| index)
            .collect();

        let mut head = Vec::new();
        if let Some(key) = ctx.affinity_key() {
            // BackupOnly providers are excluded from affinity selection unless
            // they are the only eligible, non-excluded providers left.
            let non_excluded: Vec<usize> = eligible.iter().copied().filter(|index| !excluded.contains(index)).collect();
            let preferred_candidates: Vec<usize> = non_excluded
                .iter()
                .copied()
                .filter(|&index| !matches!(self.providers[index].kind, ProviderKind::BackupOnly))
                .collect();
            let candidates = if preferred_candidates.is_empty() { &non_excluded } else { &preferred_candidates };
            if let Some(preferred) = self.affinity.preferred_provider(key, candidates) {
                head.push(preferred);
            }
        }
        if let Some(sticky) = ctx.last_successful_provider() {
            if !head.contains(&sticky) && !excluded.contains(&sticky) {
                head.push(sticky);
            }
        }

        let mut pooled: Vec<usize> = Vec::new();
        let mut backup: Vec<usize> = Vec::new();
        let mut backup_only: Vec<usize> = Vec::new();
        let mut excluded_tail: Vec<usize> = Vec::new();
        for index in eligible {
            if head.contains(&index) {
                continue;
            }
            if excluded.contains(&index) {
                excluded_tail.push(index);
                continue;
            }
            match self.providers[index].kind {
                ProviderKind::Pooled => pooled.push(index),
                ProviderKind::Backup => backup.push(index),
                ProviderKind::BackupOnly => backup_only.push(index),
                ProviderKind::Disabled => {}
            }
        }

        match policy {
            OrderingPolicy::Sequential => {
                // Favor the idlest provider; ties broken by whichever has the
                // most headroom left on the shared pooled-provider semaphore.
                pooled.sort_by(|&a, &b| {
                    let client_a = &self.providers[a].client;
                    let client_b = &self.providers[b].client;
                    let idle_a = client_a.idle_connections();
                    let idle_b = client_b.idle_connections();
                    idle_b.cmp(&idle_a).then_with(|| {
                        let shared_a = client_a.shared_available_permits().unwrap_or(idle_a);
                        let shared_b = client_b.shared_available_permits().unwrap_or(idle_b);
                        shared_b.cmp(&shared_a)
                    })
                });
            }
            OrderingPolicy::Balanced => {
                // Three-key sort: has spare capacity at all, then available/max
                // ratio (more headroom first), then latency EWMA (faster first).
                pooled.sort_by(|&a, &b| {
                    let client_a = &self.providers[a].client;
                    let client_b = &self.providers[b].client;
                    let idle_a = client_a.idle_connections();
                    let idle_b = client_b.idle_connections();

                    (idle_b > 0)
                        .cmp(&(idle_a > 0))
                        .then_with(|| {
                            let ratio_a = idle_a as f64 / client_a.max_connections().max(1) as f64;
                            let ratio_b = idle_b as f64 / client_b.max_connections().max(1) as f64;
                            ratio_b.total_cmp(&ratio_a)
                        })
                        .then_with(|| {
                            let latency_a = self.bandwidth.latency_ewma_ms(a);
                            let latency_b = self.bandwidth.latency_ewma_ms(b);
                            latency_a.total_cmp(&latency_b)
                        })
                });
            }
        }

        head.extend(pooled);
        head.extend(backup);
        head.extend(backup_only);
        head.extend(excluded_tail);
        head
    }

    /// Applies a failure-rate penalty to `provider_index` under `key`
    /// without running a full fail-over call. Used by the buffered streamer
    /// when a fetch is declared a straggler and a secondary fetch is
    /// launched elsewhere: the slow provider still gets charged one EWMA
    /// failure bump even though its original call may eventually succeed.
    pub fn penalize_straggler(&self, key: &str, provider_index: usize) {
        self.affinity.record_failure(key, provider_index);
    }

    #[instrument(skip(self, ctx), fields(op = "STAT"))]
    pub async fn stat(&self, segment_id: &str, ctx: &UsageContext) -> Result<bool, DispatchError> {
        self.fail_over(
            segment_id,
            ctx,
            "STAT",
            OrderingPolicy::Sequential,
            |client, ctx| {
                let segment_id = segment_id.to_owned();
                Box::pin(async move { client.stat(&segment_id, ctx).await })
            },
            |_| None,
        )
        .await
    }

    #[instrument(skip(self, ctx), fields(op = "HEAD"))]
    pub async fn head(&self, segment_id: &str, ctx: &UsageContext) -> Result<YencHeader, DispatchError> {
        self.fail_over(
            segment_id,
            ctx,
            "HEAD",
            OrderingPolicy::Sequential,
            |client, ctx| {
                let segment_id = segment_id.to_owned();
                Box::pin(async move { client.head(&segment_id, ctx).await })
            },
            |_| None,
        )
        .await
    }

    #[instrument(skip(self, ctx), fields(op = "BODY"))]
    pub async fn body(
        &self,
        segment_id: &str,
        ctx: &UsageContext,
        policy: OrderingPolicy,
    ) -> Result<ArticleBody, DispatchError> {
        self.fail_over(
            segment_id,
            ctx,
            "BODY",
            policy,
            |client, ctx| {
                let segment_id = segment_id.to_owned();
                Box::pin(async move { client.body(&segment_id, ctx).await })
            },
            |body: &ArticleBody| Some(body.bytes.len() as u64),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_over<T, F>(
        &self,
        segment_id: &str,
        ctx: &UsageContext,
        operation: &'static str,
        policy: OrderingPolicy,
        mut op: F,
        throughput_bytes: impl Fn(&T) -> Option<u64>,
    ) -> Result<T, DispatchError>
    where
        F: for<'a> FnMut(
            &'a ProviderClient,
            &'a UsageContext,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, ProviderError>> + Send + 'a>>,
    {
        let order = self.build_order(ctx, policy);
        if order.is_empty() {
            return Err(DispatchError::NoProviders);
        }

        let mut last_error: Option<ProviderError> = None;
        for provider_index in order {
            ctx.set_current_provider_index(provider_index);
            ctx.set_is_backup(!matches!(self.providers[provider_index].kind, ProviderKind::Pooled));

            let entry = &self.providers[provider_index];
            let started = Instant::now();
            match op(&entry.client, ctx).await {
                Ok(value) => {
                    let elapsed = started.elapsed();
                    self.bandwidth.record_latency(provider_index, elapsed);
                    if let Some(bytes) = throughput_bytes(&value) {
                        let key = ctx.affinity_key().unwrap_or(segment_id);
                        self.affinity.record_success(key, provider_index, bytes, elapsed.as_millis().max(1) as u64);
                    }
                    ctx.set_last_successful_provider(provider_index);
                    return Ok(value);
                }
                Err(err) if err.is_permanent_segment_failure() => {
                    self.error_sink
                        .record_missing_article(MissingArticleEvent {
                            provider_index,
                            segment_id: segment_id.to_owned(),
                            file_name: ctx.job_name().map(str::to_owned),
                            operation,
                            observed_at: Instant::now(),
                        })
                        .await;
                    last_error = Some(err);
                }
                Err(ProviderError::Canceled) => return Err(DispatchError::Canceled),
                Err(err) => {
                    self.affinity.record_failure(ctx.affinity_key().unwrap_or(segment_id), provider_index);
                    warn!(provider_index, error = %err, "provider failed, trying next");
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if err.is_permanent_segment_failure() => Err(DispatchError::SegmentNotFound),
            Some(err) => Err(DispatchError::AllProvidersFailed { source: err }),
            None => Err(DispatchError::NoProviders),
        }
    }
}
