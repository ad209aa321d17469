//! Multi-provider NNTP streaming engine.
//!
//! Turns the segment list of an NZB file into an ordered, seekable byte
//! stream, coordinating many concurrent connections across several Usenet
//! providers with fail-over, provider affinity, and bandwidth/error
//! reporting. See the crate's `SPEC_FULL.md` for the full component design.

pub mod affinity;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod limiter;
pub mod pool;
pub mod provider_client;
pub mod stats;
pub mod streamer;
pub mod transport;
pub mod usage;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::instrument;

use affinity::AffinityStore;
use cache::SegmentMetaCache;
use config::{ConfigProvider, ProviderKind};
use dispatcher::{Dispatcher, OrderingPolicy};
use error::{DispatchError, StreamError};
use limiter::OperationLimiter;
use pool::ConnectionPool;
use provider_client::ProviderClient;
use stats::{BandwidthSink, DynErrorSink, InMemoryErrorSink};
use streamer::BufferedSegmentStreamer;
use transport::tcp::TcpTransport;
use transport::YencHeader;
use usage::UsageContext;

/// Top-level handle: wires configuration into pools, provider clients, the
/// dispatcher, affinity store, and stat sinks, and exposes the operations
/// an embedding application needs.
pub struct Engine {
    dispatcher: Arc<Dispatcher>,
    cache: Arc<SegmentMetaCache>,
    affinity: Arc<AffinityStore>,
    bandwidth: Arc<BandwidthSink>,
    error_sink: DynErrorSink,
}

impl Engine {
    /// Builds an engine from the current configuration snapshot. Call again
    /// (and swap the returned `Engine`) to pick up configuration changes;
    /// the engine itself does not watch for reloads.
    pub async fn new(config: &dyn ConfigProvider) -> Self {
        Self::with_transport_factory(config, |provider_config| {
            Box::new(TcpTransport::new(provider_config)) as transport::BoxedTransport
        })
        .await
    }

    /// Like [`Engine::new`], but with a caller-supplied transport factory.
    /// Used by tests (and any embedder that wants to swap in a fake
    /// [`transport::NntpTransport`] for deterministic runs) to avoid real
    /// sockets.
    pub async fn with_transport_factory(
        config: &dyn ConfigProvider,
        make_transport: impl Fn(&config::ProviderConfig) -> transport::BoxedTransport + Send + Sync + Clone + 'static,
    ) -> Self {
        let providers = config.providers().await;
        let limits = config.limits().await;

        let limiter = Arc::new(OperationLimiter::new(&limits));
        let bandwidth = Arc::new(BandwidthSink::new());
        let affinity = Arc::new(AffinityStore::new());
        let error_sink: DynErrorSink = Arc::new(InMemoryErrorSink::new());

        let shared_pooled_permits = Arc::new(tokio::sync::Semaphore::new(limits.total_streaming_connections));

        let mut dispatch_entries = Vec::with_capacity(providers.len());
        for provider in &providers {
            if !provider.is_eligible() {
                continue;
            }

            let shared = match provider.kind {
                ProviderKind::Pooled => Some(Arc::clone(&shared_pooled_permits)),
                ProviderKind::Backup | ProviderKind::BackupOnly => None,
                ProviderKind::Disabled => unreachable!("filtered above"),
            };

            let provider_config = provider.clone();
            let make_transport = make_transport.clone();
            let pool = ConnectionPool::new(provider.max_connections, shared, move || make_transport(&provider_config));

            let client = Arc::new(ProviderClient::new(provider.index, pool, Arc::clone(&limiter), Arc::clone(&bandwidth), &limits));
            dispatch_entries.push((client, provider.kind));
        }

        let dispatcher = Arc::new(Dispatcher::new(
            dispatch_entries,
            Arc::clone(&affinity),
            Arc::clone(&bandwidth),
            Arc::clone(&error_sink),
        ));

        Self {
            dispatcher,
            cache: Arc::new(SegmentMetaCache::new()),
            affinity,
            bandwidth,
            error_sink,
        }
    }

    /// Opens a seekable, ordered stream over `segment_ids`.
    #[instrument(skip(self, segment_sizes, ctx))]
    pub async fn open_stream(
        &self,
        segment_ids: Vec<String>,
        file_size: u64,
        concurrent_connections: usize,
        buffer_size: usize,
        segment_sizes: Option<Vec<u64>>,
        ctx: UsageContext,
    ) -> Result<BufferedSegmentStreamer, StreamError> {
        BufferedSegmentStreamer::open(
            Arc::clone(&self.dispatcher),
            segment_ids,
            file_size,
            concurrent_connections,
            buffer_size,
            segment_sizes,
            ctx,
        )
        .await
    }

    /// Whether `segment_id` exists on any eligible provider. Consults and
    /// populates the metadata cache.
    pub async fn stat(&self, segment_id: &str, ctx: &UsageContext) -> Result<bool, DispatchError> {
        if let Some(meta) = self.cache.get(segment_id) {
            if let Some(exists) = meta.exists {
                return Ok(exists);
            }
        }
        let exists = self.dispatcher.stat(segment_id, ctx).await?;
        self.cache.record_exists(segment_id, exists);
        Ok(exists)
    }

    /// Fetches (and caches) the yEnc header for `segment_id`.
    pub async fn get_yenc_header(&self, segment_id: &str, ctx: &UsageContext) -> Result<YencHeader, DispatchError> {
        if let Some(meta) = self.cache.get(segment_id) {
            if let Some(header) = meta.header {
                return Ok(header);
            }
        }
        let header = self.dispatcher.head(segment_id, ctx).await?;
        self.cache.record_header(segment_id, header);
        Ok(header)
    }

    /// Checks existence of every segment in `segment_ids`, with up to
    /// `concurrency` STATs in flight at once, invoking `progress` after
    /// each completes.
    pub async fn check_all_segments(
        &self,
        segment_ids: &[String],
        concurrency: usize,
        mut progress: impl FnMut(usize, usize),
        ctx: &UsageContext,
    ) -> Vec<Result<bool, DispatchError>> {
        let total = segment_ids.len();
        let results: Vec<Result<bool, DispatchError>> = stream::iter(segment_ids.iter().cloned())
            .map(|segment_id| {
                let ctx = ctx.clone();
                async move { self.stat(&segment_id, &ctx).await }
            })
            .buffered(concurrency.max(1))
            .enumerate()
            .map(|(index, result)| {
                progress(index + 1, total);
                result
            })
            .collect()
            .await;
        results
    }

    /// Resolves total byte sizes for a batch of files, each given as an
    /// ordered segment-id list, with up to `concurrency` files resolved at
    /// once.
    pub async fn get_file_sizes_batch(
        &self,
        files: Vec<Vec<String>>,
        concurrency: usize,
        ctx: &UsageContext,
    ) -> Vec<Result<u64, DispatchError>> {
        stream::iter(files.into_iter())
            .map(|segment_ids| {
                let ctx = ctx.clone();
                async move {
                    let mut total = 0u64;
                    for segment_id in &segment_ids {
                        total += self.get_yenc_header(segment_id, &ctx).await?.part_size;
                    }
                    Ok(total)
                }
            })
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    /// Seeds the affinity store's throughput priors for a fresh affinity
    /// key from an external per-provider benchmark.
    pub fn refresh_benchmark_speeds(&self, affinity_key: &str, benchmark: &BTreeMap<usize, f64>) {
        self.affinity.refresh_benchmark_speeds(affinity_key, benchmark);
    }

    /// Snapshot of current bytes/sec and latency EWMA for one provider.
    pub fn bandwidth_snapshot(&self, provider_index: usize) -> (u64, f64) {
        (
            self.bandwidth.current_bytes_per_sec(provider_index),
            self.bandwidth.latency_ewma_ms(provider_index),
        )
    }

    pub fn error_sink(&self) -> &DynErrorSink {
        &self.error_sink
    }
}
