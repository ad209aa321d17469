//! In-memory bandwidth, latency, and missing-article reporting.
//!
//! Grounded on `traffic-audit`'s `DynTrafficAuditRepo`/`TrafficEvent` shape:
//! a small async trait behind an `Arc<dyn _>` alias, with a concrete
//! in-memory implementation the engine owns by default.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Bound on how many missing-article events are retained per provider.
const MISSING_ARTICLE_LOG_CAPACITY: usize = 1024;
/// Width of the rolling window used for the per-provider instantaneous
/// bytes/sec figure.
const BANDWIDTH_WINDOW: Duration = Duration::from_secs(1);

/// One observed "article not found" event, recorded by the dispatcher.
#[derive(Debug, Clone)]
pub struct MissingArticleEvent {
    pub provider_index: usize,
    pub segment_id: String,
    pub file_name: Option<String>,
    pub operation: &'static str,
    pub observed_at: Instant,
}

/// Sink for per-provider byte counters and an append-only missing-article
/// log. External telemetry export is an embedding application's concern;
/// the engine only needs to accumulate and snapshot these in memory.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn record_missing_article(&self, event: MissingArticleEvent);
    async fn missing_articles_for(&self, provider_index: usize) -> Vec<MissingArticleEvent>;
    async fn missing_articles_for_file(&self, file_name: &str) -> Vec<MissingArticleEvent>;
}

/// `Arc<dyn ErrorSink>`, mirroring the `DynTrafficAuditRepo` alias idiom.
pub type DynErrorSink = Arc<dyn ErrorSink>;

struct ProviderBandwidth {
    samples: VecDeque<(Instant, u64)>,
    latency_ewma_ms: f64,
}

impl Default for ProviderBandwidth {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            latency_ewma_ms: 0.0,
        }
    }
}

/// In-memory bandwidth and latency sink: one instance per engine, shared
/// across every [`crate::provider_client::ProviderClient`].
pub struct BandwidthSink {
    providers: Mutex<HashMap<usize, ProviderBandwidth>>,
}

impl BandwidthSink {
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_bytes(&self, provider_index: usize, bytes: u64) {
        let mut providers = self.providers.lock();
        let entry = providers.entry(provider_index).or_default();
        let now = Instant::now();
        entry.samples.push_back((now, bytes));
        while let Some((timestamp, _)) = entry.samples.front() {
            if now.duration_since(*timestamp) > BANDWIDTH_WINDOW {
                entry.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_latency(&self, provider_index: usize, elapsed: Duration) {
        const ALPHA: f64 = 0.2;
        let mut providers = self.providers.lock();
        let entry = providers.entry(provider_index).or_default();
        let sample = elapsed.as_secs_f64() * 1000.0;
        entry.latency_ewma_ms = ALPHA * sample + (1.0 - ALPHA) * entry.latency_ewma_ms;
    }

    /// Instantaneous bytes/sec over the trailing window.
    pub fn current_bytes_per_sec(&self, provider_index: usize) -> u64 {
        let providers = self.providers.lock();
        providers
            .get(&provider_index)
            .map(|entry| entry.samples.iter().map(|(_, bytes)| *bytes).sum())
            .unwrap_or(0)
    }

    pub fn latency_ewma_ms(&self, provider_index: usize) -> f64 {
        self.providers
            .lock()
            .get(&provider_index)
            .map(|entry| entry.latency_ewma_ms)
            .unwrap_or(0.0)
    }
}

impl Default for BandwidthSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Default, process-local [`ErrorSink`]: a bounded ring buffer per provider,
/// plus a second index by file name so callers tracking one download can ask
/// "did any segment of this file go missing" without scanning every provider.
pub struct InMemoryErrorSink {
    by_provider: Mutex<HashMap<usize, VecDeque<MissingArticleEvent>>>,
    by_file: Mutex<HashMap<String, VecDeque<MissingArticleEvent>>>,
}

impl InMemoryErrorSink {
    pub fn new() -> Self {
        Self {
            by_provider: Mutex::new(HashMap::new()),
            by_file: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryErrorSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ErrorSink for InMemoryErrorSink {
    async fn record_missing_article(&self, event: MissingArticleEvent) {
        {
            let mut by_provider = self.by_provider.lock();
            let log = by_provider.entry(event.provider_index).or_default();
            log.push_back(event.clone());
            while log.len() > MISSING_ARTICLE_LOG_CAPACITY {
                log.pop_front();
            }
        }
        if let Some(file_name) = event.file_name.clone() {
            let mut by_file = self.by_file.lock();
            let log = by_file.entry(file_name).or_default();
            log.push_back(event);
            while log.len() > MISSING_ARTICLE_LOG_CAPACITY {
                log.pop_front();
            }
        }
    }

    async fn missing_articles_for(&self, provider_index: usize) -> Vec<MissingArticleEvent> {
        self.by_provider
            .lock()
            .get(&provider_index)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn missing_articles_for_file(&self, file_name: &str) -> Vec<MissingArticleEvent> {
        self.by_file
            .lock()
            .get(file_name)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_article_log_is_bounded() {
        let sink = InMemoryErrorSink::new();
        for i in 0..(MISSING_ARTICLE_LOG_CAPACITY + 10) {
            sink.record_missing_article(MissingArticleEvent {
                provider_index: 0,
                segment_id: format!("seg-{i}"),
                file_name: None,
                operation: "BODY",
                observed_at: Instant::now(),
            })
            .await;
        }
        assert_eq!(sink.missing_articles_for(0).await.len(), MISSING_ARTICLE_LOG_CAPACITY);
    }

    #[tokio::test]
    async fn missing_articles_indexed_by_file_name() {
        let sink = InMemoryErrorSink::new();
        sink.record_missing_article(MissingArticleEvent {
            provider_index: 0,
            segment_id: "seg-1".to_owned(),
            file_name: Some("movie.mkv".to_owned()),
            operation: "BODY",
            observed_at: Instant::now(),
        })
        .await;
        sink.record_missing_article(MissingArticleEvent {
            provider_index: 1,
            segment_id: "seg-2".to_owned(),
            file_name: Some("other.mkv".to_owned()),
            operation: "BODY",
            observed_at: Instant::now(),
        })
        .await;

        let movie_events = sink.missing_articles_for_file("movie.mkv").await;
        assert_eq!(movie_events.len(), 1);
        assert_eq!(movie_events[0].segment_id, "seg-1");
        assert!(sink.missing_articles_for_file("never-seen.mkv").await.is_empty());
    }

    #[test]
    fn bandwidth_accumulates_within_window() {
        let sink = BandwidthSink::new();
        sink.record_bytes(0, 100);
        sink.record_bytes(0, 200);
        assert_eq!(sink.current_bytes_per_sec(0), 300);
    }
}
