//! Per-affinity-key, per-provider throughput/failure learning and
//! epsilon-greedy provider selection.

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::Rng;

/// Smoothing factor for both throughput and failure-rate EWMAs.
const ALPHA: f64 = 0.2;
/// Exploration probability for [`AffinityStore::preferred_provider`].
const EPSILON: f64 = 0.1;
/// Failure-rate penalty weight in the selection score.
const FAILURE_PENALTY: f64 = 2.0;
/// A provider whose failure rate is at or above this is treated as
/// saturated and excluded from the exploration pool.
const SATURATED_FAILURE_RATE: f64 = 0.9;

#[derive(Debug, Clone, Copy, Default)]
struct Record {
    throughput_bytes_per_ms: f64,
    failure_rate: f64,
}

/// Learns, per `(affinity_key, provider_index)`, which providers serve a
/// given kind of content fastest and most reliably.
pub struct AffinityStore {
    records: RwLock<HashMap<(String, usize), Record>>,
}

impl AffinityStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_success(&self, key: &str, provider_index: usize, bytes: u64, elapsed_ms: u64) {
        let elapsed_ms = elapsed_ms.max(1);
        let sample = bytes as f64 / elapsed_ms as f64;
        let mut records = self.records.write();
        let record = records.entry((key.to_owned(), provider_index)).or_default();
        record.throughput_bytes_per_ms = ALPHA * sample + (1.0 - ALPHA) * record.throughput_bytes_per_ms;
        record.failure_rate *= 1.0 - ALPHA;
    }

    pub fn record_failure(&self, key: &str, provider_index: usize) {
        let mut records = self.records.write();
        let record = records.entry((key.to_owned(), provider_index)).or_default();
        record.failure_rate = ALPHA + (1.0 - ALPHA) * record.failure_rate;
    }

    /// Seeds fresh affinity keys from an external benchmark of bytes/ms per
    /// provider, so a never-seen key still has a sane throughput prior.
    pub fn refresh_benchmark_speeds(&self, key: &str, benchmark: &std::collections::BTreeMap<usize, f64>) {
        let mut records = self.records.write();
        for (&provider_index, &speed) in benchmark {
            records
                .entry((key.to_owned(), provider_index))
                .or_insert(Record {
                    throughput_bytes_per_ms: speed,
                    failure_rate: 0.0,
                });
        }
    }

    /// Chooses a provider for `key` among `eligible_providers`. With
    /// probability `EPSILON` explores uniformly among non-saturated
    /// providers; otherwise exploits the best throughput-adjusted-for-
    /// failure score. Returns `None` if no record exists for any eligible
    /// provider (caller should fall back to its default ordering).
    pub fn preferred_provider(&self, key: &str, eligible_providers: &[usize]) -> Option<usize> {
        if eligible_providers.is_empty() {
            return None;
        }

        let records = self.records.read();
        let scored: Vec<(usize, Record)> = eligible_providers
            .iter()
            .filter_map(|&index| records.get(&(key.to_owned(), index)).map(|record| (index, *record)))
            .collect();
        drop(records);

        if scored.is_empty() {
            return None;
        }

        let explorable: Vec<usize> = scored
            .iter()
            .filter(|(_, record)| record.failure_rate < SATURATED_FAILURE_RATE)
            .map(|(index, _)| *index)
            .collect();

        if !explorable.is_empty() && rand::thread_rng().gen_bool(EPSILON) {
            let pick = rand::thread_rng().gen_range(0..explorable.len());
            return Some(explorable[pick]);
        }

        scored
            .into_iter()
            .max_by(|(_, a), (_, b)| {
                let score_a = a.throughput_bytes_per_ms / (1.0 + FAILURE_PENALTY * a.failure_rate);
                let score_b = b.throughput_bytes_per_ms / (1.0 + FAILURE_PENALTY * b.failure_rate);
                score_a.total_cmp(&score_b)
            })
            .map(|(index, _)| index)
    }
}

impl Default for AffinityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exploits_the_fastest_provider_after_enough_samples() {
        let store = AffinityStore::new();
        for _ in 0..50 {
            store.record_success("movie-1", 0, 10_000_000, 1_000);
            store.record_success("movie-1", 1, 1_000_000, 1_000);
        }

        let mut picks_fast = 0;
        for _ in 0..200 {
            if store.preferred_provider("movie-1", &[0, 1]) == Some(0) {
                picks_fast += 1;
            }
        }
        // With epsilon = 0.1 we expect roughly 90%+ exploitation of provider 0.
        assert!(picks_fast > 150, "expected provider 0 to dominate, got {picks_fast}/200");
    }

    #[test]
    fn unknown_key_returns_none() {
        let store = AffinityStore::new();
        assert_eq!(store.preferred_provider("never-seen", &[0, 1]), None);
    }
}
