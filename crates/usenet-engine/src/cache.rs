//! Bounded LRU cache mapping a segment id to its known metadata.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

use crate::transport::YencHeader;

/// What is known about a segment. Writes are idempotent: once an `exists`
/// bit or header is learned it is never downgraded.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentMeta {
    pub exists: Option<bool>,
    pub header: Option<YencHeader>,
}

/// Default cap, matching the engine's bounded-memory metadata cache.
const DEFAULT_CAPACITY: usize = 8192;

/// Thread-safe bounded cache keyed by segment message-id.
pub struct SegmentMetaCache {
    inner: Mutex<LruCache<String, SegmentMeta>>,
}

impl SegmentMetaCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).expect("1 is nonzero"));
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, segment_id: &str) -> Option<SegmentMeta> {
        self.inner.lock().get(segment_id).copied()
    }

    pub fn record_exists(&self, segment_id: &str, exists: bool) {
        let mut guard = self.inner.lock();
        if guard.get_mut(segment_id).is_none() {
            guard.put(segment_id.to_owned(), SegmentMeta::default());
        }
        let entry = guard.get_mut(segment_id).expect("just inserted");
        entry.exists.get_or_insert(exists);
    }

    pub fn record_header(&self, segment_id: &str, header: YencHeader) {
        let mut guard = self.inner.lock();
        if guard.get_mut(segment_id).is_none() {
            guard.put(segment_id.to_owned(), SegmentMeta::default());
        }
        let entry = guard.get_mut(segment_id).expect("just inserted");
        entry.exists.get_or_insert(true);
        entry.header.get_or_insert(header);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SegmentMetaCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_idempotent() {
        let cache = SegmentMetaCache::with_capacity(4);
        let header = YencHeader {
            part_size: 100,
            part_offset: 0,
        };
        cache.record_header("seg-1", header);
        cache.record_header(
            "seg-1",
            YencHeader {
                part_size: 999,
                part_offset: 999,
            },
        );
        let meta = cache.get("seg-1").unwrap();
        assert_eq!(meta.header.unwrap().part_size, 100);
    }

    #[test]
    fn evicts_past_capacity() {
        let cache = SegmentMetaCache::with_capacity(2);
        cache.record_exists("a", true);
        cache.record_exists("b", true);
        cache.record_exists("c", true);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
    }
}
