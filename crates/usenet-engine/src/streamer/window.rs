//! Sliding-window slot arena backing the buffered segment streamer.
//!
//! Grounded on the `Vec<Option<Bytes>>` indexed-reassembly idiom from
//! `other_examples`'s NZB downloader, generalized to a bounded window with
//! seek support and straggler tracking.

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::StreamError;
use crate::usage::UsageContext;

/// Floor for the straggler deadline, regardless of how fast the rolling
/// average currently is.
const STRAGGLER_FLOOR: Duration = Duration::from_secs(2);
/// Multiplier applied to the rolling average fetch time to decide a segment
/// is straggling.
const STRAGGLER_MULTIPLIER: u32 = 3;

/// One segment's state within the window.
#[derive(Debug)]
pub enum Slot {
    /// Not yet scheduled for fetch.
    Pending,
    /// A fetch is in flight; `started_at` feeds the straggler check and
    /// `ctx` lets a straggler watcher learn which provider is currently
    /// being tried, so a secondary fetch can exclude it.
    InFlight { started_at: Instant, ctx: UsageContext },
    /// Fetch completed successfully.
    Ready(Bytes),
    /// Every provider failed and graceful degradation filled the gap.
    ZeroFilled(Bytes),
    /// Every provider failed and graceful degradation is disabled.
    Failed(String),
}

/// Bounded arena of [`Slot`]s, indexed by absolute segment sequence number.
pub struct SegmentWindow {
    /// `slots[i]` holds sequence number `window_start + i`.
    slots: Vec<Slot>,
    window_start: usize,
    total_segments: usize,
    rolling_avg_fetch: Duration,
}

impl SegmentWindow {
    pub fn new(total_segments: usize, buffer_size: usize) -> Self {
        let capacity = buffer_size.min(total_segments.max(1));
        Self {
            slots: (0..capacity).map(|_| Slot::Pending).collect(),
            window_start: 0,
            total_segments,
            rolling_avg_fetch: STRAGGLER_FLOOR,
        }
    }

    pub fn window_start(&self) -> usize {
        self.window_start
    }

    pub fn window_end(&self) -> usize {
        (self.window_start + self.slots.len()).min(self.total_segments)
    }

    fn index_of(&self, seq: usize) -> Option<usize> {
        if seq < self.window_start {
            return None;
        }
        let offset = seq - self.window_start;
        if offset < self.slots.len() {
            Some(offset)
        } else {
            None
        }
    }

    /// First sequence number in the window still `Pending`, if any.
    pub fn next_unscheduled(&self) -> Option<usize> {
        self.slots.iter().enumerate().find_map(|(offset, slot)| match slot {
            Slot::Pending => Some(self.window_start + offset),
            _ => None,
        })
    }

    pub fn mark_in_flight(&mut self, seq: usize, ctx: UsageContext) {
        if let Some(index) = self.index_of(seq) {
            self.slots[index] = Slot::InFlight { started_at: Instant::now(), ctx };
        }
    }

    /// Whether `seq`'s slot currently has a fetch in flight.
    pub fn is_in_flight(&self, seq: usize) -> bool {
        matches!(self.index_of(seq).map(|index| &self.slots[index]), Some(Slot::InFlight { .. }))
    }

    pub fn mark_ready(&mut self, seq: usize, bytes: Bytes) {
        let elapsed = self.elapsed_for(seq);
        if let Some(index) = self.index_of(seq) {
            self.slots[index] = Slot::Ready(bytes);
        }
        if let Some(elapsed) = elapsed {
            self.record_fetch_time(elapsed);
        }
    }

    pub fn mark_zero_filled(&mut self, seq: usize, size: u64) {
        if let Some(index) = self.index_of(seq) {
            self.slots[index] = Slot::ZeroFilled(Bytes::from(vec![0u8; size as usize]));
        }
    }

    pub fn mark_failed(&mut self, seq: usize, reason: String) {
        if let Some(index) = self.index_of(seq) {
            self.slots[index] = Slot::Failed(reason);
        }
    }

    fn elapsed_for(&self, seq: usize) -> Option<Duration> {
        match self.index_of(seq).map(|index| &self.slots[index]) {
            Some(Slot::InFlight { started_at, .. }) => Some(started_at.elapsed()),
            _ => None,
        }
    }

    fn record_fetch_time(&mut self, elapsed: Duration) {
        const ALPHA: f64 = 0.2;
        let previous = self.rolling_avg_fetch.as_secs_f64();
        let sample = elapsed.as_secs_f64();
        let updated = ALPHA * sample + (1.0 - ALPHA) * previous;
        self.rolling_avg_fetch = Duration::from_secs_f64(updated.max(0.0));
    }

    /// Deadline past which a still-in-flight fetch is considered a
    /// straggler and a secondary fetch should be launched.
    pub fn straggler_deadline(&self) -> Duration {
        (self.rolling_avg_fetch * STRAGGLER_MULTIPLIER).max(STRAGGLER_FLOOR)
    }

    /// Sequence numbers (with their in-flight context) currently past the
    /// straggler deadline.
    pub fn stragglers(&self) -> Vec<(usize, UsageContext)> {
        let deadline = self.straggler_deadline();
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(offset, slot)| match slot {
                Slot::InFlight { started_at, ctx } if started_at.elapsed() > deadline => {
                    Some((self.window_start + offset, ctx.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Whether `seq`'s slot is `Ready`/`ZeroFilled`/`Failed` (i.e. the
    /// reader can act on it without waiting further).
    pub fn is_settled(&self, seq: usize) -> bool {
        matches!(
            self.index_of(seq).map(|index| &self.slots[index]),
            Some(Slot::Ready(_)) | Some(Slot::ZeroFilled(_)) | Some(Slot::Failed(_))
        )
    }

    pub fn take_settled(&mut self, seq: usize) -> Option<Result<Bytes, StreamError>> {
        let index = self.index_of(seq)?;
        match std::mem::replace(&mut self.slots[index], Slot::Pending) {
            Slot::Ready(bytes) | Slot::ZeroFilled(bytes) => Some(Ok(bytes)),
            Slot::Failed(reason) => Some(Err(StreamError::PermanentSegmentFailure { index: seq, reason })),
            other => {
                self.slots[index] = other;
                None
            }
        }
    }

    /// Slides the window forward so `new_start` becomes the first slot,
    /// dropping slots that fall out of range. Used after the reader
    /// advances past a segment and after a seek.
    pub fn slide_to(&mut self, new_start: usize, buffer_size: usize) {
        let capacity = buffer_size.min(self.total_segments.saturating_sub(new_start).max(1));
        let mut new_slots = Vec::with_capacity(capacity);
        for offset in 0..capacity {
            let seq = new_start + offset;
            let reused = self.index_of(seq).map(|index| std::mem::replace(&mut self.slots[index], Slot::Pending));
            new_slots.push(reused.unwrap_or(Slot::Pending));
        }
        self.slots = new_slots;
        self.window_start = new_start;
    }
}
