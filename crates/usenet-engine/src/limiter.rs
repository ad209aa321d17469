//! Global, priority-class admission control shared across all providers.
//!
//! Three classes (Queue, HealthCheck, Streaming) each have their own
//! capacity plus share a single total cap. Unlike a plain semaphore, waiters
//! are queued per class and drained in strict priority order — Streaming
//! ahead of HealthCheck ahead of Queue — whenever capacity frees up, so a
//! Streaming acquire never waits behind an already-queued Queue acquire.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::config::EngineLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Queue,
    HealthCheck,
    Streaming,
}

/// Priority order, highest first, consulted whenever capacity frees up.
const PRIORITY_ORDER: [OperationClass; 3] = [OperationClass::Streaming, OperationClass::HealthCheck, OperationClass::Queue];

fn class_index(class: OperationClass) -> usize {
    match class {
        OperationClass::Queue => 0,
        OperationClass::HealthCheck => 1,
        OperationClass::Streaming => 2,
    }
}

struct LimiterState {
    total_capacity: usize,
    total_in_use: usize,
    class_capacity: [usize; 3],
    class_in_use: [usize; 3],
    waiters: [VecDeque<oneshot::Sender<()>>; 3],
}

impl LimiterState {
    /// Grants the next waiting acquire, in strict priority order, that fits
    /// within both its class cap and the shared total cap. Waiters whose
    /// acquire future was already canceled are dropped and skipped.
    fn wake_next(&mut self) {
        for class in PRIORITY_ORDER {
            let idx = class_index(class);
            if self.total_in_use >= self.total_capacity || self.class_in_use[idx] >= self.class_capacity[idx] {
                continue;
            }
            while let Some(waiter) = self.waiters[idx].pop_front() {
                self.total_in_use += 1;
                self.class_in_use[idx] += 1;
                if waiter.send(()).is_ok() {
                    return;
                }
                // The acquiring future was canceled before being woken; give
                // the slot back and keep looking.
                self.total_in_use -= 1;
                self.class_in_use[idx] -= 1;
            }
        }
    }
}

/// A held admission permit for one operation; releases both the class and
/// total capacity on drop and wakes the next eligible waiter.
pub struct OperationPermit {
    state: Arc<Mutex<LimiterState>>,
    class: OperationClass,
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let idx = class_index(self.class);
        state.total_in_use -= 1;
        state.class_in_use[idx] -= 1;
        state.wake_next();
    }
}

/// Process-wide limiter. One instance is shared by every [`crate::provider_client::ProviderClient`].
pub struct OperationLimiter {
    state: Arc<Mutex<LimiterState>>,
}

impl OperationLimiter {
    pub fn new(limits: &EngineLimits) -> Self {
        let total_capacity = limits.total_streaming_connections;
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                total_capacity,
                total_in_use: 0,
                // Streaming has no class-specific cap beyond the shared
                // total: it is meant to be limited only by overall capacity,
                // never starved by a class-local bound.
                class_capacity: [limits.max_queue_connections, limits.max_healthcheck_connections, total_capacity],
                class_in_use: [0, 0, 0],
                waiters: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            })),
        }
    }

    /// Acquires a permit for `class`. Grants immediately if both the class
    /// cap and the shared total cap have room; otherwise queues behind other
    /// waiters of the same class and is woken in strict priority order as
    /// capacity frees up, regardless of arrival order across classes.
    pub async fn acquire(&self, class: OperationClass) -> OperationPermit {
        let idx = class_index(class);
        let rx = {
            let mut state = self.state.lock();
            if state.total_in_use < state.total_capacity && state.class_in_use[idx] < state.class_capacity[idx] {
                state.total_in_use += 1;
                state.class_in_use[idx] += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters[idx].push_back(tx);
                Some(rx)
            }
        };

        if let Some(rx) = rx {
            rx.await.expect("limiter never drops a waiter without granting it a permit");
        }

        OperationPermit { state: Arc::clone(&self.state), class }
    }

    pub fn available(&self, class: OperationClass) -> usize {
        let state = self.state.lock();
        let idx = class_index(class);
        let by_class = state.class_capacity[idx].saturating_sub(state.class_in_use[idx]);
        let by_total = state.total_capacity.saturating_sub(state.total_in_use);
        by_class.min(by_total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_release_on_drop() {
        let limits = EngineLimits::builder().max_queue_connections(1).build();
        let limiter = OperationLimiter::new(&limits);
        assert_eq!(limiter.available(OperationClass::Queue), 1);
        let permit = limiter.acquire(OperationClass::Queue).await;
        assert_eq!(limiter.available(OperationClass::Queue), 0);
        drop(permit);
        assert_eq!(limiter.available(OperationClass::Queue), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn streaming_jumps_ahead_of_queued_queue_waiters() {
        let limits = EngineLimits::builder()
            .max_queue_connections(20)
            .max_healthcheck_connections(20)
            .total_streaming_connections(1)
            .build();
        let limiter = Arc::new(OperationLimiter::new(&limits));

        // Saturate the single shared slot.
        let holder = limiter.acquire(OperationClass::Queue).await;

        // Queue up several Queue-class waiters behind it.
        let mut queue_waiters = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            queue_waiters.push(tokio::spawn(async move { limiter.acquire(OperationClass::Queue).await }));
        }

        // A Streaming acquire submitted after all of them should still be
        // granted the freed slot first.
        let limiter_for_streaming = Arc::clone(&limiter);
        let streaming = tokio::spawn(async move { limiter_for_streaming.acquire(OperationClass::Streaming).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(holder);

        let streaming_permit = tokio::time::timeout(std::time::Duration::from_secs(1), streaming)
            .await
            .expect("streaming waiter should be woken promptly")
            .expect("task did not panic");

        assert_eq!(streaming_permit.class, OperationClass::Streaming);

        drop(streaming_permit);
        for handle in queue_waiters {
            handle.abort();
        }
    }
}
