//! Ambient context carried alongside every operation.
//!
//! This is plain data passed by the caller (and mutated by the dispatcher
//! and streamer for observability); it is never stashed in a thread-local or
//! other process-global.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// What kind of workload is driving a request. Affects permit class and
/// provider ordering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageKind {
    Unknown,
    Queue,
    Streaming,
    BufferedStreaming,
    HealthCheck,
    Repair,
    Analysis,
}

impl UsageKind {
    /// Which [`crate::limiter::OperationClass`] this usage maps to.
    pub fn operation_class(self) -> crate::limiter::OperationClass {
        use crate::limiter::OperationClass;
        match self {
            Self::Queue | Self::Analysis => OperationClass::Queue,
            Self::HealthCheck | Self::Repair => OperationClass::HealthCheck,
            Self::Streaming | Self::BufferedStreaming | Self::Unknown => OperationClass::Streaming,
        }
    }
}

/// Mutable, shared observability/steering state for one logical request
/// chain (e.g. one `OpenStream` call and everything it fans out into).
#[derive(Debug)]
struct Inner {
    kind: UsageKind,
    job_name: Option<String>,
    affinity_key: Option<String>,
    forced_provider_index: Option<usize>,
    disable_graceful_degradation: AtomicBool,
    excluded_provider_indices: parking_lot::Mutex<Vec<usize>>,
    is_backup: AtomicBool,
    is_secondary: AtomicBool,
    current_provider_index: AtomicUsize,
    buffered_count: AtomicUsize,
    buffer_window: AtomicUsize,
    total_segments: AtomicUsize,
    last_successful_provider: AtomicUsize,
    has_last_successful_provider: AtomicBool,
}

/// Cheaply cloneable handle to a request's [`UsageKind`] and steering state.
#[derive(Debug, Clone)]
pub struct UsageContext {
    inner: Arc<Inner>,
}

const NO_PROVIDER: usize = usize::MAX;

impl UsageContext {
    pub fn new(kind: UsageKind) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                job_name: None,
                affinity_key: None,
                forced_provider_index: None,
                disable_graceful_degradation: AtomicBool::new(false),
                excluded_provider_indices: parking_lot::Mutex::new(Vec::new()),
                is_backup: AtomicBool::new(false),
                is_secondary: AtomicBool::new(false),
                current_provider_index: AtomicUsize::new(NO_PROVIDER),
                buffered_count: AtomicUsize::new(0),
                buffer_window: AtomicUsize::new(0),
                total_segments: AtomicUsize::new(0),
                last_successful_provider: AtomicUsize::new(NO_PROVIDER),
                has_last_successful_provider: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_job_name(mut self, job_name: impl Into<String>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("UsageContext must be configured before cloning")
            .job_name = Some(job_name.into());
        self
    }

    pub fn with_affinity_key(mut self, affinity_key: impl Into<String>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("UsageContext must be configured before cloning")
            .affinity_key = Some(affinity_key.into());
        self
    }

    pub fn with_forced_provider(mut self, index: usize) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("UsageContext must be configured before cloning")
            .forced_provider_index = Some(index);
        self
    }

    pub fn with_graceful_degradation_disabled(self) -> Self {
        self.inner.disable_graceful_degradation.store(true, Ordering::Relaxed);
        self
    }

    pub fn kind(&self) -> UsageKind {
        self.inner.kind
    }

    pub fn job_name(&self) -> Option<&str> {
        self.inner.job_name.as_deref()
    }

    pub fn affinity_key(&self) -> Option<&str> {
        self.inner.affinity_key.as_deref()
    }

    pub fn forced_provider_index(&self) -> Option<usize> {
        self.inner.forced_provider_index
    }

    pub fn disable_graceful_degradation(&self) -> bool {
        self.inner.disable_graceful_degradation.load(Ordering::Relaxed)
    }

    pub fn excluded_provider_indices(&self) -> Vec<usize> {
        self.inner.excluded_provider_indices.lock().clone()
    }

    pub fn exclude_provider(&self, index: usize) {
        let mut guard = self.inner.excluded_provider_indices.lock();
        if !guard.contains(&index) {
            guard.push(index);
        }
    }

    pub fn set_is_backup(&self, value: bool) {
        self.inner.is_backup.store(value, Ordering::Relaxed);
    }

    pub fn is_backup(&self) -> bool {
        self.inner.is_backup.load(Ordering::Relaxed)
    }

    pub fn set_is_secondary(&self, value: bool) {
        self.inner.is_secondary.store(value, Ordering::Relaxed);
    }

    pub fn is_secondary(&self) -> bool {
        self.inner.is_secondary.load(Ordering::Relaxed)
    }

    pub fn set_current_provider_index(&self, index: usize) {
        self.inner.current_provider_index.store(index, Ordering::Relaxed);
    }

    pub fn current_provider_index(&self) -> Option<usize> {
        match self.inner.current_provider_index.load(Ordering::Relaxed) {
            NO_PROVIDER => None,
            index => Some(index),
        }
    }

    pub fn set_buffered_count(&self, value: usize) {
        self.inner.buffered_count.store(value, Ordering::Relaxed);
    }

    pub fn set_buffer_window(&self, value: usize) {
        self.inner.buffer_window.store(value, Ordering::Relaxed);
    }

    pub fn set_total_segments(&self, value: usize) {
        self.inner.total_segments.store(value, Ordering::Relaxed);
    }

    pub fn last_successful_provider(&self) -> Option<usize> {
        if self.inner.has_last_successful_provider.load(Ordering::Relaxed) {
            Some(self.inner.last_successful_provider.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    pub fn set_last_successful_provider(&self, index: usize) {
        self.inner.last_successful_provider.store(index, Ordering::Relaxed);
        self.inner.has_last_successful_provider.store(true, Ordering::Relaxed);
    }

    /// A context derived from `self` for a secondary/straggler fetch of the
    /// same segment: same job/affinity, but with `provider` excluded and
    /// `is_secondary` set. Does not alias `self`'s mutable state.
    pub fn fork_secondary(&self, exclude_provider: usize) -> Self {
        let mut excluded = self.excluded_provider_indices();
        if !excluded.contains(&exclude_provider) {
            excluded.push(exclude_provider);
        }

        let forked = Inner {
            kind: self.inner.kind,
            job_name: self.inner.job_name.clone(),
            affinity_key: self.inner.affinity_key.clone(),
            forced_provider_index: self.inner.forced_provider_index,
            disable_graceful_degradation: AtomicBool::new(self.disable_graceful_degradation()),
            excluded_provider_indices: parking_lot::Mutex::new(excluded),
            is_backup: AtomicBool::new(self.is_backup()),
            is_secondary: AtomicBool::new(true),
            current_provider_index: AtomicUsize::new(NO_PROVIDER),
            buffered_count: AtomicUsize::new(0),
            buffer_window: AtomicUsize::new(0),
            total_segments: AtomicUsize::new(0),
            last_successful_provider: AtomicUsize::new(NO_PROVIDER),
            has_last_successful_provider: AtomicBool::new(false),
        };

        Self { inner: Arc::new(forked) }
    }
}
