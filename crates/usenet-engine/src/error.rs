//! Error taxonomy shared by every component of the engine.
//!
//! Each component exposes its own error enum so callers can match on the
//! failure without losing which layer produced it, but all of them carry
//! enough detail for the dispatcher to decide "retry this provider",
//! "replace the connection", or "give up and fail over".

use std::time::Duration;

use thiserror::Error;

/// Errors produced by a single [`crate::transport::NntpTransport`] connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not connect to {host}:{port}: {source}")]
    CouldNotConnect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("authentication failed for {host}:{port}")]
    CouldNotAuthenticate { host: String, port: u16 },

    #[error("nntp protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("article not found")]
    ArticleNotFound,

    #[error("segment size is unknown")]
    SegmentSizeUnknown,

    #[error("connection is closed")]
    Closed,
}

impl TransportError {
    /// Whether this failure should be treated as transient (retry / replace
    /// the connection) rather than a permanent per-segment miss.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CouldNotConnect { .. } | Self::Protocol(_) | Self::Io(_) | Self::Timeout(_) | Self::Closed
        )
    }

    pub fn is_permanent_segment_failure(&self) -> bool {
        matches!(self, Self::ArticleNotFound | Self::SegmentSizeUnknown)
    }
}

/// Errors surfaced by [`crate::pool::ConnectionPool`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out waiting for a connection slot")]
    LeaseTimeout,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("pool is disposed")]
    Disposed,
}

impl From<PoolError> for TransportError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::LeaseTimeout => TransportError::Timeout(Duration::default()),
            PoolError::Transport(inner) => inner,
            PoolError::Disposed => TransportError::Closed,
        }
    }
}

/// Errors surfaced by [`crate::provider_client::ProviderClient`] for a single
/// operation against a single provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider {provider_index} connect failure: {source}")]
    Connect {
        provider_index: usize,
        #[source]
        source: TransportError,
    },

    #[error("provider {provider_index} transient failure: {source}")]
    Transient {
        provider_index: usize,
        #[source]
        source: TransportError,
    },

    #[error("provider {provider_index} reported a permanent segment failure: {source}")]
    PermanentSegmentFailure {
        provider_index: usize,
        #[source]
        source: TransportError,
    },

    #[error("operation canceled")]
    Canceled,
}

impl ProviderError {
    pub fn provider_index(&self) -> Option<usize> {
        match self {
            Self::Connect { provider_index, .. }
            | Self::Transient { provider_index, .. }
            | Self::PermanentSegmentFailure { provider_index, .. } => Some(*provider_index),
            Self::Canceled => None,
        }
    }

    pub fn is_permanent_segment_failure(&self) -> bool {
        matches!(self, Self::PermanentSegmentFailure { .. })
    }
}

/// Errors surfaced by [`crate::dispatcher::Dispatcher`] after trying every
/// eligible provider.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("all providers failed, last error: {source}")]
    AllProvidersFailed {
        #[source]
        source: ProviderError,
    },

    #[error("segment not found on any provider")]
    SegmentNotFound,

    #[error("operation canceled")]
    Canceled,

    #[error("no eligible providers configured")]
    NoProviders,
}

/// Errors surfaced to the ultimate caller of a [`crate::streamer::BufferedSegmentStreamer`].
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("segment {index} permanently failed: {reason}")]
    PermanentSegmentFailure { index: usize, reason: String },

    #[error("seek offset {offset} is out of range (file size {file_size})")]
    SeekOutOfRange { offset: u64, file_size: u64 },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("stream canceled")]
    Canceled,
}
