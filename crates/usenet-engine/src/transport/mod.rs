//! A single NNTP connection.
//!
//! [`NntpTransport`] is the erased-trait-object boundary the rest of the
//! engine talks to; concrete implementations live in [`tcp`] (a real TCP/TLS
//! socket) and in tests (an in-process fake with injectable latency and
//! failures).

pub mod tcp;
pub mod yenc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// Lifecycle state of one connection, tracked by the owning [`crate::pool::ConnectionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Idle,
    InUse,
    /// An exception, timeout, or early stream disposal occurred; never
    /// reused, must be closed and replaced.
    Dirty,
    Closed,
}

/// A parsed yEnc `=ybegin`/`=ypart` header: enough to compute byte offsets
/// without decoding the body itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YencHeader {
    /// Decoded size of this part, in bytes.
    pub part_size: u64,
    /// Byte offset of this part within the full file.
    pub part_offset: u64,
}

/// The decoded body of one article: its bytes plus the parsed yEnc header
/// that placed them within the file.
#[derive(Debug, Clone)]
pub struct ArticleBody {
    pub header: YencHeader,
    pub bytes: Bytes,
}

/// Single-connection NNTP operations. Implementations are not required to
/// be `Clone`; the pool owns exactly one instance per live connection.
#[async_trait]
pub trait NntpTransport: Send {
    /// Connects the socket (optionally over TLS), reads the greeting, and
    /// authenticates. Must be called exactly once before any other method.
    async fn connect_and_auth(&mut self) -> Result<(), TransportError>;

    /// Whether the article exists, without consuming its body.
    async fn stat(&mut self, message_id: &str) -> Result<bool, TransportError>;

    /// Fetches headers only; does not return the body.
    async fn head(&mut self, message_id: &str) -> Result<YencHeader, TransportError>;

    /// Fetches and yEnc-decodes the full body.
    async fn body(&mut self, message_id: &str) -> Result<ArticleBody, TransportError>;

    /// Cheap liveness probe, used for idle health pings.
    async fn date(&mut self) -> Result<(), TransportError>;

    /// Selects a newsgroup; required by some providers before STAT/BODY.
    async fn group(&mut self, name: &str) -> Result<(), TransportError>;

    /// Current lifecycle state, as observed by the last operation.
    fn state(&self) -> ConnectionState;

    /// Marks the connection Dirty, e.g. because a caller abandoned an
    /// in-flight body stream before reaching the yEnc end sentinel.
    fn mark_dirty(&mut self);
}

/// Boxed trait object, the shape every [`crate::pool::ConnectionPool`] slot holds.
pub type BoxedTransport = Box<dyn NntpTransport>;
