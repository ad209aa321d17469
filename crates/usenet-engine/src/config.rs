//! Configuration surface consumed by the engine.
//!
//! The engine never reads configuration from disk or a database itself;
//! it depends only on the small [`ConfigProvider`] trait below. Persisting
//! or parsing provider lists is an embedding application's concern.

use async_trait::async_trait;
use typed_builder::TypedBuilder;

/// What role a provider plays in dispatch ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Participates in the shared global connection pool.
    Pooled,
    /// Tried only after all `Pooled` providers fail; has its own small pool.
    Backup,
    /// Like `Backup`, but never tried unless explicitly forced or when no
    /// `Pooled`/`Backup` provider remains.
    BackupOnly,
    /// Configured but not eligible for dispatch.
    Disabled,
}

/// A single configured Usenet provider endpoint.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ProviderConfig {
    /// Stable 0-based index; must remain stable across config reloads for
    /// the same host so affinity/benchmark data stays meaningful.
    pub index: usize,
    pub host: String,
    pub port: u16,
    #[builder(default = true)]
    pub use_tls: bool,
    pub username: String,
    #[builder(setter(into))]
    pub password: String,
    pub max_connections: usize,
    pub kind: ProviderKind,
}

impl ProviderConfig {
    pub fn is_eligible(&self) -> bool {
        !matches!(self.kind, ProviderKind::Disabled)
    }
}

/// Process-wide limits, derived from the `usenet.*` configuration keys.
#[derive(Debug, Clone, TypedBuilder)]
pub struct EngineLimits {
    /// `K`: default number of concurrent connections per stream.
    #[builder(default = 8)]
    pub connections_per_stream: usize,
    /// Upper clamp for the dynamic per-operation timeout.
    #[builder(default = std::time::Duration::from_secs(90))]
    pub operation_timeout: std::time::Duration,
    /// `B`: default stream buffer size, in segments.
    #[builder(default = 40)]
    pub stream_buffer_size: usize,
    /// Upper cap on the shared pooled-provider semaphore.
    #[builder(default = 64)]
    pub total_streaming_connections: usize,
    /// `Q`: Queue-class operation permits.
    #[builder(default = 16)]
    pub max_queue_connections: usize,
    /// `H`: HealthCheck-class operation permits.
    #[builder(default = 4)]
    pub max_healthcheck_connections: usize,
    /// Retries performed per provider before treating a transient failure as
    /// exhausted for that provider (decided Open Question, see DESIGN.md).
    #[builder(default = 5)]
    pub retry_budget: u32,
}

/// External collaborator yielding the current provider list and limits.
///
/// Implementations are free to re-read configuration on every call (e.g. to
/// support live reload); the engine treats each call's result as a fresh
/// snapshot.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn providers(&self) -> Vec<ProviderConfig>;
    async fn limits(&self) -> EngineLimits;
}

/// A `ConfigProvider` backed by an in-memory snapshot, for embedding and
/// tests. Not a file-format parser: reading provider lists from disk or a
/// database is an external collaborator's job.
pub struct StaticConfigProvider {
    providers: Vec<ProviderConfig>,
    limits: EngineLimits,
}

impl StaticConfigProvider {
    pub fn new(providers: Vec<ProviderConfig>, limits: EngineLimits) -> Self {
        Self { providers, limits }
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn providers(&self) -> Vec<ProviderConfig> {
        self.providers.clone()
    }

    async fn limits(&self) -> EngineLimits {
        self.limits.clone()
    }
}
