//! Per-provider connection pool behind a shared global semaphore.
//!
//! Grounded on the lease/return-or-replace shape of `bb8`'s
//! `ManageConnection`, combined with `usenet-engine-task`'s `ChildTask` for
//! a background task that reaps connections idle past the timeout and fires
//! a `DATE` health ping on connections idle past a shorter threshold.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument, warn};

use crate::error::PoolError;
use crate::transport::{BoxedTransport, ConnectionState};
use usenet_engine_task::ChildTask;

/// Connections idle for longer than this are closed by the background reaper.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// A connection idle at least this long gets a `DATE` health ping.
const HEALTH_PING_IDLE_THRESHOLD: Duration = Duration::from_secs(45);
/// Budget for a single health ping before it is treated as a failure.
const HEALTH_PING_TIMEOUT: Duration = Duration::from_secs(10);
/// How often the background task scans the idle set.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

struct IdleConnection {
    transport: BoxedTransport,
    idle_since: Instant,
    last_health_ping: Instant,
}

struct PoolInner {
    idle: Mutex<VecDeque<IdleConnection>>,
    /// Permits for this pool's own capacity (`max_connections`).
    local: Arc<Semaphore>,
    max_connections: usize,
    /// Permits shared across every `Pooled` provider's pool; `None` for
    /// Backup/BackupOnly pools, which do not share capacity.
    shared: Option<Arc<Semaphore>>,
    live: AtomicUsize,
    factory: Box<dyn Fn() -> BoxedTransport + Send + Sync>,
}

/// Bounded set of [`crate::transport::NntpTransport`] connections for one provider.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    disposed: Arc<std::sync::atomic::AtomicBool>,
    _idle_sweep: ChildTask<()>,
}

/// A leased connection. The holder must call exactly one of [`ConnectionLease::return_to_pool`]
/// or [`ConnectionLease::replace`].
pub struct ConnectionLease {
    transport: Option<BoxedTransport>,
    _local_permit: OwnedSemaphorePermit,
    _shared_permit: Option<OwnedSemaphorePermit>,
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        max_connections: usize,
        shared: Option<Arc<Semaphore>>,
        factory: impl Fn() -> BoxedTransport + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            idle: Mutex::new(VecDeque::new()),
            local: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            shared,
            live: AtomicUsize::new(0),
            factory: Box::new(factory),
        });
        let disposed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let sweep_inner = Arc::clone(&inner);
        let sweep_disposed = Arc::clone(&disposed);

        Self {
            inner,
            disposed,
            _idle_sweep: ChildTask::spawn(idle_sweep_loop(sweep_inner, sweep_disposed)),
        }
    }

    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::Relaxed)
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max_connections
    }

    /// Connection slots neither leased out nor occupied by a live
    /// connection — i.e. how much spare capacity this pool has right now.
    /// Used by the dispatcher to prefer high-headroom providers.
    pub fn available_permits(&self) -> usize {
        self.inner.local.available_permits()
    }

    /// Spare capacity on the shared pooled-provider semaphore, if this pool
    /// participates in one (`None` for Backup/BackupOnly providers).
    pub fn shared_available_permits(&self) -> Option<usize> {
        self.inner.shared.as_ref().map(|shared| shared.available_permits())
    }

    /// Leases a connection, creating a new one if no idle connection is
    /// available and capacity remains. Blocks on both the local semaphore
    /// and (if set) the shared global semaphore.
    #[instrument(skip(self))]
    pub async fn lease(&self, timeout: Duration) -> Result<ConnectionLease, PoolError> {
        if self.disposed.load(Ordering::Relaxed) {
            return Err(PoolError::Disposed);
        }

        let local_permit = tokio::time::timeout(timeout, Arc::clone(&self.inner.local).acquire_owned())
            .await
            .map_err(|_| PoolError::LeaseTimeout)?
            .expect("pool semaphore is never closed");

        let shared_permit = match &self.inner.shared {
            Some(shared) => Some(
                tokio::time::timeout(timeout, Arc::clone(shared).acquire_owned())
                    .await
                    .map_err(|_| PoolError::LeaseTimeout)?
                    .expect("shared semaphore is never closed"),
            ),
            None => None,
        };

        let mut idle = self.inner.idle.lock().await;
        while let Some(candidate) = idle.pop_back() {
            if candidate.idle_since.elapsed() > IDLE_TIMEOUT {
                self.inner.live.fetch_sub(1, Ordering::Relaxed);
                debug!("closing connection idle past timeout");
                continue;
            }
            drop(idle);
            return Ok(ConnectionLease {
                transport: Some(candidate.transport),
                _local_permit: local_permit,
                _shared_permit: shared_permit,
                inner: Arc::clone(&self.inner),
            });
        }
        drop(idle);

        let mut transport = (self.inner.factory)();
        transport.connect_and_auth().await.map_err(PoolError::Transport)?;
        self.inner.live.fetch_add(1, Ordering::Relaxed);

        Ok(ConnectionLease {
            transport: Some(transport),
            _local_permit: local_permit,
            _shared_permit: shared_permit,
            inner: Arc::clone(&self.inner),
        })
    }

    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::Relaxed);
        let mut idle = self.inner.idle.lock().await;
        idle.clear();
        self.inner.live.store(0, Ordering::Relaxed);
    }
}

impl ConnectionLease {
    pub fn transport(&mut self) -> &mut BoxedTransport {
        self.transport.as_mut().expect("transport taken only on return/replace")
    }

    /// Returns the connection to the pool's idle set. Callers must already
    /// have awaited a clean ("quiet") state; returning a connection whose
    /// last observed state is [`ConnectionState::Dirty`] is a logic error
    /// and is downgraded to a replace.
    pub async fn return_to_pool(mut self) {
        let transport = self.transport.take().expect("single-use lease");
        if transport.state() == ConnectionState::Dirty {
            warn!("returning a dirty connection, replacing instead");
            self.inner.live.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        let now = Instant::now();
        let mut idle = self.inner.idle.lock().await;
        idle.push_back(IdleConnection {
            transport,
            idle_since: now,
            last_health_ping: now,
        });
    }

    /// Discards the connection; the pool's live count drops by one and a
    /// fresh connection will be created on the next lease.
    pub fn replace(mut self) {
        self.transport.take();
        self.inner.live.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for ConnectionLease {
    /// A lease dropped without an explicit `return_to_pool`/`replace` (e.g.
    /// due to a canceled future) is treated as a replace so the pool's live
    /// count never drifts.
    fn drop(&mut self) {
        if self.transport.take().is_some() {
            self.inner.live.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Background task, one per pool: closes connections idle past
/// [`IDLE_TIMEOUT`] and fires a `DATE` probe on connections idle past
/// [`HEALTH_PING_IDLE_THRESHOLD`]. A failed or timed-out ping is logged and
/// otherwise ignored; the connection is left in the idle set and will
/// simply fail fast (and get replaced) the next time it is leased and used.
async fn idle_sweep_loop(inner: Arc<PoolInner>, disposed: Arc<std::sync::atomic::AtomicBool>) {
    loop {
        tokio::time::sleep(IDLE_SWEEP_INTERVAL).await;
        if disposed.load(Ordering::Relaxed) {
            continue;
        }

        let mut idle = inner.idle.lock().await;
        let mut retained = VecDeque::with_capacity(idle.len());
        while let Some(mut candidate) = idle.pop_front() {
            if candidate.idle_since.elapsed() > IDLE_TIMEOUT {
                inner.live.fetch_sub(1, Ordering::Relaxed);
                debug!("closing connection idle past timeout");
                continue;
            }
            if candidate.last_health_ping.elapsed() >= HEALTH_PING_IDLE_THRESHOLD {
                match tokio::time::timeout(HEALTH_PING_TIMEOUT, candidate.transport.date()).await {
                    Ok(Ok(())) => debug!("idle health ping ok"),
                    Ok(Err(error)) => warn!(%error, "idle health ping failed"),
                    Err(_) => warn!("idle health ping timed out"),
                }
                candidate.last_health_ping = Instant::now();
            }
            retained.push_back(candidate);
        }
        *idle = retained;
    }
}
