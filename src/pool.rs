use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        Mutex,
    },
    task::JoinHandle,
    time::{timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const EXPAND_ABOVE: f64 = 0.8;
const SHRINK_BELOW: f64 = 0.3;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool timeout")]
    Timeout,
    #[error("failed to create connection: {0}")]
    Connect(String),
    #[error("connection pool is shut down")]
    Closed,
}

/// Creates connections for a pool and tells it which ones can no longer be reused.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection, PoolError>;

    fn is_broken(&self, connection: &Self::Connection) -> bool;
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub name: String,
    pub live: usize,
    pub idle: usize,
    pub min_size: usize,
    pub max_size: usize,
}

/// Bounded, autoscaling connection pool.
///
/// Idle connections sit in a queue whose capacity equals `max_size`. `live` counts
/// every connection the pool owns, checked out or idle, and never exceeds `max_size`.
pub struct ConnectionPool<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner<M: ManageConnection> {
    name: String,
    manager: M,
    min_size: usize,
    max_size: usize,
    acquire_timeout: Duration,
    live: AtomicUsize,
    closed: AtomicBool,
    closing: CancellationToken,
    idle_tx: mpsc::Sender<M::Connection>,
    idle_rx: Mutex<mpsc::Receiver<M::Connection>>,
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Builds the pool and eagerly opens `min_size` connections. Individual creation
    /// failures are logged and skipped.
    pub async fn new(name: impl Into<String>, manager: M, config: &PoolConfig) -> Self {
        Self::with_acquire_timeout(name, manager, config, DEFAULT_ACQUIRE_TIMEOUT).await
    }

    pub async fn with_acquire_timeout(
        name: impl Into<String>,
        manager: M,
        config: &PoolConfig,
        acquire_timeout: Duration,
    ) -> Self {
        let max_size = config.max_size.max(1);
        let min_size = config.min_size.min(max_size);
        let (idle_tx, idle_rx) = mpsc::channel(max_size);
        let pool = Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                manager,
                min_size,
                max_size,
                acquire_timeout,
                live: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                closing: CancellationToken::new(),
                idle_tx,
                idle_rx: Mutex::new(idle_rx),
            }),
        };

        for _ in 0..min_size {
            if let Err(error) = pool.inner.grow_one().await {
                warn!(pool = %pool.inner.name, error = %error, "failed to create initial connection");
            }
        }
        info!(
            pool = %pool.inner.name,
            live = pool.inner.live.load(Ordering::SeqCst),
            min_size,
            max_size,
            "connection pool ready"
        );
        pool
    }

    /// Hands out a connection: an idle one if available, else a fresh one while under
    /// `max_size`, else the next one released within the acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection<M>, PoolError> {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.acquire_timeout;

        loop {
            if inner.closed.load(Ordering::SeqCst) {
                return Err(PoolError::Closed);
            }

            if let Some(connection) = inner.try_take_idle() {
                if let Some(connection) = inner.keep_if_healthy(connection) {
                    return Ok(self.guard(connection));
                }
                continue;
            }

            if inner.try_reserve() {
                return match inner.manager.connect().await {
                    Ok(connection) => Ok(self.guard(connection)),
                    Err(error) => {
                        inner.live.fetch_sub(1, Ordering::SeqCst);
                        Err(error)
                    }
                };
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PoolError::Timeout);
            }
            let waited = timeout(remaining, async {
                let mut idle = tokio::select! {
                    _ = inner.closing.cancelled() => return None,
                    idle = inner.idle_rx.lock() => idle,
                };
                tokio::select! {
                    _ = inner.closing.cancelled() => None,
                    connection = idle.recv() => connection,
                }
            })
            .await;
            match waited {
                Ok(Some(connection)) => {
                    if let Some(connection) = inner.keep_if_healthy(connection) {
                        return Ok(self.guard(connection));
                    }
                }
                Ok(None) => return Err(PoolError::Closed),
                Err(_) => {
                    debug!(pool = %inner.name, "timed out waiting for an idle connection");
                    return Err(PoolError::Timeout);
                }
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            name: self.inner.name.clone(),
            live: self.inner.live.load(Ordering::SeqCst),
            idle: self.inner.idle_len(),
            min_size: self.inner.min_size,
            max_size: self.inner.max_size,
        }
    }

    /// Runs one autoscale evaluation immediately.
    pub async fn scale_once(&self) {
        self.inner.scale().await;
    }

    /// Spawns the periodic autoscaler. The task holds only a weak reference and exits
    /// once the pool is dropped or shut down.
    pub fn spawn_autoscaler(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<PoolInner<M>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                inner.scale().await;
            }
        })
    }

    /// Stops the pool: idle connections are closed now, checked-out ones when they are
    /// released. Further acquires fail with [`PoolError::Closed`].
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.closing.cancel();
        let mut idle = inner.idle_rx.lock().await;
        let mut closed = 0usize;
        while let Ok(connection) = idle.try_recv() {
            drop(connection);
            inner.live.fetch_sub(1, Ordering::SeqCst);
            closed += 1;
        }
        info!(pool = %inner.name, closed, "connection pool shut down");
    }

    fn guard(&self, connection: M::Connection) -> PooledConnection<M> {
        PooledConnection {
            connection: Some(connection),
            pool: self.inner.clone(),
        }
    }
}

impl<M: ManageConnection> PoolInner<M> {
    fn idle_len(&self) -> usize {
        self.idle_tx.max_capacity() - self.idle_tx.capacity()
    }

    fn try_take_idle(&self) -> Option<M::Connection> {
        let mut idle = self.idle_rx.try_lock().ok()?;
        idle.try_recv().ok()
    }

    fn try_reserve(&self) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < self.max_size).then_some(live + 1)
            })
            .is_ok()
    }

    fn discard(&self, connection: M::Connection) {
        drop(connection);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn keep_if_healthy(&self, connection: M::Connection) -> Option<M::Connection> {
        if self.manager.is_broken(&connection) {
            debug!(pool = %self.name, "discarding broken idle connection");
            self.discard(connection);
            None
        } else {
            Some(connection)
        }
    }

    fn release(&self, connection: M::Connection) {
        if self.closed.load(Ordering::SeqCst) || self.manager.is_broken(&connection) {
            self.discard(connection);
            return;
        }
        match self.idle_tx.try_send(connection) {
            Ok(()) => {}
            Err(TrySendError::Full(connection)) | Err(TrySendError::Closed(connection)) => {
                self.discard(connection);
            }
        }
    }

    async fn grow_one(&self) -> Result<(), PoolError> {
        if !self.try_reserve() {
            return Ok(());
        }
        match self.manager.connect().await {
            Ok(connection) => {
                if let Err(TrySendError::Full(connection)) | Err(TrySendError::Closed(connection)) =
                    self.idle_tx.try_send(connection)
                {
                    self.discard(connection);
                }
                Ok(())
            }
            Err(error) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                Err(error)
            }
        }
    }

    fn shrink_one(&self) -> bool {
        let reserved = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live > self.min_size).then_some(live - 1)
            })
            .is_ok();
        if !reserved {
            return false;
        }
        match self.try_take_idle() {
            Some(connection) => {
                drop(connection);
                true
            }
            None => {
                self.live.fetch_add(1, Ordering::SeqCst);
                false
            }
        }
    }

    async fn scale(&self) {
        let live = self.live.load(Ordering::SeqCst);
        let idle = self.idle_len();
        let utilization = (self.max_size - idle) as f64 / self.max_size as f64;
        let step = (live / 4).max(1);

        if utilization > EXPAND_ABOVE && live < self.max_size {
            let mut added = 0usize;
            for _ in 0..step {
                if self.live.load(Ordering::SeqCst) >= self.max_size {
                    break;
                }
                if let Err(error) = self.grow_one().await {
                    warn!(pool = %self.name, error = %error, "failed to expand pool");
                    break;
                }
                added += 1;
            }
            debug!(pool = %self.name, utilization, added, "pool expanded");
        } else if utilization < SHRINK_BELOW && live > self.min_size {
            let removed = (0..step).take_while(|_| self.shrink_one()).count();
            debug!(pool = %self.name, utilization, removed, "pool shrunk");
        }
    }
}

/// A checked-out connection. Dropping it returns the connection to the pool exactly
/// once, or closes it when the pool is full, shut down, or the connection is broken.
pub struct PooledConnection<M: ManageConnection> {
    connection: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("pooled connection is present until dropped")
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("pooled connection is present until dropped")
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}
