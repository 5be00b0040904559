//! Generic bounded connection pool (spec section 4.6).
//!
//! Grounded on `examples/original_source/src/db_connection_manager.{h,cpp}`:
//! `PooledDbConnectionManager` hand-rolls queue + condition-variable pool
//! semantics instead of delegating to the driver's own pool, because the
//! spec's acquire-timeout/queue-depth contract needs to be independently
//! testable (testable property 7). This is the async-Rust equivalent:
//! `std::sync::Mutex` guards the idle queue and counters (never held across
//! an `.await`), `tokio::sync::Notify` replaces the condition variable.
//!
//! Not tied to any particular driver: `ConnectionFactory` is the seam a
//! Postgres-backed repository (or anything else) plugs into.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tm_types::{ErrorCode, HasErrorCode};
use tokio::sync::Notify;

#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn open(&self) -> Result<Self::Connection, Self::Error>;

    /// Runs once on every freshly opened connection, before it is handed
    /// out or stored idle. Default: no-op.
    async fn initialize(&self, _conn: &mut Self::Connection) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Cheap, synchronous liveness check consulted on release. Default:
    /// always healthy (drivers without a cheap check should override to
    /// `false` if they want broken connections dropped aggressively).
    fn is_healthy(&self, _conn: &Self::Connection) -> bool {
        true
    }
}

#[derive(Debug, Error)]
pub enum PoolError<E> {
    #[error("timed out after {0:?} acquiring a connection")]
    Timeout(Duration),
    #[error("pool is shutting down")]
    ShuttingDown,
    #[error("failed to open connection: {0}")]
    Open(#[source] E),
}

impl<E: std::error::Error> HasErrorCode for PoolError<E> {
    fn error_code(&self) -> ErrorCode {
        match self {
            PoolError::Timeout(_) => ErrorCode::PoolTimeout,
            PoolError::ShuttingDown => ErrorCode::ResourceExhausted,
            PoolError::Open(_) => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub size: usize,
    pub in_use: usize,
    pub available: usize,
    pub total_acquires: u64,
    pub total_timeouts: u64,
    pub total_wait: Duration,
}

struct PoolState<C> {
    idle: VecDeque<C>,
    in_use: usize,
    shutdown: bool,
    total_acquires: u64,
    total_timeouts: u64,
    total_wait: Duration,
}

pub struct Pool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    notify: Notify,
}

impl<F: ConnectionFactory> Pool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            factory,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                in_use: 0,
                shutdown: false,
                total_acquires: 0,
                total_timeouts: 0,
                total_wait: Duration::ZERO,
            }),
            notify: Notify::new(),
        })
    }

    /// Acquires a connection, opening one if the pool has spare capacity,
    /// or waiting for a release, or failing with [`PoolError::Timeout`]
    /// once `acquire_timeout` elapses.
    pub async fn get(self: &Arc<Self>) -> Result<PooledConnection<F>, PoolError<F::Error>> {
        let start = Instant::now();
        loop {
            enum Action<C> {
                Return(C),
                Open,
                Wait,
                Shutdown,
            }

            let action = {
                let mut state = self.state.lock().expect("pool mutex poisoned");
                if state.shutdown {
                    Action::Shutdown
                } else if let Some(conn) = state.idle.pop_front() {
                    state.in_use += 1;
                    state.total_acquires += 1;
                    state.total_wait += start.elapsed();
                    Action::Return(conn)
                } else if state.in_use < self.config.pool_size {
                    // Reserve the slot before releasing the lock so a
                    // concurrent acquirer can't also start opening.
                    state.in_use += 1;
                    Action::Open
                } else {
                    Action::Wait
                }
            };

            match action {
                Action::Shutdown => return Err(PoolError::ShuttingDown),
                Action::Return(conn) => return Ok(PooledConnection::new(Arc::clone(self), conn)),
                Action::Open => match self.open_and_initialize().await {
                    Ok(conn) => {
                        let mut state = self.state.lock().expect("pool mutex poisoned");
                        state.total_acquires += 1;
                        state.total_wait += start.elapsed();
                        return Ok(PooledConnection::new(Arc::clone(self), conn));
                    }
                    Err(e) => {
                        let mut state = self.state.lock().expect("pool mutex poisoned");
                        state.in_use -= 1;
                        drop(state);
                        self.notify.notify_one();
                        tracing::error!(error = %e, "failed to open pooled connection");
                        return Err(PoolError::Open(e));
                    }
                },
                Action::Wait => {
                    let elapsed = start.elapsed();
                    let remaining = self.config.acquire_timeout.checked_sub(elapsed).unwrap_or(Duration::ZERO);
                    if remaining.is_zero() {
                        let mut state = self.state.lock().expect("pool mutex poisoned");
                        state.total_timeouts += 1;
                        return Err(PoolError::Timeout(self.config.acquire_timeout));
                    }
                    let notified = self.notify.notified();
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        let mut state = self.state.lock().expect("pool mutex poisoned");
                        state.total_timeouts += 1;
                        return Err(PoolError::Timeout(self.config.acquire_timeout));
                    }
                }
            }
        }
    }

    async fn open_and_initialize(&self) -> Result<F::Connection, F::Error> {
        let mut conn = self.factory.open().await?;
        self.factory.initialize(&mut conn).await?;
        Ok(conn)
    }

    fn release(&self, conn: F::Connection) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        state.in_use -= 1;
        if !state.shutdown && self.factory.is_healthy(&conn) {
            state.idle.push_back(conn);
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Drains idle connections and marks the pool as shutting down; any
    /// pending or future `get()` calls fail immediately.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        state.shutdown = true;
        state.idle.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().expect("pool mutex poisoned");
        PoolStats {
            size: self.config.pool_size,
            in_use: state.in_use,
            available: state.idle.len(),
            total_acquires: state.total_acquires,
            total_timeouts: state.total_timeouts,
            total_wait: state.total_wait,
        }
    }
}

/// An owned handle that returns its connection to the pool on drop.
pub struct PooledConnection<F: ConnectionFactory> {
    pool: Arc<Pool<F>>,
    conn: Option<F::Connection>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(pool: Arc<Pool<F>>, conn: F::Connection) -> Self {
        Self { pool, conn: Some(conn) }
    }
}

impl<F: ConnectionFactory> std::ops::Deref for PooledConnection<F> {
    type Target = F::Connection;
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection taken only on drop")
    }
}

impl<F: ConnectionFactory> std::ops::DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection taken only on drop")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicUsize,
        fail_opens: AtomicUsize,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("synthetic open failure")]
    struct OpenError;

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        type Connection = usize;
        type Error = OpenError;

        async fn open(&self) -> Result<Self::Connection, Self::Error> {
            if self.fail_opens.load(Ordering::SeqCst) > 0 {
                self.fail_opens.fetch_sub(1, Ordering::SeqCst);
                return Err(OpenError);
            }
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn opens_up_to_pool_size_then_reuses_released_connections() {
        let pool = Pool::new(
            CountingFactory::default(),
            PoolConfig {
                pool_size: 2,
                acquire_timeout: Duration::from_millis(200),
            },
        );
        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        assert_eq!(pool.stats().in_use, 2);
        drop(a);
        let c = pool.get().await.unwrap();
        assert_eq!(pool.factory.opened.load(Ordering::SeqCst), 2);
        drop(b);
        drop(c);
    }

    #[tokio::test]
    async fn blocks_then_times_out_when_exhausted() {
        let pool = Pool::new(
            CountingFactory::default(),
            PoolConfig {
                pool_size: 1,
                acquire_timeout: Duration::from_millis(50),
            },
        );
        let _held = pool.get().await.unwrap();
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout(_)));
        assert_eq!(pool.stats().total_timeouts, 1);
    }

    #[tokio::test]
    async fn waiting_acquirer_is_woken_by_a_release() {
        let pool = Pool::new(
            CountingFactory::default(),
            PoolConfig {
                pool_size: 1,
                acquire_timeout: Duration::from_millis(500),
            },
        );
        let held = pool.get().await.unwrap();
        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.get().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        let got = waiter.await.unwrap();
        assert!(got.is_ok());
    }

    #[tokio::test]
    async fn failed_open_does_not_consume_a_slot() {
        let factory = CountingFactory::default();
        factory.fail_opens.store(1, Ordering::SeqCst);
        let pool = Pool::new(
            factory,
            PoolConfig {
                pool_size: 1,
                acquire_timeout: Duration::from_millis(200),
            },
        );
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, PoolError::Open(_)));
        assert_eq!(pool.stats().in_use, 0);
        let ok = pool.get().await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn shutdown_fails_pending_and_future_acquisitions() {
        let pool = Pool::new(
            CountingFactory::default(),
            PoolConfig {
                pool_size: 1,
                acquire_timeout: Duration::from_millis(200),
            },
        );
        let held = pool.get().await.unwrap();
        drop(held);
        pool.shutdown();
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, PoolError::ShuttingDown));
    }
}
