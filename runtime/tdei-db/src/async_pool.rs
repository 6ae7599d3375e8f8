//! Async bounded pool for database connections.
//!
//! Each job owns one pooled connection for its whole lifetime; the guard hands
//! the connection back on drop so release happens exactly once on every path.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};
use tracing::debug;

type ConnectFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;

struct Idle<T> {
    conns: Vec<T>,
}

/// Snapshot of pool occupancy, logged around acquire and release.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub waiting: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("timed out waiting for a pooled connection")]
    Timeout,
    #[error("connection acquire cancelled")]
    Cancelled,
    #[error("failed to open connection: {0}")]
    Create(String),
}

pub struct AsyncPool<T> {
    max: usize,
    connect: Box<dyn Fn() -> ConnectFuture<T> + Send + Sync>,
    idle: Mutex<Idle<T>>,
    available: Notify,
    total: AtomicUsize,
    waiting: AtomicUsize,
}

/// Cooperative cancellation shared between a job and its pending acquires.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A checked-out connection. Dropping it returns the connection to the pool;
/// [`AsyncPooled::discard`] closes it instead.
pub struct AsyncPooled<T> {
    pool: Arc<AsyncPool<T>>,
    value: Option<T>,
}

impl<T> AsyncPool<T> {
    pub fn new<F, Fut, E>(max: usize, connect: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        let connect = Box::new(move || {
            let fut = connect();
            Box::pin(async move { fut.await.map_err(|err| err.to_string()) }) as ConnectFuture<T>
        });
        Arc::new(Self {
            max: max.max(1),
            connect,
            idle: Mutex::new(Idle { conns: Vec::new() }),
            available: Notify::new(),
            total: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        })
    }

    fn idle(&self) -> MutexGuard<'_, Idle<T>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<AsyncPooled<T>, AcquireError> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(AcquireError::Cancelled);
            }
            // Register interest before checking state so a release between the
            // check and the wait is not lost.
            let notified = self.available.notified();
            if let Some(conn) = self.idle().conns.pop() {
                return Ok(self.wrap(conn));
            }
            if self.try_reserve() {
                return match (self.connect)().await {
                    Ok(conn) => Ok(self.wrap(conn)),
                    Err(err) => {
                        self.total.fetch_sub(1, Ordering::SeqCst);
                        self.available.notify_one();
                        Err(AcquireError::Create(err))
                    }
                };
            }

            let remaining = match deadline {
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return Err(AcquireError::Timeout);
                    }
                    Some(limit - now)
                }
                None => None,
            };

            self.waiting.fetch_add(1, Ordering::SeqCst);
            let outcome = wait_for_slot(notified, remaining, cancel).await;
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            outcome?;
        }
    }

    fn try_reserve(&self) -> bool {
        self.total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < self.max).then_some(total + 1)
            })
            .is_ok()
    }

    fn wrap(self: &Arc<Self>, conn: T) -> AsyncPooled<T> {
        AsyncPooled {
            pool: Arc::clone(self),
            value: Some(conn),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.total.load(Ordering::SeqCst),
            idle: self.idle().conns.len(),
            waiting: self.waiting.load(Ordering::SeqCst),
        }
    }

    pub fn in_flight(&self) -> usize {
        let stats = self.stats();
        stats.total.saturating_sub(stats.idle)
    }

    pub fn idle_count(&self) -> usize {
        self.idle().conns.len()
    }

    fn release(&self, conn: T) {
        self.idle().conns.push(conn);
        self.available.notify_one();
        debug!(stats = ?self.stats(), "connection returned to pool");
    }

    fn discard(&self) {
        self.total.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
        debug!(stats = ?self.stats(), "pooled connection discarded");
    }
}

async fn wait_for_slot(
    notified: tokio::sync::futures::Notified<'_>,
    remaining: Option<Duration>,
    cancel: Option<&CancelToken>,
) -> Result<(), AcquireError> {
    match (cancel, remaining) {
        (Some(token), Some(duration)) => tokio::select! {
            _ = notified => Ok(()),
            _ = token.cancelled() => Err(AcquireError::Cancelled),
            _ = sleep(duration) => Err(AcquireError::Timeout),
        },
        (Some(token), None) => tokio::select! {
            _ = notified => Ok(()),
            _ = token.cancelled() => Err(AcquireError::Cancelled),
        },
        (None, Some(duration)) => tokio::select! {
            _ = notified => Ok(()),
            _ = sleep(duration) => Err(AcquireError::Timeout),
        },
        (None, None) => {
            notified.await;
            Ok(())
        }
    }
}

impl<T> AsyncPooled<T> {
    pub fn discard(mut self) {
        if self.value.take().is_some() {
            self.pool.discard();
        }
    }
}

impl<T> AsRef<T> for AsyncPooled<T> {
    fn as_ref(&self) -> &T {
        self.value
            .as_ref()
            .expect("pooled connection used after release")
    }
}

impl<T> Drop for AsyncPooled<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.value.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reuses_released_connections() {
        let pool = AsyncPool::new(2, || async { Ok::<_, std::io::Error>(7usize) });
        let first = pool.acquire(None, None).await.expect("first");
        let second = pool.acquire(None, None).await.expect("second");
        assert_eq!(pool.in_flight(), 2);
        drop(first);
        assert_eq!(pool.idle_count(), 1);
        drop(second);
        assert_eq!(pool.stats(), PoolStats { total: 2, idle: 2, waiting: 0 });
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let pool = AsyncPool::new(1, || async { Ok::<_, std::io::Error>(42usize) });
        let _guard = pool.acquire(None, None).await.expect("guard");
        let result = pool.acquire(Some(Duration::from_millis(5)), None).await;
        assert_eq!(result.err(), Some(AcquireError::Timeout));
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn cancelled_acquire_returns_promptly() {
        let pool = AsyncPool::new(1, || async { Ok::<_, std::io::Error>(7usize) });
        let _guard = pool.acquire(None, None).await.expect("guard");
        let token = CancelToken::new();
        token.cancel();
        let result = pool.acquire(None, Some(&token)).await;
        assert_eq!(result.err(), Some(AcquireError::Cancelled));
    }

    #[tokio::test]
    async fn waiter_wakes_when_connection_returns() {
        let pool = AsyncPool::new(1, || async { Ok::<_, std::io::Error>(1usize) });
        let guard = pool.acquire(None, None).await.expect("guard");
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.acquire(Some(Duration::from_secs(5)), None)
                    .await
                    .map(|conn| *conn.as_ref())
            })
        };
        tokio::task::yield_now().await;
        drop(guard);
        assert_eq!(waiter.await.expect("join"), Ok(1));
    }

    #[tokio::test]
    async fn discard_frees_a_slot() {
        let pool = AsyncPool::new(1, || async { Ok::<_, std::io::Error>(7usize) });
        let guard = pool.acquire(None, None).await.expect("guard");
        guard.discard();
        let next = pool.acquire(Some(Duration::from_millis(10)), None).await;
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn failed_connect_releases_reservation() {
        let pool = AsyncPool::new(1, || async { Err::<usize, _>("refused") });
        let err = pool.acquire(None, None).await.err();
        assert_eq!(err, Some(AcquireError::Create("refused".to_string())));
        assert_eq!(pool.stats().total, 0);
    }
}
