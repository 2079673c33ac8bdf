//! A bounded pool of expensive, externally constructed resources.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::core::{BoxFuture, duration_ms, lock};
use crate::error::PoolError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle resources kept around instead of being destroyed on release.
    pub min_size: usize,
    /// Upper bound on resources handed out at the same time.
    pub max_size: usize,
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub created: u64,
    pub destroyed: u64,
    pub max_size: usize,
}

pub type Factory<R> = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;
pub type Destroyer<R> = Box<dyn Fn(R) + Send + Sync>;

/// What a waiting acquirer receives: either a resource someone released, or
/// the right to construct a fresh one because a slot opened up.
enum Handoff<R: Send + 'static> {
    Resource(Lease<R>),
    Slot(SlotPermit<R>),
}

struct PoolState<R: Send + 'static> {
    idle: VecDeque<R>,
    /// Slots held by leases and by constructions in progress.
    in_use: usize,
    waiters: VecDeque<oneshot::Sender<Handoff<R>>>,
    created: u64,
    destroyed: u64,
    closed: bool,
}

impl<R: Send + 'static> PoolState<R> {
    /// Pops the longest-waiting acquirer that is still listening.
    fn next_waiter(&mut self) -> Option<oneshot::Sender<Handoff<R>>> {
        while let Some(tx) = self.waiters.pop_front() {
            if !tx.is_closed() {
                return Some(tx);
            }
        }
        None
    }
}

struct PoolInner<R: Send + 'static> {
    config: PoolConfig,
    factory: Factory<R>,
    destroyer: Destroyer<R>,
    state: Mutex<PoolState<R>>,
}

impl<R: Send + 'static> PoolInner<R> {
    async fn create(self: &Arc<Self>, permit: SlotPermit<R>) -> Result<Lease<R>, PoolError> {
        // a failed or abandoned construction frees the slot when the permit drops
        let resource = (self.factory)().await.map_err(PoolError::Create)?;
        permit.disarm();
        lock(&self.state).created += 1;
        Ok(Lease::new(resource, self.clone()))
    }

    fn put_back(self: &Arc<Self>, mut resource: R) {
        loop {
            let mut state = lock(&self.state);

            if let Some(tx) = state.next_waiter() {
                drop(state);
                match tx.send(Handoff::Resource(Lease::new(resource, self.clone()))) {
                    Ok(()) => return,
                    Err(Handoff::Resource(mut lease)) => match lease.resource.take() {
                        Some(returned) => {
                            resource = returned;
                            continue;
                        }
                        None => return,
                    },
                    Err(Handoff::Slot(_)) => unreachable!(),
                }
            }

            state.in_use = state.in_use.saturating_sub(1);
            if !state.closed && state.idle.len() < self.config.min_size {
                state.idle.push_back(resource);
                return;
            }

            state.destroyed += 1;
            drop(state);
            (self.destroyer)(resource);
            return;
        }
    }

    fn free_slot(self: &Arc<Self>) {
        loop {
            let mut state = lock(&self.state);

            if let Some(tx) = state.next_waiter() {
                drop(state);
                match tx.send(Handoff::Slot(SlotPermit::new(self.clone()))) {
                    Ok(()) => return,
                    Err(Handoff::Slot(permit)) => {
                        permit.disarm();
                        continue;
                    }
                    Err(Handoff::Resource(_)) => unreachable!(),
                }
            }

            state.in_use = state.in_use.saturating_sub(1);
            return;
        }
    }
}

/// A reserved slot that has not produced a resource yet.
struct SlotPermit<R: Send + 'static> {
    pool: Option<Arc<PoolInner<R>>>,
}

impl<R: Send + 'static> SlotPermit<R> {
    fn new(pool: Arc<PoolInner<R>>) -> Self {
        Self { pool: Some(pool) }
    }

    fn disarm(mut self) {
        self.pool = None;
    }
}

impl<R: Send + 'static> Drop for SlotPermit<R> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.free_slot();
        }
    }
}

/// Exclusive access to a pooled resource. Dropping the lease releases it.
pub struct Lease<R: Send + 'static> {
    resource: Option<R>,
    pool: Arc<PoolInner<R>>,
}

impl<R: Send + 'static> Lease<R> {
    fn new(resource: R, pool: Arc<PoolInner<R>>) -> Self {
        Self {
            resource: Some(resource),
            pool,
        }
    }

    /// Returns the resource to the pool. Equivalent to dropping the lease.
    pub fn release(self) {}
}

impl<R: Send + 'static> Deref for Lease<R> {
    type Target = R;

    fn deref(&self) -> &R {
        match &self.resource {
            Some(resource) => resource,
            None => unreachable!(),
        }
    }
}

impl<R: Send + 'static> DerefMut for Lease<R> {
    fn deref_mut(&mut self) -> &mut R {
        match &mut self.resource {
            Some(resource) => resource,
            None => unreachable!(),
        }
    }
}

impl<R: Send + 'static> Drop for Lease<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.put_back(resource);
        }
    }
}

impl<R: Send + std::fmt::Debug + 'static> std::fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Lease").field(&self.resource).finish()
    }
}

/// Bounds the number of live instances of a resource and reuses idle ones.
///
/// At most `max_size` resources are handed out at once. When the bound is
/// reached, acquirers queue up and are served in arrival order as leases are
/// released.
pub struct ResourcePool<R: Send + 'static> {
    inner: Arc<PoolInner<R>>,
}

impl<R: Send + 'static> Clone for ResourcePool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Send + 'static> ResourcePool<R> {
    pub fn new<F, Fut, D>(config: PoolConfig, factory: F, destroyer: D) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        D: Fn(R) + Send + Sync + 'static,
    {
        let config = PoolConfig {
            max_size: config.max_size.max(1),
            ..config
        };

        Self {
            inner: Arc::new(PoolInner {
                config,
                factory: Box::new(move || -> BoxFuture<'static, anyhow::Result<R>> {
                    Box::pin(factory())
                }),
                destroyer: Box::new(destroyer),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    in_use: 0,
                    waiters: VecDeque::new(),
                    created: 0,
                    destroyed: 0,
                    closed: false,
                }),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Hands out an idle resource, constructs a new one when below
    /// `max_size`, or waits for a release up to `acquire_timeout`.
    pub async fn acquire(&self) -> Result<Lease<R>, PoolError> {
        enum Next<R: Send + 'static> {
            Ready(Lease<R>),
            Create(SlotPermit<R>),
            Wait(oneshot::Receiver<Handoff<R>>),
        }

        let next = {
            let mut state = lock(&self.inner.state);

            if state.closed {
                return Err(PoolError::Closed);
            }

            if let Some(resource) = state.idle.pop_front() {
                state.in_use += 1;
                Next::Ready(Lease::new(resource, self.inner.clone()))
            } else if state.in_use < self.inner.config.max_size {
                state.in_use += 1;
                Next::Create(SlotPermit::new(self.inner.clone()))
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Next::Wait(rx)
            }
        };

        match next {
            Next::Ready(lease) => Ok(lease),
            Next::Create(permit) => self.inner.create(permit).await,
            Next::Wait(rx) => {
                let timeout = self.inner.config.acquire_timeout;
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(Handoff::Resource(lease))) => Ok(lease),
                    Ok(Ok(Handoff::Slot(permit))) => self.inner.create(permit).await,
                    Ok(Err(_)) => Err(PoolError::Closed),
                    Err(_) => {
                        tracing::debug!(?timeout, "timed out waiting for a pooled resource");
                        Err(PoolError::AcquireTimeout(timeout))
                    }
                }
            }
        }
    }

    /// Returns a leased resource. Same as dropping the lease.
    pub fn release(&self, lease: Lease<R>) {
        drop(lease);
    }

    /// Constructs resources until `min_size` are alive. Returns how many
    /// were created.
    pub async fn warm_up(&self) -> Result<usize, PoolError> {
        let mut created = 0;
        loop {
            let permit = {
                let mut state = lock(&self.inner.state);
                if state.closed || state.idle.len() + state.in_use >= self.inner.config.min_size {
                    break;
                }
                state.in_use += 1;
                SlotPermit::new(self.inner.clone())
            };

            let lease = self.inner.create(permit).await?;
            drop(lease);
            created += 1;
        }
        Ok(created)
    }

    /// Destroys every idle resource. Returns how many were destroyed.
    pub fn drain(&self) -> usize {
        let drained: Vec<R> = {
            let mut state = lock(&self.inner.state);
            let drained: Vec<R> = state.idle.drain(..).collect();
            state.destroyed += drained.len() as u64;
            drained
        };

        let count = drained.len();
        for resource in drained {
            (self.inner.destroyer)(resource);
        }
        count
    }

    /// Drains the pool and rejects current and future acquirers with
    /// [`PoolError::Closed`]. Outstanding leases are destroyed on release.
    pub fn close(&self) {
        let waiters = {
            let mut state = lock(&self.inner.state);
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };
        drop(waiters);
        self.drain();
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.inner.state);
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use,
            waiting: state.waiters.iter().filter(|tx| !tx.is_closed()).count(),
            created: state.created,
            destroyed: state.destroyed,
            max_size: self.inner.config.max_size,
        }
    }
}

impl<R: Send + 'static> std::fmt::Debug for ResourcePool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Connection {
        id: usize,
    }

    fn pool(min_size: usize, max_size: usize) -> (ResourcePool<Connection>, Arc<AtomicUsize>) {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::new(AtomicUsize::new(0));
        let on_destroy = destroyed.clone();

        let pool = ResourcePool::new(
            PoolConfig {
                min_size,
                max_size,
                acquire_timeout: Duration::from_millis(500),
            },
            move || {
                let counter = counter.clone();
                async move {
                    Ok(Connection {
                        id: counter.fetch_add(1, Ordering::SeqCst),
                    })
                }
            },
            move |_| {
                on_destroy.fetch_add(1, Ordering::SeqCst);
            },
        );
        (pool, destroyed)
    }

    #[tokio::test]
    async fn test_reuses_idle_resource() {
        let (pool, _) = pool(1, 2);

        let lease = pool.acquire().await.unwrap();
        let first = lease.id;
        pool.release(lease);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.id, first);
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_use_never_exceeds_max() {
        let (pool, _) = pool(0, 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().in_use, 2);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|lease| lease.id) })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.stats().waiting, 1);
        assert_eq!(pool.stats().in_use, 2);

        // handed straight to the waiter, never idle in between
        let released = a.id;
        drop(a);
        assert_eq!(waiter.await.unwrap().unwrap(), released);
        assert_eq!(pool.stats().idle, 0);
        assert!(pool.stats().in_use <= 2);
        drop(b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_order() {
        let (pool, _) = pool(0, 1);
        let held = pool.acquire().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for n in 0..3 {
            let pool = pool.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                lock(&order).push(n);
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(lease);
            }));
            tokio::task::yield_now().await;
        }

        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*lock(&order), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout() {
        let (pool, _) = pool(0, 1);
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::AcquireTimeout(_)));
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_release_above_min_destroys() {
        let (pool, destroyed) = pool(1, 3);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        drop(a);
        drop(b);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_factory_failure_frees_slot() {
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = fail.clone();
        let pool = ResourcePool::new(
            PoolConfig {
                min_size: 0,
                max_size: 1,
                acquire_timeout: Duration::from_millis(100),
            },
            move || {
                let flag = flag.clone();
                async move {
                    if flag.load(Ordering::SeqCst) {
                        anyhow::bail!("connection refused");
                    }
                    Ok(7)
                }
            },
            |_| {},
        );

        assert!(matches!(pool.acquire().await, Err(PoolError::Create(_))));
        assert_eq!(pool.stats().in_use, 0);

        fail.store(false, Ordering::SeqCst);
        assert_eq!(*pool.acquire().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_warm_up_and_drain() {
        let (pool, destroyed) = pool(3, 5);
        assert_eq!(pool.warm_up().await.unwrap(), 3);
        assert_eq!(pool.stats().idle, 3);
        assert_eq!(pool.warm_up().await.unwrap(), 0);

        assert_eq!(pool.drain(), 3);
        assert_eq!(destroyed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_rejects_waiters() {
        let (pool, _) = pool(0, 1);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
        drop(held);
        assert_eq!(pool.stats().idle, 0);
    }
}
