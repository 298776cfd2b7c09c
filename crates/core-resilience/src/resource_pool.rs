//! Generic bounded pool for scarce, expensive-to-construct resources
//!
//! Provides safe reuse of native handles (inference contexts, device
//! sessions) with a hard capacity limit, eager or lazy creation, and
//! deadline-aware acquisition.
//!
//! # Ownership
//!
//! A resource is owned by exactly one of {pool, caller} at any time. A
//! checked-out resource lives inside a [`PooledResource`] guard; dropping the
//! guard (or calling [`PooledResource::release`]) hands it back. Resources are
//! destroyed explicitly through [`ResourceFactory::destroy`], never left to
//! whatever order values happen to be dropped in.
//!
//! # Accounting
//!
//! Every checked-out resource holds one semaphore permit, and the semaphore
//! starts with `capacity` permits, so `available + in_use == created <=
//! capacity` holds whenever the pool is quiescent. Waiters are served in
//! FIFO order by the semaphore, so no waiter starves under finite contention.

use super::context::CallContext;
use super::error::ResilienceError;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, warn};

const POOL_NAME: &str = "resource pool";

/// Configuration for resource pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live resources; must be greater than zero
    pub capacity: usize,
    /// Number of resources created eagerly at construction (0 = fully lazy).
    /// Values above `capacity` are clamped.
    pub prewarm: usize,
    /// Wait budget for [`ResourcePool::acquire`] when the caller set no deadline
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 3,
            prewarm: 0,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Eager profile: every resource is created up front.
    ///
    /// Suited to text engines where all contexts share one loaded model and
    /// a failure to reserve memory should surface at startup, not on the
    /// first request.
    ///
    /// ```
    /// use hearth_core_resilience::resource_pool::PoolConfig;
    ///
    /// let config = PoolConfig::eager(4);
    /// assert_eq!(config.prewarm, 4);
    /// ```
    pub fn eager(capacity: usize) -> Self {
        Self {
            capacity,
            prewarm: capacity,
            ..Default::default()
        }
    }

    /// Lazy profile: resources are created on demand up to `capacity`.
    ///
    /// Suited to image engines where each context loads its own weights and
    /// startup should not pay for capacity that may never be used.
    pub fn lazy(capacity: usize) -> Self {
        Self {
            capacity,
            prewarm: 0,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), ResilienceError> {
        if self.capacity == 0 {
            return Err(ResilienceError::Validation(
                "pool capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Factory trait for creating, resetting and destroying pooled resources
#[async_trait::async_trait]
pub trait ResourceFactory<T: Send + 'static>: Send + Sync {
    /// Create a new resource
    async fn create(&self) -> Result<T, ResilienceError>;

    /// Clear per-use transient state before the resource is requeued
    fn reset(&self, _resource: &mut T) {}

    /// Destroy a resource, freeing whatever native memory it holds
    fn destroy(&self, resource: T) {
        drop(resource);
    }
}

/// Internal pool state, guarded by one narrow mutex
struct PoolState<T> {
    idle: VecDeque<T>,
    created: usize,
    closed: bool,
    total_acquires: u64,
    total_releases: u64,
    acquire_timeouts: u64,
    acquire_errors: u64,
    destroyed: u64,
}

impl<T> PoolState<T> {
    fn new(capacity: usize) -> Self {
        Self {
            idle: VecDeque::with_capacity(capacity),
            created: 0,
            closed: false,
            total_acquires: 0,
            total_releases: 0,
            acquire_timeouts: 0,
            acquire_errors: 0,
            destroyed: 0,
        }
    }
}

struct PoolInner<T: Send + 'static> {
    config: PoolConfig,
    factory: Arc<dyn ResourceFactory<T>>,
    state: Mutex<PoolState<T>>,
    semaphore: Arc<Semaphore>,
    available: Notify,
    created_at: Instant,
}

impl<T: Send + 'static> PoolInner<T> {
    fn destroy_now(&self, resource: T) {
        self.factory.destroy(resource);
    }

    /// Take a resource back from a caller
    fn return_resource(&self, mut resource: T) {
        self.factory.reset(&mut resource);

        let mut state = self.state.lock();
        state.total_releases += 1;

        if state.closed {
            state.created -= 1;
            state.destroyed += 1;
            drop(state);
            debug!("Pool closed, destroying released resource");
            self.destroy_now(resource);
            return;
        }

        if state.idle.len() >= self.config.capacity {
            // Accounting says this cannot happen; never leak the handle if it does
            state.created -= 1;
            state.destroyed += 1;
            drop(state);
            warn!("Idle queue full on release, destroying resource instead of requeueing");
            self.destroy_now(resource);
            return;
        }

        state.idle.push_back(resource);
        drop(state);
        self.available.notify_waiters();
    }

    /// Destroy a checked-out resource and free its slot
    fn discard_resource(&self, resource: T) {
        {
            let mut state = self.state.lock();
            state.total_releases += 1;
            state.created -= 1;
            state.destroyed += 1;
        }
        self.destroy_now(resource);
    }
}

impl<T: Send + 'static> Drop for PoolInner<T> {
    fn drop(&mut self) {
        // Guards hold the inner Arc, so only idle resources can remain here
        let state = self.state.get_mut();
        if state.idle.is_empty() {
            return;
        }
        debug!(destroyed = state.idle.len(), "Resource pool dropped without close");
        let drained: Vec<T> = state.idle.drain(..).collect();
        state.created -= drained.len();
        state.destroyed += drained.len() as u64;
        for resource in drained {
            self.factory.destroy(resource);
        }
    }
}

/// Releases a reserved creation slot if resource creation never completes
/// (factory error or the acquiring future being dropped mid-create).
struct CreationSlot<'a, T: Send + 'static> {
    inner: &'a PoolInner<T>,
    armed: bool,
}

impl<T: Send + 'static> CreationSlot<'_, T> {
    fn defuse(mut self) {
        self.armed = false;
    }
}

impl<T: Send + 'static> Drop for CreationSlot<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.state.lock();
            state.created -= 1;
            state.acquire_errors += 1;
        }
    }
}

/// A checked-out resource.
///
/// Dereferences to the resource. Returning it to the pool happens on drop,
/// so early returns and `?` never leak capacity.
pub struct PooledResource<T: Send + 'static> {
    resource: Option<T>,
    pool: Arc<PoolInner<T>>,
    acquired_at: Instant,
    // Dropped after `Drop::drop` has requeued the resource, so a woken
    // waiter always finds it in the idle queue.
    _permit: OwnedSemaphorePermit,
}

impl<T: Send + 'static> PooledResource<T> {
    /// Return the resource to the pool
    pub fn release(self) {
        drop(self);
    }

    /// Destroy the resource instead of requeueing it; its slot becomes free
    /// for a fresh resource on the next acquire.
    pub fn discard(mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.discard_resource(resource);
        }
    }

    /// How long this resource has been checked out
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl<T: Send + 'static> Deref for PooledResource<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `release`/`discard`/`drop` take the resource, and they consume the guard
        self.resource.as_ref().expect("pooled resource accessed after release")
    }
}

impl<T: Send + 'static> DerefMut for PooledResource<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("pooled resource accessed after release")
    }
}

impl<T: Send + 'static> Drop for PooledResource<T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.return_resource(resource);
        }
    }
}

impl<T: Send + std::fmt::Debug + 'static> std::fmt::Debug for PooledResource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledResource")
            .field("resource", &self.resource)
            .field("held_for", &self.held_for())
            .finish()
    }
}

/// A bounded pool of reusable resources
///
/// # Example
/// ```no_run
/// use hearth_core_resilience::{CallContext, PoolConfig, ResilienceError, ResourceFactory, ResourcePool};
/// use std::sync::Arc;
///
/// struct InferenceContext { id: usize }
/// struct ContextFactory;
///
/// #[async_trait::async_trait]
/// impl ResourceFactory<InferenceContext> for ContextFactory {
///     async fn create(&self) -> Result<InferenceContext, ResilienceError> {
///         Ok(InferenceContext { id: 1 })
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ResourcePool::new(PoolConfig::lazy(2), Arc::new(ContextFactory)).await?;
///
/// let ctx = pool.acquire(&CallContext::background()).await?;
/// // Use ctx...
/// ctx.release();
///
/// pool.close();
/// # Ok(())
/// # }
/// ```
pub struct ResourcePool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> ResourcePool<T> {
    /// Create a new pool, eagerly creating `config.prewarm` resources.
    ///
    /// Construction is all-or-nothing: if any prewarm creation fails, the
    /// resources created so far are destroyed and the error is returned.
    pub async fn new(
        config: PoolConfig,
        factory: Arc<dyn ResourceFactory<T>>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;

        let mut config = config;
        config.prewarm = config.prewarm.min(config.capacity);

        let mut warm = Vec::with_capacity(config.prewarm);
        for i in 0..config.prewarm {
            match factory.create().await {
                Ok(resource) => warm.push(resource),
                Err(e) => {
                    warn!(
                        "Prewarm failed creating resource {} of {}: {}",
                        i + 1,
                        config.prewarm,
                        e
                    );
                    for resource in warm {
                        factory.destroy(resource);
                    }
                    return Err(e);
                }
            }
        }

        let mut state = PoolState::new(config.capacity);
        state.created = warm.len();
        state.idle.extend(warm);

        debug!(
            capacity = config.capacity,
            prewarmed = state.created,
            "Resource pool created"
        );

        let capacity = config.capacity;
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                state: Mutex::new(state),
                semaphore: Arc::new(Semaphore::new(capacity)),
                available: Notify::new(),
                created_at: Instant::now(),
            }),
        })
    }

    /// Acquire a resource.
    ///
    /// Returns an idle resource immediately if one exists; otherwise creates
    /// one if the pool is below capacity; otherwise waits for a release until
    /// the caller's deadline (or the configured acquire timeout when the
    /// caller set none). Factory errors are returned as-is and do not consume
    /// capacity.
    pub async fn acquire(&self, ctx: &CallContext) -> Result<PooledResource<T>, ResilienceError> {
        if ctx.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }
        if ctx.is_expired() {
            self.inner.state.lock().acquire_timeouts += 1;
            return Err(ResilienceError::Timeout(Duration::ZERO));
        }
        if self.is_closed() {
            return Err(ResilienceError::Closed(POOL_NAME));
        }

        let permit = match self.inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(ResilienceError::Closed(POOL_NAME)),
            Err(TryAcquireError::NoPermits) => self.wait_for_permit(ctx).await?,
        };

        self.checkout(permit).await
    }

    /// Acquire without blocking and without creating new resources.
    ///
    /// Returns `Ok(None)` when no idle resource is immediately available.
    pub fn try_acquire(&self) -> Result<Option<PooledResource<T>>, ResilienceError> {
        let permit = match self.inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(ResilienceError::Closed(POOL_NAME)),
            Err(TryAcquireError::NoPermits) => return Ok(None),
        };

        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(ResilienceError::Closed(POOL_NAME));
        }
        match state.idle.pop_front() {
            Some(resource) => {
                state.total_acquires += 1;
                drop(state);
                Ok(Some(self.wrap(resource, permit)))
            }
            None => Ok(None),
        }
    }

    /// Return a resource to the pool. Equivalent to dropping the guard.
    pub fn release(&self, resource: PooledResource<T>) {
        resource.release();
    }

    /// Close the pool.
    ///
    /// Idle resources are destroyed now. Checked-out resources stay valid
    /// and are destroyed when released. Blocked and future acquisitions fail
    /// with [`ResilienceError::Closed`]. Calling this more than once is a no-op.
    pub fn close(&self) {
        let drained: Vec<T> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<T> = state.idle.drain(..).collect();
            state.created -= drained.len();
            state.destroyed += drained.len() as u64;
            drained
        };

        self.inner.semaphore.close();
        self.inner.available.notify_waiters();

        debug!(destroyed = drained.len(), "Resource pool closed");
        for resource in drained {
            self.inner.destroy_now(resource);
        }
    }

    /// Destroy every idle resource so the next acquisitions build fresh ones.
    ///
    /// Returns how many resources were destroyed.
    pub fn recycle_idle(&self) -> usize {
        let drained: Vec<T> = {
            let mut state = self.inner.state.lock();
            let drained: Vec<T> = state.idle.drain(..).collect();
            state.created -= drained.len();
            state.destroyed += drained.len() as u64;
            drained
        };

        let count = drained.len();
        for resource in drained {
            self.inner.destroy_now(resource);
        }
        count
    }

    /// Wait until at least one idle resource exists
    pub async fn wait_for_available(&self, ctx: &CallContext) -> Result<(), ResilienceError> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.state.lock();
                if state.closed {
                    return Err(ResilienceError::Closed(POOL_NAME));
                }
                if !state.idle.is_empty() {
                    return Ok(());
                }
            }

            ctx.run(notified).await?;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get current pool statistics as one consistent snapshot
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            capacity: self.inner.config.capacity,
            available: state.idle.len(),
            in_use: state.created - state.idle.len(),
            created: state.created,
            total_acquires: state.total_acquires,
            total_releases: state.total_releases,
            acquire_timeouts: state.acquire_timeouts,
            acquire_errors: state.acquire_errors,
            destroyed: state.destroyed,
            closed: state.closed,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    async fn wait_for_permit(
        &self,
        ctx: &CallContext,
    ) -> Result<OwnedSemaphorePermit, ResilienceError> {
        let started = Instant::now();
        let deadline = ctx
            .deadline()
            .unwrap_or_else(|| started + self.inner.config.acquire_timeout);

        let wait = self.inner.semaphore.clone().acquire_owned();

        tokio::select! {
            permit = wait => permit.map_err(|_| ResilienceError::Closed(POOL_NAME)),
            _ = ctx.cancellation_token().cancelled() => Err(ResilienceError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                self.inner.state.lock().acquire_timeouts += 1;
                Err(ResilienceError::Timeout(deadline.saturating_duration_since(started)))
            }
        }
    }

    async fn checkout(
        &self,
        permit: OwnedSemaphorePermit,
    ) -> Result<PooledResource<T>, ResilienceError> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(ResilienceError::Closed(POOL_NAME));
            }
            if let Some(resource) = state.idle.pop_front() {
                state.total_acquires += 1;
                drop(state);
                return Ok(self.wrap(resource, permit));
            }
            // Holding a permit with an empty idle queue means created < capacity
            state.created += 1;
        }

        let slot = CreationSlot {
            inner: &self.inner,
            armed: true,
        };
        let resource = self.inner.factory.create().await?;
        slot.defuse();

        let mut state = self.inner.state.lock();
        if state.closed {
            state.created -= 1;
            state.destroyed += 1;
            drop(state);
            self.inner.destroy_now(resource);
            return Err(ResilienceError::Closed(POOL_NAME));
        }
        state.total_acquires += 1;
        drop(state);

        debug!("Created new pooled resource");
        Ok(self.wrap(resource, permit))
    }

    fn wrap(&self, resource: T, permit: OwnedSemaphorePermit) -> PooledResource<T> {
        PooledResource {
            resource: Some(resource),
            pool: self.inner.clone(),
            acquired_at: Instant::now(),
            _permit: permit,
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Maximum number of live resources
    pub capacity: usize,
    /// Resources idle in the pool
    pub available: usize,
    /// Resources checked out (or being created)
    pub in_use: usize,
    /// Live resources (available + in_use)
    pub created: usize,
    pub total_acquires: u64,
    pub total_releases: u64,
    pub acquire_timeouts: u64,
    /// Acquisitions that failed while creating a resource
    pub acquire_errors: u64,
    /// Resources destroyed over the pool's lifetime
    pub destroyed: u64,
    pub closed: bool,
    pub uptime: Duration,
}

impl PoolStats {
    /// Get pool utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            (self.in_use as f64 / self.capacity as f64) * 100.0
        }
    }

    /// Fraction of acquisitions that timed out (0.0 - 1.0)
    pub fn timeout_rate(&self) -> f64 {
        if self.total_acquires == 0 {
            0.0
        } else {
            self.acquire_timeouts as f64 / self.total_acquires as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TestContext {
        id: usize,
        scratch: Vec<u8>,
    }

    #[derive(Default)]
    struct TestFactory {
        counter: AtomicUsize,
        live: AtomicUsize,
        max_live: AtomicUsize,
        fail_on: Option<usize>,
        destroyed: parking_lot::Mutex<HashMap<usize, usize>>,
    }

    #[async_trait::async_trait]
    impl ResourceFactory<TestContext> for TestFactory {
        async fn create(&self) -> Result<TestContext, ResilienceError> {
            let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(id) {
                return Err(ResilienceError::Transient(format!("out of VRAM on {}", id)));
            }
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(TestContext {
                id,
                scratch: Vec::new(),
            })
        }

        fn reset(&self, resource: &mut TestContext) {
            resource.scratch.clear();
        }

        fn destroy(&self, resource: TestContext) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            *self.destroyed.lock().entry(resource.id).or_insert(0) += 1;
        }
    }

    async fn pool_with(factory: Arc<TestFactory>, config: PoolConfig) -> ResourcePool<TestContext> {
        ResourcePool::new(config, factory).await.unwrap()
    }

    #[tokio::test]
    async fn test_zero_capacity_rejected() {
        let result =
            ResourcePool::<TestContext>::new(PoolConfig::lazy(0), Arc::new(TestFactory::default()))
                .await;
        assert!(matches!(result, Err(ResilienceError::Validation(_))));
    }

    #[tokio::test]
    async fn test_pool_acquire_release() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory, PoolConfig::lazy(5)).await;

        let ctx = pool.acquire(&CallContext::background()).await.unwrap();
        assert_eq!(ctx.id, 1);

        let stats = pool.stats();
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.available, 0);

        pool.release(ctx);

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.total_releases, 1);
    }

    #[tokio::test]
    async fn test_pool_reuse_resets_state() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory, PoolConfig::lazy(2)).await;

        let mut ctx = pool.acquire(&CallContext::background()).await.unwrap();
        ctx.scratch.extend_from_slice(b"kv-cache");
        let id = ctx.id;
        drop(ctx);

        let ctx = pool.acquire(&CallContext::background()).await.unwrap();
        assert_eq!(ctx.id, id);
        assert!(ctx.scratch.is_empty());
    }

    #[tokio::test]
    async fn test_prewarm_creates_eagerly() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory.clone(), PoolConfig::eager(3)).await;

        let stats = pool.stats();
        assert_eq!(stats.created, 3);
        assert_eq!(stats.available, 3);
        assert_eq!(factory.live.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_prewarm_failure_is_all_or_nothing() {
        let factory = Arc::new(TestFactory {
            fail_on: Some(3),
            ..Default::default()
        });
        let result = ResourcePool::new(PoolConfig::eager(4), factory.clone()).await;

        assert!(matches!(result, Err(ResilienceError::Transient(_))));
        assert_eq!(factory.live.load(Ordering::SeqCst), 0);
        assert_eq!(factory.destroyed.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_factory_failure_does_not_consume_capacity() {
        let factory = Arc::new(TestFactory {
            fail_on: Some(1),
            ..Default::default()
        });
        let pool = pool_with(factory, PoolConfig::lazy(1)).await;

        let err = pool.acquire(&CallContext::background()).await.unwrap_err();
        assert_eq!(err, ResilienceError::Transient("out of VRAM on 1".to_string()));
        assert_eq!(pool.stats().created, 0);
        assert_eq!(pool.stats().acquire_errors, 1);

        // Capacity is still there for the next caller
        let ctx = pool.acquire(&CallContext::background()).await.unwrap();
        assert_eq!(ctx.id, 2);
    }

    #[tokio::test]
    async fn test_try_acquire_never_creates() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory.clone(), PoolConfig::lazy(2)).await;

        assert!(pool.try_acquire().unwrap().is_none());
        assert_eq!(factory.counter.load(Ordering::SeqCst), 0);

        drop(pool.acquire(&CallContext::background()).await.unwrap());
        let ctx = pool.try_acquire().unwrap();
        assert!(ctx.is_some());
    }

    #[tokio::test]
    async fn test_expired_deadline_times_out_without_blocking() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory, PoolConfig::eager(1)).await;

        let ctx = CallContext::background().with_deadline(Instant::now() - Duration::from_millis(1));
        let started = Instant::now();
        let result = pool.acquire(&ctx).await;

        assert!(matches!(result, Err(ResilienceError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_millis(20));
        assert_eq!(pool.stats().acquire_timeouts, 1);
        assert_eq!(pool.stats().available, 1);
    }

    #[tokio::test]
    async fn test_holder_blocks_second_acquirer_until_deadline() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory, PoolConfig::lazy(1)).await;

        let held = pool.acquire(&CallContext::background()).await.unwrap();

        let waiter = pool.clone();
        let started = Instant::now();
        let result = tokio::spawn(async move {
            let ctx = CallContext::background().with_timeout(Duration::from_millis(50));
            waiter.acquire(&ctx).await.map(|r| r.id)
        })
        .await
        .unwrap();

        let waited = started.elapsed();
        assert!(matches!(result, Err(ResilienceError::Timeout(_))));
        assert!(waited >= Duration::from_millis(45));
        assert!(waited < Duration::from_millis(500));
        assert_eq!(held.id, 1);
        assert_eq!(pool.stats().in_use, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_acquire_timeout_applies() {
        let factory = Arc::new(TestFactory::default());
        let config = PoolConfig {
            capacity: 1,
            prewarm: 0,
            acquire_timeout: Duration::from_millis(100),
        };
        let pool = pool_with(factory, config).await;

        let _held = pool.acquire(&CallContext::background()).await.unwrap();
        let result = pool.acquire(&CallContext::background()).await;
        assert_eq!(
            result.unwrap_err(),
            ResilienceError::Timeout(Duration::from_millis(100))
        );
    }

    #[tokio::test]
    async fn test_waiter_receives_released_resource() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory, PoolConfig::lazy(1)).await;

        let held = pool.acquire(&CallContext::background()).await.unwrap();
        let waiter = pool.clone();
        let handle = tokio::spawn(async move {
            let ctx = CallContext::background().with_timeout(Duration::from_secs(5));
            waiter.acquire(&ctx).await.map(|r| r.id)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release();

        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_gets_nothing() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory, PoolConfig::lazy(1)).await;
        let _held = pool.acquire(&CallContext::background()).await.unwrap();

        let ctx = CallContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = pool.acquire(&ctx).await;
        assert!(matches!(result, Err(ResilienceError::Cancelled)));
        assert_eq!(pool.stats().in_use, 1);
    }

    #[tokio::test]
    async fn test_close_destroys_checked_out_resources_once_on_release() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory.clone(), PoolConfig::eager(4)).await;

        let held: Vec<_> = {
            let mut held = Vec::new();
            for _ in 0..3 {
                held.push(pool.acquire(&CallContext::background()).await.unwrap());
            }
            held
        };

        pool.close();
        pool.close();

        // Only the idle one is gone so far
        assert_eq!(factory.destroyed.lock().len(), 1);
        assert_eq!(pool.stats().created, 3);

        for ctx in held {
            ctx.release();
        }

        let destroyed = factory.destroyed.lock();
        assert_eq!(destroyed.len(), 4);
        assert!(destroyed.values().all(|&count| count == 1));
        assert_eq!(pool.stats().created, 0);
        assert_eq!(factory.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails_immediately() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory, PoolConfig::lazy(1)).await;
        pool.close();

        assert_eq!(
            pool.acquire(&CallContext::background()).await.unwrap_err(),
            ResilienceError::Closed(POOL_NAME)
        );
        assert!(pool.try_acquire().is_err());
    }

    #[tokio::test]
    async fn test_dropping_pool_destroys_idle_resources() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory.clone(), PoolConfig::eager(2)).await;
        let held = pool.acquire(&CallContext::background()).await.unwrap();

        drop(pool);
        // The outstanding guard keeps the pool alive
        assert_eq!(factory.destroyed.lock().len(), 0);

        held.release();
        let destroyed = factory.destroyed.lock();
        assert_eq!(destroyed.len(), 2);
        assert!(destroyed.values().all(|&count| count == 1));
        assert_eq!(factory.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_waiter() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory, PoolConfig::lazy(1)).await;
        let held = pool.acquire(&CallContext::background()).await.unwrap();

        let waiter = pool.clone();
        let handle = tokio::spawn(async move {
            waiter
                .acquire(&CallContext::background().with_timeout(Duration::from_secs(5)))
                .await
                .map(|r| r.id)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close();

        assert!(matches!(
            handle.await.unwrap(),
            Err(ResilienceError::Closed(_))
        ));
        drop(held);
    }

    #[tokio::test]
    async fn test_discard_frees_slot() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory.clone(), PoolConfig::lazy(1)).await;

        let ctx = pool.acquire(&CallContext::background()).await.unwrap();
        ctx.discard();
        assert_eq!(pool.stats().created, 0);

        let ctx = pool.acquire(&CallContext::background()).await.unwrap();
        assert_eq!(ctx.id, 2);
        assert_eq!(factory.destroyed.lock().get(&1), Some(&1));
    }

    #[tokio::test]
    async fn test_recycle_idle() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory.clone(), PoolConfig::eager(3)).await;
        let held = pool.acquire(&CallContext::background()).await.unwrap();

        assert_eq!(pool.recycle_idle(), 2);
        assert_eq!(pool.stats().created, 1);
        drop(held);
        assert_eq!(pool.stats().available, 1);
    }

    #[tokio::test]
    async fn test_wait_for_available() {
        let factory = Arc::new(TestFactory::default());
        let pool = pool_with(factory, PoolConfig::lazy(1)).await;
        let held = pool.acquire(&CallContext::background()).await.unwrap();

        let watcher = pool.clone();
        let handle = tokio::spawn(async move {
            watcher
                .wait_for_available(&CallContext::background().with_timeout(Duration::from_secs(5)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_randomized_schedules_respect_capacity() {
        use rand::Rng;

        for capacity in [1usize, 2, 3, 5] {
            let factory = Arc::new(TestFactory::default());
            let pool = pool_with(factory.clone(), PoolConfig::lazy(capacity)).await;

            let mut handles = Vec::new();
            for _ in 0..24 {
                let pool = pool.clone();
                handles.push(tokio::spawn(async move {
                    for _ in 0..10 {
                        let (hold_us, use_try) = {
                            let mut rng = rand::rng();
                            (rng.random_range(0..400u64), rng.random_bool(0.2))
                        };
                        let resource = if use_try {
                            pool.try_acquire().unwrap()
                        } else {
                            let ctx = CallContext::background().with_timeout(Duration::from_secs(10));
                            Some(pool.acquire(&ctx).await.unwrap())
                        };
                        if let Some(resource) = resource {
                            tokio::time::sleep(Duration::from_micros(hold_us)).await;
                            let stats = pool.stats();
                            assert!(stats.created <= capacity);
                            assert!(stats.in_use >= 1);
                            drop(resource);
                        }
                        tokio::task::yield_now().await;
                    }
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            let stats = pool.stats();
            assert_eq!(stats.available + stats.in_use, stats.created);
            assert!(stats.created <= capacity);
            assert_eq!(stats.in_use, 0);
            assert!(factory.max_live.load(Ordering::SeqCst) <= capacity);
        }
    }
}
