//! Bounded resource pool.

use std::{
    collections::HashMap,
    fmt, mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::{
    config::PoolConfig,
    context::Context,
    error::PoolError,
    gate::Gate,
    lease::Lease,
    manager::Manager,
    metrics::{pool_kv, Metrics, PoolState, POOL_METRICS},
};

/// Result type used by pool operations.
pub type PoolResult<T, M> = Result<T, PoolError<<M as Manager>::Error>>;

/// Identity of a pooled resource.
///
/// Unique within a single pool.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tracked resource along with the time it entered its current set.
struct Slot<R> {
    resource: Arc<R>,
    since: Instant,
}

/// State protected by the pool lock.
struct PoolSets<R> {
    /// Resources available for borrowing.
    idle: HashMap<ResourceId, Slot<R>>,
    /// Resources currently on loan.
    borrowed: HashMap<ResourceId, Slot<R>>,
    /// Capacity reserved by constructions and validations in flight.
    pending: usize,
    /// Part of `pending` that will end up in the idle set.
    pending_idle: usize,
    /// Set once, when the governing context is done.
    closed: bool,
}

impl<R> Default for PoolSets<R> {
    fn default() -> Self {
        Self {
            idle: HashMap::new(),
            borrowed: HashMap::new(),
            pending: 0,
            pending_idle: 0,
            closed: false,
        }
    }
}

impl<R> PoolSets<R> {
    fn total(&self) -> usize {
        self.idle.len() + self.borrowed.len() + self.pending
    }

    /// Remove every entry older than `timeout` from `set`.
    fn expire(
        set: &mut HashMap<ResourceId, Slot<R>>,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(ResourceId, Arc<R>)> {
        let expired: Vec<ResourceId> = set
            .iter()
            .filter(|(_, slot)| now.duration_since(slot.since) > timeout)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| set.remove(&id).map(|slot| (id, slot.resource)))
            .collect()
    }
}

/// Shared pool internals.
pub(crate) struct PoolInner<M: Manager> {
    /// Resource lifecycle callbacks.
    manager: M,
    /// Normalized pool configuration.
    config: PoolConfig,
    /// Idle and borrowed sets.
    state: Mutex<PoolSets<M::Resource>>,
    /// Woken whenever a resource or some capacity might have become available.
    gate: Gate,
    /// Governing context. The pool closes once it is done.
    governor: Context,
    /// Cancelled after closing has finished.
    shutdown: CancellationToken,
    /// Source of resource identities.
    next_id: AtomicU64,
    /// Premade label used to record metrics.
    label: [KeyValue; 1],
    /// Linked metrics storage.
    metrics: Arc<Metrics>,
}

impl<M: Manager> PoolInner<M> {
    fn name(&self) -> &str {
        self.config.display_name()
    }

    fn next_id(&self) -> ResourceId {
        ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn state(&self) -> PoolState {
        let state = self.state.lock();
        PoolState {
            max_size: self.config.max_size,
            size: state.idle.len() + state.borrowed.len(),
            idle: state.idle.len(),
            in_use: state.borrowed.len(),
            pending: state.pending,
            min_idle: self.config.min_idle,
            closed: state.closed,
        }
    }

    fn record_state(&self) {
        self.metrics.record_state(&self.label, &self.state());
    }

    /// Reserve one unit of capacity, optionally taking an idle candidate along with it.
    ///
    /// Must be called with the pool lock held.
    fn reserve(
        self: &Arc<Self>,
        state: &mut PoolSets<M::Resource>,
        candidate: Option<(ResourceId, Slot<M::Resource>)>,
    ) -> Reservation<M> {
        state.pending += 1;
        Reservation {
            pool: self.clone(),
            candidate,
            idle_bound: false,
            active: true,
        }
    }

    /// Reserve one unit of capacity for a resource that goes straight to the idle set.
    fn reserve_idle(self: &Arc<Self>, state: &mut PoolSets<M::Resource>) -> Reservation<M> {
        state.pending_idle += 1;
        let mut reservation = self.reserve(state, None);
        reservation.idle_bound = true;
        reservation
    }

    /// Core of the borrow operation.
    ///
    /// Every wake-up restarts from the idle scan, so that a returned resource is reused right
    /// away instead of only re-checking total capacity.
    async fn acquire(self: &Arc<Self>, cx: &Context, wait: bool) -> PoolResult<Lease<M>, M> {
        enum Step<M: Manager> {
            Validate(ResourceId, Arc<M::Resource>, Reservation<M>),
            Construct(Reservation<M>),
            Wait,
        }

        loop {
            let step = {
                let mut state = self.state.lock();
                if state.closed {
                    drop(state);
                    // Pass the signal on, in case this borrower consumed the closing broadcast.
                    self.gate.broadcast();
                    return Err(PoolError::Closed);
                }
                let first = state.idle.keys().next().copied();
                let candidate = first.and_then(|id| state.idle.remove(&id).map(|slot| (id, slot)));
                match candidate {
                    Some((id, slot)) => {
                        let resource = slot.resource.clone();
                        let reservation = self.reserve(&mut state, Some((id, slot)));
                        Step::Validate(id, resource, reservation)
                    }
                    None if state.total() < self.config.max_size => {
                        Step::Construct(self.reserve(&mut state, None))
                    }
                    None => Step::Wait,
                }
            };
            match step {
                Step::Validate(id, resource, reservation) => {
                    match self.manager.validate(cx, &resource).await {
                        Ok(true) => {
                            trace!(pool = self.name(), resource = %id, "lending idle resource");
                            return self.finish_lend(cx, reservation, id, resource).await;
                        }
                        Ok(false) => {
                            debug!(
                                pool = self.name(),
                                resource = %id,
                                "discarding invalid resource"
                            );
                            drop(resource);
                            if let Some(resource) = reservation.discard() {
                                self.manager.destruct(cx, resource).await;
                            }
                        }
                        // Dropping the reservation puts the candidate back as it was.
                        Err(err) => return Err(PoolError::Validate(err)),
                    }
                }
                Step::Construct(reservation) => match self.manager.construct(cx).await {
                    Ok(resource) => {
                        let id = self.next_id();
                        debug!(pool = self.name(), resource = %id, "constructed resource");
                        return self
                            .finish_lend(cx, reservation, id, Arc::new(resource))
                            .await;
                    }
                    Err(err) => return Err(PoolError::Construct(err)),
                },
                Step::Wait if !wait => return Err(PoolError::Exhausted),
                Step::Wait => {
                    trace!(pool = self.name(), "pool is saturated, waiting");
                    self.gate.wait(cx).await?;
                }
            }
        }
    }

    async fn finish_lend(
        self: &Arc<Self>,
        cx: &Context,
        reservation: Reservation<M>,
        id: ResourceId,
        resource: Arc<M::Resource>,
    ) -> PoolResult<Lease<M>, M> {
        match reservation.lend(id, resource) {
            Ok(lease) => Ok(lease),
            Err(resource) => {
                debug!(pool = self.name(), resource = %id, "pool closed while borrowing");
                self.manager.destruct(cx, resource).await;
                Err(PoolError::Closed)
            }
        }
    }

    /// Move a borrowed resource back to the idle set.
    pub(crate) fn release(&self, id: ResourceId, borrowed_at: Instant) {
        self.metrics
            .use_time
            .record(borrowed_at.elapsed().as_secs_f64(), &self.label);
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let Some(slot) = state.borrowed.remove(&id) else {
            trace!(pool = self.name(), resource = %id, "returned resource is not tracked");
            return;
        };
        state.idle.insert(
            id,
            Slot {
                resource: slot.resource,
                since: Instant::now(),
            },
        );
        drop(state);
        trace!(pool = self.name(), resource = %id, "resource returned");
        self.gate.broadcast();
    }

    /// Stop tracking a borrowed resource.
    pub(crate) fn forget(&self, id: ResourceId) {
        let mut state = self.state.lock();
        if state.borrowed.remove(&id).is_some() {
            drop(state);
            debug!(pool = self.name(), resource = %id, "resource detached");
            self.gate.broadcast();
        }
    }

    async fn clean_up(self: &Arc<Self>, cx: &Context) -> PoolResult<(), M> {
        let expired = {
            let mut guard = self.state.lock();
            if guard.closed {
                return Ok(());
            }
            let state = &mut *guard;
            let now = Instant::now();
            let mut expired = PoolSets::expire(&mut state.idle, now, self.config.idle_timeout);
            let abandoned =
                PoolSets::expire(&mut state.borrowed, now, self.config.borrow_timeout);
            for (id, _) in &abandoned {
                warn!(
                    pool = self.name(),
                    resource = %id,
                    "reclaiming resource after borrow timeout"
                );
            }
            expired.extend(abandoned);
            expired
        };
        if !expired.is_empty() {
            debug!(pool = self.name(), count = expired.len(), "destroying expired resources");
            for (_, resource) in expired {
                self.manager.destruct(cx, resource).await;
            }
            self.gate.broadcast();
        }
        self.top_up(cx).await
    }

    /// Construct idle resources until there are at least `min_idle` of them.
    ///
    /// Constructions already started by a concurrent top-up count towards `min_idle`.
    async fn top_up(self: &Arc<Self>, cx: &Context) -> PoolResult<(), M> {
        loop {
            let reservation = {
                let mut state = self.state.lock();
                if state.closed
                    || state.idle.len() + state.pending_idle >= self.config.min_idle
                    || state.total() >= self.config.max_size
                {
                    return Ok(());
                }
                self.reserve_idle(&mut state)
            };
            let resource = Arc::new(
                self.manager
                    .construct(cx)
                    .await
                    .map_err(PoolError::Construct)?,
            );
            let id = self.next_id();
            if let Err(resource) = reservation.stock(id, resource) {
                self.manager.destruct(cx, resource).await;
                return Ok(());
            }
            trace!(pool = self.name(), resource = %id, "added idle resource");
        }
    }

    /// Drain and destroy all tracked resources.
    ///
    /// Runs exactly once: as the final act of the maintenance task, or when the initial top-up
    /// fails and the maintenance task was never started.
    async fn close(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            let idle = mem::take(&mut state.idle);
            let borrowed = mem::take(&mut state.borrowed);
            idle.into_values()
                .chain(borrowed.into_values())
                .map(|slot| slot.resource)
                .collect::<Vec<_>>()
        };
        self.gate.broadcast();
        debug!(pool = self.name(), count = drained.len(), "closing pool");
        for resource in drained {
            self.manager.destruct(&self.governor, resource).await;
        }
        self.record_state();
        self.shutdown.cancel();
    }

    /// Periodic maintenance loop.
    async fn maintain(self: Arc<Self>) {
        let period = self.config.maintenance_interval;
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.governor.done() => break,
                _ = timer.tick() => {
                    if let Err(err) = self.clean_up(&self.governor).await {
                        self.manager
                            .report(&self.governor, &err, "failed to clean up the pool");
                    }
                    self.record_state();
                }
            }
        }
        self.close().await;
    }
}

/// Capacity held by an in-flight construction or validation.
///
/// Dropping an unsettled reservation gives the capacity back, and returns an idle candidate to
/// the idle set with its original timestamp.
struct Reservation<M: Manager> {
    pool: Arc<PoolInner<M>>,
    /// Idle resource being validated.
    candidate: Option<(ResourceId, Slot<M::Resource>)>,
    /// Reserved by a top-up rather than a borrower.
    idle_bound: bool,
    active: bool,
}

impl<M: Manager> Reservation<M> {
    /// Lock pool state and give the reserved capacity back.
    fn settle(&mut self) -> parking_lot::MutexGuard<'_, PoolSets<M::Resource>> {
        self.active = false;
        let mut state = self.pool.state.lock();
        state.pending -= 1;
        if self.idle_bound {
            state.pending_idle -= 1;
        }
        state
    }

    /// Register resource as borrowed.
    ///
    /// Returns the resource back if the pool was closed in the meantime.
    fn lend(
        mut self,
        id: ResourceId,
        resource: Arc<M::Resource>,
    ) -> Result<Lease<M>, Arc<M::Resource>> {
        self.candidate = None;
        let max_size = self.pool.config.max_size;
        let mut state = self.settle();
        if state.closed {
            return Err(resource);
        }
        let now = Instant::now();
        state.borrowed.insert(
            id,
            Slot {
                resource: resource.clone(),
                since: now,
            },
        );
        let spare = !state.idle.is_empty() || state.total() < max_size;
        drop(state);
        if spare {
            // Someone else may have consumed the signal meant for another waiter.
            self.pool.gate.broadcast();
        }
        Ok(Lease::new(&self.pool, id, resource, now))
    }

    /// Register resource as idle.
    ///
    /// Returns the resource back if the pool was closed in the meantime.
    fn stock(
        mut self,
        id: ResourceId,
        resource: Arc<M::Resource>,
    ) -> Result<(), Arc<M::Resource>> {
        let mut state = self.settle();
        if state.closed {
            return Err(resource);
        }
        state.idle.insert(
            id,
            Slot {
                resource,
                since: Instant::now(),
            },
        );
        drop(state);
        self.pool.gate.broadcast();
        Ok(())
    }

    /// Give up capacity along with the candidate, which must then be destroyed by the caller.
    fn discard(mut self) -> Option<Arc<M::Resource>> {
        let candidate = self.candidate.take();
        drop(self.settle());
        self.pool.gate.broadcast();
        candidate.map(|(_, slot)| slot.resource)
    }
}

impl<M: Manager> Drop for Reservation<M> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let candidate = self.candidate.take();
        let mut state = self.settle();
        let orphan = match candidate {
            Some((id, slot)) if !state.closed => {
                state.idle.insert(id, slot);
                None
            }
            Some((_, slot)) => Some(slot.resource),
            None => None,
        };
        drop(state);
        self.pool.gate.broadcast();
        if let Some(resource) = orphan {
            let pool = self.pool.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        pool.manager.destruct(&pool.governor, resource).await;
                    });
                }
                Err(_) => warn!(pool = pool.name(), "no runtime to destroy orphaned resource"),
            }
        }
    }
}

/// Bounded pool of expensive-to-construct resources.
///
/// The pool stays alive until its governing [`Context`] is done. At that point all tracked
/// resources are destroyed, and the pool is permanently closed.
pub struct Pool<M: Manager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Manager> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl<M: Manager> Pool<M> {
    /// Create new pool governed by `cx`.
    ///
    /// Constructs `min_idle` resources, then starts the maintenance task.
    ///
    /// # Errors
    ///
    /// Returns `Err` if configuration is invalid or if some initial resource could not be
    /// constructed. In the latter case all resources created so far are destroyed.
    pub async fn new(cx: &Context, manager: M, config: PoolConfig) -> PoolResult<Self, M> {
        let config = config.normalize()?;
        let label = pool_kv(config.display_name());
        let span = debug_span!("pool_maintenance", pool = config.display_name());
        let inner = Arc::new(PoolInner {
            manager,
            config,
            state: Mutex::new(PoolSets::default()),
            gate: Gate::new(),
            governor: cx.child(),
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            label,
            metrics: POOL_METRICS.clone(),
        });
        if let Err(err) = inner.top_up(cx).await {
            inner.governor.cancel();
            inner.close().await;
            return Err(err);
        }
        tokio::spawn(inner.clone().maintain().instrument(span));
        inner.record_state();
        debug!(
            pool = inner.name(),
            max_size = inner.config.max_size,
            min_idle = inner.config.min_idle,
            "pool ready"
        );
        Ok(Self { inner })
    }

    /// Create builder for a new pool.
    pub fn builder(manager: M) -> PoolBuilder<M> {
        PoolBuilder::new(manager)
    }

    /// Borrow a resource, waiting for one to become available if the pool is saturated.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the pool is closed, if `cx` is done while waiting, or if resource
    /// validation or construction fails.
    pub async fn borrow(&self, cx: &Context) -> PoolResult<Lease<M>, M> {
        self.borrow_inner(cx, true).await
    }

    /// Borrow a resource without waiting.
    ///
    /// Construction and validation are still awaited.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Exhausted`] if the pool is saturated, plus all the errors of
    /// [`Pool::borrow`].
    pub async fn try_borrow(&self, cx: &Context) -> PoolResult<Lease<M>, M> {
        self.borrow_inner(cx, false).await
    }

    async fn borrow_inner(&self, cx: &Context, wait: bool) -> PoolResult<Lease<M>, M> {
        let started = Instant::now();
        let span = debug_span!("pool_borrow", pool = self.inner.name());
        let lease = self.inner.acquire(cx, wait).instrument(span).await?;
        self.inner
            .metrics
            .wait_time
            .record(started.elapsed().as_secs_f64(), &self.inner.label);
        Ok(lease)
    }

    /// Return a borrowed resource to the pool.
    ///
    /// Does nothing for `None`, or if the pool is closed. Same as dropping the lease.
    pub fn give_back(&self, lease: impl Into<Option<Lease<M>>>) {
        if let Some(lease) = lease.into() {
            lease.release();
        }
    }

    /// Destroy expired resources and construct missing idle ones.
    ///
    /// This is run periodically by the maintenance task, but can be called manually.
    ///
    /// # Errors
    ///
    /// Returns `Err` if constructing an idle resource failed.
    pub async fn clean_up(&self, cx: &Context) -> PoolResult<(), M> {
        self.inner.clean_up(cx).await
    }

    /// Get snapshot of internal pool counts.
    #[must_use]
    pub fn status(&self) -> PoolState {
        self.inner.state()
    }

    /// Whether the pool was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Wait until the pool is closed and all its resources are destroyed.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Pool name, as used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Resource manager.
    #[must_use]
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }
}

/// Builder for [`Pool`].
#[must_use]
pub struct PoolBuilder<M: Manager> {
    manager: M,
    config: PoolConfig,
}

impl<M: Manager> PoolBuilder<M> {
    /// Alternative method to construct a pool builder.
    pub fn new(manager: M) -> Self {
        Self {
            manager,
            config: PoolConfig::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set pool name.
    pub fn name(mut self, name: impl ToString) -> Self {
        self.config = self.config.with_name(name);
        self
    }

    /// Set maximum pool size.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.config = self.config.with_max_size(max_size);
        self
    }

    /// Set minimum number of idle resources.
    pub fn min_idle(mut self, min_idle: usize) -> Self {
        self.config = self.config.with_min_idle(min_idle);
        self
    }

    /// Set idle resource timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_idle_timeout(timeout);
        self
    }

    /// Set borrowed resource timeout.
    pub fn borrow_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_borrow_timeout(timeout);
        self
    }

    /// Set interval between maintenance runs.
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.with_maintenance_interval(interval);
        self
    }

    /// Build the pool.
    ///
    /// See [`Pool::new`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if configuration is invalid or if some initial resource could not be
    /// constructed.
    pub async fn build(self, cx: &Context) -> PoolResult<Pool<M>, M> {
        Pool::new(cx, self.manager, self.config).await
    }
}
