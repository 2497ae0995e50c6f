//! Handle for a borrowed resource.

use std::{
    fmt,
    ops::Deref,
    sync::{Arc, Weak},
};

use tokio::time::Instant;

use crate::{
    manager::Manager,
    pool::{PoolInner, ResourceId},
};

/// Borrowed resource.
///
/// Dereferences to the resource itself. The resource is returned to its pool when the lease is
/// released or dropped.
#[must_use]
pub struct Lease<M: Manager> {
    /// Identity of the resource within its pool.
    id: ResourceId,
    /// Borrowed resource.
    resource: Arc<M::Resource>,
    /// Originating pool.
    pool: Weak<PoolInner<M>>,
    /// Time when the resource was borrowed.
    borrowed_at: Instant,
}

impl<M: Manager> Lease<M> {
    pub(crate) fn new(
        pool: &Arc<PoolInner<M>>,
        id: ResourceId,
        resource: Arc<M::Resource>,
        borrowed_at: Instant,
    ) -> Self {
        Self {
            id,
            resource,
            pool: Arc::downgrade(pool),
            borrowed_at,
        }
    }

    /// Identity of the borrowed resource.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Time when the resource was borrowed.
    #[must_use]
    pub fn borrowed_at(&self) -> Instant {
        self.borrowed_at
    }

    /// Shared handle to the borrowed resource.
    #[must_use]
    pub fn resource(&self) -> &Arc<M::Resource> {
        &self.resource
    }

    /// Return the resource to the pool.
    ///
    /// The resource is not validated at this point.
    pub fn release(self) {
        drop(self);
    }

    /// Take the resource out of the pool.
    ///
    /// The pool stops tracking the resource, and will neither reclaim nor destroy it.
    #[must_use]
    pub fn detach(mut self) -> Arc<M::Resource> {
        if let Some(pool) = std::mem::take(&mut self.pool).upgrade() {
            pool.forget(self.id);
        }
        self.resource.clone()
    }
}

impl<M: Manager> Deref for Lease<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl<M: Manager> AsRef<M::Resource> for Lease<M> {
    fn as_ref(&self) -> &M::Resource {
        &self.resource
    }
}

impl<M: Manager> Drop for Lease<M> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.id, self.borrowed_at);
        }
    }
}

impl<M> fmt::Debug for Lease<M>
where
    M: Manager,
    M::Resource: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("resource", &self.resource)
            .finish()
    }
}
