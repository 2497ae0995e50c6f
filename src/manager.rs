//! Caller-supplied resource lifecycle logic.

use std::sync::Arc;

use tracing::error;

use crate::{context::Context, error::PoolError};

/// Manager responsible for constructing, validating and destroying pooled resources.
///
/// The pool never holds its internal lock while calling any of these methods, so they are free
/// to block for as long as needed. Different pool operations may call them concurrently.
#[async_trait::async_trait]
pub trait Manager: Send + Sync + 'static {
    /// Type of resources managed by this manager.
    type Resource: Send + Sync + 'static;
    /// Error that can be returned from construction or validation.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Construct a new resource.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the resource could not be constructed. The error is returned to the
    /// borrower, or reported via [`Manager::report`] if construction happened during
    /// maintenance.
    async fn construct(&self, cx: &Context) -> Result<Self::Resource, Self::Error>;

    /// Destroy a resource.
    ///
    /// Called at most once per resource. A resource reclaimed after its borrow timeout may
    /// still be referenced by an abandoned [`Lease`](crate::Lease).
    async fn destruct(&self, cx: &Context, resource: Arc<Self::Resource>);

    /// Check whether an idle resource may still be used.
    ///
    /// Only called for idle resources being borrowed, never for freshly constructed ones.
    ///
    /// # Errors
    ///
    /// Returns `Err` if validity could not be determined. Borrowing stops with this error.
    async fn validate(
        &self,
        _cx: &Context,
        _resource: &Self::Resource,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// Report an error that happened in background maintenance.
    fn report(&self, _cx: &Context, err: &PoolError<Self::Error>, description: &str) {
        error!(%err, "{description}");
    }
}
