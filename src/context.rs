//! Cancellable operation context.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Reason for an interrupted operation.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum Interrupted {
    /// Context token was cancelled.
    #[error("context cancelled")]
    Cancelled,
    /// Context deadline has passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellable handle passed to every blocking pool operation and to every [`Manager`] call.
///
/// Contexts are cheap to clone. Clones share the same cancellation token.
///
/// [`Manager`]: crate::Manager
#[derive(Clone, Debug, Default)]
pub struct Context {
    /// Cancellation token.
    token: CancellationToken,
    /// Optional point in time after which the context is considered done.
    deadline: Option<Instant>,
}

impl From<CancellationToken> for Context {
    fn from(token: CancellationToken) -> Self {
        Self::from_token(token)
    }
}

impl Context {
    /// Create new context which is never cancelled on its own.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create new context bound to an existing cancellation token.
    #[must_use]
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Set a deadline for this context.
    ///
    /// If the context already has an earlier deadline, it is kept.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// Set a deadline for this context relative to current time.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Create derived context.
    ///
    /// Cancelling the derived context doesn't affect the parent, while cancelling the parent also
    /// cancels all derived contexts.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Get underlying cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Get context deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and all contexts derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check whether context is done, without waiting.
    ///
    /// Cancellation takes precedence over an expired deadline.
    #[must_use]
    pub fn err(&self) -> Option<Interrupted> {
        if self.token.is_cancelled() {
            Some(Interrupted::Cancelled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(Interrupted::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Shortcut for `self.err().is_some()`.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Wait until the context is either cancelled, or its deadline passes.
    pub async fn done(&self) -> Interrupted {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => Interrupted::Cancelled,
                _ = sleep_until(deadline) => Interrupted::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Interrupted::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_fires() {
        let cx = Context::new().with_timeout(Duration::from_millis(500));
        assert_eq!(cx.err(), None);
        let started = Instant::now();
        assert_eq!(cx.done().await, Interrupted::DeadlineExceeded);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(cx.is_done());
    }

    #[tokio::test]
    async fn cancel_wins_over_deadline() {
        let cx = Context::new().with_timeout(Duration::from_secs(60));
        cx.cancel();
        assert_eq!(cx.done().await, Interrupted::Cancelled);
        assert_eq!(cx.err(), Some(Interrupted::Cancelled));
    }

    #[test]
    fn earlier_deadline_is_kept() {
        let now = Instant::now();
        let cx = Context::new()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(10));
        assert_eq!(cx.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn child_is_cancelled_by_parent() {
        let parent = Context::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_done());
        let child = parent.child();
        parent.cancel();
        assert!(child.is_done());
    }
}
