//! Broadcast wait primitive with per-waiter cancellation.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::context::{Context, Interrupted};

/// Mutable part of a [`Gate`].
#[derive(Debug, Default)]
struct GateState {
    /// Token closed by the broadcast of the current generation.
    token: CancellationToken,
    /// Whether the current generation was already broadcast.
    fired: bool,
    /// Number of generations started so far.
    generation: u64,
}

/// Cancellable gate.
///
/// Any number of tasks can wait on a gate until it is opened by [`Gate::broadcast`], or until
/// their own [`Context`] is done. All waiters which captured the same generation are released
/// together.
///
/// A broadcast with no waiters is remembered: the next call to [`Gate::wait`] consumes it,
/// starts a new generation and returns immediately.
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
}

impl Gate {
    /// Create new closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next broadcast.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `cx` was cancelled or its deadline passed before the gate was opened.
    pub async fn wait(&self, cx: &Context) -> Result<(), Interrupted> {
        let token = {
            let mut state = self.state.lock();
            if state.fired {
                state.token = CancellationToken::new();
                state.fired = false;
                state.generation += 1;
                return Ok(());
            }
            state.token.clone()
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => Ok(()),
            err = cx.done() => Err(err),
        }
    }

    /// Release all current waiters.
    ///
    /// Never blocks. Does nothing if the current generation was already broadcast.
    pub fn broadcast(&self) {
        let mut state = self.state.lock();
        if state.fired {
            return;
        }
        state.fired = true;
        state.token.cancel();
    }

    /// Number of generations started so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use tokio::time::{sleep, timeout, Instant};

    use super::*;

    #[tokio::test]
    async fn wait_successful() {
        let gate = Arc::new(Gate::new());
        let opener = gate.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            opener.broadcast();
        });
        gate.wait(&Context::new()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_deadline() {
        let gate = Gate::new();
        let cx = Context::new().with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        assert_eq!(gate.wait(&cx).await, Err(Interrupted::DeadlineExceeded));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn wait_cancelled() {
        let gate = Gate::new();
        let cx = Context::new();
        cx.cancel();
        assert_eq!(gate.wait(&cx).await, Err(Interrupted::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn broadcast_releases_all_waiters() {
        const WAITERS: usize = 16;
        let gate = Arc::new(Gate::new());
        let count = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..WAITERS)
            .map(|_| {
                let gate = gate.clone();
                let count = count.clone();
                tokio::spawn(async move {
                    gate.wait(&Context::new()).await.unwrap();
                    count.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        sleep(Duration::from_millis(100)).await;
        gate.broadcast();
        for task in tasks {
            timeout(Duration::from_secs(5), task)
                .await
                .expect("waiter not released")
                .unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), WAITERS);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_broadcast_is_consumed_once() {
        let gate = Gate::new();
        gate.broadcast();
        // Repeated broadcast of the same generation is a no-op.
        gate.broadcast();
        gate.wait(&Context::new()).await.unwrap();
        assert_eq!(gate.generation(), 1);

        let cx = Context::new().with_timeout(Duration::from_millis(50));
        assert_eq!(gate.wait(&cx).await, Err(Interrupted::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_affect_others() {
        let gate = Arc::new(Gate::new());
        let cancelled = Context::new();
        let first = {
            let gate = gate.clone();
            let cx = cancelled.clone();
            tokio::spawn(async move { gate.wait(&cx).await })
        };
        let second = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait(&Context::new()).await })
        };
        sleep(Duration::from_millis(50)).await;
        cancelled.cancel();
        assert_eq!(first.await.unwrap(), Err(Interrupted::Cancelled));
        assert!(!second.is_finished());
        gate.broadcast();
        assert_eq!(second.await.unwrap(), Ok(()));
    }
}
