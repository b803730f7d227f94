//! Cancellation tokens.
//!
//! A [`CancelToken`] is a cloneable, thread-safe "stop" signal with an
//! optional deadline. Waiters park on a flume channel whose only sender is
//! dropped on cancellation, which wakes every waiter at once.

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Inner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
    deadline: Option<Instant>,
}

/// Cloneable cancellation signal.
///
/// # Example
///
/// ```rust
/// use rivet_core::cancel::CancelToken;
///
/// let token = CancelToken::new();
/// let observer = token.clone();
/// assert!(!observer.is_cancelled());
///
/// token.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create a token that fires only when [`cancel`](Self::cancel) is called.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a token that also fires once `timeout` has elapsed.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Some(Instant::now() + timeout))
    }

    /// Create a token that also fires at `deadline`.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline))
    }

    fn build(deadline: Option<Instant>) -> Self {
        let (trigger, signal) = flume::bounded(1);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
                deadline,
            }),
        }
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        // Dropping the only sender disconnects the channel and wakes everyone.
        drop(self.inner.trigger.lock().take());
    }

    /// Returns true once the token was cancelled or its deadline passed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
            || self.inner.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The deadline, if this token has one.
    #[inline]
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Wait until the token fires.
    pub async fn cancelled(&self) {
        use futures::{select, FutureExt};

        if self.is_cancelled() {
            return;
        }

        let signal = self.inner.signal.recv_async();
        match self.inner.deadline {
            None => {
                let _ = signal.await;
            }
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                select! {
                    _ = signal.fuse() => {}
                    _ = compio::time::sleep(wait).fuse() => {}
                }
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}
