//! Bounded-wait mutual exclusion.

use std::{sync::Arc, time::Duration};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Exclusive hold on a [`TryMutex`], released on drop.
///
/// Tying release to ownership of the guard means the lock is released on
/// every exit path, including panics, and a release without a prior
/// acquisition cannot be expressed.
pub type TryMutexGuard = OwnedMutexGuard<()>;

/// A mutex supporting bounded-wait acquisition.
///
/// Acquisition succeeds immediately when uncontended, otherwise waits up to
/// the given timeout. A zero timeout degenerates to a non-blocking attempt.
/// Waiting suspends the task rather than blocking the thread. Fairness under
/// contention is not guaranteed. Not re-entrant: a holder that acquires again
/// waits on itself.
#[derive(Debug, Clone, Default)]
pub struct TryMutex {
    inner: Arc<Mutex<()>>,
}

impl TryMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to acquire the mutex within `timeout`.
    /// Returns `None` when the mutex is still contended once the timeout
    /// elapses.
    pub async fn try_lock(&self, timeout: Duration) -> Option<TryMutexGuard> {
        if timeout.is_zero() {
            self.inner.clone().try_lock_owned().ok()
        } else {
            tokio::time::timeout(timeout, self.inner.clone().lock_owned())
                .await
                .ok()
        }
    }
}
