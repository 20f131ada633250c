use std::sync::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};
use std::time::Duration;

use tracing::warn;

/// Acquires a mutex, recovering from poison if a thread panicked while
/// holding it.
///
/// Recovery keeps the endpoint operating, but a poisoned lock means another
/// thread panicked mid-update and should be investigated.
pub(crate) fn lock_or_recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!("mutex poisoned, recovering; a thread panicked while holding this lock");
        poisoned.into_inner()
    })
}

/// `Condvar::wait_timeout` with the same poison recovery as
/// [`lock_or_recover`].
pub(crate) fn wait_timeout_or_recover<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
    cond.wait_timeout(guard, timeout)
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
