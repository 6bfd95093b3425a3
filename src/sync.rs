//! Lock helpers shared by every subsystem.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Acquire `mutex`, recovering the guard if a previous holder panicked.
/// Guarded subsystem state is plain data and stays valid across a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
