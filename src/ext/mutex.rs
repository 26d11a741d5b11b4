//! Poison-tolerant locking.
use std::sync::{Mutex, MutexGuard};

pub trait MutexExt<T> {
    /// Locks the mutex. A panic in another worker does not poison the data for us.
    fn lock_blocking(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_blocking(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
