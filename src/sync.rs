//! Poison-recovering lock acquisition.
//!
//! A panicking request handler must not wedge the supervisor or the log
//! buffer for the rest of the process lifetime, so all shared state in this
//! crate goes through these helpers instead of unwrapping lock results.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::error;

/// Acquires a read lock, recovering from poison if a thread panicked while
/// holding it. The data may be inconsistent after recovery; the error log is
/// the signal to investigate.
pub fn read_or_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        error!("RwLock poisoned (read); a thread panicked while holding this lock, recovering");
        poisoned.into_inner()
    })
}

/// Acquires a write lock, recovering from poison if a thread panicked while
/// holding it.
pub fn write_or_recover<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        error!("RwLock poisoned (write); a thread panicked while holding this lock, recovering");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_after_panic_while_locked() {
        let lock = std::sync::Arc::new(RwLock::new(1));
        let lock2 = std::sync::Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = lock2.write().unwrap();
            panic!("poison it");
        })
        .join();

        assert!(lock.read().is_err());
        assert_eq!(*read_or_recover(&lock), 1);
        *write_or_recover(&lock) = 2;
        assert_eq!(*read_or_recover(&lock), 2);
    }
}
