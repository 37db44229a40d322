// SPDX-License-Identifier: Apache-2.0

//! A mutex that logs a warning when acquisition takes too long.
//!
//! Long waits almost always mean another thread holds the lock across an
//! expensive computation. The warning names the lock so the hold site can be
//! found; the operation itself never fails.

use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

/// A [`parking_lot::Mutex`] wrapper whose lock operation reports slow
/// acquisitions.
#[derive(Debug, Default)]
pub struct TimedMutex<T> {
    inner: Mutex<T>,
}

impl<T> TimedMutex<T> {
    /// Wraps `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquires the lock, warning as `name` when the wait exceeds
    /// `warn_after`.
    pub fn lock_warn_long(&self, warn_after: Duration, name: &str) -> MutexGuard<'_, T> {
        if let Some(guard) = self.inner.try_lock() {
            return guard;
        }
        let start = Instant::now();
        let guard = self.inner.lock();
        let waited = start.elapsed();
        if waited > warn_after {
            warn!(lock = name, waited_ms = waited.as_millis() as u64, "slow mutex acquisition");
        }
        guard
    }

    /// Acquires the lock without timing.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}
