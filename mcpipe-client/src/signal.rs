//! # Wake and Shutdown Signals
//!
//! Purpose: Let producers, fill callbacks and reconnect timers rouse the driver
//! thread, and let the cluster stop everything with one flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Manual-reset event shared by the driver and everything that feeds it.
///
/// The driver resets the signal before each pass and waits on it when the
/// pass found no I/O to do; anything set in between is not lost.
#[derive(Debug, Default)]
pub struct WakeSignal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Blocks until the signal is set or `timeout` elapses.
    ///
    /// Returns true if the signal was set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut set = self.set.lock();
        if !*set {
            self.cond.wait_for(&mut set, timeout);
        }
        *set
    }
}

/// One-way cancellation flag with timed waits.
#[derive(Debug, Default)]
pub struct ShutdownToken {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let _guard = self.lock.lock();
        self.cancelled.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Sleeps for `timeout` unless cancelled first. Returns true when cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.lock.lock();
        if self.is_cancelled() {
            return true;
        }
        self.cond.wait_for(&mut guard, timeout);
        self.is_cancelled()
    }
}
