//! Blocking signals shared between connection threads

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// One-shot broadcast: fired once, observed by any number of waiters
#[derive(Debug, Default)]
pub struct CloseSignal {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl CloseSignal {
    pub fn new() -> Self {
        CloseSignal::default()
    }

    /// Wake every current and future waiter; repeated calls are no-ops
    pub fn fire(&self) {
        let mut fired = self.fired.lock();
        if !*fired {
            *fired = true;
            self.cond.notify_all();
        }
    }

    pub fn is_fired(&self) -> bool {
        *self.fired.lock()
    }

    /// Wait until fired; returns whether the signal fired in time
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut fired = self.fired.lock();
        while !*fired {
            if self.cond.wait_until(&mut fired, deadline).timed_out() {
                break;
            }
        }
        *fired
    }
}

/// Counts in-flight work so a shutdown can drain it
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: Mutex<usize>,
    cond: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        WaitGroup::default()
    }

    pub fn add(&self) {
        *self.count.lock() += 1;
    }

    pub fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    pub fn pending(&self) -> usize {
        *self.count.lock()
    }

    /// Wait for the count to reach zero; returns whether it did in time
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        *count == 0
    }
}
