//! HTTP/2 flow control
//!
//! This module implements send-side flow control as defined in RFC 7540
//! Section 5.2. A [`WindowControl`] is a signed credit counter shared between
//! the read loop, which grants credit on WINDOW_UPDATE and SETTINGS, and the
//! writers, which spend it on DATA frames. The counter may go negative when
//! the peer shrinks SETTINGS_INITIAL_WINDOW_SIZE below what is already in
//! flight.

use super::error::{Error, Result};
use super::settings::MAX_WINDOW_SIZE;
use parking_lot::{Condvar, Mutex};
use std::time::Instant;

#[derive(Debug)]
struct WindowState {
    size: i64,
    closed: bool,
}

/// Thread-safe flow-control credit
#[derive(Debug)]
pub struct WindowControl {
    state: Mutex<WindowState>,
    cond: Condvar,
}

impl WindowControl {
    pub fn new(initial: u32) -> Self {
        WindowControl {
            state: Mutex::new(WindowState { size: initial as i64, closed: false }),
            cond: Condvar::new(),
        }
    }

    /// Current credit, negative when over-committed
    pub fn size(&self) -> i64 {
        self.state.lock().size
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Add credit from a WINDOW_UPDATE
    ///
    /// Exceeding 2^31-1 is a flow-control error and leaves the window as is.
    pub fn increase(&self, increment: u32) -> Result<i64> {
        let mut state = self.state.lock();
        let size = state.size + increment as i64;
        if size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "window {} + {} exceeds 2^31-1",
                state.size, increment
            )));
        }
        state.size = size;
        if size > 0 {
            self.cond.notify_all();
        }
        Ok(size)
    }

    /// Apply a SETTINGS_INITIAL_WINDOW_SIZE change
    pub fn adjust(&self, delta: i64) -> Result<i64> {
        let mut state = self.state.lock();
        let size = state.size + delta;
        if size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "initial window change of {} overflows window {}",
                delta, state.size
            )));
        }
        state.size = size;
        if size > 0 {
            self.cond.notify_all();
        }
        Ok(size)
    }

    /// Take up to `max` bytes of credit without blocking
    ///
    /// Returns 0 when the window is exhausted or closed.
    pub fn try_consume(&self, max: usize) -> usize {
        let mut state = self.state.lock();
        if state.closed || state.size <= 0 {
            return 0;
        }
        let n = (state.size as u64).min(max as u64) as usize;
        state.size -= n as i64;
        n
    }

    /// Return credit taken but not spent
    pub fn give_back(&self, n: usize) {
        let mut state = self.state.lock();
        state.size += n as i64;
        if state.size > 0 {
            self.cond.notify_all();
        }
    }

    /// Block until the window is positive
    ///
    /// Fails with [`Error::ConnectionClosed`] once the window is closed and
    /// with [`Error::Timeout`] at `deadline`.
    pub fn wait_positive(&self, deadline: Instant) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Error::ConnectionClosed);
            }
            if state.size > 0 {
                return Ok(());
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return if state.closed {
                    Err(Error::ConnectionClosed)
                } else if state.size > 0 {
                    Ok(())
                } else {
                    Err(Error::Timeout)
                };
            }
        }
    }

    /// Wake every waiter and refuse further credit
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }

    /// Reopen with fresh credit, for recycled streams
    pub fn reset(&self, initial: u32) {
        let mut state = self.state.lock();
        state.size = initial as i64;
        state.closed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_consume_and_increase() {
        let window = WindowControl::new(100);
        assert_eq!(window.try_consume(60), 60);
        assert_eq!(window.try_consume(60), 40);
        assert_eq!(window.try_consume(10), 0);

        assert_eq!(window.increase(100).unwrap(), 100);
        assert_eq!(window.size(), 100);
    }

    #[test]
    fn test_increase_overflow_is_rejected() {
        let window = WindowControl::new(MAX_WINDOW_SIZE);
        assert!(matches!(window.increase(1), Err(Error::FlowControl(_))));
        assert_eq!(window.size(), MAX_WINDOW_SIZE as i64);
    }

    #[test]
    fn test_adjust_may_go_negative() {
        let window = WindowControl::new(100);
        window.try_consume(80);
        assert_eq!(window.adjust(-50).unwrap(), -30);
        assert_eq!(window.try_consume(10), 0);
        window.increase(40).unwrap();
        assert_eq!(window.try_consume(100), 10);
    }

    #[test]
    fn test_wait_positive_wakes_on_increase() {
        let window = Arc::new(WindowControl::new(0));
        let w = window.clone();
        let waiter = thread::spawn(move || w.wait_positive(Instant::now() + Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(50));
        window.increase(10).unwrap();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_wait_positive_close_and_timeout() {
        let window = Arc::new(WindowControl::new(0));
        let start = Instant::now();
        assert!(matches!(
            window.wait_positive(start + Duration::from_millis(30)),
            Err(Error::Timeout)
        ));

        let w = window.clone();
        let waiter = thread::spawn(move || w.wait_positive(Instant::now() + Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        window.close();
        assert!(matches!(waiter.join().unwrap(), Err(Error::ConnectionClosed)));
        assert!(start.elapsed() < Duration::from_secs(2));

        window.reset(5);
        assert!(!window.is_closed());
        assert_eq!(window.try_consume(10), 5);
    }

    proptest! {
        #[test]
        fn prop_consumed_never_exceeds_granted(
            initial in 0u32..70_000,
            ops in proptest::collection::vec((any::<bool>(), 0u32..20_000), 0..64),
        ) {
            let window = WindowControl::new(initial);
            let mut granted = initial as i64;
            let mut consumed = 0i64;
            for (grant, amount) in ops {
                if grant {
                    if window.increase(amount).is_ok() {
                        granted += amount as i64;
                    }
                } else {
                    consumed += window.try_consume(amount as usize) as i64;
                }
                prop_assert!(consumed <= granted);
                prop_assert_eq!(window.size(), granted - consumed);
            }
        }
    }
}
