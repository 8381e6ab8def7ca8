//! Stop signalling for daemon workers.
//!
//! Every collector and bridge worker suspends in timed waits on a
//! [`StopSignal`] rather than plain sleeps, so a supervisor shutdown
//! unblocks it within one polling interval.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A one-way stop event shared between a worker and its owner.
///
/// Cloning produces another handle to the same signal. Once triggered the
/// signal stays triggered; workers re-check it at the top of every loop.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    /// Creates a fresh, untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers the signal and wakes every waiter.
    pub fn trigger(&self) {
        let mut stopped = self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        self.inner.condvar.notify_all();
    }

    /// Returns `true` once the signal has been triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits up to `timeout` for the signal.
    ///
    /// Returns `true` when the signal was (or became) triggered, `false`
    /// when the timeout elapsed first. This is the worker idiom:
    ///
    /// ```rust
    /// # use std::time::Duration;
    /// # use wslmon_daemon::stop::StopSignal;
    /// # let stop = StopSignal::new();
    /// # stop.trigger();
    /// while !stop.wait_timeout(Duration::from_secs(5)) {
    ///     // one polling cycle
    /// }
    /// ```
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .condvar
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            stopped = guard;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untriggered_times_out() {
        let stop = StopSignal::new();
        let start = Instant::now();
        assert!(!stop.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_trigger_is_sticky() {
        let stop = StopSignal::new();
        stop.trigger();
        assert!(stop.is_triggered());
        assert!(stop.wait_timeout(Duration::from_secs(0)));
        assert!(stop.wait_timeout(Duration::from_secs(1)));
    }

    #[test]
    fn test_trigger_wakes_waiter() {
        let stop = StopSignal::new();
        let waiter = stop.clone();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(10));
        stop.trigger();
        assert!(handle.join().unwrap());
    }
}
