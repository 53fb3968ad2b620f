//! Clock interface and implementations for testability.
//!
//! Adapted from the teacher's `base::clock`: a `Clocks` trait lets workers
//! (the server's cut-boundary ticker, the client's record timer, retry
//! backoff loops) sleep against a real or simulated clock so tests don't
//! need to burn wall time.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::warn;

/// Abstract interface to the system clock, for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Sleeps the current thread for the given duration (or, for a
    /// simulated clock, advances time without blocking).
    fn sleep(&self, how_long: Duration);
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks;

impl Clocks for RealClocks {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, how_long: Duration) {
        std::thread::sleep(how_long);
    }
}

/// Logs a warning if the guarded section takes longer than a second,
/// mirroring the teacher's `TimerGuard`.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: SystemTime,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.now(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        if let Ok(elapsed) = self.clocks.now().duration_since(self.start) {
            if elapsed >= Duration::from_secs(1) {
                let label_f = self.label_f.take().unwrap();
                warn!("{} took {:?}!", label_f().as_ref(), elapsed);
            }
        }
    }
}

/// Simulated clock for unit tests: `sleep` advances a counter rather than
/// blocking the thread.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<Mutex<SystemTime>>);

impl SimulatedClocks {
    pub fn new(start: SystemTime) -> Self {
        SimulatedClocks(Arc::new(Mutex::new(start)))
    }
}

impl Clocks for SimulatedClocks {
    fn now(&self) -> SystemTime {
        *self.0.lock().unwrap()
    }

    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.lock().unwrap();
        *l += how_long;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances_on_sleep() {
        let start = SystemTime::UNIX_EPOCH;
        let clocks = SimulatedClocks::new(start);
        clocks.sleep(Duration::from_secs(5));
        assert_eq!(
            clocks.now().duration_since(start).unwrap(),
            Duration::from_secs(5)
        );
    }
}
