//! Tools for propagating a graceful shutdown signal through the program.
//!
//! Adapted from the teacher's `base::shutdown`, stripped of the
//! `futures`-based waker bookkeeping: every worker in this crate blocks on
//! plain sockets, subprocesses, and file I/O, so the receiver only needs a
//! synchronous check/wait, not a `Future` impl.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

struct Inner {
    /// `false` once shutdown has been requested.
    running: Mutex<bool>,
    condvar: Condvar,
}

pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        *self.0.running.lock() = false;
        self.0.condvar.notify_all();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

impl Receiver {
    /// Returns `Err` if shutdown has been requested.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if *self.0.running.lock() {
            Ok(())
        } else {
            Err(ShutdownError)
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.check().is_err()
    }

    /// Blocks until shutdown is requested or `timeout` elapses, returning
    /// `Ok(())` on timeout and `Err` if shutdown fired first.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let mut l = self.0.running.lock();
        if !*l {
            return Err(ShutdownError);
        }
        let result = self.0.condvar.wait_for(&mut l, timeout);
        if result.timed_out() {
            Ok(())
        } else {
            Err(ShutdownError)
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
///
/// Dropping the sender requests shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        running: Mutex::new(true),
        condvar: Condvar::new(),
    });
    (Sender(inner.clone()), Receiver(inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_check() {
        let (tx, rx) = channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
        assert!(rx.is_shutdown());
    }

    #[test]
    fn blocking() {
        let (tx, rx) = channel();
        rx.wait_for(Duration::from_secs(0)).unwrap();
        let rx2 = rx.clone();
        let h = std::thread::spawn(move || rx2.wait_for(Duration::from_secs(1000)).unwrap_err());

        // Make it likely rx2 has started waiting on the condvar.
        std::thread::sleep(Duration::from_millis(10));

        drop(tx);
        h.join().unwrap();
    }
}
