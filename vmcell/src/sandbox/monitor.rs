//! VMM exit monitoring.
//!
//! Watchers get a channel that emits exactly one error when the VMM dies
//! underneath a running sandbox; a deliberate `stop()` never fires it.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use vmcell_shared::Error;

#[derive(Default)]
pub(crate) struct SandboxMonitor {
    watchers: Mutex<Vec<mpsc::Sender<Error>>>,
    fired: AtomicBool,
    /// Set before a deliberate stop so the exit is not reported as a
    /// failure.
    expecting_exit: AtomicBool,
}

impl SandboxMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_watcher(&self) -> mpsc::Receiver<Error> {
        let (tx, rx) = mpsc::channel(1);
        self.watchers.lock().push(tx);
        rx
    }

    pub fn expect_exit(&self) {
        self.expecting_exit.store(true, Ordering::SeqCst);
    }

    pub fn exit_expected(&self) -> bool {
        self.expecting_exit.load(Ordering::SeqCst)
    }

    /// Deliver `status` to every watcher, once.
    pub fn fire(&self, status: i32) {
        self.fire_with(|| {
            Error::GuestPanic(format!("vmm exited unexpectedly with status {}", status))
        });
    }

    /// Deliver an arbitrary fatal error to every watcher, once.
    pub fn fire_with(&self, make_error: impl Fn() -> Error) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let watchers = std::mem::take(&mut *self.watchers.lock());
        for watcher in watchers {
            let _ = watcher.try_send(make_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fires_exactly_once() {
        let monitor = SandboxMonitor::new();
        let mut rx1 = monitor.new_watcher();
        let mut rx2 = monitor.new_watcher();

        monitor.fire(137);
        monitor.fire(1);

        assert!(matches!(rx1.recv().await, Some(Error::GuestPanic(_))));
        assert!(matches!(rx2.recv().await, Some(Error::GuestPanic(_))));
        // Channel closed after the single event.
        assert!(rx1.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_expected_exit_flag() {
        let monitor = SandboxMonitor::new();
        assert!(!monitor.exit_expected());
        monitor.expect_exit();
        assert!(monitor.exit_expected());
    }
}
