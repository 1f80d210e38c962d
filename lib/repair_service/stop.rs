use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Cooperative stop flag shared by the control surface and the repair loop.
///
/// Requesting a stop never interrupts an outstanding repair; the loop observes the flag at its
/// next fragment boundary. Sleeps between passes wake immediately.
#[derive(Debug, Default)]
pub struct StopSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_stop_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `duration` unless a stop arrives first. Returns `true` when stopped.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stopped() => true,
            _ = tokio::time::sleep(duration) => self.is_stop_requested(),
        }
    }
}
