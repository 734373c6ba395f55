//! Pause control shared between a worker and a run loop.
//!
//! The flag is an atomic the run loop reads once per iteration, so a
//! pause takes effect after at most one unit of work. The "pausing" phase
//! between `pause()` and the loop observing the flag is not recorded.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct PauseSignal {
    paused: AtomicBool,
    changed: Notify,
}

impl PauseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        self.changed.notify_one();
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.changed.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Completes on the next `pause` or `resume`. A permit left by an
    /// earlier change may complete it early; callers re-check the flag.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}
