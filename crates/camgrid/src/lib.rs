#![doc = include_str!("../README.md")]

pub mod config;
pub mod perf;
pub mod restart;
pub mod supervisor;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// One-shot shutdown signal shared by every periodic loop.
///
/// Triggering twice is harmless; only the first call flips the flag, so a
/// signal handler and a normal exit path can both request shutdown.
#[derive(Debug, Default)]
pub struct Shutdown {
    triggered: AtomicBool,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request shutdown. Returns `true` only for the first caller.
    pub fn trigger(&self) -> bool {
        !self.triggered.swap(true, Ordering::AcqRel)
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Sleep up to `duration`, waking early on shutdown. Returns `false`
    /// when shutdown was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(100);
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.is_triggered() {
                return false;
            }
            std::thread::sleep(SLICE.min(deadline.saturating_duration_since(Instant::now())));
        }
        !self.is_triggered()
    }
}

pub mod prelude {
    pub use crate::Shutdown;
    pub use crate::config::Config;
    pub use crate::perf::{ControllerState, PerfController, SystemMonitor};
    pub use crate::supervisor::Supervisor;
    pub use camgrid_capture::prelude::*;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_triggers_exactly_once() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn sleep_returns_early_once_triggered() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let started = Instant::now();
        assert!(!shutdown.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
