#![doc = include_str!("../README.md")]

pub mod frame;
pub mod surface;

use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds since the Unix epoch, saturating at `u64::MAX`.
///
/// Frame timestamps use wall-clock nanoseconds so that stale-frame age can
/// be computed across threads without sharing an `Instant` anchor.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

pub mod prelude {
    pub use crate::frame::Frame;
    pub use crate::now_nanos;
    pub use crate::surface::FrameSurface;
}
