//! System monitoring and adaptive FPS control.

mod controller;
mod monitor;

pub use controller::{ControllerState, PerfController};
pub use monitor::SystemMonitor;
