#![doc = include_str!("../README.md")]

mod cmd;
pub mod device;
pub mod evict;
pub mod manager;
pub mod mjpeg;
pub mod pattern;
pub mod worker;

use std::fmt;

/// Pixel formats negotiated with the decoder child.
///
/// # Example
/// ```rust
/// use camgrid_capture::PixelFormat;
///
/// assert_eq!(PixelFormat::Mjpeg.as_decoder_input(), "mjpeg");
/// assert_eq!(PixelFormat::Mjpeg.fallback(), PixelFormat::Yuyv);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// Motion-JPEG; preferred because decode cost stays off the camera bus.
    #[default]
    Mjpeg,
    /// Packed YUV 4:2:2.
    Yuyv,
}

impl PixelFormat {
    /// The `-input_format` value understood by the decoder child.
    pub fn as_decoder_input(self) -> &'static str {
        match self {
            PixelFormat::Mjpeg => "mjpeg",
            PixelFormat::Yuyv => "yuyv422",
        }
    }

    /// The format tried when this one fails to stream.
    pub fn fallback(self) -> PixelFormat {
        match self {
            PixelFormat::Mjpeg => PixelFormat::Yuyv,
            PixelFormat::Yuyv => PixelFormat::Mjpeg,
        }
    }

    /// Parse a configuration value; `None` for anything unrecognised.
    pub fn parse(value: &str) -> Option<PixelFormat> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mjpeg" => Some(PixelFormat::Mjpeg),
            "yuyv" => Some(PixelFormat::Yuyv),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Mjpeg => f.write_str("mjpeg"),
            PixelFormat::Yuyv => f.write_str("yuyv"),
        }
    }
}

/// Capture geometry and rate shared by every worker of one manager.
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    /// Requested frame width.
    pub width: u32,
    /// Requested frame height.
    pub height: u32,
    /// Rate requested from the decoder and ceiling for admitted frames.
    pub fps: u32,
    /// Preferred pixel format.
    pub format: PixelFormat,
    /// Floor for `set_fps`, combined with the built-in minimum of 5.
    pub min_fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 25,
            format: PixelFormat::Mjpeg,
            min_fps: 5,
        }
    }
}

/// Errors from capture workers.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// `start` was called on a worker that is already running.
    #[error("capture worker already running")]
    AlreadyRunning,
    /// `start` was called while a previous stop had not been acknowledged.
    #[error("capture worker has not exited yet")]
    NotExited,
    /// The driving thread could not be spawned.
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub mod prelude {
    pub use crate::device::{CameraDevice, Capabilities, discover_devices};
    pub use crate::evict::kill_device_holders;
    pub use crate::manager::{Manager, ManagerError};
    pub use crate::worker::{CaptureWorker, WorkerStats};
    pub use crate::{CaptureError, CaptureSettings, PixelFormat};
    pub use camgrid_core::prelude::*;
}
