//! V4L2 device discovery over sysfs.
//!
//! Enumeration never opens a device node from this process: topology comes
//! from `/sys/class/video4linux`, and format capabilities are probed with a
//! bounded external `v4l2-ctl` invocation so an active capture is never
//! contended.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::cmd::{COMMAND_DEADLINE, output_with_deadline};
use crate::{CaptureSettings, PixelFormat};

const SYSFS_V4L: &str = "/sys/class/video4linux";

/// What a camera advertises, reduced to the mode one worker will request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub max_width: u32,
    pub max_height: u32,
    pub max_fps: u32,
    pub format: PixelFormat,
}

/// One physical USB camera, immutable after enumeration.
///
/// Identity is the device-node path; two nodes sharing a sysfs USB parent
/// are the same camera and only the lowest-numbered node is retained.
#[derive(Debug, Clone)]
pub struct CameraDevice {
    /// Stable identifier derived from the node basename (`video0`).
    pub id: String,
    /// Device-node path (`/dev/video0`).
    pub path: PathBuf,
    /// Human-readable name from sysfs, or the id when unavailable.
    pub name: String,
    pub capabilities: Capabilities,
}

/// Enumerate USB capture devices, ascending by node number, truncated to
/// `slot_count`.
///
/// Per-device failures are logged and shrink the result; an empty set is a
/// valid outcome (hot-plug may introduce devices later).
pub fn discover_devices(settings: &CaptureSettings, slot_count: usize) -> Vec<CameraDevice> {
    let mut nodes = list_video_nodes();
    nodes.sort_unstable();

    let mut devices: Vec<CameraDevice> = Vec::new();
    let mut parents: Vec<PathBuf> = Vec::new();

    for node in nodes {
        if devices.len() >= slot_count {
            break;
        }
        // Odd-numbered nodes are metadata planes of the preceding capture node.
        if node % 2 != 0 {
            continue;
        }
        let Some(parent) = usb_parent(node) else {
            debug!(node, "skipping node without resolvable physical parent");
            continue;
        };
        if parents.contains(&parent) {
            debug!(node, "skipping secondary node of an already-accepted camera");
            continue;
        }
        if !is_usb_node(node) {
            debug!(node, "skipping non-USB node");
            continue;
        }

        let id = format!("video{node}");
        let path = PathBuf::from(format!("/dev/video{node}"));
        if !path.exists() {
            warn!(%id, "sysfs entry without device node, skipping");
            continue;
        }
        let name = node_name(node).unwrap_or_else(|| id.clone());
        let capabilities = probe_capabilities(&path, settings);
        info!(
            %id, %name,
            "discovered camera: {}x{} @ {} fps ({})",
            capabilities.max_width, capabilities.max_height,
            capabilities.max_fps, capabilities.format,
        );
        parents.push(parent);
        devices.push(CameraDevice {
            id,
            path,
            name,
            capabilities,
        });
    }

    info!("discovery found {} camera(s)", devices.len());
    devices
}

/// Node numbers present under `/sys/class/video4linux`.
fn list_video_nodes() -> Vec<u32> {
    let Ok(entries) = fs::read_dir(SYSFS_V4L) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| video_number(&e.file_name().to_string_lossy()))
        .collect()
}

/// Extract `N` from a `videoN` basename or path.
pub fn video_number(name: &str) -> Option<u32> {
    let base = name.rsplit('/').next()?;
    base.strip_prefix("video")?.parse().ok()
}

/// The sysfs path identifying the physical USB device behind a video node.
///
/// `/sys/class/video4linux/videoN/device` links to the interface; its
/// parent is the USB device shared by every node of the same camera.
pub fn usb_parent(node: u32) -> Option<PathBuf> {
    let link = PathBuf::from(format!("{SYSFS_V4L}/video{node}/device"));
    let resolved = fs::canonicalize(link).ok()?;
    resolved.parent().map(Path::to_path_buf)
}

/// USB parent for a `/dev/videoN` path; `None` when unresolvable.
pub fn usb_parent_of_path(path: &Path) -> Option<PathBuf> {
    usb_parent(video_number(&path.to_string_lossy())?)
}

fn is_usb_node(node: u32) -> bool {
    let modalias = format!("{SYSFS_V4L}/video{node}/device/modalias");
    fs::read_to_string(modalias)
        .map(|s| s.starts_with("usb:"))
        .unwrap_or(false)
}

/// Whether `/dev/videoN` looks like a primary USB capture node: even
/// numbered (odd nodes are metadata planes) with a `usb:` modalias.
pub fn is_primary_usb_node(node: u32) -> bool {
    node % 2 == 0 && is_usb_node(node)
}

fn node_name(node: u32) -> Option<String> {
    let sysfs = format!("{SYSFS_V4L}/video{node}/name");
    fs::read_to_string(sysfs)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Probe the extended format listing; fall back to the configured mode when
/// the probe fails or advertises nothing useful.
fn probe_capabilities(path: &Path, settings: &CaptureSettings) -> Capabilities {
    let fallback = Capabilities {
        max_width: settings.width,
        max_height: settings.height,
        max_fps: settings.fps,
        format: settings.format,
    };

    let path_str = path.to_string_lossy();
    let Some(listing) = output_with_deadline(
        "v4l2-ctl",
        &["-d", &path_str, "--list-formats-ext"],
        COMMAND_DEADLINE,
    ) else {
        debug!(path = %path_str, "format probe failed, using configured mode");
        return fallback;
    };

    let (sizes, probed_fps) = parse_formats_ext(&listing);
    if sizes.is_empty() {
        return fallback;
    }

    let (width, height) = closest_size(&sizes, (settings.width, settings.height));
    if (width, height) != (settings.width, settings.height) {
        info!(
            path = %path_str,
            "camera does not advertise {}x{}, using closest {}x{}",
            settings.width, settings.height, width, height,
        );
    }
    Capabilities {
        max_width: width,
        max_height: height,
        max_fps: probed_fps.unwrap_or(settings.fps).min(settings.fps),
        // MJPEG sizes were advertised, so prefer MJPEG regardless of the
        // configured fallback format.
        format: PixelFormat::Mjpeg,
    }
}

/// Parse `v4l2-ctl --list-formats-ext` output: discrete sizes and the
/// highest frame rate within the MJPEG section.
fn parse_formats_ext(listing: &str) -> (Vec<(u32, u32)>, Option<u32>) {
    static SIZE: OnceLock<Regex> = OnceLock::new();
    static FPS: OnceLock<Regex> = OnceLock::new();
    let size_re = SIZE.get_or_init(|| Regex::new(r"Size: Discrete (\d+)x(\d+)").unwrap());
    let fps_re = FPS.get_or_init(|| Regex::new(r"(\d+)\.\d+ fps").unwrap());

    let mut sizes = Vec::new();
    let mut max_fps: Option<u32> = None;
    let mut in_mjpeg = false;

    for line in listing.lines() {
        let line = line.trim();
        if line.contains("'MJPG'") || line.contains("Motion-JPEG") {
            in_mjpeg = true;
            continue;
        }
        if line.contains("'YUYV'") || line.contains("'H264'") {
            in_mjpeg = false;
            continue;
        }
        if !in_mjpeg {
            continue;
        }
        if let Some(caps) = size_re.captures(line)
            && let (Ok(w), Ok(h)) = (caps[1].parse(), caps[2].parse())
        {
            sizes.push((w, h));
        }
        if let Some(caps) = fps_re.captures(line)
            && let Ok(fps) = caps[1].parse::<u32>()
        {
            max_fps = Some(max_fps.map_or(fps, |m: u32| m.max(fps)));
        }
    }

    (sizes, max_fps)
}

/// Closest advertised size to the target by L1 distance.
fn closest_size(sizes: &[(u32, u32)], target: (u32, u32)) -> (u32, u32) {
    let distance = |(w, h): (u32, u32)| {
        (w as i64 - target.0 as i64).abs() + (h as i64 - target.1 as i64).abs()
    };
    sizes
        .iter()
        .copied()
        .min_by_key(|s| distance(*s))
        .unwrap_or(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
ioctl: VIDIOC_ENUM_FMT
\tType: Video Capture

\t[0]: 'MJPG' (Motion-JPEG, compressed)
\t\tSize: Discrete 1920x1080
\t\t\tInterval: Discrete 0.033s (30.000 fps)
\t\tSize: Discrete 640x480
\t\t\tInterval: Discrete 0.033s (30.000 fps)
\t\t\tInterval: Discrete 0.067s (15.000 fps)
\t\tSize: Discrete 320x240
\t\t\tInterval: Discrete 0.033s (30.000 fps)
\t[1]: 'YUYV' (YUYV 4:2:2)
\t\tSize: Discrete 640x480
\t\t\tInterval: Discrete 0.017s (60.000 fps)
";

    #[test]
    fn parses_sizes_and_fps_from_mjpeg_section_only() {
        let (sizes, fps) = parse_formats_ext(LISTING);
        assert_eq!(sizes, vec![(1920, 1080), (640, 480), (320, 240)]);
        // The 60 fps YUYV interval must not leak into the MJPEG maximum.
        assert_eq!(fps, Some(30));
    }

    #[test]
    fn empty_listing_yields_nothing() {
        let (sizes, fps) = parse_formats_ext("ioctl: VIDIOC_ENUM_FMT\n");
        assert!(sizes.is_empty());
        assert_eq!(fps, None);
    }

    #[test]
    fn closest_size_uses_l1_distance() {
        let sizes = [(1920, 1080), (800, 600), (320, 240)];
        assert_eq!(closest_size(&sizes, (640, 480)), (800, 600));
        assert_eq!(closest_size(&sizes, (1920, 1080)), (1920, 1080));
        assert_eq!(closest_size(&[], (640, 480)), (640, 480));
    }

    #[test]
    fn video_number_parses_paths_and_basenames() {
        assert_eq!(video_number("video0"), Some(0));
        assert_eq!(video_number("/dev/video12"), Some(12));
        assert_eq!(video_number("/dev/media0"), None);
        assert_eq!(video_number("videoX"), None);
    }
}
