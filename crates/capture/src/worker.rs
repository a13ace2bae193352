//! Per-camera capture worker.
//!
//! A worker owns one device, one latest-frame surface, and at most one
//! decoder child at a time. The driving thread spawns `ffmpeg` against the
//! device, frames its MJPEG stdout, decimates by time against the target
//! FPS, decodes, and publishes. When no decoder argument set streams, the
//! worker degrades to synthetic test patterns and keeps retrying the real
//! camera.
//!
//! FPS changes never restart the decoder: the child runs at the camera's
//! capture rate and the worker skips decoding frames that arrive faster
//! than the target interval.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use camgrid_core::{frame::Frame, now_nanos, surface::FrameSurface};
use image::ImageFormat;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::{CameraDevice, video_number};
use crate::mjpeg::{FramingError, MjpegFramer};
use crate::pattern::test_pattern;
use crate::{CaptureError, CaptureSettings, PixelFormat};

const DECODER_BIN: &str = "ffmpeg";
const STOP_ACK_DEADLINE: Duration = Duration::from_secs(2);
const RETRY_PAUSE: Duration = Duration::from_millis(500);
const PATTERN_RETRY_INTERVAL: Duration = Duration::from_secs(10);
const PATTERN_RETRY_LOG_INTERVAL: Duration = Duration::from_secs(30);
const LOG_EVERY_FRAMES: u64 = 150;
const FPS_FLOOR: u32 = 5;

// Worker lifecycle phases.
const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const EXITED: u8 = 3;

/// Counters observed from any thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStats {
    /// Frames decoded and published.
    pub frames: u64,
    /// Frames dropped by time-based decimation before decode.
    pub skipped: u64,
    /// Framing timeouts and decode failures.
    pub errors: u64,
    /// Timestamp of the last published frame (nanoseconds since epoch).
    pub last_frame_nanos: u64,
}

/// Capture worker for one camera.
///
/// Cloneable handle; all clones drive the same underlying state.
#[derive(Clone)]
pub struct CaptureWorker {
    inner: Arc<Inner>,
}

struct Inner {
    device: CameraDevice,
    surface: Arc<FrameSurface>,

    // Capture mode fixed for the worker's lifetime.
    capture_width: u32,
    capture_height: u32,
    capture_fps: u32,
    format: PixelFormat,
    min_fps: u32,

    running: AtomicBool,
    phase: AtomicU8,
    target_fps: AtomicU32,

    frames: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
    last_frame_nanos: AtomicU64,

    child: Mutex<Option<Child>>,
    ack_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl CaptureWorker {
    /// Build a worker around a device and its surface.
    ///
    /// Capture geometry comes from the device capabilities, falling back to
    /// the shared settings where the probe reported nothing.
    pub fn new(
        device: CameraDevice,
        surface: Arc<FrameSurface>,
        settings: CaptureSettings,
    ) -> Self {
        let caps = device.capabilities;
        let width = if caps.max_width > 0 { caps.max_width } else { settings.width };
        let height = if caps.max_height > 0 { caps.max_height } else { settings.height };
        let fps = if caps.max_fps > 0 { caps.max_fps } else { settings.fps };

        info!(
            camera = %device.id,
            "capture mode {}x{} @ {} fps ({})",
            width, height, fps, caps.format,
        );

        Self {
            inner: Arc::new(Inner {
                format: caps.format,
                device,
                surface,
                capture_width: width,
                capture_height: height,
                capture_fps: fps,
                min_fps: settings.min_fps,
                running: AtomicBool::new(false),
                phase: AtomicU8::new(IDLE),
                target_fps: AtomicU32::new(fps),
                frames: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                last_frame_nanos: AtomicU64::new(0),
                child: Mutex::new(None),
                ack_rx: Mutex::new(None),
            }),
        }
    }

    /// Spawn the driving thread. Fails unless the worker is `Idle` or
    /// `Exited`.
    pub fn start(&self) -> Result<(), CaptureError> {
        let inner = &self.inner;
        let claimed = inner
            .phase
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .or_else(|_| {
                inner
                    .phase
                    .compare_exchange(EXITED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            });
        if claimed.is_err() {
            return match inner.phase.load(Ordering::Acquire) {
                STOPPING => Err(CaptureError::NotExited),
                _ => Err(CaptureError::AlreadyRunning),
            };
        }

        inner.running.store(true, Ordering::Release);
        let (ack_tx, ack_rx) = mpsc::channel();
        *inner.ack_rx.lock() = Some(ack_rx);

        let inner = Arc::clone(inner);
        let spawned = thread::Builder::new()
            .name(format!("capture-{}", inner.device.id))
            .spawn(move || {
                drive(&inner);
                inner.phase.store(EXITED, Ordering::Release);
                let _ = ack_tx.send(());
            });
        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                self.inner.phase.store(EXITED, Ordering::Release);
                Err(CaptureError::Spawn(e))
            }
        }
    }

    /// Stop the worker: signal the driving thread, kill the decoder child
    /// to unblock any read, and wait up to two seconds for the exit
    /// acknowledgement. Idempotent.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner
            .phase
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        inner.running.store(false, Ordering::Release);

        if let Some(child) = inner.child.lock().as_mut() {
            let _ = child.kill();
        }

        let ack = inner.ack_rx.lock().take();
        match ack.map(|rx| rx.recv_timeout(STOP_ACK_DEADLINE)) {
            Some(Ok(())) | Some(Err(mpsc::RecvTimeoutError::Disconnected)) | None => {
                debug!(camera = %inner.device.id, "capture worker stopped");
            }
            Some(Err(mpsc::RecvTimeoutError::Timeout)) => {
                warn!(camera = %inner.device.id, "capture worker did not acknowledge stop in time");
            }
        }
    }

    /// Stop, wait for `Exited`, reset counters, start again.
    pub fn restart(&self) -> Result<(), CaptureError> {
        self.stop();

        let deadline = Instant::now() + STOP_ACK_DEADLINE;
        loop {
            match self.inner.phase.load(Ordering::Acquire) {
                IDLE | EXITED => break,
                _ if Instant::now() >= deadline => return Err(CaptureError::NotExited),
                _ => thread::sleep(Duration::from_millis(10)),
            }
        }

        self.inner.frames.store(0, Ordering::Relaxed);
        self.inner.skipped.store(0, Ordering::Relaxed);
        self.inner.errors.store(0, Ordering::Relaxed);
        self.start()
    }

    /// Update the target FPS, clamped to
    /// `[max(5, min_fps), capture_fps]`. Applied by decimation; the decoder
    /// child is never restarted for this.
    pub fn set_fps(&self, fps: u32) {
        let lo = FPS_FLOOR.max(self.inner.min_fps);
        let clamped = fps.clamp(lo, self.inner.capture_fps.max(lo));
        let old = self.inner.target_fps.swap(clamped, Ordering::AcqRel);
        if old != clamped {
            info!(
                camera = %self.inner.device.id,
                "target fps {old} -> {clamped} (frame skipping, no restart)",
            );
        }
    }

    /// Current target FPS.
    pub fn fps(&self) -> u32 {
        self.inner.target_fps.load(Ordering::Acquire)
    }

    /// The camera's capture rate, the ceiling for `set_fps`.
    pub fn max_fps(&self) -> u32 {
        self.inner.capture_fps
    }

    /// Capture resolution fixed at construction.
    pub fn resolution(&self) -> (u32, u32) {
        (self.inner.capture_width, self.inner.capture_height)
    }

    /// Snapshot of the worker counters.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            frames: self.inner.frames.load(Ordering::Relaxed),
            skipped: self.inner.skipped.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
            last_frame_nanos: self.inner.last_frame_nanos.load(Ordering::Relaxed),
        }
    }

    /// The device this worker drives.
    pub fn device(&self) -> &CameraDevice {
        &self.inner.device
    }

    /// Whether the driving thread is (supposed to be) alive.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }
}

/// Kills and reaps the decoder child on every exit path, panics included.
struct ChildGuard<'a> {
    slot: &'a Mutex<Option<Child>>,
}

impl Drop for ChildGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut child) = self.slot.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Outer driving loop: real capture with test-pattern fallback, retrying
/// until stopped.
fn drive(inner: &Inner) {
    loop {
        if !inner.running.load(Ordering::Acquire) {
            break;
        }

        let streamed = try_real_capture(inner);

        if !streamed && inner.running.load(Ordering::Acquire) {
            info!(camera = %inner.device.id, "real capture failed, entering recovery mode");
            run_test_pattern(inner);
        }

        if inner.running.load(Ordering::Acquire) {
            // Avoid a tight loop when the stream keeps ending immediately.
            thread::sleep(RETRY_PAUSE);
        }
    }
}

/// One pass over the ordered decoder argument sets. Returns `true` only if
/// a stream ran until the stop signal; a spawn failure or an early stream
/// end falls through to the next set.
fn try_real_capture(inner: &Inner) -> bool {
    for args in decoder_arg_sets(inner) {
        if run_decoder(inner, &args) {
            return true;
        }
        if !inner.running.load(Ordering::Acquire) {
            return true;
        }
    }
    false
}

/// Ordered argument sets: configured format, the other format, then
/// auto-detect.
fn decoder_arg_sets(inner: &Inner) -> Vec<Vec<String>> {
    let formats = [Some(inner.format), Some(inner.format.fallback()), None];
    formats
        .iter()
        .map(|fmt| decoder_args(inner, *fmt))
        .collect()
}

fn decoder_args(inner: &Inner, input_format: Option<PixelFormat>) -> Vec<String> {
    let mut args: Vec<String> = [
        "-thread_queue_size", "512",
        "-probesize", "32",
        "-analyzeduration", "0",
        "-f", "v4l2",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    if let Some(fmt) = input_format {
        args.push("-input_format".into());
        args.push(fmt.as_decoder_input().into());
    }
    args.push("-video_size".into());
    args.push(format!("{}x{}", inner.capture_width, inner.capture_height));
    args.push("-framerate".into());
    args.push(inner.capture_fps.to_string());
    args.push("-i".into());
    args.push(inner.device.path.to_string_lossy().into_owned());
    args.extend(
        ["-f", "image2pipe", "-vcodec", "mjpeg", "-q:v", "5", "-"]
            .iter()
            .map(|s| s.to_string()),
    );
    args
}

/// Per-frame framing deadline: generous at low rates, never under 150 ms.
fn frame_deadline(target_fps: u32) -> Duration {
    let per_frame = Duration::from_secs_f64(3.0 / f64::from(target_fps.max(1)))
        + Duration::from_millis(50);
    per_frame.max(Duration::from_millis(150))
}

/// Spawn one decoder child and run the framing loop over its stdout.
/// Returns `true` only when the loop exited because of the stop signal.
fn run_decoder(inner: &Inner, args: &[String]) -> bool {
    debug!(camera = %inner.device.id, ?args, "trying decoder");

    let mut child = match Command::new(DECODER_BIN)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(camera = %inner.device.id, "failed to spawn decoder: {e}");
            return false;
        }
    };

    let Some(mut stdout) = child.stdout.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return false;
    };
    let pid = child.id();
    *inner.child.lock() = Some(child);
    let _guard = ChildGuard { slot: &inner.child };

    info!(
        camera = %inner.device.id, pid,
        "decoder started: {}x{} @ {} fps",
        inner.capture_width, inner.capture_height, inner.capture_fps,
    );

    let mut framer = MjpegFramer::new();
    let mut last_admit = Instant::now();

    loop {
        if !inner.running.load(Ordering::Acquire) {
            return true;
        }

        let target = inner.target_fps.load(Ordering::Acquire).max(1);
        match framer.next_frame(&mut stdout, frame_deadline(target)) {
            Ok(jpeg) => {
                // Time-based decimation: the camera may ignore the
                // requested rate, so the wall clock decides admission.
                let min_interval = Duration::from_secs_f64(1.0 / f64::from(target));
                if last_admit.elapsed() < min_interval {
                    inner.skipped.fetch_add(1, Ordering::Relaxed);
                    inner.surface.mark_dropped();
                    continue;
                }
                last_admit = Instant::now();

                match image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg) {
                    Ok(img) => publish(inner, Frame::new(img), target),
                    Err(_) => {
                        inner.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(err) if err.is_stream_end() => {
                if inner.running.load(Ordering::Acquire) {
                    info!(camera = %inner.device.id, "decoder stream ended");
                }
                return !inner.running.load(Ordering::Acquire);
            }
            Err(FramingError::Read(_)) => {
                if !inner.running.load(Ordering::Acquire) {
                    return true;
                }
                inner.errors.fetch_add(1, Ordering::Relaxed);
                framer.clear();
            }
            Err(err) => {
                // SOI/EOI timeout: drop the partial buffer, keep reading.
                debug!(camera = %inner.device.id, "framing: {err}");
                inner.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Publish a decoded frame and update counters.
fn publish(inner: &Inner, frame: Frame, target_fps: u32) {
    let (w, h) = (frame.width(), frame.height());
    inner.surface.publish(Arc::new(frame));
    inner.last_frame_nanos.store(now_nanos(), Ordering::Relaxed);
    let count = inner.frames.fetch_add(1, Ordering::Relaxed) + 1;

    if count % LOG_EVERY_FRAMES == 1 {
        info!(
            camera = %inner.device.id,
            "frame #{count} ({w}x{h}) @ {target_fps} fps (skipped: {})",
            inner.skipped.load(Ordering::Relaxed),
        );
    }
}

/// Publish synthetic frames at the target rate, retrying the real camera
/// every ten seconds. Returns when the real camera streams again or the
/// worker stops.
fn run_test_pattern(inner: &Inner) {
    info!(camera = %inner.device.id, "test pattern mode (camera unavailable)");

    let camera_number = video_number(&inner.device.id).unwrap_or(0);
    let mut last_retry = Instant::now();
    let mut last_retry_log: Option<Instant> = None;
    let mut retries = 0u32;

    while inner.running.load(Ordering::Acquire) {
        if last_retry.elapsed() >= PATTERN_RETRY_INTERVAL {
            last_retry = Instant::now();
            retries += 1;
            if last_retry_log.is_none_or(|t| t.elapsed() > PATTERN_RETRY_LOG_INTERVAL) {
                info!(camera = %inner.device.id, "retry #{retries}: attempting real capture");
                last_retry_log = Some(Instant::now());
            }
            if try_real_capture(inner) {
                info!(
                    camera = %inner.device.id,
                    "reconnected to real camera after {retries} retries",
                );
                return;
            }
        }

        let target = inner.target_fps.load(Ordering::Acquire).max(1);
        let frame = test_pattern(
            camera_number,
            inner.frames.load(Ordering::Relaxed),
            inner.capture_width,
            inner.capture_height,
        );
        publish(inner, frame, target);

        thread::sleep(Duration::from_secs_f64(1.0 / f64::from(target)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Capabilities;
    use std::path::PathBuf;

    fn device(id: &str, caps: Capabilities) -> CameraDevice {
        CameraDevice {
            id: id.to_string(),
            path: PathBuf::from(format!("/dev/{id}")),
            name: id.to_string(),
            capabilities: caps,
        }
    }

    fn worker_with(fps: u32, min_fps: u32) -> CaptureWorker {
        CaptureWorker::new(
            device(
                "video0",
                Capabilities {
                    max_width: 640,
                    max_height: 480,
                    max_fps: fps,
                    format: PixelFormat::Mjpeg,
                },
            ),
            Arc::new(FrameSurface::new()),
            CaptureSettings {
                min_fps,
                ..CaptureSettings::default()
            },
        )
    }

    #[test]
    fn capabilities_override_settings_and_zero_falls_back() {
        let settings = CaptureSettings::default();
        let w = CaptureWorker::new(
            device(
                "video0",
                Capabilities {
                    max_width: 0,
                    max_height: 0,
                    max_fps: 30,
                    format: PixelFormat::Mjpeg,
                },
            ),
            Arc::new(FrameSurface::new()),
            settings,
        );
        assert_eq!(w.resolution(), (settings.width, settings.height));
        assert_eq!(w.max_fps(), 30);
        assert_eq!(w.fps(), 30);
    }

    #[test]
    fn set_fps_clamps_to_worker_range() {
        let w = worker_with(30, 10);
        w.set_fps(100);
        assert_eq!(w.fps(), 30);
        w.set_fps(1);
        assert_eq!(w.fps(), 10);
        w.set_fps(15);
        assert_eq!(w.fps(), 15);
        // Setting the same value twice is observationally the same.
        w.set_fps(15);
        assert_eq!(w.fps(), 15);
    }

    #[test]
    fn fps_floor_is_at_least_five() {
        let w = worker_with(30, 1);
        w.set_fps(1);
        assert_eq!(w.fps(), 5);
    }

    #[test]
    fn decoder_arg_sets_try_configured_then_fallback_then_auto() {
        let w = worker_with(15, 5);
        let sets = decoder_arg_sets(&w.inner);
        assert_eq!(sets.len(), 3);
        assert!(sets[0].windows(2).any(|p| p == ["-input_format", "mjpeg"]));
        assert!(sets[1].windows(2).any(|p| p == ["-input_format", "yuyv422"]));
        assert!(!sets[2].iter().any(|a| a == "-input_format"));
        for set in &sets {
            assert!(set.windows(2).any(|p| p == ["-video_size", "640x480"]));
            assert!(set.windows(2).any(|p| p == ["-framerate", "15"]));
            assert!(set.windows(2).any(|p| p == ["-i", "/dev/video0"]));
            assert_eq!(set.last().map(String::as_str), Some("-"));
        }
    }

    #[test]
    fn frame_deadline_has_a_floor_and_scales_down() {
        assert_eq!(frame_deadline(30), Duration::from_millis(150));
        // At 5 fps: 3/5 s + 50 ms = 650 ms.
        assert_eq!(frame_deadline(5), Duration::from_millis(650));
        assert!(frame_deadline(0) >= Duration::from_millis(150));
    }

    #[test]
    fn stop_without_start_is_a_noop() {
        let w = worker_with(15, 5);
        w.stop();
        w.stop();
        assert!(!w.is_running());
    }

    #[test]
    fn start_twice_fails_then_stop_allows_restart() {
        let w = worker_with(15, 5);
        w.start().expect("first start");
        assert!(matches!(w.start(), Err(CaptureError::AlreadyRunning)));
        w.stop();
        // stop() waits for the exit acknowledgement, so the worker is
        // restartable immediately afterwards.
        w.restart().expect("restart after stop");
        w.stop();
    }

    #[test]
    fn stop_resets_nothing_but_restart_resets_counters() {
        let w = worker_with(15, 5);
        w.inner.frames.store(42, Ordering::Relaxed);
        w.inner.errors.store(7, Ordering::Relaxed);
        w.restart().expect("restart");
        assert_eq!(w.stats().frames, 0);
        assert_eq!(w.stats().errors, 0);
        w.stop();
    }
}
