//! Health and recovery: hot-plug detection, stale-frame detection, bounded
//! restarts, and the periodic health summary.
//!
//! Three periodic loops share one shutdown signal. Polling never blocks on
//! recovery work: eviction and worker restarts run on spawned threads so
//! the poll cadence holds even while a restart waits out its two-second
//! stop acknowledgement.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camgrid_capture::device::{
    CameraDevice, is_primary_usb_node, usb_parent, usb_parent_of_path,
};
use camgrid_capture::evict::kill_device_holders;
use camgrid_capture::manager::Manager;
use camgrid_core::now_nanos;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::Shutdown;
use crate::config::Config;
use crate::restart::{Admission, RestartAccounting, RestartPolicy};

const STALE_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// A device must stay present this long after a disconnect before a
/// reconnect is acted on.
const RECONNECT_DEBOUNCE: Duration = Duration::from_secs(3);
/// Settling time for a re-plugged device before its worker restarts.
const DEVICE_SETTLE: Duration = Duration::from_millis(1500);
/// Highest /dev/videoN probed when scanning for new cameras.
const NEW_DEVICE_SCAN_MAX: u32 = 10;

/// Classification used by the health summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotHealth {
    /// Connected with a fresh frame.
    Online,
    /// Connected but the frame is missing or too old.
    Stale,
    Disconnected,
}

/// Per-slot recovery state.
struct SlotState {
    /// Whether `adopt_cameras` has seen this slot since the manager's
    /// current generation came up. Until then the slot is invisible to the
    /// pollers: its camera may still be mid-startup.
    adopted: bool,
    connected: bool,
    last_disconnect: Option<Instant>,
    last_failed_restart: Option<Instant>,
    restart: RestartAccounting,
}

impl SlotState {
    fn new() -> Self {
        Self {
            adopted: false,
            connected: false,
            last_disconnect: None,
            last_failed_restart: None,
            restart: RestartAccounting::new(),
        }
    }
}

struct SupervisorInner {
    manager: Arc<Manager>,
    cfg: Config,
    shutdown: Arc<Shutdown>,
    policy: RestartPolicy,
    slots: Mutex<Vec<SlotState>>,
    reinit_in_progress: AtomicBool,
}

/// Watchdog over the camera set.
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(manager: Arc<Manager>, cfg: &Config, shutdown: Arc<Shutdown>) -> Self {
        let slot_count = cfg.slot_count;
        Self {
            inner: Arc::new(SupervisorInner {
                manager,
                cfg: cfg.clone(),
                shutdown,
                policy: RestartPolicy::from_config(cfg),
                slots: Mutex::new((0..slot_count).map(|_| SlotState::new()).collect()),
                reinit_in_progress: AtomicBool::new(false),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Mark every currently-discovered camera as connected and hand the
    /// slots over to the pollers.
    ///
    /// Called once after the manager has been initialized and started.
    /// Until then the pollers ignore every slot: discovered cameras are
    /// visible through `Manager::cameras` before their staggered startup
    /// has finished, and a restart fired into that window would kill a
    /// decoder child that is still coming up.
    pub fn adopt_cameras(&self) {
        let count = self.inner.manager.cameras().len();
        let mut slots = self.inner.slots.lock();
        for (index, slot) in slots.iter_mut().enumerate() {
            slot.adopted = true;
            slot.connected = index < count;
        }
    }

    /// Spawn the hot-plug, stale-frame, and health loops.
    pub fn start(&self) {
        let mut threads = self.threads.lock();
        let shutdown = &self.inner.shutdown;

        let hotplug = Arc::clone(&self.inner);
        let interval = Duration::from_millis(self.inner.cfg.rescan_interval_ms);
        threads.extend(spawn_loop(
            "hotplug-poll",
            interval,
            Arc::clone(shutdown),
            move || hotplug_tick(&hotplug),
        ));

        let stale = Arc::clone(&self.inner);
        threads.extend(spawn_loop(
            "stale-poll",
            STALE_POLL_INTERVAL,
            Arc::clone(shutdown),
            move || stale_tick(&stale),
        ));

        if self.inner.cfg.health_log_interval_sec > 0.0 {
            let health = Arc::clone(&self.inner);
            let interval = Duration::from_secs_f64(self.inner.cfg.health_log_interval_sec);
            threads.extend(spawn_loop(
                "health-log",
                interval,
                Arc::clone(shutdown),
                move || health.health_tick(),
            ));
        }

        info!("supervisor started");
    }

    /// Wait for all loops to exit. Call after triggering shutdown.
    pub fn stop(&self) {
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        debug!("supervisor loops joined");
    }

    /// Connected flag for a slot, as shown to the display.
    pub fn slot_connected(&self, index: usize) -> bool {
        self.inner.slot_connected(index)
    }
}

/// Run `tick` every `interval` until shutdown. A panicking tick is logged
/// and ends the loop without taking the process down.
fn spawn_loop(
    name: &'static str,
    interval: Duration,
    shutdown: Arc<Shutdown>,
    mut tick: impl FnMut() + Send + 'static,
) -> Option<JoinHandle<()>> {
    let result = thread::Builder::new().name(name.into()).spawn(move || {
        debug!("{name} loop running");
        while shutdown.sleep(interval) {
            if catch_unwind(AssertUnwindSafe(&mut tick)).is_err() {
                error!("{name} loop panicked; loop disabled");
                return;
            }
        }
    });
    match result {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("failed to spawn {name} loop: {e}");
            None
        }
    }
}

/// Poll device presence: mark disconnects, debounce reconnects, and scan
/// for brand-new cameras in free slots.
fn hotplug_tick(this: &Arc<SupervisorInner>) {
    let cameras = this.manager.cameras();

    for (index, camera) in cameras.iter().enumerate() {
        if index >= this.cfg.slot_count {
            break;
        }
        let exists = camera.path.exists();

        let (was_connected, eligible_reconnect) = {
            let mut slots = this.slots.lock();
            let Some(slot) = slots.get_mut(index) else {
                break;
            };
            if !slot.adopted {
                // Camera generation still starting up; not ours yet.
                continue;
            }
            let was = slot.connected;
            if was && !exists {
                slot.connected = false;
                slot.last_disconnect = Some(Instant::now());
            }
            let eligible = !was
                && exists
                && slot
                    .last_disconnect
                    .is_none_or(|t| t.elapsed() >= RECONNECT_DEBOUNCE);
            (was, eligible)
        };

        if was_connected && !exists {
            warn!(camera = %camera.id, "camera disconnected");
        } else if !was_connected && exists {
            if eligible_reconnect {
                info!(camera = %camera.id, "camera reconnected, scheduling restart");
                attempt_restart(this, index, DEVICE_SETTLE, "reconnect");
            } else {
                debug!(camera = %camera.id, "reconnect seen, still debouncing");
            }
        }
    }

    scan_for_new_cameras(this, &cameras);
}

/// Probe unused even-numbered nodes for a camera we are not tracking.
fn scan_for_new_cameras(this: &Arc<SupervisorInner>, cameras: &[CameraDevice]) {
    if this.reinit_in_progress.load(Ordering::Acquire) {
        return;
    }
    if !this.any_slot_adopted() {
        // Initial startup has not handed the slots over yet; a reinit now
        // would tear down a manager that is still starting.
        return;
    }

    let connected = {
        let slots = this.slots.lock();
        slots
            .iter()
            .enumerate()
            .filter(|(i, s)| *i < cameras.len() && s.connected)
            .count()
    };
    if connected >= this.cfg.slot_count {
        return;
    }

    let known: Vec<PathBuf> = cameras.iter().map(|c| c.path.clone()).collect();
    let known_parents: Vec<PathBuf> = known
        .iter()
        .filter_map(|p| usb_parent_of_path(p))
        .collect();

    for node in (0..=NEW_DEVICE_SCAN_MAX).step_by(2) {
        let path = PathBuf::from(format!("/dev/video{node}"));
        if known.contains(&path) || !path.exists() {
            continue;
        }
        if !is_primary_usb_node(node) {
            continue;
        }
        let Some(parent) = usb_parent(node) else {
            continue;
        };
        if known_parents.contains(&parent) {
            continue;
        }

        info!(path = %path.display(), "new camera detected");
        handle_new_device(this, path);
        return;
    }
}

/// Tear the manager down and re-discover, serialized by
/// `reinit_in_progress`. The engine replaces the whole worker generation
/// rather than adding one slot.
fn handle_new_device(this: &Arc<SupervisorInner>, path: PathBuf) {
    if this
        .reinit_in_progress
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        debug!("reinit already in progress, ignoring new device");
        return;
    }

    let has_free_slot = {
        let slots = this.slots.lock();
        let cameras = this.manager.cameras().len();
        slots
            .iter()
            .enumerate()
            .any(|(i, s)| i >= cameras || !s.connected)
    };
    if !has_free_slot {
        info!(path = %path.display(), "new camera but no free slot");
        this.reinit_in_progress.store(false, Ordering::Release);
        return;
    }

    let inner = Arc::clone(this);
    let spawned = thread::Builder::new()
        .name("camera-reinit".into())
        .spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| inner.reinitialize()));
            if result.is_err() {
                error!("camera re-initialization panicked");
            }
            inner.reinit_in_progress.store(false, Ordering::Release);
        });
    if spawned.is_err() {
        this.reinit_in_progress.store(false, Ordering::Release);
    }
}

/// Flag connected cameras whose surface has gone quiet and offer them to
/// the restart policy.
fn stale_tick(this: &Arc<SupervisorInner>) {
    let cameras = this.manager.cameras();
    if cameras.is_empty() {
        return;
    }

    let timeout = this.cfg.stale_frame_timeout_sec;
    let now = now_nanos();

    for (index, camera) in cameras.iter().enumerate() {
        if index >= this.cfg.slot_count {
            break;
        }
        let (adopted, connected) = this.slot_flags(index);
        if !adopted || !connected {
            continue;
        }
        let Some(surface) = this.manager.frame_surface(&camera.id) else {
            continue;
        };
        let last = surface.last_frame_nanos();
        if last == 0 {
            // Never produced a frame; still initializing.
            continue;
        }
        let age = now.saturating_sub(last) as f64 / 1e9;
        if age <= timeout {
            continue;
        }

        warn!(camera = %camera.id, "stale frames: nothing for {age:.1}s");
        this.set_connected(index, false);
        attempt_restart(this, index, Duration::ZERO, "stale frames");
    }
}

/// Consult the bounded restart policy and, when admitted, run eviction and
/// the worker restart off the polling thread.
fn attempt_restart(this: &Arc<SupervisorInner>, index: usize, settle: Duration, reason: &'static str) {
    if this.reinit_in_progress.load(Ordering::Acquire) {
        debug!(index, "reinit in progress, skipping restart");
        return;
    }

    let admitted = {
        let mut slots = this.slots.lock();
        let Some(slot) = slots.get_mut(index) else {
            return;
        };
        // A recent failed open gets its own cooldown before the
        // sliding-window accounting even sees the attempt.
        let failed_cooldown = Duration::from_secs_f64(this.cfg.failed_camera_cooldown_sec);
        if slot
            .last_failed_restart
            .is_some_and(|t| t.elapsed() < failed_cooldown)
        {
            debug!(index, "failed-camera cooldown active");
            return;
        }
        match slot.restart.admit(Instant::now(), &this.policy) {
            Admission::Admitted => true,
            Admission::CoolingDown => {
                debug!(index, "restart cooldown active");
                false
            }
            Admission::LimitReached { first_hit } => {
                if first_hit {
                    warn!(
                        index,
                        "restart limit reached ({} in {:.0}s), suppressing for {:.0}s",
                        this.policy.max_per_window,
                        this.policy.window.as_secs_f64(),
                        (this.policy.window * 2).as_secs_f64(),
                    );
                }
                false
            }
        }
    };
    if !admitted {
        return;
    }

    info!(index, "restarting capture worker ({reason})");
    let inner = Arc::clone(this);
    let spawned = thread::Builder::new()
        .name(format!("camera-restart-{index}"))
        .spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| inner.perform_restart(index, settle)));
            if result.is_err() {
                error!(index, "restart task panicked");
            }
        });
    if let Err(e) = spawned {
        warn!(index, "failed to spawn restart task: {e}");
    }
}

impl SupervisorInner {
    fn reinitialize(&self) {
        thread::sleep(DEVICE_SETTLE);
        self.manager.stop();
        thread::sleep(Duration::from_millis(500));

        self.manager.initialize();
        if let Err(e) = self.manager.start() {
            warn!("manager restart after new device failed: {e}");
            return;
        }

        let count = self.manager.cameras().len();
        let mut slots = self.slots.lock();
        for (index, slot) in slots.iter_mut().enumerate() {
            slot.adopted = true;
            slot.connected = index < count;
            slot.last_disconnect = None;
        }
        info!("re-initialized with {count} camera(s)");
    }

    fn perform_restart(&self, index: usize, settle: Duration) {
        if !settle.is_zero() {
            thread::sleep(settle);
        }

        let camera = self.manager.cameras().into_iter().nth(index);
        if let Some(camera) = &camera {
            kill_device_holders(&camera.path, self.cfg.kill_device_holders);
        }

        match self.manager.restart_camera_by_index(index) {
            Ok(()) => {
                // Reset the frame clock so the stale detector does not
                // fire again on the pre-restart timestamp.
                if let Some(camera) = &camera
                    && let Some(surface) = self.manager.frame_surface(&camera.id)
                {
                    surface.touch_last_frame();
                }
                self.set_connected(index, true);
                if let Some(slot) = self.slots.lock().get_mut(index) {
                    slot.last_failed_restart = None;
                }
                info!(index, "capture worker restarted");
            }
            Err(e) => {
                warn!(index, "restart failed: {e}");
                if let Some(slot) = self.slots.lock().get_mut(index) {
                    slot.last_failed_restart = Some(Instant::now());
                }
            }
        }
    }

    /// One summary line: online / stale / disconnected per slot.
    fn health_tick(&self) {
        let cameras = self.manager.cameras();
        let total = self.cfg.slot_count;
        let timeout = self.cfg.stale_frame_timeout_sec;
        let now = now_nanos();

        let mut online = 0usize;
        let mut stale = 0usize;
        let mut disconnected = 0usize;

        for index in 0..total {
            let connected = self.slot_connected(index);
            let last = cameras
                .get(index)
                .and_then(|c| self.manager.frame_surface(&c.id))
                .map(|s| s.last_frame_nanos())
                .unwrap_or(0);

            match classify_slot(connected, last, now, timeout) {
                SlotHealth::Online => online += 1,
                SlotHealth::Stale => {
                    stale += 1;
                    if last > 0 {
                        let age = now.saturating_sub(last) as f64 / 1e9;
                        warn!(index, "camera frame is stale ({age:.1}s old)");
                    }
                }
                SlotHealth::Disconnected => disconnected += 1,
            }
        }

        info!(
            "cameras online={online} stale={stale} disconnected={disconnected} total_slots={total}"
        );
    }

    fn slot_connected(&self, index: usize) -> bool {
        self.slots
            .lock()
            .get(index)
            .map(|s| s.connected)
            .unwrap_or(false)
    }

    /// `(adopted, connected)` for a slot; `(false, false)` out of range.
    fn slot_flags(&self, index: usize) -> (bool, bool) {
        self.slots
            .lock()
            .get(index)
            .map(|s| (s.adopted, s.connected))
            .unwrap_or((false, false))
    }

    fn any_slot_adopted(&self) -> bool {
        self.slots.lock().iter().any(|s| s.adopted)
    }

    fn set_connected(&self, index: usize, connected: bool) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(index) {
            if slot.connected != connected {
                info!(index, connected, "camera status changed");
            }
            slot.connected = connected;
        }
    }
}

/// Health classification for one slot.
pub(crate) fn classify_slot(
    connected: bool,
    last_frame_nanos: u64,
    now_nanos: u64,
    stale_timeout_sec: f64,
) -> SlotHealth {
    if !connected {
        return SlotHealth::Disconnected;
    }
    if last_frame_nanos == 0 {
        // Connected but never produced a frame.
        return SlotHealth::Stale;
    }
    let age = now_nanos.saturating_sub(last_frame_nanos) as f64 / 1e9;
    if age > stale_timeout_sec {
        SlotHealth::Stale
    } else {
        SlotHealth::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn disconnected_wins_regardless_of_frames() {
        assert_eq!(
            classify_slot(false, 10 * SEC, 11 * SEC, 1.5),
            SlotHealth::Disconnected
        );
    }

    #[test]
    fn connected_without_frames_is_stale() {
        assert_eq!(classify_slot(true, 0, 10 * SEC, 1.5), SlotHealth::Stale);
    }

    #[test]
    fn fresh_frame_is_online() {
        assert_eq!(
            classify_slot(true, 10 * SEC, 11 * SEC, 1.5),
            SlotHealth::Online
        );
    }

    #[test]
    fn old_frame_is_stale() {
        assert_eq!(
            classify_slot(true, 10 * SEC, 13 * SEC, 1.5),
            SlotHealth::Stale
        );
    }

    #[test]
    fn age_exactly_at_threshold_is_online() {
        let timeout = 1.5;
        let last = 10 * SEC;
        let now = last + (timeout * 1e9) as u64;
        assert_eq!(classify_slot(true, last, now, timeout), SlotHealth::Online);
    }

    #[test]
    fn adopt_marks_discovered_cameras_connected() {
        let manager = Arc::new(Manager::new(
            camgrid_capture::CaptureSettings::default(),
            3,
        ));
        let supervisor = Supervisor::new(manager, &Config::default(), Shutdown::new());
        supervisor.adopt_cameras();
        // No cameras discovered in a test environment: every slot stays
        // disconnected.
        assert!(!supervisor.slot_connected(0));
        assert!(!supervisor.slot_connected(1));
        assert!(!supervisor.slot_connected(2));
        assert!(!supervisor.slot_connected(99));
    }

    #[test]
    fn slots_stay_invisible_to_pollers_until_adopted() {
        let manager = Arc::new(Manager::new(
            camgrid_capture::CaptureSettings::default(),
            3,
        ));
        let supervisor = Supervisor::new(manager, &Config::default(), Shutdown::new());
        // A fresh slot must not look like a reconnect candidate: until
        // adoption it is skipped entirely.
        assert!(!supervisor.inner.any_slot_adopted());
        assert_eq!(supervisor.inner.slot_flags(0), (false, false));

        supervisor.adopt_cameras();
        assert!(supervisor.inner.any_slot_adopted());
        assert_eq!(supervisor.inner.slot_flags(0), (true, false));
        assert_eq!(supervisor.inner.slot_flags(99), (false, false));
    }
}
