//! Adaptive FPS controller.
//!
//! A state machine over CPU temperature and load searches for the highest
//! sustainable frame rate, holds it, and backs off through Recovering or
//! Emergency when the host overheats. Changes reach the workers through
//! `Manager::set_fps` and take effect by decimation only; no decoder is
//! ever restarted for an FPS change.
//!
//! With `dynamic_fps` disabled the controller only monitors, warning when
//! the temperature passes the critical line.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camgrid_capture::manager::Manager;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::Shutdown;
use crate::config::Config;
use crate::perf::monitor::SystemMonitor;

// Thermal zones in °C, sized for a Pi-class host that throttles at 85.
const TEMP_IDEAL: f64 = 72.0;
const TEMP_COMFORT: f64 = 78.0;
const TEMP_WARM: f64 = 82.0;
const TEMP_HOT: f64 = 84.0;
const TEMP_CRITICAL: f64 = 86.0;

// Load zones for a 4-core host.
const LOAD_IDEAL: f64 = 2.5;
const LOAD_HIGH: f64 = 3.8;

const TEMP_HISTORY: usize = 10;
const MIN_TICK: Duration = Duration::from_millis(250);
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(5);

// Hold timers between FPS moves.
const PROBE_RAISE_HOLD: Duration = Duration::from_secs(15);
const PROBE_REDUCE_HOLD: Duration = Duration::from_secs(5);
const STABLE_RAISE_HOLD: Duration = Duration::from_secs(30);
const RECOVER_STEP_HOLD: Duration = Duration::from_secs(5);
const EMERGENCY_EXIT_HOLD: Duration = Duration::from_secs(10);

// Probing backs off harder than the configured step.
const PROBE_REDUCE_STEP: u32 = 3;

/// Controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Searching for the highest sustainable FPS.
    Probing,
    /// Holding the sweet spot.
    Stable,
    /// Stepping back up to the sweet spot after an emergency.
    Recovering,
    /// Pinned at minimum FPS until the host cools.
    Emergency,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Probing => "Probing",
            ControllerState::Stable => "Stable",
            ControllerState::Recovering => "Recovering",
            ControllerState::Emergency => "Emergency",
        };
        f.write_str(name)
    }
}

/// Configuration-derived bounds the state machine consults each tick.
#[derive(Debug, Clone, Copy)]
struct Limits {
    min_fps: u32,
    max_fps: u32,
    step: u32,
    stress_hold: u32,
    recover_hold: u32,
    load_threshold: f64,
    temp_threshold: f64,
}

impl Limits {
    fn from_config(cfg: &Config) -> Self {
        let min_fps = cfg.min_dynamic_fps;
        Self {
            min_fps,
            max_fps: cfg.capture_fps.max(min_fps),
            step: cfg.ui_fps_step.max(1),
            stress_hold: cfg.stress_hold_count.max(1),
            recover_hold: cfg.recover_hold_count.max(1),
            load_threshold: cfg.cpu_load_threshold,
            temp_threshold: cfg.cpu_temp_threshold_c,
        }
    }
}

/// Mutable controller state; pure so the transitions are testable with
/// synthetic readings and clocks.
struct ControlState {
    state: ControllerState,
    current_fps: u32,
    sweet_spot: u32,

    temp_history: VecDeque<f64>,
    trend: f64,

    stability: u32,
    stress: u32,
    recover: u32,

    state_entered: Instant,
    last_change: Instant,
    stable_since: Instant,
    adjustments: u64,
}

impl ControlState {
    fn new(initial_fps: u32, now: Instant) -> Self {
        Self {
            state: ControllerState::Probing,
            current_fps: initial_fps,
            sweet_spot: initial_fps,
            temp_history: VecDeque::with_capacity(TEMP_HISTORY),
            trend: 0.0,
            stability: 0,
            stress: 0,
            recover: 0,
            state_entered: now,
            last_change: now,
            stable_since: now,
            adjustments: 0,
        }
    }

    /// One adaptation cycle. Returns the FPS to push to the workers when a
    /// change (or an Emergency re-pin) happened this tick.
    fn tick(&mut self, temp: f64, load: f64, now: Instant, limits: &Limits) -> Option<u32> {
        self.update_trend(temp);
        match self.state {
            ControllerState::Probing => self.probing(temp, load, now, limits),
            ControllerState::Stable => self.stable(temp, load, now, limits),
            ControllerState::Recovering => self.recovering(temp, now, limits),
            ControllerState::Emergency => self.emergency(temp, now, limits),
        }
    }

    fn update_trend(&mut self, temp: f64) {
        self.temp_history.push_back(temp);
        while self.temp_history.len() > TEMP_HISTORY {
            self.temp_history.pop_front();
        }
        // Source behaviour: divide by n, not n-1; the extra damping is
        // preserved deliberately.
        let n = self.temp_history.len();
        if n >= 3 {
            self.trend = (self.temp_history[n - 1] - self.temp_history[0]) / n as f64;
        }
    }

    fn probing(&mut self, temp: f64, load: f64, now: Instant, limits: &Limits) -> Option<u32> {
        if temp >= TEMP_CRITICAL {
            warn!("EMERGENCY: temperature {temp:.1}C");
            return self.enter_emergency(now, limits);
        }

        let under_stress = temp >= limits.temp_threshold || load >= limits.load_threshold;
        let load_ok = load < LOAD_HIGH;
        let sustainable = temp < TEMP_WARM || (temp < TEMP_HOT && self.trend <= 0.0);

        if sustainable && load_ok && !under_stress {
            self.stability += 1;
            self.stress = 0;

            if self.stability >= 8 {
                if self.current_fps > self.sweet_spot {
                    self.sweet_spot = self.current_fps;
                    info!("new sweet spot: {} fps @ {temp:.1}C", self.sweet_spot);
                }
                if self.stability >= 12 {
                    info!("stable at {} fps", self.current_fps);
                    self.enter_state(ControllerState::Stable, now);
                    return None;
                }
                if self.current_fps < limits.max_fps
                    && temp < TEMP_COMFORT
                    && self.trend < 0.0
                    && now.duration_since(self.last_change) > PROBE_RAISE_HOLD
                {
                    return self.change_fps(self.current_fps + limits.step, now, limits);
                }
            }
        } else {
            self.stability = 0;
            self.stress += 1;

            if self.stress >= limits.stress_hold {
                let should_reduce = temp >= TEMP_HOT
                    || (temp >= TEMP_WARM && self.trend > 0.3)
                    || load >= LOAD_HIGH;
                if should_reduce && now.duration_since(self.last_change) > PROBE_REDUCE_HOLD {
                    let target = self.current_fps.saturating_sub(PROBE_REDUCE_STEP);
                    let applied = self.change_fps(target, now, limits);
                    if self.current_fps < self.sweet_spot {
                        self.sweet_spot = self.current_fps;
                    }
                    self.stress = 0;
                    return applied;
                }
            }
        }
        None
    }

    fn stable(&mut self, temp: f64, load: f64, now: Instant, limits: &Limits) -> Option<u32> {
        if temp >= TEMP_CRITICAL {
            warn!("EMERGENCY while stable: temperature {temp:.1}C");
            return self.enter_emergency(now, limits);
        }

        let under_stress = temp >= limits.temp_threshold || load >= limits.load_threshold;
        let needs_reduce = temp >= TEMP_HOT
            || (temp >= TEMP_WARM && self.trend > 0.5)
            || load >= LOAD_HIGH
            || under_stress;

        if needs_reduce {
            self.stress += 1;
            if self.stress >= limits.stress_hold {
                info!("reducing fps: temp {temp:.1}C load {load:.2} after {} stressed ticks", self.stress);
                let applied =
                    self.change_fps(self.current_fps.saturating_sub(limits.step), now, limits);
                if self.current_fps < self.sweet_spot {
                    self.sweet_spot = self.current_fps;
                    info!("sweet spot lowered to {} fps", self.sweet_spot);
                }
                self.stress = 0;
                return applied;
            }
            return None;
        }

        self.stress = 0;
        self.recover += 1;

        if now.duration_since(self.stable_since) > STABLE_RAISE_HOLD
            && self.current_fps < limits.max_fps
            && temp < TEMP_IDEAL
            && self.trend < 0.0
            && load < LOAD_IDEAL
            && self.recover >= limits.recover_hold
        {
            info!("conditions excellent, trying higher fps");
            let applied = self.change_fps(self.current_fps + limits.step, now, limits);
            self.stable_since = now;
            self.recover = 0;
            return applied;
        }
        None
    }

    fn recovering(&mut self, temp: f64, now: Instant, limits: &Limits) -> Option<u32> {
        if temp >= TEMP_HOT {
            if temp >= TEMP_CRITICAL {
                return self.enter_emergency(now, limits);
            }
            return None;
        }

        if temp < TEMP_COMFORT
            && self.trend <= 0.0
            && now.duration_since(self.last_change) > RECOVER_STEP_HOLD
        {
            self.recover += 1;
            if self.recover >= limits.recover_hold {
                if self.current_fps < self.sweet_spot {
                    let applied = self.change_fps(self.current_fps + limits.step, now, limits);
                    self.recover = 0;
                    return applied;
                }
                info!("recovered to sweet spot: {} fps", self.sweet_spot);
                self.enter_state(ControllerState::Stable, now);
            }
        } else {
            self.recover = 0;
        }
        None
    }

    fn emergency(&mut self, temp: f64, now: Instant, limits: &Limits) -> Option<u32> {
        let mut applied = None;
        if self.current_fps != limits.min_fps {
            self.current_fps = limits.min_fps;
            applied = Some(limits.min_fps);
        }
        if temp < TEMP_WARM
            && self.trend <= 0.0
            && now.duration_since(self.state_entered) > EMERGENCY_EXIT_HOLD
        {
            info!("leaving emergency at {temp:.1}C");
            self.enter_state(ControllerState::Recovering, now);
        }
        applied
    }

    fn enter_emergency(&mut self, now: Instant, limits: &Limits) -> Option<u32> {
        self.enter_state(ControllerState::Emergency, now);
        self.current_fps = limits.min_fps;
        Some(limits.min_fps)
    }

    fn enter_state(&mut self, state: ControllerState, now: Instant) {
        let old = self.state;
        self.state = state;
        self.state_entered = now;
        self.stability = 0;
        self.stress = 0;
        self.recover = 0;
        if state == ControllerState::Stable {
            self.stable_since = now;
        }
        info!("controller state {old} -> {state}");
    }

    fn change_fps(&mut self, fps: u32, now: Instant, limits: &Limits) -> Option<u32> {
        let fps = fps.clamp(limits.min_fps, limits.max_fps);
        if fps == self.current_fps {
            return None;
        }
        info!("fps {} -> {fps}", self.current_fps);
        self.current_fps = fps;
        self.last_change = now;
        self.stability = 0;
        self.adjustments += 1;
        Some(fps)
    }
}

/// Thermal/load controller pushing FPS targets to the camera manager.
pub struct PerfController {
    manager: Arc<Manager>,
    shutdown: Arc<Shutdown>,
    dynamic: bool,
    limits: Limits,
    tick_interval: Duration,
    monitor: Mutex<SystemMonitor>,
    state: Mutex<ControlState>,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PerfController {
    pub fn new(manager: Arc<Manager>, cfg: &Config, shutdown: Arc<Shutdown>) -> Arc<Self> {
        let mut limits = Limits::from_config(cfg);
        if !cfg.dynamic_fps {
            // Fixed mode pins the range to the configured rate.
            limits.min_fps = cfg.capture_fps;
            limits.max_fps = cfg.capture_fps;
        }
        let initial = limits.max_fps;

        if cfg.dynamic_fps {
            info!(
                "controller: {}x{} @ {initial} fps, dynamic {}-{} fps",
                cfg.capture_width, cfg.capture_height, limits.min_fps, limits.max_fps,
            );
        } else {
            info!(
                "controller: {}x{} @ {initial} fps (fixed, monitoring only)",
                cfg.capture_width, cfg.capture_height,
            );
        }

        Arc::new(Self {
            manager,
            shutdown,
            dynamic: cfg.dynamic_fps,
            limits,
            tick_interval: Duration::from_millis(cfg.perf_check_interval_ms).max(MIN_TICK),
            monitor: Mutex::new(SystemMonitor::new()),
            state: Mutex::new(ControlState::new(initial, Instant::now())),
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Spawn the control thread and apply the initial FPS.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            state.state_entered = now;
            state.last_change = now;
            if !self.dynamic {
                state.state = ControllerState::Stable;
            }
            self.manager.set_fps(state.current_fps);
        }
        if self.dynamic {
            info!(
                "controller started: probing {}-{} fps",
                self.limits.min_fps, self.limits.max_fps
            );
        } else {
            info!("controller started: fixed {} fps", self.limits.max_fps);
        }

        let controller = Arc::clone(&self);
        let spawned = thread::Builder::new()
            .name("perf-controller".into())
            .spawn(move || controller.run());
        match spawned {
            Ok(handle) => *self.handle.lock() = Some(handle),
            Err(e) => warn!("failed to spawn controller thread: {e}"),
        }
    }

    /// Stop the control thread and wait for it.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Current state name.
    pub fn state(&self) -> ControllerState {
        self.state.lock().state
    }

    /// Current FPS target.
    pub fn current_fps(&self) -> u32 {
        self.state.lock().current_fps
    }

    /// Highest frame rate observed to be sustainable so far.
    pub fn sweet_spot_fps(&self) -> u32 {
        self.state.lock().sweet_spot
    }

    /// Whether adaptation is enabled.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    fn run(&self) {
        let mut last_status = Instant::now();
        while self.running.load(Ordering::Acquire) && !self.shutdown.is_triggered() {
            if !self.shutdown.sleep(self.tick_interval) {
                break;
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            let (temp, load) = {
                let mut monitor = self.monitor.lock();
                monitor.refresh();
                (monitor.temperature(), monitor.load_average())
            };

            if self.dynamic {
                let applied = self.state.lock().tick(temp, load, Instant::now(), &self.limits);
                if let Some(fps) = applied {
                    self.manager.set_fps(fps);
                }
            } else if temp >= TEMP_CRITICAL {
                warn!("temperature critical ({temp:.1}C), consider improving ventilation");
            }

            if last_status.elapsed() >= STATUS_LOG_INTERVAL {
                last_status = Instant::now();
                self.log_status(temp, load);
            }
        }
        debug!("controller loop exited");
    }

    fn log_status(&self, temp: f64, load: f64) {
        let state = self.state.lock();
        if self.dynamic {
            info!(
                "{} | fps {} (sweet={}, range {}-{}) | temp {temp:.1}C | load {load:.2} | adjustments {}",
                state.state,
                state.current_fps,
                state.sweet_spot,
                self.limits.min_fps,
                self.limits.max_fps,
                state.adjustments,
            );
        } else {
            info!(
                "fixed mode | fps {} | temp {temp:.1}C | load {load:.2}",
                state.current_fps
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits {
            min_fps: 10,
            max_fps: 20,
            step: 2,
            stress_hold: 3,
            recover_hold: 3,
            load_threshold: 3.0,
            temp_threshold: 75.0,
        }
    }

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn critical_temperature_enters_emergency_at_minimum_fps() {
        let base = Instant::now();
        let lim = limits();
        let mut state = ControlState::new(20, base);
        let applied = state.tick(90.0, 0.5, at(base, 1), &lim);
        assert_eq!(state.state, ControllerState::Emergency);
        assert_eq!(applied, Some(10));
        assert_eq!(state.current_fps, 10);
        // While in Emergency, fps stays pinned at the minimum.
        state.tick(88.0, 0.5, at(base, 2), &lim);
        assert_eq!(state.current_fps, 10);
    }

    #[test]
    fn thermal_ramp_reduces_fps_without_emergency() {
        // 70 -> 85 -> 70 C over eight one-second ticks: the probe backs off
        // once the stress hold and the five-second change gate both allow
        // it, and 85 C never crosses the critical line.
        let base = Instant::now();
        let lim = limits();
        let mut state = ControlState::new(20, base);
        let trace = [70.0, 75.0, 80.0, 83.0, 85.0, 83.0, 78.0, 70.0];
        let mut changes = Vec::new();
        for (i, temp) in trace.iter().enumerate() {
            if let Some(fps) = state.tick(*temp, 0.5, at(base, i as u64 + 1), &lim) {
                changes.push(fps);
            }
            assert_ne!(state.state, ControllerState::Emergency);
        }
        assert_eq!(changes, vec![17]);
        assert_eq!(state.current_fps, 17);
        assert_eq!(state.sweet_spot, 17);
        assert_eq!(state.state, ControllerState::Probing);
    }

    #[test]
    fn sustained_stability_promotes_to_stable() {
        let base = Instant::now();
        let lim = limits();
        let mut state = ControlState::new(20, base);
        for i in 1..=12 {
            state.tick(60.0, 0.5, at(base, i), &lim);
        }
        assert_eq!(state.state, ControllerState::Stable);
        assert_eq!(state.sweet_spot, 20);
        assert_eq!(state.current_fps, 20);
    }

    #[test]
    fn emergency_recovers_through_recovering_to_stable() {
        let base = Instant::now();
        let lim = limits();
        let mut state = ControlState::new(20, base);
        state.sweet_spot = 14;

        state.tick(90.0, 0.5, at(base, 1), &lim);
        assert_eq!(state.state, ControllerState::Emergency);

        // Cooled below Warm with a non-positive trend, past the exit hold.
        for i in 2..=14 {
            state.tick(70.0, 0.5, at(base, i), &lim);
            if state.state != ControllerState::Emergency {
                break;
            }
        }
        assert_eq!(state.state, ControllerState::Recovering);

        // Step back up to the sweet spot, then settle in Stable.
        let mut guard = 0;
        while state.state == ControllerState::Recovering && guard < 100 {
            guard += 1;
            state.tick(70.0, 0.5, at(base, 14 + guard), &lim);
        }
        assert_eq!(state.state, ControllerState::Stable);
        assert_eq!(state.current_fps, 14);
    }

    #[test]
    fn stable_reduces_after_stress_hold() {
        let base = Instant::now();
        let lim = limits();
        let mut state = ControlState::new(20, base);
        state.enter_state(ControllerState::Stable, base);
        state.sweet_spot = 20;

        let mut applied = None;
        for i in 1..=3 {
            applied = state.tick(84.5, 0.5, at(base, i), &lim);
        }
        assert_eq!(applied, Some(18));
        assert_eq!(state.sweet_spot, 18);
        assert_eq!(state.state, ControllerState::Stable);
    }

    #[test]
    fn min_equal_max_never_changes_fps() {
        let base = Instant::now();
        let lim = Limits {
            min_fps: 15,
            max_fps: 15,
            ..limits()
        };
        let mut state = ControlState::new(15, base);
        let trace = [60.0, 70.0, 80.0, 85.0, 84.0, 70.0, 60.0, 55.0];
        for (i, temp) in trace.iter().enumerate() {
            // Clamping makes every candidate equal to the current rate, so
            // no change is ever emitted outside of an emergency pin.
            if *temp < TEMP_CRITICAL {
                assert_eq!(state.tick(*temp, 0.5, at(base, i as u64 + 1), &lim), None);
            }
        }
        assert_eq!(state.current_fps, 15);
    }

    #[test]
    fn unreadable_sensors_read_as_zero_and_never_escalate() {
        let base = Instant::now();
        let lim = limits();
        let mut state = ControlState::new(20, base);
        for i in 1..=30 {
            state.tick(0.0, 0.0, at(base, i), &lim);
            assert_ne!(state.state, ControllerState::Emergency);
        }
    }

    #[test]
    fn trend_uses_source_divisor() {
        let base = Instant::now();
        let lim = limits();
        let mut state = ControlState::new(20, base);
        state.tick(70.0, 0.5, at(base, 1), &lim);
        state.tick(72.0, 0.5, at(base, 2), &lim);
        state.tick(76.0, 0.5, at(base, 3), &lim);
        // (76 - 70) / 3, not / 2.
        assert!((state.trend - 2.0).abs() < f64::EPSILON);
    }
}
