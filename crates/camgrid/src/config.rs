//! Runtime configuration: INI file, environment overrides, defaults.
//!
//! Malformed values never abort: each key falls back to its default and is
//! clamped into a documented range. A missing file means pure defaults.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use camgrid_capture::{CaptureSettings, PixelFormat};
use tracing::warn;

/// Environment variable overriding the default config path.
pub const CONFIG_PATH_ENV: &str = "CAMERA_DASHBOARD_CONFIG";
/// Environment variable overriding the configured log file.
pub const LOG_FILE_ENV: &str = "CAMERA_DASHBOARD_LOG_FILE";

const DEFAULT_CONFIG_PATH: &str = "./config.ini";

/// All recognised options with their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    // [logging]
    pub log_level: String,
    pub log_file: PathBuf,
    /// Parsed for the host's rotation tooling; not acted on in-process.
    pub log_max_bytes: u64,
    pub log_backup_count: u32,
    pub log_to_stdout: bool,

    // [performance]
    pub dynamic_fps: bool,
    pub perf_check_interval_ms: u64,
    pub min_dynamic_fps: u32,
    pub ui_fps_step: u32,
    pub cpu_load_threshold: f64,
    pub cpu_temp_threshold_c: f64,
    pub stress_hold_count: u32,
    pub recover_hold_count: u32,
    pub stale_frame_timeout_sec: f64,
    pub restart_cooldown_sec: f64,
    pub max_restarts_per_window: usize,
    pub restart_window_sec: f64,

    // [camera]
    pub rescan_interval_ms: u64,
    pub failed_camera_cooldown_sec: f64,
    pub slot_count: usize,
    pub kill_device_holders: bool,

    // [profile]
    pub capture_width: u32,
    pub capture_height: u32,
    pub capture_fps: u32,
    pub capture_format: PixelFormat,
    /// The display's refresh cadence; informational to the capture core.
    pub ui_fps: u32,

    // [health]
    pub health_log_interval_sec: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_file: PathBuf::from("./logs/camgrid.log"),
            log_max_bytes: 5 * 1024 * 1024,
            log_backup_count: 3,
            log_to_stdout: true,

            dynamic_fps: true,
            perf_check_interval_ms: 2000,
            min_dynamic_fps: 10,
            ui_fps_step: 2,
            cpu_load_threshold: 3.0,
            cpu_temp_threshold_c: 75.0,
            stress_hold_count: 3,
            recover_hold_count: 3,
            stale_frame_timeout_sec: 1.5,
            restart_cooldown_sec: 5.0,
            max_restarts_per_window: 3,
            restart_window_sec: 30.0,

            rescan_interval_ms: 2000,
            failed_camera_cooldown_sec: 30.0,
            slot_count: 3,
            kill_device_holders: true,

            capture_width: 640,
            capture_height: 480,
            capture_fps: 25,
            capture_format: PixelFormat::Mjpeg,
            ui_fps: 20,

            health_log_interval_sec: 30.0,
        }
    }
}

impl Config {
    /// The INI path to use: explicit argument, then `$CAMERA_DASHBOARD_CONFIG`,
    /// then `./config.ini`.
    pub fn config_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(path) = env::var(CONFIG_PATH_ENV)
            && !path.is_empty()
        {
            return PathBuf::from(path);
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Load from the resolved path. A missing file yields defaults; a file
    /// that fails to read is logged and yields defaults.
    pub fn load(explicit: Option<&Path>) -> Config {
        let path = Self::config_path(explicit);
        let mut cfg = Config::default();

        match fs::read_to_string(&path) {
            Ok(text) => cfg.apply_ini(&parse_ini(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to read config {}: {e} (using defaults)", path.display()),
        }

        if let Ok(log_file) = env::var(LOG_FILE_ENV)
            && !log_file.is_empty()
        {
            cfg.log_file = PathBuf::from(log_file);
        }
        cfg
    }

    /// The capture settings shared by every worker.
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            width: self.capture_width,
            height: self.capture_height,
            fps: self.capture_fps,
            format: self.capture_format,
            min_fps: self.min_dynamic_fps,
        }
    }

    fn apply_ini(&mut self, ini: &IniData) {
        if let Some(section) = ini.get("logging") {
            if let Some(v) = section.get("level") {
                self.log_level = v.trim().to_ascii_lowercase();
            }
            if let Some(v) = section.get("file") {
                self.log_file = PathBuf::from(v);
            }
            if let Some(v) = section.get("max_bytes") {
                self.log_max_bytes = as_int(v, self.log_max_bytes, Some(1024), None);
            }
            if let Some(v) = section.get("backup_count") {
                self.log_backup_count = as_int(v, self.log_backup_count, Some(1), None);
            }
            if let Some(v) = section.get("stdout") {
                self.log_to_stdout = as_bool(v, self.log_to_stdout);
            }
        }

        if let Some(section) = ini.get("performance") {
            if let Some(v) = section.get("dynamic_fps") {
                self.dynamic_fps = as_bool(v, self.dynamic_fps);
            }
            if let Some(v) = section.get("perf_check_interval_ms") {
                self.perf_check_interval_ms =
                    as_int(v, self.perf_check_interval_ms, Some(250), None);
            }
            if let Some(v) = section.get("min_dynamic_fps") {
                self.min_dynamic_fps = as_int(v, self.min_dynamic_fps, Some(1), None);
            }
            if let Some(v) = section.get("ui_fps_step") {
                self.ui_fps_step = as_int(v, self.ui_fps_step, Some(1), None);
            }
            if let Some(v) = section.get("cpu_load_threshold") {
                self.cpu_load_threshold =
                    as_float(v, self.cpu_load_threshold, Some(0.1), Some(20.0));
            }
            if let Some(v) = section.get("cpu_temp_threshold_c") {
                self.cpu_temp_threshold_c =
                    as_float(v, self.cpu_temp_threshold_c, Some(30.0), Some(100.0));
            }
            if let Some(v) = section.get("stress_hold_count") {
                self.stress_hold_count = as_int(v, self.stress_hold_count, Some(1), None);
            }
            if let Some(v) = section.get("recover_hold_count") {
                self.recover_hold_count = as_int(v, self.recover_hold_count, Some(1), None);
            }
            if let Some(v) = section.get("stale_frame_timeout_sec") {
                self.stale_frame_timeout_sec =
                    as_float(v, self.stale_frame_timeout_sec, Some(0.5), None);
            }
            if let Some(v) = section.get("restart_cooldown_sec") {
                self.restart_cooldown_sec =
                    as_float(v, self.restart_cooldown_sec, Some(1.0), None);
            }
            if let Some(v) = section.get("max_restarts_per_window") {
                self.max_restarts_per_window =
                    as_int(v, self.max_restarts_per_window, Some(1), None);
            }
            if let Some(v) = section.get("restart_window_sec") {
                self.restart_window_sec = as_float(v, self.restart_window_sec, Some(5.0), None);
            }
        }

        if let Some(section) = ini.get("camera") {
            if let Some(v) = section.get("rescan_interval_ms") {
                self.rescan_interval_ms = as_int(v, self.rescan_interval_ms, Some(500), None);
            }
            if let Some(v) = section.get("failed_camera_cooldown_sec") {
                self.failed_camera_cooldown_sec =
                    as_float(v, self.failed_camera_cooldown_sec, Some(1.0), None);
            }
            if let Some(v) = section.get("slot_count") {
                self.slot_count = as_int(v, self.slot_count, Some(1), Some(8));
            }
            if let Some(v) = section.get("kill_device_holders") {
                self.kill_device_holders = as_bool(v, self.kill_device_holders);
            }
        }

        if let Some(section) = ini.get("profile") {
            if let Some(v) = section.get("capture_width") {
                self.capture_width = as_int(v, self.capture_width, Some(160), Some(1920));
            }
            if let Some(v) = section.get("capture_height") {
                self.capture_height = as_int(v, self.capture_height, Some(120), Some(1080));
            }
            if let Some(v) = section.get("capture_fps") {
                self.capture_fps = as_int(v, self.capture_fps, Some(1), Some(60));
            }
            if let Some(v) = section.get("capture_format")
                && let Some(fmt) = PixelFormat::parse(v)
            {
                self.capture_format = fmt;
            }
            if let Some(v) = section.get("ui_fps") {
                self.ui_fps = as_int(v, self.ui_fps, Some(1), Some(60));
            }
        }

        if let Some(section) = ini.get("health")
            && let Some(v) = section.get("log_interval_sec")
        {
            self.health_log_interval_sec =
                as_float(v, self.health_log_interval_sec, Some(5.0), None);
        }
    }

    /// Sanity-check the configuration. Returns an overall ok flag and
    /// human-readable warnings; never fatal.
    pub fn validate(&self) -> (bool, Vec<String>) {
        let mut ok = true;
        let mut warnings = Vec::new();

        if self.capture_width * self.capture_height > 480_000 {
            warnings
                .push("high resolution may cause USB bandwidth issues with multiple cameras".into());
        }
        if self.capture_fps > 20 {
            warnings.push(format!(
                "capture_fps {} > 20 may cause instability with 3+ cameras",
                self.capture_fps
            ));
        }

        // Rough MJPEG bandwidth estimate across all slots, in MB/s.
        let bandwidth = f64::from(self.capture_width)
            * f64::from(self.capture_height)
            * f64::from(self.capture_fps)
            * 0.15
            * self.slot_count as f64
            / 1024.0
            / 1024.0;
        if bandwidth > 30.0 {
            ok = false;
            warnings.push("estimated USB bandwidth exceeds safe limits".into());
        } else if bandwidth > 20.0 {
            warnings.push("estimated USB bandwidth is high and may cause issues".into());
        }

        if self.min_dynamic_fps > self.capture_fps {
            warnings.push(format!(
                "min_dynamic_fps ({}) > capture_fps ({})",
                self.min_dynamic_fps, self.capture_fps
            ));
        }
        if self.ui_fps > 60 {
            warnings.push("ui_fps > 60 is wasteful and likely unsupported".into());
        }

        (ok, warnings)
    }
}

type IniData = BTreeMap<String, BTreeMap<String, String>>;

/// Minimal INI parser: `[section]` headers, `key = value` lines, `#`/`;`
/// comments. Keys outside any section are ignored.
fn parse_ini(text: &str) -> IniData {
    let mut result = IniData::new();
    let mut current = String::new();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            current = line[1..line.len() - 1].trim().to_string();
            result.entry(current.clone()).or_default();
            continue;
        }
        if let Some(eq) = line.find('=')
            && eq > 0
            && !current.is_empty()
        {
            let key = line[..eq].trim().to_string();
            let value = line[eq + 1..].trim().to_string();
            result.entry(current.clone()).or_default().insert(key, value);
        }
    }
    result
}

/// Truthy: 1/true/yes/on. Falsy: 0/false/no/off. Anything else keeps the
/// fallback.
fn as_bool(value: &str, fallback: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => fallback,
    }
}

fn as_int<T>(value: &str, fallback: T, min: Option<T>, max: Option<T>) -> T
where
    T: Copy + Ord + std::str::FromStr,
{
    let mut parsed = match value.trim().parse::<T>() {
        Ok(v) => v,
        Err(_) => return fallback,
    };
    if let Some(lo) = min {
        parsed = parsed.max(lo);
    }
    if let Some(hi) = max {
        parsed = parsed.min(hi);
    }
    parsed
}

fn as_float(value: &str, fallback: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    let mut parsed = match value.trim().parse::<f64>() {
        Ok(v) => v,
        Err(_) => return fallback,
    };
    if let Some(lo) = min {
        parsed = parsed.max(lo);
    }
    if let Some(hi) = max {
        parsed = parsed.min(hi);
    }
    parsed
}
