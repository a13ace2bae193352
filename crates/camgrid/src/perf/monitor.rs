//! System metrics: CPU load, temperature, memory.
//!
//! Readings come straight from procfs/sysfs and are cached between
//! refreshes. Unreadable sources degrade to neutral values (a host without
//! thermal zones reads as 0 °C and can never look hot) rather than erroring.

use std::fs;

/// Cached system readings, refreshed by the controller's tick.
#[derive(Debug, Default)]
pub struct SystemMonitor {
    load_avg: f64,
    temperature: f64,
    memory_used_pct: f64,
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-read every source. Never fails; missing sources leave 0.
    pub fn refresh(&mut self) {
        self.load_avg = read_load_average().unwrap_or(0.0);
        self.temperature = read_temperature();
        self.memory_used_pct = read_memory_used_pct().unwrap_or(0.0);
    }

    /// 1-minute load average from the last refresh.
    pub fn load_average(&self) -> f64 {
        self.load_avg
    }

    /// Mean CPU temperature in °C from the last refresh; 0 when no thermal
    /// zone was parseable.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Used memory percentage; telemetry only.
    pub fn memory_used_pct(&self) -> f64 {
        self.memory_used_pct
    }
}

fn read_load_average() -> Option<f64> {
    parse_loadavg(&fs::read_to_string("/proc/loadavg").ok()?)
}

/// First whitespace-separated field of /proc/loadavg.
fn parse_loadavg(text: &str) -> Option<f64> {
    text.split_whitespace().next()?.parse().ok()
}

/// Mean of all parseable thermal zones, in °C. 0.0 when none parse.
fn read_temperature() -> f64 {
    let Ok(entries) = fs::read_dir("/sys/class/thermal") else {
        return 0.0;
    };

    let mut total = 0.0;
    let mut count = 0u32;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with("thermal_zone") {
            continue;
        }
        let temp_path = entry.path().join("temp");
        if let Some(celsius) = fs::read_to_string(temp_path)
            .ok()
            .and_then(|s| parse_millidegrees(&s))
        {
            total += celsius;
            count += 1;
        }
    }

    if count == 0 { 0.0 } else { total / f64::from(count) }
}

/// Thermal zone files report millidegrees Celsius.
fn parse_millidegrees(text: &str) -> Option<f64> {
    let value: f64 = text.trim().parse().ok()?;
    Some(value / 1000.0)
}

fn read_memory_used_pct() -> Option<f64> {
    parse_meminfo(&fs::read_to_string("/proc/meminfo").ok()?)
}

/// Used percentage from MemTotal/MemAvailable.
fn parse_meminfo(text: &str) -> Option<f64> {
    let mut total: Option<f64> = None;
    let mut available: Option<f64> = None;
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("MemTotal:"), Some(v)) => total = v.parse().ok(),
            (Some("MemAvailable:"), Some(v)) => available = v.parse().ok(),
            _ => {}
        }
    }
    let (total, available) = (total?, available?);
    if total <= 0.0 {
        return None;
    }
    Some(100.0 * (total - available) / total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loadavg_takes_the_first_field() {
        assert_eq!(parse_loadavg("1.42 0.98 0.75 2/345 6789"), Some(1.42));
        assert_eq!(parse_loadavg(""), None);
        assert_eq!(parse_loadavg("garbage"), None);
    }

    #[test]
    fn thermal_readings_are_millidegrees() {
        assert_eq!(parse_millidegrees("65000\n"), Some(65.0));
        assert_eq!(parse_millidegrees("  48500 "), Some(48.5));
        assert_eq!(parse_millidegrees("warm"), None);
    }

    #[test]
    fn meminfo_yields_a_used_percentage() {
        let text = "MemTotal:       1000 kB\nMemAvailable:    250 kB\n";
        assert_eq!(parse_meminfo(text), Some(75.0));
        assert_eq!(parse_meminfo("MemTotal: 0 kB\nMemAvailable: 0 kB\n"), None);
        assert_eq!(parse_meminfo(""), None);
    }
}
