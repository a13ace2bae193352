//! Eviction of stray processes holding a camera device node.
//!
//! Decoder children from a crashed previous run (or anything else) can keep
//! `/dev/videoN` open and make every capture attempt fail. Before opening a
//! device the caller can clear such holders: PIDs are collected with `lsof`
//! (falling back to `fuser`), sent SIGTERM, given a grace period, and any
//! survivor is killed. All of it is best-effort; failures read as "no
//! holders".

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::cmd::{COMMAND_DEADLINE, output_with_deadline};

/// Grace period between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(400);

/// Terminate any process holding `path`. Returns whether anything was
/// signalled. A no-op returning `false` when `enabled` is off.
pub fn kill_device_holders(path: &Path, enabled: bool) -> bool {
    kill_device_holders_with_grace(path, enabled, DEFAULT_GRACE)
}

/// As [`kill_device_holders`] with an explicit grace period.
pub fn kill_device_holders_with_grace(path: &Path, enabled: bool, grace: Duration) -> bool {
    if !enabled {
        return false;
    }

    let mut pids = pids_from_lsof(path);
    if pids.is_empty() {
        pids = pids_from_fuser(path);
    }
    pids.remove(&(std::process::id() as i32));
    if pids.is_empty() {
        return false;
    }

    warn!(path = %path.display(), ?pids, "clearing processes holding device");

    for &pid in &pids {
        match send_signal(pid, libc::SIGTERM) {
            Ok(()) => {}
            Err(errno) if is_permission_errno(errno) => {
                // We cannot signal the holder ourselves; hand the whole
                // device over to an escalated fuser and stop iterating.
                escalated_kill(path);
                break;
            }
            Err(errno) => debug!(pid, errno, "SIGTERM failed"),
        }
    }

    thread::sleep(grace);

    for &pid in &pids {
        if !pid_alive(pid) {
            continue;
        }
        match send_signal(pid, libc::SIGKILL) {
            Ok(()) => {}
            Err(errno) if is_permission_errno(errno) => escalated_kill(path),
            Err(errno) => debug!(pid, errno, "SIGKILL failed"),
        }
    }

    true
}

fn escalated_kill(path: &Path) {
    let path = path.to_string_lossy();
    let _ = output_with_deadline("sudo", &["fuser", "-k", &path], COMMAND_DEADLINE);
}

fn pids_from_lsof(path: &Path) -> BTreeSet<i32> {
    let path = path.to_string_lossy();
    output_with_deadline("lsof", &["-t", &path], COMMAND_DEADLINE)
        .map(|out| parse_pid_lines(&out))
        .unwrap_or_default()
}

fn pids_from_fuser(path: &Path) -> BTreeSet<i32> {
    let path = path.to_string_lossy();
    output_with_deadline("fuser", &["-v", &path], COMMAND_DEADLINE)
        .map(|out| extract_pids(&out))
        .unwrap_or_default()
}

/// One PID per line, as `lsof -t` prints them.
fn parse_pid_lines(out: &str) -> BTreeSet<i32> {
    out.lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .filter(|&pid| pid > 0)
        .collect()
}

/// Any whole numbers in the output, as `fuser` prints them.
fn extract_pids(out: &str) -> BTreeSet<i32> {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    let re = DIGITS.get_or_init(|| Regex::new(r"\b(\d+)\b").unwrap());
    re.find_iter(out)
        .filter_map(|m| m.as_str().parse::<i32>().ok())
        .filter(|&pid| pid > 0)
        .collect()
}

fn send_signal(pid: i32, signal: i32) -> Result<(), i32> {
    // SAFETY: kill(2) with a valid signal number has no memory-safety
    // concerns; the worst outcome is ESRCH/EPERM reported via errno.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

fn pid_alive(pid: i32) -> bool {
    // Signal 0 probes existence without delivering anything.
    unsafe { libc::kill(pid, 0) == 0 }
}

fn is_permission_errno(errno: i32) -> bool {
    errno == libc::EPERM || errno == libc::EACCES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_eviction_is_a_noop() {
        assert!(!kill_device_holders(Path::new("/dev/video0"), false));
    }

    #[test]
    fn parses_lsof_style_pid_lines() {
        let pids = parse_pid_lines("1234\n5678\n\nnot-a-pid\n-3\n");
        assert_eq!(pids.into_iter().collect::<Vec<_>>(), vec![1234, 5678]);
    }

    #[test]
    fn extracts_pids_from_fuser_output() {
        let pids = extract_pids("/dev/video0:  4321m 8765");
        assert_eq!(pids.into_iter().collect::<Vec<_>>(), vec![4321, 8765]);
    }

    #[test]
    fn own_pid_is_never_a_target() {
        // The device path is our own binary, which nothing "holds" via
        // lsof/fuser semantics on most systems; the important property is
        // that the call degrades to false rather than erroring.
        let result = kill_device_holders_with_grace(
            Path::new("/nonexistent/device"),
            true,
            Duration::from_millis(1),
        );
        assert!(!result);
    }
}
