//! Bounded external command execution.
//!
//! Discovery and holder eviction shell out to system tools (`v4l2-ctl`,
//! `lsof`, `fuser`). Every invocation runs with stderr suppressed and a
//! hard deadline; failure of any kind yields `None` so callers degrade to
//! "no information" instead of propagating an error.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Deadline applied to every external command.
pub(crate) const COMMAND_DEADLINE: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Run `program args...` and return its trimmed stdout.
///
/// Returns `None` on spawn failure, non-zero exit, or when the deadline
/// elapses (the child is killed and reaped in that case). Stdout is drained
/// concurrently so a chatty child cannot deadlock on a full pipe.
pub(crate) fn output_with_deadline(
    program: &str,
    args: &[&str],
    deadline: Duration,
) -> Option<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    let mut stdout = child.stdout.take()?;
    let reader = thread::spawn(move || {
        let mut buf = String::new();
        let _ = stdout.read_to_string(&mut buf);
        buf
    });

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let out = reader.join().unwrap_or_default();
                return if status.success() {
                    Some(out.trim().to_string())
                } else {
                    None
                };
            }
            Ok(None) => {
                if started.elapsed() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = reader.join();
                    return None;
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = reader.join();
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_of_a_quick_command() {
        let out = output_with_deadline("echo", &["holders"], COMMAND_DEADLINE);
        assert_eq!(out.as_deref(), Some("holders"));
    }

    #[test]
    fn missing_program_yields_none() {
        assert!(output_with_deadline("definitely-not-a-real-tool", &[], COMMAND_DEADLINE).is_none());
    }

    #[test]
    fn failing_command_yields_none() {
        assert!(output_with_deadline("false", &[], COMMAND_DEADLINE).is_none());
    }

    #[test]
    fn deadline_kills_a_hung_command() {
        let started = Instant::now();
        let out = output_with_deadline("sleep", &["10"], Duration::from_millis(200));
        assert!(out.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
