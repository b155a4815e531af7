//! Running-application check.
//!
//! Patching requires the application to be stopped. This module only
//! detects a running instance; it never signals or kills anything.

use crate::error::{Error, Result};
use std::process::Command;

/// Find the first process whose name is exactly `name`.
///
/// Returns `Ok(None)` when no such process exists.
pub fn find_running(name: &str) -> Result<Option<i32>> {
    let output = Command::new("pgrep")
        .args(["-x", name])
        .output()
        .map_err(|e| Error::command_failed("pgrep", e.to_string()))?;

    // pgrep: 0 = matched, 1 = no match, anything else = error
    match output.status.code() {
        Some(0) => Ok(parse_pids(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .next()),
        Some(1) => Ok(None),
        _ => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::command_failed("pgrep", stderr.trim()))
        }
    }
}

/// Fail with [`Error::AppRunning`] if `name` is running.
pub fn ensure_not_running(name: &str) -> Result<()> {
    match find_running(name)? {
        Some(pid) => Err(Error::AppRunning {
            name: name.to_string(),
            pid,
        }),
        None => {
            tracing::debug!(process = %name, "application not running");
            Ok(())
        }
    }
}

/// Parse one PID per line, ignoring anything that isn't a number.
fn parse_pids(stdout: &str) -> Vec<i32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}
