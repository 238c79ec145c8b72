//! Doctor/lint command execution.
//!
//! Runs a verification command through `sh -c` in a working directory with a
//! per-invocation timeout. A timed-out command is killed, reaped, and
//! reported as a normal non-zero exit so the caller's failure policy applies
//! uniformly.

use chrono::Utc;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit code reported for a killed (timed out) command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Lines of combined output kept for failure reporting.
const OUTPUT_TAIL_LINES: usize = 120;

#[derive(Debug, Error)]
pub enum DoctorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DoctorError>;

/// Result of one command invocation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub cmd: String,
    pub exit_code: i32,
    pub passed: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    /// Tail of combined output for event payloads and failure notes.
    pub fn output_tail(&self) -> String {
        let combined = if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n--- STDERR ---\n{}", self.stdout, self.stderr)
        };
        let lines: Vec<&str> = combined.lines().collect();
        let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
        lines[start..].join("\n")
    }
}

/// Execute a command with an optional timeout (seconds, 0 = none).
pub async fn run_command(cmd: &str, working_dir: &Path, timeout_sec: u64) -> Result<CommandResult> {
    debug!(cmd, working_dir = %working_dir.display(), timeout_sec, "running command");
    let start = Utc::now();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdout_handle = child.stdout.take();
    let mut stderr_handle = child.stderr.take();

    let (exit_code, timed_out) = if timeout_sec > 0 {
        tokio::select! {
            status = child.wait() => (status?.code().unwrap_or(-1), false),
            () = tokio::time::sleep(Duration::from_secs(timeout_sec)) => {
                if let Err(err) = child.kill().await {
                    warn!(cmd, error = %err, "failed to kill timed-out command");
                }
                let _ = child.wait().await;
                warn!(cmd, timeout_sec, "command timed out");
                (TIMEOUT_EXIT_CODE, true)
            }
        }
    } else {
        (child.wait().await?.code().unwrap_or(-1), false)
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    if let Some(ref mut handle) = stdout_handle {
        let _ = handle.read_to_end(&mut stdout).await;
    }
    if let Some(ref mut handle) = stderr_handle {
        let _ = handle.read_to_end(&mut stderr).await;
    }

    let duration_ms = (Utc::now() - start).num_milliseconds().max(0) as u64;
    Ok(CommandResult {
        cmd: cmd.to_string(),
        exit_code,
        passed: exit_code == 0 && !timed_out,
        timed_out,
        duration_ms,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn passing_command_reports_success() {
        let dir = TempDir::new().unwrap();
        let result = run_command("true", dir.path(), 10).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.exit_code, 0);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn failing_command_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let result = run_command("exit 3", dir.path(), 10).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn command_output_is_captured() {
        let dir = TempDir::new().unwrap();
        let result = run_command("echo out; echo err 1>&2", dir.path(), 10)
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        let tail = result.output_tail();
        assert!(tail.contains("out"));
        assert!(tail.contains("err"));
    }

    #[tokio::test]
    async fn timeout_is_a_normal_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let result = run_command("sleep 5", dir.path(), 1).await.unwrap();
        assert!(!result.passed);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.duration_ms < 5000);
    }

    #[tokio::test]
    async fn runs_in_the_given_working_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let result = run_command("cat marker.txt", dir.path(), 10).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.stdout, "here");
    }

    #[test]
    fn output_tail_keeps_last_lines() {
        let result = CommandResult {
            cmd: "x".into(),
            exit_code: 1,
            passed: false,
            timed_out: false,
            duration_ms: 0,
            stdout: (0..200).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n"),
            stderr: String::new(),
        };
        let tail = result.output_tail();
        assert!(!tail.contains("line 0\n"));
        assert!(tail.contains("line 199"));
        assert_eq!(tail.lines().count(), 120);
    }
}
