//! Shared subprocess execution.
//!
//! [`run_command`] is used by everything that shells out: the console
//! and bridge wrappers in the device crate and the script handler in the
//! daemon. Callers build a [`tokio::process::Command`] with program and
//! arguments; spawning, stdin, output capture and the timeout happen here.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Maximum stdout or stderr size captured per stream (4 MiB).
const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` if the process was killed by a signal.
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Process timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// Spawn `cmd`, optionally write `stdin`, capture stdout/stderr, and kill
/// the child if it outlives `timeout`.
pub async fn run_command(
    cmd: &mut Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    // `kill_on_drop(true)` ensures the child is killed when dropped (e.g. on timeout).
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(CommandError::Spawn)?;

    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // The process may close stdin early; that is not our failure.
        let _ = pipe.write_all(data).await;
        drop(pipe);
    }

    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();
    let stdout_task = tokio::spawn(async move { read_stream(stdout_handle).await });
    let stderr_task = tokio::spawn(async move { read_stream(stderr_handle).await });

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let stdout_bytes = stdout_task.await.unwrap_or_default();
            let stderr_bytes = stderr_task.await.unwrap_or_default();
            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
                exit_code: status.code().unwrap_or(-1),
                duration_ms: start.elapsed().as_millis() as u64,
            })
        }
        Ok(Err(e)) => Err(CommandError::Io(e)),
        // `child` is dropped on return, which kills it.
        Err(_elapsed) => Err(CommandError::Timeout {
            elapsed_ms: start.elapsed().as_millis() as u64,
        }),
    }
}

/// Read an entire output stream, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

#[cfg(all(test, unix))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello; exit 3"]);
        let output = run_command(&mut cmd, None, Duration::from_secs(5))
            .await
            .expect("sh should run");
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn pipes_stdin() {
        let mut cmd = Command::new("cat");
        let output = run_command(&mut cmd, Some(b"{\"a\":1}"), Duration::from_secs(5))
            .await
            .expect("cat should run");
        assert_eq!(output.stdout, "{\"a\":1}");
    }

    #[tokio::test]
    async fn kills_on_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let result = run_command(&mut cmd, None, Duration::from_millis(100)).await;
        assert_matches!(result, Err(CommandError::Timeout { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let mut cmd = Command::new("definitely-not-a-real-binary-xyz");
        let result = run_command(&mut cmd, None, Duration::from_secs(1)).await;
        assert_matches!(result, Err(CommandError::Spawn(_)));
    }
}
