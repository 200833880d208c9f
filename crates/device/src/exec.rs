use std::path::Path;
use std::time::Duration;

use droidfleet_core::driver::DeviceError;
use droidfleet_core::subprocess::{run_command, CommandError, CommandOutput};
use tokio::process::Command;

/// Run `binary args...` with a timeout, mapping failures into
/// [`DeviceError`]. A non-zero exit is an error.
pub(crate) async fn exec_tool(
    binary: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, DeviceError> {
    let output = exec_tool_unchecked(binary, args, timeout).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(DeviceError::CommandFailed {
            command: describe(binary, args),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Like [`exec_tool`] but leaves exit-code interpretation to the caller.
/// Some bridge verbs exit 0 on failure and report it on stdout.
pub(crate) async fn exec_tool_unchecked(
    binary: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, DeviceError> {
    let mut cmd = Command::new(binary);
    cmd.args(args);

    tracing::trace!(command = %describe(binary, args), "Executing device tool");

    run_command(&mut cmd, None, timeout)
        .await
        .map_err(|e| match e {
            CommandError::Timeout { elapsed_ms } => DeviceError::Timeout {
                operation: describe(binary, args),
                elapsed_ms,
            },
            CommandError::Spawn(source) | CommandError::Io(source) => DeviceError::Spawn {
                command: describe(binary, args),
                source,
            },
        })
}

/// Human-readable `tool verb` for error messages (no arguments beyond the
/// verb, which keeps addresses and names out of metric-like labels).
pub(crate) fn describe(binary: &Path, args: &[&str]) -> String {
    let tool = binary
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| binary.display().to_string());
    match args.iter().find(|a| !a.starts_with('-') && !a.contains(':')) {
        Some(verb) => format!("{tool} {verb}"),
        None => tool,
    }
}
