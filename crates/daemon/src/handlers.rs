//! Concrete operation handlers.
//!
//! - [`ScriptHandler`] (`run_script`): runs a script file with an external
//!   interpreter, piping `{profile, payload}` as JSON on stdin. Stdout is
//!   parsed as JSON when possible and returned as the task result.
//! - [`DeviceShellHandler`] (`device_shell`): runs one shell command on the
//!   profile's device through the debug bridge.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use droidfleet_core::driver::DeviceDriver;
use droidfleet_core::profile::Profile;
use droidfleet_core::subprocess::{run_command, CommandError};
use droidfleet_device::ConsoleDriver;
use droidfleet_scheduler::{HandlerError, OperationHandler};
use serde_json::Value;

/// Longest stderr excerpt carried into an error message.
const STDERR_EXCERPT: usize = 2000;

// ---------------------------------------------------------------------------
// run_script
// ---------------------------------------------------------------------------

pub struct ScriptHandler {
    interpreter: PathBuf,
    timeout: Duration,
}

impl ScriptHandler {
    /// `timeout` bounds the interpreter process; the child is killed when
    /// it expires.
    pub fn new(interpreter: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl OperationHandler for ScriptHandler {
    async fn handle(&self, profile: &Profile, payload: &Value) -> Result<Value, HandlerError> {
        let script = payload
            .get("script")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerError::InvalidPayload("missing \"script\" path".into()))?;

        let input = serde_json::json!({ "profile": profile, "payload": payload });
        let stdin = serde_json::to_vec(&input)
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;

        let mut cmd = tokio::process::Command::new(&self.interpreter);
        cmd.arg(script)
            .env("PROFILE_ID", &profile.id)
            .env("INSTANCE_NAME", &profile.instance_name);
        if let Some(port) = profile.port {
            cmd.env("DEVICE_PORT", port.to_string());
        }

        tracing::debug!(
            profile_id = %profile.id,
            interpreter = %self.interpreter.display(),
            script,
            "Running script",
        );

        let output = run_command(&mut cmd, Some(&stdin), self.timeout)
            .await
            .map_err(|e| match e {
                CommandError::Timeout { elapsed_ms } => HandlerError::Timeout { elapsed_ms },
                other => HandlerError::Failed(format!("Failed to run script: {other}")),
            })?;

        if !output.success() {
            return Err(HandlerError::Failed(format!(
                "Script exited with code {}: {}",
                output.exit_code,
                excerpt(output.stderr.trim()),
            )));
        }

        Ok(serde_json::from_str::<Value>(output.stdout.trim()).unwrap_or_else(|_| {
            serde_json::json!({
                "stdout": output.stdout,
                "duration_ms": output.duration_ms,
            })
        }))
    }
}

// ---------------------------------------------------------------------------
// device_shell
// ---------------------------------------------------------------------------

pub struct DeviceShellHandler {
    driver: Arc<ConsoleDriver>,
}

impl DeviceShellHandler {
    pub fn new(driver: Arc<ConsoleDriver>) -> Self {
        Self { driver }
    }

    /// The profile's recorded port, else the port of its instance in the
    /// driver's last listing.
    async fn port_for(&self, profile: &Profile) -> Result<u16, HandlerError> {
        if let Some(port) = profile.port {
            return Ok(port);
        }
        self.driver
            .get_instances()
            .await
            .into_iter()
            .find(|i| i.name == profile.instance_name)
            .map(|i| i.port)
            .ok_or_else(|| {
                HandlerError::Failed(format!(
                    "No known control port for instance {}",
                    profile.instance_name
                ))
            })
    }
}

#[async_trait::async_trait]
impl OperationHandler for DeviceShellHandler {
    async fn handle(&self, profile: &Profile, payload: &Value) -> Result<Value, HandlerError> {
        let command = shell_command(payload)?;
        let port = self.port_for(profile).await?;
        let address = self.driver.address_for(port);

        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        let stdout = self
            .driver
            .bridge()
            .shell(&address, &args)
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;

        Ok(serde_json::json!({ "address": address, "output": stdout }))
    }
}

/// Accepts `{"command": "ls -l /sdcard"}` or `{"command": ["ls", "-l"]}`.
pub fn shell_command(payload: &Value) -> Result<Vec<String>, HandlerError> {
    let args: Vec<String> = match payload.get("command") {
        Some(Value::String(line)) => line.split_whitespace().map(str::to_string).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    HandlerError::InvalidPayload("command items must be strings".into())
                })
            })
            .collect::<Result<_, _>>()?,
        _ => {
            return Err(HandlerError::InvalidPayload(
                "missing \"command\" (string or array)".into(),
            ))
        }
    };
    if args.is_empty() {
        return Err(HandlerError::InvalidPayload("empty command".into()));
    }
    Ok(args)
}

fn excerpt(s: &str) -> &str {
    match s.char_indices().nth(STDERR_EXCERPT) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
