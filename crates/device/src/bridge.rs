//! Debug bridge wrapper.
//!
//! Thin async wrapper over an `adb`-compatible binary. Connection state is
//! always read back from `devices`; `connect` exits 0 even when it fails,
//! so its stdout is inspected instead of the exit code.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use droidfleet_core::driver::{DeviceError, LogStream};
use droidfleet_core::instance::DeviceMetrics;
use futures::StreamExt;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::SplitStream;

use crate::exec::{describe, exec_tool, exec_tool_unchecked};

const BYTES_PER_KB: u64 = 1024;

static BATTERY_LEVEL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*level:\s*(\d+)").ok());

#[derive(Debug, Clone)]
pub struct DebugBridge {
    binary: PathBuf,
    timeout: Duration,
}

impl DebugBridge {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// `connect <address>` bounded by `timeout`.
    pub async fn connect(&self, address: &str, timeout: Duration) -> Result<(), DeviceError> {
        let output = exec_tool_unchecked(&self.binary, &["connect", address], timeout).await?;
        let stdout = output.stdout.to_lowercase();
        if output.success()
            && (stdout.contains("connected to") || stdout.contains("already connected"))
            && !stdout.contains("cannot")
            && !stdout.contains("failed")
        {
            Ok(())
        } else {
            Err(DeviceError::CommandFailed {
                command: describe(&self.binary, &["connect"]),
                exit_code: output.exit_code,
                stderr: first_nonempty(&output.stdout, &output.stderr),
            })
        }
    }

    pub async fn disconnect(&self, address: &str) -> Result<(), DeviceError> {
        exec_tool(&self.binary, &["disconnect", address], self.timeout)
            .await
            .map(drop)
    }

    /// Addresses in the `device` state. `offline` and `unauthorized`
    /// entries are not usable and are left out.
    pub async fn devices(&self) -> Result<Vec<String>, DeviceError> {
        let output = exec_tool(&self.binary, &["devices"], self.timeout).await?;
        Ok(parse_devices(&output.stdout))
    }

    /// Run a shell command on the device at `address`, returning stdout.
    pub async fn shell(&self, address: &str, command: &[&str]) -> Result<String, DeviceError> {
        self.shell_with_timeout(address, command, self.timeout).await
    }

    pub async fn shell_with_timeout(
        &self,
        address: &str,
        command: &[&str],
        timeout: Duration,
    ) -> Result<String, DeviceError> {
        let mut args = vec!["-s", address, "shell"];
        args.extend_from_slice(command);
        let output = exec_tool(&self.binary, &args, timeout).await?;
        Ok(output.stdout)
    }

    /// Round-trip `echo ok` through the device shell.
    pub async fn liveness(&self, address: &str) -> Result<(), DeviceError> {
        let stdout = self.shell(address, &["echo", "ok"]).await?;
        if stdout.trim() == "ok" {
            Ok(())
        } else {
            Err(DeviceError::Parse(format!(
                "liveness probe returned {:?}",
                stdout.trim()
            )))
        }
    }

    /// Read load, memory and battery. Each read is independent; a failed
    /// read leaves its fields `None`.
    pub async fn metrics(&self, address: &str) -> DeviceMetrics {
        let (load, meminfo, battery) = tokio::join!(
            self.shell(address, &["cat", "/proc/loadavg"]),
            self.shell(address, &["cat", "/proc/meminfo"]),
            self.shell(address, &["dumpsys", "battery"]),
        );

        let (memory_used_mb, memory_total_mb) = meminfo
            .ok()
            .map(|out| parse_meminfo(&out))
            .unwrap_or((None, None));

        DeviceMetrics {
            cpu_load: load.ok().and_then(|out| parse_loadavg(&out)),
            memory_used_mb,
            memory_total_mb,
            battery_percent: battery.ok().and_then(|out| parse_battery_level(&out)),
        }
    }

    /// Follow `logcat` on the device, starting from the newest buffered
    /// line so a restarted capture does not replay the ring buffer. The
    /// child process lives as long as the returned stream and is killed
    /// when the stream is dropped.
    pub fn logcat(&self, address: &str) -> Result<LogStream, DeviceError> {
        let mut child = Command::new(&self.binary)
            .args(["-s", address, "logcat", "-v", "time", "-T", "1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DeviceError::Spawn {
                command: describe(&self.binary, &["logcat"]),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::Unavailable("logcat stdout was not captured".into()))?;

        // Split on raw bytes: app output is not guaranteed to be UTF-8.
        let lines = SplitStream::new(BufReader::new(stdout).split(b'\n'))
            .take_while(|chunk| futures::future::ready(chunk.is_ok()))
            .filter_map(|chunk| futures::future::ready(chunk.ok()))
            .map(move |bytes| {
                // Holding the child here ties its lifetime to the stream.
                let _keep_alive = &child;
                decode_log_line(&bytes)
            });

        Ok(lines.boxed())
    }
}

/// One logcat line, invalid UTF-8 replaced and the trailing `\r` dropped.
pub fn decode_log_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_string()
}

fn first_nonempty(a: &str, b: &str) -> String {
    let a = a.trim();
    if a.is_empty() {
        b.trim().to_string()
    } else {
        a.to_string()
    }
}

// ---------------------------------------------------------------------------
// Output parsers
// ---------------------------------------------------------------------------

/// Parse `devices` output into the serials/addresses in `device` state.
pub fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && !line.starts_with("List of devices") && !line.starts_with('*')
        })
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            (state == "device").then(|| serial.to_string())
        })
        .collect()
}

/// First field of `/proc/loadavg`.
pub fn parse_loadavg(output: &str) -> Option<f32> {
    output.split_whitespace().next()?.parse().ok()
}

/// `(used_mb, total_mb)` from `/proc/meminfo`. Used is total minus
/// available.
pub fn parse_meminfo(output: &str) -> (Option<u64>, Option<u64>) {
    let field = |key: &str| -> Option<u64> {
        output
            .lines()
            .find(|line| line.starts_with(key))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()
    };
    let total_kb = field("MemTotal:");
    let available_kb = field("MemAvailable:");

    let total_mb = total_kb.map(|kb| kb / BYTES_PER_KB);
    let used_mb = match (total_kb, available_kb) {
        (Some(total), Some(avail)) => Some(total.saturating_sub(avail) / BYTES_PER_KB),
        _ => None,
    };
    (used_mb, total_mb)
}

/// `level: N` from `dumpsys battery`, clamped to 0..=100.
pub fn parse_battery_level(output: &str) -> Option<u8> {
    let level: u32 = BATTERY_LEVEL_RE
        .as_ref()?
        .captures(output)?
        .get(1)?
        .as_str()
        .parse()
        .ok()?;
    Some(level.min(100) as u8)
}
