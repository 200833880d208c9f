//! Hypervisor console wrapper.
//!
//! The console tool is addressed with LDPlayer-style verbs:
//!
//! | Operation | Invocation                                   |
//! |-----------|----------------------------------------------|
//! | list      | `list2`                                      |
//! | create    | `add --name <name>`                          |
//! | clone     | `copy --name <target> --from <source>`       |
//! | configure | `modify --name <name> --<key> <value> ...`   |
//! | launch    | `launch --name <name>`                       |
//! | stop      | `quit --name <name>`                         |
//! | remove    | `remove --name <name>`                       |

use std::path::PathBuf;
use std::time::Duration;

use droidfleet_core::driver::DeviceError;

use crate::exec::exec_tool;

/// One row of `list2` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleEntry {
    pub index: u32,
    pub name: String,
    /// Android has finished booting inside the instance.
    pub running: bool,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct HypervisorConsole {
    binary: PathBuf,
    timeout: Duration,
}

impl HypervisorConsole {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub async fn list(&self) -> Result<Vec<ConsoleEntry>, DeviceError> {
        let output = exec_tool(&self.binary, &["list2"], self.timeout).await?;
        Ok(parse_list2(&output.stdout))
    }

    pub async fn add(&self, name: &str) -> Result<(), DeviceError> {
        self.named("add", name).await
    }

    pub async fn copy(&self, target: &str, source: &str) -> Result<(), DeviceError> {
        exec_tool(
            &self.binary,
            &["copy", "--name", target, "--from", source],
            self.timeout,
        )
        .await
        .map(drop)
    }

    /// Apply creation options (`--key value` pairs).
    pub async fn modify(&self, name: &str, options: &[(String, String)]) -> Result<(), DeviceError> {
        if options.is_empty() {
            return Ok(());
        }
        let flags: Vec<String> = options.iter().map(|(k, _)| format!("--{k}")).collect();
        let mut args: Vec<&str> = vec!["modify", "--name", name];
        for (flag, (_, value)) in flags.iter().zip(options) {
            args.push(flag);
            args.push(value);
        }
        exec_tool(&self.binary, &args, self.timeout).await.map(drop)
    }

    pub async fn launch(&self, name: &str) -> Result<(), DeviceError> {
        self.named("launch", name).await
    }

    pub async fn quit(&self, name: &str) -> Result<(), DeviceError> {
        self.named("quit", name).await
    }

    pub async fn remove(&self, name: &str) -> Result<(), DeviceError> {
        self.named("remove", name).await
    }

    async fn named(&self, verb: &str, name: &str) -> Result<(), DeviceError> {
        exec_tool(&self.binary, &[verb, "--name", name], self.timeout)
            .await
            .map(drop)
    }
}

/// Parse `list2` output.
///
/// Each line is `index,title,top_hwnd,bind_hwnd,android_started,pid,vbox_pid[,...]`.
/// Lines that do not match are skipped with a warning rather than failing
/// the whole listing.
pub fn parse_list2(output: &str) -> Vec<ConsoleEntry> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let entry = parse_list2_line(line);
            if entry.is_none() {
                tracing::warn!(line, "Skipping unparseable console list line");
            }
            entry
        })
        .collect()
}

fn parse_list2_line(line: &str) -> Option<ConsoleEntry> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 7 {
        return None;
    }
    let index = fields[0].parse().ok()?;
    let name = fields[1];
    if name.is_empty() {
        return None;
    }
    let running = fields[4] == "1";
    let pid = fields[5].parse::<i64>().ok().filter(|p| *p > 0).map(|p| p as u32);

    Some(ConsoleEntry {
        index,
        name: name.to_string(),
        running,
        pid,
    })
}
