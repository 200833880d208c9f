//! Daemon configuration from environment variables.
//!
//! Every component config has compiled-in defaults; the environment
//! overrides them. A `.env` file in the working directory is loaded first
//! by the binary.
//!
//! | Variable               | Default          | Description                               |
//! |------------------------|------------------|-------------------------------------------|
//! | `CONSOLE_PATH`         | `ldconsole`      | Hypervisor console binary                 |
//! | `ADB_PATH`             | `adb`            | Debug-bridge binary                       |
//! | `BRIDGE_HOST`          | `127.0.0.1`      | Host part of bridge addresses             |
//! | `BASE_ADB_PORT`        | `5555`           | Control port of instance index 0          |
//! | `COMMAND_TIMEOUT_SECS` | `15`             | Bound on each external command            |
//! | `PROFILES_PATH`        | `profiles.json`  | JSON profile store                        |
//! | `MAX_CONCURRENT_TASKS` | `4`              | Scheduler slots                           |
//! | `TASK_MAX_ATTEMPTS`    | `3`              | Default attempt limit per task            |
//! | `TASK_TIMEOUT_SECS`    | `600`            | Handler timeout per attempt               |
//! | `TICK_INTERVAL_MS`     | `1000`           | Admission tick period                     |
//! | `REMOTE_TASKS_URL`     | --               | Enables remote task intake when set       |
//! | `REMOTE_POLL_SECS`     | `30`             | Remote intake interval                    |
//! | `POOL_MIN`             | `0`              | Pool lower bound                          |
//! | `POOL_MAX`             | `10`             | Pool upper bound                          |
//! | `POOL_TARGET`          | `0`              | Desired pool size                         |
//! | `POOL_AUTOSCALE`       | `false`          | Converge on the target at startup         |
//! | `POOL_TEMPLATE`        | --               | Instance to clone new members from        |
//! | `POOL_NAME_PREFIX`     | `droid`          | Name prefix of new members                |
//! | `PROBE_INTERVAL_SECS`  | `30`             | Pool health probe period                  |
//! | `PROXY_LIST`           | --               | Comma-separated `host:port` rotation      |
//! | `SCAN_INTERVAL_SECS`   | `15`             | Reconciler scan period                    |
//! | `LOG_DIR`              | `logs`           | Device log directory                      |
//! | `LOG_MAX_BYTES`        | `10485760`       | Device log rotation threshold             |
//! | `COLLECT_METRICS`      | `true`           | Read coarse device metrics during scans   |
//! | `SCRIPT_INTERPRETER`   | `python3`        | Interpreter for `run_script` tasks        |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use droidfleet_core::error::CoreError;
use droidfleet_core::pool::PoolConfig;
use droidfleet_device::DriverConfig;
use droidfleet_reconciler::ReconcilerConfig;
use droidfleet_scheduler::remote::DEFAULT_INTAKE_BATCH;
use droidfleet_scheduler::SchedulerConfig;

/// Default remote intake interval.
const DEFAULT_REMOTE_POLL_SECS: u64 = 30;

/// HTTP timeout for remote intake requests.
const REMOTE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("Invalid pool configuration: {0}")]
    Pool(#[from] CoreError),
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub poll_interval: Duration,
    pub batch: usize,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub driver: DriverConfig,
    pub profiles_path: PathBuf,
    pub scheduler: SchedulerConfig,
    /// `None` disables remote intake.
    pub remote: Option<RemoteConfig>,
    pub pool: PoolConfig,
    /// Raw `PROXY_LIST`; `None` disables proxy assignment.
    pub proxy_list: Option<String>,
    pub reconciler: ReconcilerConfig,
    pub script_interpreter: String,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset and blank variables
    /// take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let mut driver = DriverConfig::default();
        if let Some(path) = env.string("CONSOLE_PATH") {
            driver.console_path = PathBuf::from(path);
        }
        if let Some(path) = env.string("ADB_PATH") {
            driver.adb_path = PathBuf::from(path);
        }
        if let Some(host) = env.string("BRIDGE_HOST") {
            driver.bridge_host = host;
        }
        driver.base_port = env.parse("BASE_ADB_PORT", driver.base_port, "a port number")?;
        driver.command_timeout = env.secs("COMMAND_TIMEOUT_SECS", driver.command_timeout)?;

        let profiles_path = env
            .string("PROFILES_PATH")
            .map_or_else(|| PathBuf::from("profiles.json"), PathBuf::from);

        let mut scheduler = SchedulerConfig::default();
        scheduler.max_concurrent_tasks = env.parse(
            "MAX_CONCURRENT_TASKS",
            scheduler.max_concurrent_tasks,
            "a non-negative integer",
        )?;
        scheduler.default_max_attempts = env.parse(
            "TASK_MAX_ATTEMPTS",
            scheduler.default_max_attempts,
            "a non-negative integer",
        )?;
        scheduler.task_timeout = env.secs("TASK_TIMEOUT_SECS", scheduler.task_timeout)?;
        scheduler.tick_interval = Duration::from_millis(env.parse(
            "TICK_INTERVAL_MS",
            scheduler.tick_interval.as_millis() as u64,
            "a number of milliseconds",
        )?);

        let remote = match env.string("REMOTE_TASKS_URL") {
            Some(url) => Some(RemoteConfig {
                url,
                poll_interval: env.secs(
                    "REMOTE_POLL_SECS",
                    Duration::from_secs(DEFAULT_REMOTE_POLL_SECS),
                )?,
                batch: DEFAULT_INTAKE_BATCH,
                request_timeout: REMOTE_REQUEST_TIMEOUT,
            }),
            None => None,
        };

        let mut pool = PoolConfig::default();
        pool.min_instances = env.parse("POOL_MIN", pool.min_instances, "a non-negative integer")?;
        pool.max_instances = env.parse("POOL_MAX", pool.max_instances, "a non-negative integer")?;
        pool.target_instances =
            env.parse("POOL_TARGET", pool.target_instances, "a non-negative integer")?;
        pool.autoscale = env.flag("POOL_AUTOSCALE", pool.autoscale)?;
        pool.template.clone_from = env.string("POOL_TEMPLATE");
        if let Some(prefix) = env.string("POOL_NAME_PREFIX") {
            pool.template.name_prefix = prefix;
        }
        pool.probe_interval = env.secs("PROBE_INTERVAL_SECS", pool.probe_interval)?;
        pool.validate()?;

        let mut reconciler = ReconcilerConfig::default();
        reconciler.scan_interval = env.secs("SCAN_INTERVAL_SECS", reconciler.scan_interval)?;
        if let Some(dir) = env.string("LOG_DIR") {
            reconciler.log_dir = PathBuf::from(dir);
        }
        reconciler.max_log_bytes =
            env.parse("LOG_MAX_BYTES", reconciler.max_log_bytes, "a byte count")?;
        reconciler.collect_metrics = env.flag("COLLECT_METRICS", reconciler.collect_metrics)?;

        let script_interpreter = env
            .string("SCRIPT_INTERPRETER")
            .unwrap_or_else(|| "python3".to_string());

        Ok(Self {
            driver,
            profiles_path,
            scheduler,
            remote,
            pool,
            proxy_list: env.string("PROXY_LIST"),
            reconciler,
            script_interpreter,
        })
    }
}

// ---- private helpers ----

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(
        &self,
        var: &'static str,
        default: T,
        expected: &'static str,
    ) -> Result<T, ConfigError> {
        match self.string(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var,
                expected,
                value,
            }),
        }
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(var, default.as_secs(), "a number of seconds")
            .map(Duration::from_secs)
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.string(var) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var,
                    expected: "a boolean",
                    value,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<DaemonConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaemonConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.driver.console_path, PathBuf::from("ldconsole"));
        assert_eq!(config.driver.base_port, 5555);
        assert_eq!(config.scheduler.max_concurrent_tasks, 4);
        assert_eq!(config.scheduler.default_max_attempts, 3);
        assert_eq!(config.scheduler.task_timeout, Duration::from_secs(600));
        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(1000));
        assert!(config.remote.is_none());
        assert_eq!(config.pool.max_instances, 10);
        assert!(!config.pool.autoscale);
        assert_eq!(config.reconciler.scan_interval, Duration::from_secs(15));
        assert_eq!(config.reconciler.max_log_bytes, 10 * 1024 * 1024);
        assert_eq!(config.script_interpreter, "python3");
        assert_eq!(config.proxy_list, None);
    }

    #[test]
    fn overrides_are_applied() {
        let config = from_pairs(&[
            ("BASE_ADB_PORT", "6000"),
            ("MAX_CONCURRENT_TASKS", "8"),
            ("TICK_INTERVAL_MS", "250"),
            ("REMOTE_TASKS_URL", "http://tasks:8080/api"),
            ("REMOTE_POLL_SECS", "5"),
            ("POOL_MIN", "1"),
            ("POOL_TARGET", "3"),
            ("POOL_AUTOSCALE", "yes"),
            ("POOL_TEMPLATE", "golden"),
            ("COLLECT_METRICS", "0"),
            ("PROXY_LIST", "10.0.0.1:8080, 10.0.0.2:8080"),
        ])
        .unwrap();

        assert_eq!(config.driver.base_port, 6000);
        assert_eq!(config.scheduler.max_concurrent_tasks, 8);
        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(250));
        let remote = config.remote.unwrap();
        assert_eq!(remote.url, "http://tasks:8080/api");
        assert_eq!(remote.poll_interval, Duration::from_secs(5));
        assert_eq!(config.pool.target_instances, 3);
        assert!(config.pool.autoscale);
        assert_eq!(config.pool.template.clone_from.as_deref(), Some("golden"));
        assert!(!config.reconciler.collect_metrics);
        assert!(config.proxy_list.is_some());
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = from_pairs(&[("REMOTE_TASKS_URL", "  "), ("POOL_MAX", "")]).unwrap();
        assert!(config.remote.is_none());
        assert_eq!(config.pool.max_instances, 10);
    }

    #[test]
    fn malformed_number_is_rejected() {
        let err = from_pairs(&[("BASE_ADB_PORT", "70000")]).unwrap_err();
        assert_matches!(err, ConfigError::Invalid { var: "BASE_ADB_PORT", .. });
    }

    #[test]
    fn malformed_flag_is_rejected() {
        let err = from_pairs(&[("POOL_AUTOSCALE", "sometimes")]).unwrap_err();
        assert_matches!(err, ConfigError::Invalid { var: "POOL_AUTOSCALE", .. });
    }

    #[test]
    fn inconsistent_pool_bounds_are_rejected() {
        let err = from_pairs(&[("POOL_MIN", "5"), ("POOL_TARGET", "2")]).unwrap_err();
        assert_matches!(err, ConfigError::Pool(CoreError::Validation(_)));
    }
}
