use std::path::PathBuf;
use std::time::Duration;

use crate::reconnect::ReconnectConfig;

/// Default period between scans.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(15);

/// Default size at which a device log file is rotated (10 MiB).
pub const DEFAULT_MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub scan_interval: Duration,
    /// Directory holding one `<instance>.log` per streamed device.
    pub log_dir: PathBuf,
    pub max_log_bytes: u64,
    pub collect_metrics: bool,
    pub metrics_timeout: Duration,
    /// Bound on listing, resolving and bridge queries inside a scan.
    pub step_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            scan_interval: DEFAULT_SCAN_INTERVAL,
            log_dir: PathBuf::from("logs"),
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            collect_metrics: true,
            metrics_timeout: Duration::from_secs(5),
            step_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}
