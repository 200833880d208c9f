//! Bounded reconnection for a single device.
//!
//! Unlike a long-lived connection loop, repair runs inside a scan and must
//! finish quickly: one connect attempt, at most one retry after a short
//! delay, each attempt under its own timeout. Whether the connection
//! actually came up is decided afterwards by re-reading the bridge list,
//! not by the connect call's return value.

use std::future::Future;
use std::time::{Duration, Instant};

use droidfleet_core::driver::{DeviceDriver, DeviceError};

/// Tunable parameters for the repair sequence.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Pause after dropping the stale bridge entry.
    pub settle_delay: Duration,
    /// Upper bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Pause before the retry.
    pub retry_delay: Duration,
    /// Total connect attempts, including the first.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(2),
            max_attempts: 2,
        }
    }
}

/// Run `fut` under `limit`, reporting expiry as [`DeviceError::Timeout`].
pub async fn bounded<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T, DeviceError>
where
    F: Future<Output = Result<T, DeviceError>>,
{
    let start = Instant::now();
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::Timeout {
            operation: operation.to_string(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        }),
    }
}

/// Try to connect the bridge to `port`, retrying per `config`.
///
/// Returns the last error when every attempt fails. Success here only
/// means the bridge accepted the request; callers must re-verify.
pub async fn connect_with_retry(
    driver: &dyn DeviceDriver,
    port: u16,
    config: &ReconnectConfig,
) -> Result<u32, DeviceError> {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match bounded("bridge connect", config.connect_timeout, driver.connect(port)).await {
            Ok(()) => {
                tracing::debug!(port, attempt, "Bridge accepted connect");
                return Ok(attempt);
            }
            Err(e) if attempt < max_attempts => {
                tracing::warn!(port, attempt, error = %e, "Connect attempt failed, retrying");
                tokio::time::sleep(config.retry_delay).await;
            }
            Err(e) => {
                tracing::warn!(port, attempt, error = %e, "Connect attempts exhausted");
                return Err(e);
            }
        }
    }
}
