//! Device driver capability.
//!
//! [`DeviceDriver`] is the seam between the orchestration components and
//! whatever actually talks to the hypervisor and debug bridge. Every method
//! is a suspension point; implementations are expected to bound each call
//! with a timeout and report it as [`DeviceError::Timeout`].

use futures::stream::BoxStream;

use crate::instance::{DeviceMetrics, Instance, InstanceSpec};

/// Stream of log lines from one device. Ends when the device goes away.
pub type LogStream = BoxStream<'static, String>;

/// Errors surfaced by a device driver.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// An external command did not finish in time and was killed.
    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout {
        operation: String,
        elapsed_ms: u64,
    },

    /// An external command ran but reported failure.
    #[error("{command} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The external tool could not be started at all.
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The hypervisor does not know this instance.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Tool output could not be understood.
    #[error("Unexpected output: {0}")]
    Parse(String),

    /// The hypervisor or bridge is unreachable as a whole.
    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl DeviceError {
    /// Timeouts and exec failures are worth retrying on the next cycle;
    /// a missing instance or garbled output is not going to fix itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::CommandFailed { .. } | Self::Spawn { .. } | Self::Unavailable(_)
        )
    }
}

/// Operations the orchestration core needs from the device layer.
#[async_trait::async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Create a fresh instance.
    async fn create_instance(&self, name: &str, spec: &InstanceSpec) -> Result<(), DeviceError>;

    /// Clone `source` into a new instance named `target`.
    async fn clone_instance(&self, source: &str, target: &str) -> Result<(), DeviceError>;

    async fn remove_instance(&self, name: &str) -> Result<(), DeviceError>;

    async fn launch_instance(&self, name: &str) -> Result<(), DeviceError>;

    async fn stop_instance(&self, name: &str) -> Result<(), DeviceError>;

    /// The driver's cached instance list as of the last refresh.
    async fn get_instances(&self) -> Vec<Instance>;

    /// Re-read the instance list from the hypervisor, replacing the cache.
    async fn refresh_from_hypervisor(&self) -> Result<Vec<Instance>, DeviceError>;

    /// Ask the hypervisor for the instance's current control port. Never
    /// answered from cache.
    async fn resolve_control_port(&self, name: &str) -> Result<u16, DeviceError>;

    /// Connect the bridge to the instance listening on `port`.
    async fn connect(&self, port: u16) -> Result<(), DeviceError>;

    /// Drop a bridge connection by address (`host:port`).
    async fn disconnect(&self, address: &str) -> Result<(), DeviceError>;

    /// Addresses the bridge currently reports as usable.
    async fn list_connected_addresses(&self) -> Result<Vec<String>, DeviceError>;

    /// Lightweight round-trip through the bridge.
    async fn run_liveness_probe(&self, port: u16) -> Result<(), DeviceError>;

    async fn read_coarse_metrics(&self, port: u16) -> Result<DeviceMetrics, DeviceError>;

    /// Start following the device log at `address`.
    async fn open_log_stream(&self, address: &str) -> Result<LogStream, DeviceError>;

    /// Address a control port is reachable at through the bridge.
    fn address_for(&self, port: u16) -> String {
        crate::instance::bridge_address(crate::instance::DEFAULT_BRIDGE_HOST, port)
    }
}
