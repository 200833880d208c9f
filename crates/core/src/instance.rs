//! Instance, health, and live device status types.

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// Hypervisor run state as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Unknown,
}

/// One emulated device as projected by the device driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    /// Hypervisor-assigned index.
    pub index: u32,
    /// Control-channel (debug bridge) port.
    pub port: u16,
    pub status: InstanceStatus,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}

/// Host every bridge address is formed against.
pub const DEFAULT_BRIDGE_HOST: &str = "127.0.0.1";

/// Format the bridge address for a control port, e.g. `127.0.0.1:5555`.
pub fn bridge_address(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// Creation options forwarded to the driver when a fresh instance is made.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Driver-specific key/value options (resolution, cpu count, ...).
    #[serde(default)]
    pub options: Vec<(String, String)>,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Probe-derived health of one pool member.
///
/// `healthy` only flips to `false` after `threshold` consecutive failures,
/// so a single missed probe does not mark an instance unhealthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub healthy: bool,
    pub consecutive_errors: u32,
    pub last_check: Option<Timestamp>,
    pub status: InstanceStatus,
}

impl InstanceHealth {
    /// Health for an instance seen for the first time.
    pub fn observed(status: InstanceStatus) -> Self {
        Self {
            healthy: true,
            consecutive_errors: 0,
            last_check: None,
            status,
        }
    }

    pub fn record_success(&mut self, now: Timestamp) {
        self.healthy = true;
        self.consecutive_errors = 0;
        self.last_check = Some(now);
        self.status = InstanceStatus::Running;
    }

    /// Count a failed probe. Returns `true` when this failure is the one
    /// that flipped the instance unhealthy.
    pub fn record_failure(&mut self, now: Timestamp, threshold: u32) -> bool {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_check = Some(now);
        let was_healthy = self.healthy;
        if self.consecutive_errors >= threshold {
            self.healthy = false;
        }
        was_healthy && !self.healthy
    }

    /// A restart went through. The instance counts as healthy again but
    /// keeps its error streak until a probe succeeds, so repeated failed
    /// recoveries still reach the replace threshold.
    pub fn mark_recovered(&mut self, now: Timestamp) {
        self.healthy = true;
        self.last_check = Some(now);
        self.status = InstanceStatus::Running;
    }
}

// ---------------------------------------------------------------------------
// Live device status
// ---------------------------------------------------------------------------

/// Best-effort device metrics. Any field the device would not report is
/// left `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    /// One-minute load average as reported by the guest kernel.
    pub cpu_load: Option<f32>,
    pub memory_used_mb: Option<u64>,
    pub memory_total_mb: Option<u64>,
    pub battery_percent: Option<u8>,
}

impl DeviceMetrics {
    pub fn is_empty(&self) -> bool {
        self.cpu_load.is_none()
            && self.memory_used_mb.is_none()
            && self.memory_total_mb.is_none()
            && self.battery_percent.is_none()
    }
}

/// Per-instance reconciliation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Unknown,
    Stopped,
    RunningDisconnected,
    RunningConnected,
    /// Absent from the hypervisor list. Terminal.
    Removed,
}

impl DeviceState {
    pub fn from_observation(running: bool, connected: bool) -> Self {
        match (running, connected) {
            (false, _) => Self::Stopped,
            (true, false) => Self::RunningDisconnected,
            (true, true) => Self::RunningConnected,
        }
    }

    pub fn is_connected(self) -> bool {
        self == Self::RunningConnected
    }
}

/// Snapshot produced by one reconciler scan for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub running: bool,
    pub connected: bool,
    pub port: u16,
    pub state: DeviceState,
    pub metrics: Option<DeviceMetrics>,
    pub last_check: Timestamp,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
