//! [`ConsoleDriver`]: the [`DeviceDriver`] implementation used in
//! production.
//!
//! Instance indices come from the console; control ports are derived from
//! them (`base_port + index * port_stride`), which is how the hypervisor
//! assigns bridge ports. Because indices can be reassigned when instances
//! are added or removed, [`DeviceDriver::resolve_control_port`] always
//! re-lists rather than trusting the cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use droidfleet_core::driver::{DeviceDriver, DeviceError, LogStream};
use droidfleet_core::instance::{
    bridge_address, DeviceMetrics, Instance, InstanceSpec, InstanceStatus, DEFAULT_BRIDGE_HOST,
};
use tokio::sync::RwLock;

use crate::bridge::DebugBridge;
use crate::console::{ConsoleEntry, HypervisorConsole};

/// Port of the instance with index 0.
pub const DEFAULT_BASE_PORT: u16 = 5555;

/// Port distance between consecutive instance indices.
pub const DEFAULT_PORT_STRIDE: u16 = 2;

/// Default bound on any single console or bridge invocation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub console_path: PathBuf,
    pub adb_path: PathBuf,
    pub bridge_host: String,
    pub base_port: u16,
    pub port_stride: u16,
    pub command_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            console_path: PathBuf::from("ldconsole"),
            adb_path: PathBuf::from("adb"),
            bridge_host: DEFAULT_BRIDGE_HOST.to_string(),
            base_port: DEFAULT_BASE_PORT,
            port_stride: DEFAULT_PORT_STRIDE,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl DriverConfig {
    /// Control port for a hypervisor index. Saturates instead of wrapping
    /// for absurd indices.
    pub fn port_for_index(&self, index: u32) -> u16 {
        let port = u32::from(self.base_port)
            .saturating_add(index.saturating_mul(u32::from(self.port_stride)));
        u16::try_from(port).unwrap_or(u16::MAX)
    }
}

/// Drives instances through the hypervisor console and debug bridge.
pub struct ConsoleDriver {
    config: DriverConfig,
    console: HypervisorConsole,
    bridge: DebugBridge,
    /// Last listing, keyed by instance name.
    instances: RwLock<HashMap<String, Instance>>,
}

impl ConsoleDriver {
    pub fn new(config: DriverConfig) -> Self {
        let console = HypervisorConsole::new(config.console_path.clone(), config.command_timeout);
        let bridge = DebugBridge::new(config.adb_path.clone(), config.command_timeout);
        Self {
            config,
            console,
            bridge,
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Direct bridge access for handlers that run device commands.
    pub fn bridge(&self) -> &DebugBridge {
        &self.bridge
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn to_instance(&self, entry: &ConsoleEntry) -> Instance {
        Instance {
            name: entry.name.clone(),
            index: entry.index,
            port: self.config.port_for_index(entry.index),
            status: if entry.running {
                InstanceStatus::Running
            } else {
                InstanceStatus::Stopped
            },
        }
    }

    /// Refresh after a mutating console call. A failed refresh leaves the
    /// previous cache in place; the next reconciler scan will retry.
    async fn refresh_after(&self, operation: &str) {
        if let Err(e) = self.refresh_from_hypervisor().await {
            tracing::warn!(operation, error = %e, "Instance list refresh failed");
        }
    }
}

#[async_trait::async_trait]
impl DeviceDriver for ConsoleDriver {
    async fn create_instance(&self, name: &str, spec: &InstanceSpec) -> Result<(), DeviceError> {
        tracing::info!(instance = %name, "Creating instance");
        self.console.add(name).await?;
        self.console.modify(name, &spec.options).await?;
        self.refresh_after("create").await;
        Ok(())
    }

    async fn clone_instance(&self, source: &str, target: &str) -> Result<(), DeviceError> {
        tracing::info!(source = %source, target = %target, "Cloning instance");
        self.console.copy(target, source).await?;
        self.refresh_after("clone").await;
        Ok(())
    }

    async fn remove_instance(&self, name: &str) -> Result<(), DeviceError> {
        tracing::info!(instance = %name, "Removing instance");
        self.console.remove(name).await?;
        self.instances.write().await.remove(name);
        self.refresh_after("remove").await;
        Ok(())
    }

    async fn launch_instance(&self, name: &str) -> Result<(), DeviceError> {
        tracing::info!(instance = %name, "Launching instance");
        self.console.launch(name).await
    }

    async fn stop_instance(&self, name: &str) -> Result<(), DeviceError> {
        tracing::info!(instance = %name, "Stopping instance");
        self.console.quit(name).await
    }

    async fn get_instances(&self) -> Vec<Instance> {
        let mut list: Vec<Instance> = self.instances.read().await.values().cloned().collect();
        list.sort_by_key(|i| i.index);
        list
    }

    async fn refresh_from_hypervisor(&self) -> Result<Vec<Instance>, DeviceError> {
        let entries = self
            .console
            .list()
            .await
            .map_err(|e| DeviceError::Unavailable(format!("hypervisor listing failed: {e}")))?;

        let fresh: HashMap<String, Instance> = entries
            .iter()
            .map(|entry| (entry.name.clone(), self.to_instance(entry)))
            .collect();

        let mut list: Vec<Instance> = fresh.values().cloned().collect();
        list.sort_by_key(|i| i.index);

        *self.instances.write().await = fresh;
        tracing::debug!(count = list.len(), "Instance list refreshed");
        Ok(list)
    }

    async fn resolve_control_port(&self, name: &str) -> Result<u16, DeviceError> {
        let entries = self.console.list().await?;
        let entry = entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| DeviceError::InstanceNotFound(name.to_string()))?;

        let instance = self.to_instance(entry);
        let port = instance.port;
        self.instances
            .write()
            .await
            .insert(instance.name.clone(), instance);
        Ok(port)
    }

    async fn connect(&self, port: u16) -> Result<(), DeviceError> {
        let address = self.address_for(port);
        self.bridge.connect(&address, self.config.command_timeout).await
    }

    async fn disconnect(&self, address: &str) -> Result<(), DeviceError> {
        self.bridge.disconnect(address).await
    }

    async fn list_connected_addresses(&self) -> Result<Vec<String>, DeviceError> {
        self.bridge.devices().await
    }

    async fn run_liveness_probe(&self, port: u16) -> Result<(), DeviceError> {
        self.bridge.liveness(&self.address_for(port)).await
    }

    async fn read_coarse_metrics(&self, port: u16) -> Result<DeviceMetrics, DeviceError> {
        let metrics = self.bridge.metrics(&self.address_for(port)).await;
        if metrics.is_empty() {
            Err(DeviceError::Unavailable(format!(
                "no metrics readable on port {port}"
            )))
        } else {
            Ok(metrics)
        }
    }

    async fn open_log_stream(&self, address: &str) -> Result<LogStream, DeviceError> {
        self.bridge.logcat(address)
    }

    fn address_for(&self, port: u16) -> String {
        bridge_address(&self.config.bridge_host, port)
    }
}
