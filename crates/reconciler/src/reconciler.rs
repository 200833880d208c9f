//! Periodic ground-truth reconciliation.
//!
//! Each scan re-reads the hypervisor's instance list and the bridge's
//! connected set, derives a [`DeviceStatus`] per instance, and repairs
//! instances that are running but not connected. Repair never trusts a
//! cached port: the authoritative port is re-resolved first, and the
//! connection is only considered up once the bridge list says so.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use droidfleet_core::driver::{DeviceDriver, DeviceError};
use droidfleet_core::event_names;
use droidfleet_core::instance::{DeviceMetrics, DeviceState, DeviceStatus, Instance};
use droidfleet_core::profile::ProfileStore;
use droidfleet_events::{EventBus, FleetEvent};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::ReconcilerConfig;
use crate::log_stream::{self, LogStreamer};
use crate::reconnect::{bounded, connect_with_retry};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Hypervisor unreachable: {0}")]
    HypervisorUnavailable(#[source] DeviceError),

    #[error("Unknown instance: {0}")]
    UnknownInstance(String),

    #[error("Device log I/O failed: {0}")]
    Log(#[from] std::io::Error),
}

/// Outcome counts of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub checked: usize,
    pub repaired: usize,
    pub failed_repairs: usize,
    pub port_changes: usize,
    pub removed: usize,
}

/// Result of examining one instance within a scan.
struct Examined {
    name: String,
    status: DeviceStatus,
    repair: Option<RepairOutcome>,
}

struct RepairOutcome {
    connected: bool,
    port_changed: bool,
}

pub struct DeviceReconciler {
    driver: Arc<dyn DeviceDriver>,
    profiles: Option<Arc<dyn ProfileStore>>,
    bus: Arc<EventBus>,
    config: ReconcilerConfig,
    /// Latest status per instance name. Removed instances stay with
    /// [`DeviceState::Removed`] until the name reappears.
    statuses: RwLock<HashMap<String, DeviceStatus>>,
    streamer: LogStreamer,
}

impl DeviceReconciler {
    pub fn new(driver: Arc<dyn DeviceDriver>, bus: Arc<EventBus>, config: ReconcilerConfig) -> Self {
        let streamer = LogStreamer::new(config.log_dir.clone(), config.max_log_bytes);
        Self {
            driver,
            profiles: None,
            bus,
            config,
            statuses: RwLock::new(HashMap::new()),
            streamer,
        }
    }

    /// Write corrected ports back through `profiles`.
    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileStore>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    /// Run scans every `scan_interval` until `cancel` fires, then stop all
    /// log streams.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        tracing::info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            "Device reconciler started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Device reconciler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.scan().await {
                        Ok(report) => tracing::debug!(?report, "Scan complete"),
                        Err(e) => tracing::error!(error = %e, "Scan failed"),
                    }
                }
            }
        }

        self.streamer.stop_all().await;
    }

    /// One reconciliation pass.
    ///
    /// Fails only when the hypervisor itself cannot be listed. A failed
    /// bridge query is treated as "nothing connected" for this pass.
    pub async fn scan(&self) -> Result<ScanReport, ReconcileError> {
        let instances = bounded(
            "hypervisor refresh",
            self.config.step_timeout,
            self.driver.refresh_from_hypervisor(),
        )
        .await
        .map_err(ReconcileError::HypervisorUnavailable)?;

        let connected: HashSet<String> = match bounded(
            "bridge devices",
            self.config.step_timeout,
            self.driver.list_connected_addresses(),
        )
        .await
        {
            Ok(addresses) => addresses.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Bridge device list unavailable, treating all as disconnected");
                HashSet::new()
            }
        };

        // Persisted ports first, so drift across a restart is still written back.
        let stored_ports = self.stored_ports().await;
        let previous_ports: HashMap<String, u16> = self
            .statuses
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.state != DeviceState::Removed)
            .map(|(name, s)| (name.clone(), s.port))
            .collect();

        let examined = futures::future::join_all(instances.iter().map(|instance| {
            let cached_port = stored_ports
                .get(&instance.name)
                .or_else(|| previous_ports.get(&instance.name))
                .copied()
                .unwrap_or(instance.port);
            self.examine(instance, cached_port, &connected)
        }))
        .await;

        let mut report = ScanReport {
            checked: examined.len(),
            ..Default::default()
        };

        for item in &examined {
            if let Some(outcome) = &item.repair {
                if outcome.connected {
                    report.repaired += 1;
                } else {
                    report.failed_repairs += 1;
                }
                if outcome.port_changed {
                    report.port_changes += 1;
                }
            }
            self.sync_log_stream(&item.name, &item.status).await;
        }

        let present: HashSet<&str> = instances.iter().map(|i| i.name.as_str()).collect();
        let mut statuses = self.statuses.write().await;
        for item in examined {
            statuses.insert(item.name, item.status);
        }

        let newly_removed: Vec<String> = statuses
            .iter()
            .filter(|(name, s)| !present.contains(name.as_str()) && s.state != DeviceState::Removed)
            .map(|(name, _)| name.clone())
            .collect();
        let now = Utc::now();
        for name in &newly_removed {
            if let Some(status) = statuses.get_mut(name) {
                status.running = false;
                status.connected = false;
                status.metrics = None;
                status.state = DeviceState::Removed;
                status.last_check = now;
            }
        }
        drop(statuses);

        for name in &newly_removed {
            self.streamer.stop(name).await;
            tracing::info!(instance = %name, "Instance no longer reported by hypervisor");
            self.bus.publish(
                FleetEvent::new(event_names::DEVICE_REMOVED).with_subject("device", name),
            );
        }
        report.removed = newly_removed.len();

        Ok(report)
    }

    /// Latest status for `name`.
    pub async fn status(&self, name: &str) -> Option<DeviceStatus> {
        self.statuses.read().await.get(name).cloned()
    }

    /// All known statuses, ordered by name.
    pub async fn statuses(&self) -> BTreeMap<String, DeviceStatus> {
        self.statuses
            .read()
            .await
            .iter()
            .map(|(name, s)| (name.clone(), s.clone()))
            .collect()
    }

    pub async fn is_streaming(&self, name: &str) -> bool {
        self.streamer.is_streaming(name).await
    }

    /// Last `lines` lines of the device log for `name`.
    pub async fn tail_logs(&self, name: &str, lines: usize) -> Result<Vec<String>, ReconcileError> {
        self.ensure_known(name).await?;
        Ok(log_stream::tail(&self.streamer.log_path(name), lines).await?)
    }

    /// Truncate the device log for `name` and drop its rotated file.
    pub async fn clear_logs(&self, name: &str) -> Result<(), ReconcileError> {
        self.ensure_known(name).await?;
        log_stream::clear(&self.streamer.log_path(name)).await?;
        tracing::info!(instance = %name, "Cleared device log");
        Ok(())
    }

    /// Stop every log stream.
    pub async fn shutdown(&self) {
        self.streamer.stop_all().await;
    }

    // ---- private helpers ----

    async fn ensure_known(&self, name: &str) -> Result<(), ReconcileError> {
        if self.statuses.read().await.contains_key(name) {
            Ok(())
        } else {
            Err(ReconcileError::UnknownInstance(name.to_string()))
        }
    }

    async fn examine(
        &self,
        instance: &Instance,
        cached_port: u16,
        connected_set: &HashSet<String>,
    ) -> Examined {
        let running = instance.is_running();
        let mut port = cached_port;
        let mut connected = running && connected_set.contains(&self.driver.address_for(port));
        let mut repair = None;

        if running && !connected {
            // Any capture from before the drop is tied to the old address.
            self.streamer.stop(&instance.name).await;
            let (resolved, outcome) = self.repair(&instance.name, cached_port).await;
            port = resolved;
            connected = outcome.connected;
            repair = Some(outcome);
        }

        let metrics = if connected && self.config.collect_metrics {
            self.collect_metrics(&instance.name, port).await
        } else {
            None
        };

        Examined {
            name: instance.name.clone(),
            status: DeviceStatus {
                running,
                connected,
                port,
                state: DeviceState::from_observation(running, connected),
                metrics,
                last_check: Utc::now(),
            },
            repair,
        }
    }

    /// Re-resolve, persist, drop the stale entry, reconnect, verify.
    /// Returns the port the instance should be tracked under.
    async fn repair(&self, name: &str, cached_port: u16) -> (u16, RepairOutcome) {
        let step_timeout = self.config.step_timeout;
        let reconnect = &self.config.reconnect;

        let port = match bounded(
            "resolve control port",
            step_timeout,
            self.driver.resolve_control_port(name),
        )
        .await
        {
            Ok(port) => port,
            Err(e) => {
                self.repair_failed(name, cached_port, &format!("port resolution failed: {e}"));
                return (
                    cached_port,
                    RepairOutcome {
                        connected: false,
                        port_changed: false,
                    },
                );
            }
        };

        let port_changed = port != cached_port;
        if port_changed {
            tracing::warn!(
                instance = %name,
                old_port = cached_port,
                new_port = port,
                "Control port changed",
            );
            self.persist_port(name, port).await;
            self.bus.publish(
                FleetEvent::new(event_names::DEVICE_PORT_CHANGED)
                    .with_subject("device", name)
                    .with_payload(serde_json::json!({
                        "old_port": cached_port,
                        "new_port": port,
                    })),
            );
        }

        let stale = self.driver.address_for(cached_port);
        if let Err(e) = bounded("bridge disconnect", step_timeout, self.driver.disconnect(&stale)).await {
            tracing::debug!(instance = %name, address = %stale, error = %e, "Stale disconnect failed");
        }
        tokio::time::sleep(reconnect.settle_delay).await;

        if let Err(e) = connect_with_retry(self.driver.as_ref(), port, reconnect).await {
            tracing::debug!(instance = %name, port, error = %e, "Connect not accepted");
        }

        let address = self.driver.address_for(port);
        let connected = match bounded(
            "bridge devices",
            step_timeout,
            self.driver.list_connected_addresses(),
        )
        .await
        {
            Ok(addresses) => addresses.iter().any(|a| *a == address),
            Err(e) => {
                tracing::warn!(instance = %name, error = %e, "Bridge re-query failed after reconnect");
                false
            }
        };

        if connected {
            tracing::warn!(instance = %name, port, "Reconnected device");
            self.bus.publish(
                FleetEvent::new(event_names::DEVICE_RECONNECTED)
                    .with_subject("device", name)
                    .with_payload(serde_json::json!({ "port": port })),
            );
        } else {
            self.repair_failed(name, port, "device not in bridge list after reconnect");
        }

        (
            port,
            RepairOutcome {
                connected,
                port_changed,
            },
        )
    }

    fn repair_failed(&self, name: &str, port: u16, reason: &str) {
        tracing::warn!(instance = %name, port, reason, "Device repair failed");
        self.bus.publish(
            FleetEvent::new(event_names::DEVICE_REPAIR_FAILED)
                .with_subject("device", name)
                .with_payload(serde_json::json!({ "port": port, "reason": reason })),
        );
    }

    /// Ports the profile store holds, by instance name. Empty when no
    /// store is attached or it cannot be read.
    async fn stored_ports(&self) -> HashMap<String, u16> {
        let Some(profiles) = &self.profiles else {
            return HashMap::new();
        };
        match profiles.get_all_profiles().await {
            Ok(list) => list
                .into_iter()
                .filter_map(|p| p.port.map(|port| (p.instance_name, port)))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Profile store unavailable, using last observed ports");
                HashMap::new()
            }
        }
    }

    async fn persist_port(&self, name: &str, port: u16) {
        let Some(profiles) = &self.profiles else {
            return;
        };
        match profiles.update_port(name, port).await {
            Ok(updated) => {
                tracing::info!(instance = %name, port, updated, "Persisted corrected port");
            }
            Err(e) => {
                tracing::warn!(instance = %name, port, error = %e, "Failed to persist corrected port");
            }
        }
    }

    async fn collect_metrics(&self, name: &str, port: u16) -> Option<DeviceMetrics> {
        match bounded(
            "coarse metrics",
            self.config.metrics_timeout,
            self.driver.read_coarse_metrics(port),
        )
        .await
        {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                tracing::debug!(instance = %name, error = %e, "Metrics unavailable");
                None
            }
        }
    }

    /// Start or stop the capture for `name` to match `status.connected`.
    async fn sync_log_stream(&self, name: &str, status: &DeviceStatus) {
        let streaming = self.streamer.is_streaming(name).await;
        if status.connected && !streaming {
            let address = self.driver.address_for(status.port);
            let stream = match bounded(
                "open log stream",
                self.config.step_timeout,
                self.driver.open_log_stream(&address),
            )
            .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(instance = %name, error = %e, "Could not open device log stream");
                    return;
                }
            };
            if let Err(e) = self.streamer.start(name, &address, stream).await {
                tracing::warn!(instance = %name, error = %e, "Could not start log streaming");
            }
        } else if !status.connected && streaming {
            self.streamer.stop(name).await;
        }
    }
}
