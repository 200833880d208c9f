//! In-memory fakes of the driver and profile capabilities.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use droidfleet_core::driver::{DeviceDriver, DeviceError, LogStream};
use droidfleet_core::instance::{
    bridge_address, DeviceMetrics, Instance, InstanceSpec, InstanceStatus, DEFAULT_BRIDGE_HOST,
};
use droidfleet_core::profile::{Profile, ProfileError, ProfileStatus, ProfileStore};
use droidfleet_events::EventBus;
use droidfleet_reconciler::{DeviceReconciler, ReconcilerConfig, ReconnectConfig};
use futures::StreamExt;

pub fn addr(port: u16) -> String {
    bridge_address(DEFAULT_BRIDGE_HOST, port)
}

pub fn running(name: &str, index: u32, port: u16) -> Instance {
    Instance {
        name: name.to_string(),
        index,
        port,
        status: InstanceStatus::Running,
    }
}

pub fn stopped(name: &str, index: u32, port: u16) -> Instance {
    Instance {
        status: InstanceStatus::Stopped,
        ..running(name, index, port)
    }
}

/// Hypervisor + bridge ground truth the fake reports.
#[derive(Default)]
pub struct FakeState {
    /// What the hypervisor lists, keyed by name.
    pub instances: BTreeMap<String, Instance>,
    /// Port `resolve_control_port` answers with, when it differs from the
    /// listing.
    pub resolved_ports: HashMap<String, u16>,
    /// Addresses the bridge reports in `device` state.
    pub connected: HashSet<String>,
    /// `connect` adds the address to `connected`.
    pub connect_registers: bool,
    pub connect_fails: bool,
    pub hypervisor_down: bool,
    pub metrics: Option<DeviceMetrics>,
    pub log_lines: Vec<String>,
    /// Mutating calls in order, e.g. `"connect 5557"`.
    pub calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeDriver {
    pub state: Mutex<FakeState>,
}

impl FakeDriver {
    pub fn with(state: FakeState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn edit(&self, f: impl FnOnce(&mut FakeState)) {
        f(&mut self.state.lock().unwrap());
    }
}

#[async_trait::async_trait]
impl DeviceDriver for FakeDriver {
    async fn create_instance(&self, name: &str, _spec: &InstanceSpec) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        let index = state.instances.len() as u32;
        state
            .instances
            .insert(name.to_string(), stopped(name, index, 5555 + 2 * index as u16));
        state.calls.push(format!("create {name}"));
        Ok(())
    }

    async fn clone_instance(&self, source: &str, target: &str) -> Result<(), DeviceError> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(format!("clone {source} {target}"));
        self.create_instance(target, &InstanceSpec::default()).await
    }

    async fn remove_instance(&self, name: &str) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.instances.remove(name);
        state.calls.push(format!("remove {name}"));
        Ok(())
    }

    async fn launch_instance(&self, name: &str) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if let Some(instance) = state.instances.get_mut(name) {
            instance.status = InstanceStatus::Running;
        }
        state.calls.push(format!("launch {name}"));
        Ok(())
    }

    async fn stop_instance(&self, name: &str) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if let Some(instance) = state.instances.get_mut(name) {
            instance.status = InstanceStatus::Stopped;
        }
        state.calls.push(format!("stop {name}"));
        Ok(())
    }

    async fn get_instances(&self) -> Vec<Instance> {
        self.state.lock().unwrap().instances.values().cloned().collect()
    }

    async fn refresh_from_hypervisor(&self) -> Result<Vec<Instance>, DeviceError> {
        let state = self.state.lock().unwrap();
        if state.hypervisor_down {
            return Err(DeviceError::Unavailable("console not responding".into()));
        }
        Ok(state.instances.values().cloned().collect())
    }

    async fn resolve_control_port(&self, name: &str) -> Result<u16, DeviceError> {
        let state = self.state.lock().unwrap();
        if let Some(port) = state.resolved_ports.get(name) {
            return Ok(*port);
        }
        state
            .instances
            .get(name)
            .map(|i| i.port)
            .ok_or_else(|| DeviceError::InstanceNotFound(name.to_string()))
    }

    async fn connect(&self, port: u16) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("connect {port}"));
        if state.connect_fails {
            return Err(DeviceError::CommandFailed {
                command: "adb connect".into(),
                exit_code: 1,
                stderr: "cannot connect".into(),
            });
        }
        if state.connect_registers {
            state.connected.insert(addr(port));
        }
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.connected.remove(address);
        state.calls.push(format!("disconnect {address}"));
        Ok(())
    }

    async fn list_connected_addresses(&self) -> Result<Vec<String>, DeviceError> {
        Ok(self.state.lock().unwrap().connected.iter().cloned().collect())
    }

    async fn run_liveness_probe(&self, port: u16) -> Result<(), DeviceError> {
        if self.state.lock().unwrap().connected.contains(&addr(port)) {
            Ok(())
        } else {
            Err(DeviceError::Unavailable(format!("no device at {port}")))
        }
    }

    async fn read_coarse_metrics(&self, _port: u16) -> Result<DeviceMetrics, DeviceError> {
        self.state
            .lock()
            .unwrap()
            .metrics
            .clone()
            .ok_or_else(|| DeviceError::Unavailable("no metrics".into()))
    }

    async fn open_log_stream(&self, _address: &str) -> Result<LogStream, DeviceError> {
        let lines = self.state.lock().unwrap().log_lines.clone();
        Ok(futures::stream::iter(lines).boxed())
    }
}

/// Profile store holding `profiles` in memory and recording every port
/// write-back.
#[derive(Default)]
pub struct RecordingProfiles {
    pub profiles: Mutex<Vec<Profile>>,
    pub port_updates: Mutex<Vec<(String, u16)>>,
}

impl RecordingProfiles {
    /// One active profile per `(instance_name, stored port)`.
    pub fn with_ports(entries: &[(&str, u16)]) -> Arc<Self> {
        let profiles = entries
            .iter()
            .map(|(instance, port)| Profile {
                id: format!("p-{instance}"),
                instance_name: instance.to_string(),
                port: Some(*port),
                status: ProfileStatus::Active,
                settings: serde_json::Value::Null,
            })
            .collect();
        Arc::new(Self {
            profiles: Mutex::new(profiles),
            ..Default::default()
        })
    }

    pub fn stored_port(&self, instance_name: &str) -> Option<u16> {
        self.profiles
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.instance_name == instance_name)
            .and_then(|p| p.port)
    }
}

#[async_trait::async_trait]
impl ProfileStore for RecordingProfiles {
    async fn activate(&self, id: &str) -> Result<Profile, ProfileError> {
        Err(ProfileError::NotFound(id.to_string()))
    }

    async fn deactivate(&self, id: &str) -> Result<(), ProfileError> {
        Err(ProfileError::NotFound(id.to_string()))
    }

    async fn get_profile(&self, id: &str) -> Result<Option<Profile>, ProfileError> {
        Ok(self.profiles.lock().unwrap().iter().find(|p| p.id == id).cloned())
    }

    async fn get_all_profiles(&self) -> Result<Vec<Profile>, ProfileError> {
        Ok(self.profiles.lock().unwrap().clone())
    }

    async fn update_port(&self, instance_name: &str, port: u16) -> Result<usize, ProfileError> {
        let mut changed = 0;
        for profile in self.profiles.lock().unwrap().iter_mut() {
            if profile.instance_name == instance_name && profile.port != Some(port) {
                profile.port = Some(port);
                changed += 1;
            }
        }
        self.port_updates
            .lock()
            .unwrap()
            .push((instance_name.to_string(), port));
        Ok(changed.max(1))
    }
}

/// Config with no settle/retry delays and logs under `log_dir`.
pub fn fast_config(log_dir: &Path) -> ReconcilerConfig {
    ReconcilerConfig {
        log_dir: log_dir.to_path_buf(),
        step_timeout: Duration::from_secs(2),
        metrics_timeout: Duration::from_secs(1),
        reconnect: ReconnectConfig {
            settle_delay: Duration::ZERO,
            connect_timeout: Duration::from_secs(1),
            retry_delay: Duration::ZERO,
            max_attempts: 2,
        },
        ..Default::default()
    }
}

pub fn reconciler(
    driver: Arc<FakeDriver>,
    profiles: Arc<RecordingProfiles>,
    bus: Arc<EventBus>,
    log_dir: &Path,
) -> DeviceReconciler {
    DeviceReconciler::new(driver, bus, fast_config(log_dir)).with_profiles(profiles)
}
