//! In-memory hypervisor for pool tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use droidfleet_core::driver::{DeviceDriver, DeviceError, LogStream};
use droidfleet_core::instance::{DeviceMetrics, Instance, InstanceSpec, InstanceStatus};
use droidfleet_core::pool::PoolConfig;
use futures::StreamExt;

#[derive(Default)]
pub struct FakeState {
    pub instances: BTreeMap<String, Instance>,
    /// Ports whose liveness probe fails.
    pub unresponsive: HashSet<u16>,
    pub create_fails: bool,
    pub launch_fails: bool,
    /// Liveness probes answered so far.
    pub probes: usize,
    /// Mutating calls in order, e.g. `"launch droid-1"`.
    pub calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeHypervisor {
    pub state: Mutex<FakeState>,
}

impl FakeHypervisor {
    pub fn with(state: FakeState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    /// Hypervisor already running the named instances, indices in order.
    pub fn with_running(names: &[&str]) -> Arc<Self> {
        let instances = names
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let index = index as u32;
                (
                    name.to_string(),
                    Instance {
                        name: name.to_string(),
                        index,
                        port: port_for(index),
                        status: InstanceStatus::Running,
                    },
                )
            })
            .collect();
        Arc::new(Self {
            state: Mutex::new(FakeState {
                instances,
                ..Default::default()
            }),
        })
    }

    pub fn port_of(&self, name: &str) -> u16 {
        self.state.lock().unwrap().instances[name].port
    }

    pub fn set_unresponsive(&self, name: &str, unresponsive: bool) {
        let port = self.port_of(name);
        let mut state = self.state.lock().unwrap();
        if unresponsive {
            state.unresponsive.insert(port);
        } else {
            state.unresponsive.remove(&port);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn probes(&self) -> usize {
        self.state.lock().unwrap().probes
    }

    /// Delete `name` behind the pool's back.
    pub fn delete_out_of_band(&self, name: &str) {
        self.state.lock().unwrap().instances.remove(name);
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().unwrap().instances.keys().cloned().collect()
    }

    pub fn edit(&self, f: impl FnOnce(&mut FakeState)) {
        f(&mut self.state.lock().unwrap());
    }
}

fn port_for(index: u32) -> u16 {
    5555 + 2 * index as u16
}

fn unsupported(what: &str) -> DeviceError {
    DeviceError::Unavailable(format!("{what} is not used by the pool"))
}

#[async_trait::async_trait]
impl DeviceDriver for FakeHypervisor {
    async fn create_instance(&self, name: &str, _spec: &InstanceSpec) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create {name}"));
        if state.create_fails {
            return Err(DeviceError::CommandFailed {
                command: "console add".into(),
                exit_code: 1,
                stderr: "disk full".into(),
            });
        }
        let index = state
            .instances
            .values()
            .map(|i| i.index + 1)
            .max()
            .unwrap_or(0);
        state.instances.insert(
            name.to_string(),
            Instance {
                name: name.to_string(),
                index,
                port: port_for(index),
                status: InstanceStatus::Stopped,
            },
        );
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
        state.calls.push(format!("remove {name}"));
        state
            .instances
            .remove(name)
            .map(drop)
            .ok_or_else(|| DeviceError::InstanceNotFound(name.to_string()))
    }

    async fn launch_instance(&self, name: &str) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("launch {name}"));
        if state.launch_fails {
            return Err(DeviceError::Timeout {
                operation: "console launch".into(),
                elapsed_ms: 15_000,
            });
        }
        if let Some(instance) = state.instances.get_mut(name) {
            instance.status = InstanceStatus::Running;
        }
        Ok(())
    }

    async fn stop_instance(&self, name: &str) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("stop {name}"));
        if let Some(instance) = state.instances.get_mut(name) {
            instance.status = InstanceStatus::Stopped;
        }
        Ok(())
    }

    async fn get_instances(&self) -> Vec<Instance> {
        self.state.lock().unwrap().instances.values().cloned().collect()
    }

    async fn refresh_from_hypervisor(&self) -> Result<Vec<Instance>, DeviceError> {
        Ok(self.get_instances().await)
    }

    async fn resolve_control_port(&self, name: &str) -> Result<u16, DeviceError> {
        Ok(self.port_of(name))
    }

    async fn connect(&self, _port: u16) -> Result<(), DeviceError> {
        Err(unsupported("connect"))
    }

    async fn disconnect(&self, _address: &str) -> Result<(), DeviceError> {
        Err(unsupported("disconnect"))
    }

    async fn list_connected_addresses(&self) -> Result<Vec<String>, DeviceError> {
        Ok(Vec::new())
    }

    async fn run_liveness_probe(&self, port: u16) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.probes += 1;
        if state.unresponsive.contains(&port) {
            Err(DeviceError::Timeout {
                operation: "echo ok".into(),
                elapsed_ms: 10_000,
            })
        } else {
            Ok(())
        }
    }

    async fn read_coarse_metrics(&self, _port: u16) -> Result<DeviceMetrics, DeviceError> {
        Err(unsupported("metrics"))
    }

    async fn open_log_stream(&self, _address: &str) -> Result<LogStream, DeviceError> {
        Ok(futures::stream::empty::<String>().boxed())
    }
}

/// Pool config with no delays.
pub fn config(min: usize, max: usize, target: usize) -> PoolConfig {
    PoolConfig {
        min_instances: min,
        max_instances: max,
        target_instances: target,
        creation_delay: Duration::ZERO,
        recovery_pause: Duration::ZERO,
        probe_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}
