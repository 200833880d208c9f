//! A driver fake that only records launches and stops.

#![allow(dead_code)]

use std::sync::Mutex;

use droidfleet_core::driver::{DeviceDriver, DeviceError, LogStream};
use droidfleet_core::instance::{DeviceMetrics, Instance, InstanceSpec};
use droidfleet_core::profile::{Profile, ProfileStatus};
use futures::StreamExt;

pub fn profile(id: &str, instance: &str) -> Profile {
    Profile {
        id: id.to_string(),
        instance_name: instance.to_string(),
        port: None,
        status: ProfileStatus::Inactive,
        settings: serde_json::json!({ "locale": "en-US" }),
    }
}

#[derive(Default)]
pub struct LaunchRecorder {
    pub launch_fails: bool,
    pub calls: Mutex<Vec<String>>,
}

impl LaunchRecorder {
    pub fn failing() -> Self {
        Self {
            launch_fails: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl DeviceDriver for LaunchRecorder {
    async fn create_instance(&self, name: &str, _spec: &InstanceSpec) -> Result<(), DeviceError> {
        self.record(format!("create {name}"));
        Ok(())
    }

    async fn clone_instance(&self, source: &str, target: &str) -> Result<(), DeviceError> {
        self.record(format!("clone {source} {target}"));
        Ok(())
    }

    async fn remove_instance(&self, name: &str) -> Result<(), DeviceError> {
        self.record(format!("remove {name}"));
        Ok(())
    }

    async fn launch_instance(&self, name: &str) -> Result<(), DeviceError> {
        self.record(format!("launch {name}"));
        if self.launch_fails {
            return Err(DeviceError::CommandFailed {
                command: "launch".into(),
                exit_code: 1,
                stderr: "no such player".into(),
            });
        }
        Ok(())
    }

    async fn stop_instance(&self, name: &str) -> Result<(), DeviceError> {
        self.record(format!("stop {name}"));
        Ok(())
    }

    async fn get_instances(&self) -> Vec<Instance> {
        Vec::new()
    }

    async fn refresh_from_hypervisor(&self) -> Result<Vec<Instance>, DeviceError> {
        Ok(Vec::new())
    }

    async fn resolve_control_port(&self, name: &str) -> Result<u16, DeviceError> {
        Err(DeviceError::InstanceNotFound(name.to_string()))
    }

    async fn connect(&self, _port: u16) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn disconnect(&self, _address: &str) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn list_connected_addresses(&self) -> Result<Vec<String>, DeviceError> {
        Ok(Vec::new())
    }

    async fn run_liveness_probe(&self, _port: u16) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn read_coarse_metrics(&self, _port: u16) -> Result<DeviceMetrics, DeviceError> {
        Ok(DeviceMetrics::default())
    }

    async fn open_log_stream(&self, _address: &str) -> Result<LogStream, DeviceError> {
        Ok(futures::stream::empty::<String>().boxed())
    }
}
