//! In-memory profiles, gated handlers, and a scripted remote source.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use droidfleet_core::profile::{Profile, ProfileError, ProfileStatus, ProfileStore};
use droidfleet_core::task::{TaskKind, TaskStatus};
use droidfleet_core::types::TaskId;
use droidfleet_events::EventBus;
use droidfleet_scheduler::{
    HandlerError, HandlerRegistry, OperationHandler, RemoteError, RemoteTaskSource,
    SchedulerConfig, TaskDescriptor, TaskOutcome, TaskScheduler,
};
use serde_json::Value;
use tokio::sync::Semaphore;

pub fn profile(id: &str, status: ProfileStatus) -> Profile {
    Profile {
        id: id.to_string(),
        instance_name: format!("emu-{id}"),
        port: None,
        status,
        settings: Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeProfiles {
    pub profiles: Mutex<BTreeMap<String, Profile>>,
    pub activations: Mutex<Vec<String>>,
    pub activation_fails: bool,
}

impl FakeProfiles {
    pub fn with(profiles: Vec<Profile>) -> Self {
        Self {
            profiles: Mutex::new(profiles.into_iter().map(|p| (p.id.clone(), p)).collect()),
            ..Default::default()
        }
    }

    pub fn active(ids: &[&str]) -> Self {
        Self::with(
            ids.iter()
                .map(|id| profile(id, ProfileStatus::Active))
                .collect(),
        )
    }

    pub fn activations(&self) -> Vec<String> {
        self.activations.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ProfileStore for FakeProfiles {
    async fn activate(&self, id: &str) -> Result<Profile, ProfileError> {
        if self.activation_fails {
            return Err(ProfileError::ActivationFailed {
                id: id.to_string(),
                reason: "instance did not boot".into(),
            });
        }
        let mut profiles = self.profiles.lock().unwrap();
        let profile = profiles
            .get_mut(id)
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;
        profile.status = ProfileStatus::Active;
        self.activations.lock().unwrap().push(id.to_string());
        Ok(profile.clone())
    }

    async fn deactivate(&self, id: &str) -> Result<(), ProfileError> {
        let mut profiles = self.profiles.lock().unwrap();
        let profile = profiles
            .get_mut(id)
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;
        profile.status = ProfileStatus::Inactive;
        Ok(())
    }

    async fn get_profile(&self, id: &str) -> Result<Option<Profile>, ProfileError> {
        Ok(self.profiles.lock().unwrap().get(id).cloned())
    }

    async fn get_all_profiles(&self) -> Result<Vec<Profile>, ProfileError> {
        // Reverse order so callers cannot rely on store ordering.
        Ok(self.profiles.lock().unwrap().values().rev().cloned().collect())
    }

    async fn update_port(&self, _instance_name: &str, _port: u16) -> Result<usize, ProfileError> {
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Each call blocks until the test releases a permit, then echoes the
/// payload back along with the profile it ran on.
pub struct GatedHandler {
    gate: Semaphore,
    pub calls: Mutex<Vec<(String, Value)>>,
}

impl GatedHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn open() -> Arc<Self> {
        let handler = Self::new();
        handler.release(10_000);
        handler
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn profiles_used(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl OperationHandler for GatedHandler {
    async fn handle(&self, profile: &Profile, payload: &Value) -> Result<Value, HandlerError> {
        self.calls
            .lock()
            .unwrap()
            .push((profile.id.clone(), payload.clone()));
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;
        permit.forget();
        Ok(serde_json::json!({ "profile": profile.id, "echo": payload }))
    }
}

/// Fails every call.
#[derive(Default)]
pub struct FailingHandler {
    pub calls: AtomicUsize,
}

#[async_trait::async_trait]
impl OperationHandler for FailingHandler {
    async fn handle(&self, _profile: &Profile, _payload: &Value) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::Failed("boom".into()))
    }
}

/// Never finishes within any sane timeout.
pub struct StuckHandler;

#[async_trait::async_trait]
impl OperationHandler for StuckHandler {
    async fn handle(&self, _profile: &Profile, _payload: &Value) -> Result<Value, HandlerError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Remote source
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedSource {
    /// Each poll pops one batch; an empty queue answers with nothing.
    pub batches: Mutex<VecDeque<Vec<TaskDescriptor>>>,
    pub reports: Mutex<Vec<(String, TaskOutcome)>>,
}

impl ScriptedSource {
    pub fn with_batches(batches: Vec<Vec<TaskDescriptor>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            ..Default::default()
        }
    }

    pub fn reports(&self) -> Vec<(String, TaskOutcome)> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl RemoteTaskSource for ScriptedSource {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<TaskDescriptor>, RemoteError> {
        let mut batch = self.batches.lock().unwrap().pop_front().unwrap_or_default();
        batch.truncate(limit);
        Ok(batch)
    }

    async fn report_completion(
        &self,
        remote_id: &str,
        outcome: &TaskOutcome,
    ) -> Result<(), RemoteError> {
        self.reports
            .lock()
            .unwrap()
            .push((remote_id.to_string(), outcome.clone()));
        Ok(())
    }
}

pub fn descriptor(id: &str, priority: i32) -> TaskDescriptor {
    TaskDescriptor {
        id: id.to_string(),
        kind: TaskKind::RunScript,
        profile_id: None,
        payload: serde_json::json!({ "remote": id }),
        priority,
        max_attempts: None,
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_tasks: max_concurrent,
        default_max_attempts: 3,
        task_timeout: Duration::from_secs(5),
        tick_interval: Duration::from_millis(10),
    }
}

pub fn registry(kind: TaskKind, handler: Arc<dyn OperationHandler>) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register(kind, handler);
    handlers
}

pub fn scheduler(
    config: SchedulerConfig,
    handlers: HandlerRegistry,
    profiles: Arc<FakeProfiles>,
) -> Arc<TaskScheduler> {
    Arc::new(TaskScheduler::new(
        config,
        handlers,
        profiles,
        Arc::new(EventBus::default()),
    ))
}

/// Poll until the task leaves `Running` (or `Pending` after a tick), with a
/// generous upper bound.
pub async fn wait_until_not_running(scheduler: &TaskScheduler, id: TaskId) -> TaskStatus {
    for _ in 0..500 {
        if let Some(task) = scheduler.get(id).await {
            if task.status != TaskStatus::Running {
                return task.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {id} still running");
}

/// Poll until `running_count` drops to `n`.
pub async fn wait_for_running(scheduler: &TaskScheduler, n: usize) {
    for _ in 0..500 {
        if scheduler.running_count().await == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("running count never reached {n}");
}
