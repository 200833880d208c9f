//! Priority task scheduler with bounded concurrency.
//!
//! Tasks are admitted by a periodic tick: free slots are
//! `max_concurrent_tasks - running`, filled highest priority first, then in
//! submission order. Each admitted task runs independently on the
//! scheduler's [`TaskTracker`]; a failed attempt sends the task back to
//! `pending`, where it competes with everything else on priority until
//! its attempt limit is reached.
//!
//! Task state transitions and the running set live under one lock, so
//! admission always sees the running count as of that instant.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use droidfleet_core::event_names;
use droidfleet_core::profile::{Profile, ProfileStatus, ProfileStore};
use droidfleet_core::scheduling::{available_slots, select_for_admission};
use droidfleet_core::task::{RetryDecision, Task, TaskKind, TaskOrigin, TaskSpec, TaskStatus};
use droidfleet_core::types::{ProfileId, TaskId};
use droidfleet_events::{EventBus, FleetEvent};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, TaskFailure};
use crate::handler::{HandlerError, HandlerRegistry};
use crate::remote::{RemoteTaskSource, TaskOutcome};

/// Task counts by status plus slot usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub max_concurrent: usize,
    pub available_slots: usize,
}

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<TaskId, Task>,
    /// Ids of tasks whose body is in flight.
    running: HashSet<TaskId>,
}

pub struct TaskScheduler {
    config: SchedulerConfig,
    table: RwLock<TaskTable>,
    next_seq: AtomicU64,
    handlers: HandlerRegistry,
    profiles: Arc<dyn ProfileStore>,
    bus: Arc<EventBus>,
    reporter: Option<Arc<dyn RemoteTaskSource>>,
    tracker: TaskTracker,
    shutting_down: AtomicBool,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        handlers: HandlerRegistry,
        profiles: Arc<dyn ProfileStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            table: RwLock::new(TaskTable::default()),
            next_seq: AtomicU64::new(0),
            handlers,
            profiles,
            bus,
            reporter: None,
            tracker: TaskTracker::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Report terminal outcomes of remote-origin tasks to `reporter`.
    pub fn with_reporter(mut self, reporter: Arc<dyn RemoteTaskSource>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ---- upward surface ----

    /// Enqueue a new pending task.
    pub async fn submit(&self, spec: TaskSpec) -> Result<Task, SchedulerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut task = Task::new(spec, seq, self.config.default_max_attempts);
        task.log("submitted");
        let snapshot = task.clone();
        self.table.write().await.tasks.insert(task.id, task);

        tracing::info!(
            task_id = %snapshot.id,
            kind = %snapshot.kind,
            priority = snapshot.priority,
            "Task submitted",
        );
        self.bus.publish(
            FleetEvent::new(event_names::TASK_SUBMITTED)
                .with_subject("task", snapshot.id)
                .with_payload(serde_json::json!({
                    "kind": snapshot.kind.to_string(),
                    "priority": snapshot.priority,
                })),
        );
        Ok(snapshot)
    }

    /// Drop a task that has not started yet. Running and finished tasks
    /// are left untouched and `false` is returned.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let removed = {
            let mut table = self.table.write().await;
            let pending = table
                .tasks
                .get(&id)
                .is_some_and(|t| t.status == TaskStatus::Pending);
            if pending {
                table.tasks.remove(&id)
            } else {
                None
            }
        };

        match removed {
            Some(_) => {
                tracing::info!(task_id = %id, "Task cancelled");
                self.bus
                    .publish(FleetEvent::new(event_names::TASK_CANCELLED).with_subject("task", id));
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.table.read().await.tasks.get(&id).cloned()
    }

    /// Tasks in submission order, optionally filtered by status.
    pub async fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let table = self.table.read().await;
        let mut tasks: Vec<Task> = table
            .tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    pub async fn stats(&self) -> SchedulerStats {
        let table = self.table.read().await;
        let mut stats = SchedulerStats {
            max_concurrent: self.config.max_concurrent_tasks,
            available_slots: available_slots(self.config.max_concurrent_tasks, table.running.len()),
            ..Default::default()
        };
        for task in table.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Log lines of one task.
    pub async fn logs(&self, id: TaskId) -> Result<Vec<String>, SchedulerError> {
        self.table
            .read()
            .await
            .tasks
            .get(&id)
            .map(|t| t.logs.clone())
            .ok_or(SchedulerError::TaskNotFound(id))
    }

    pub async fn running_count(&self) -> usize {
        self.table.read().await.running.len()
    }

    /// Whether a task with this remote id has already been accepted.
    pub async fn knows_remote(&self, remote_id: &str) -> bool {
        self.table.read().await.tasks.values().any(|t| {
            matches!(&t.origin, TaskOrigin::Remote { remote_id: known } if known == remote_id)
        })
    }

    // ---- admission ----

    /// Admit as many pending tasks as there are free slots and start them.
    /// Returns the admitted ids in admission order.
    pub async fn tick(self: &Arc<Self>) -> Vec<TaskId> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Vec::new();
        }

        // Spawning under the table lock keeps `shutdown` from closing the
        // tracker between admission and spawn.
        let mut table = self.table.write().await;
        if self.shutting_down.load(Ordering::SeqCst) || self.tracker.is_closed() {
            return Vec::new();
        }
        let slots = available_slots(self.config.max_concurrent_tasks, table.running.len());
        let admitted = select_for_admission(table.tasks.values(), slots);
        for &id in &admitted {
            if let Some(task) = table.tasks.get_mut(&id) {
                task.mark_running();
                let attempt = task.attempts + 1;
                task.log(format!("attempt {attempt} started"));
            }
            table.running.insert(id);
            self.bus
                .publish(FleetEvent::new(event_names::TASK_STARTED).with_subject("task", id));
            let scheduler = Arc::clone(self);
            self.tracker.spawn(async move { scheduler.execute(id).await });
        }
        drop(table);

        if !admitted.is_empty() {
            tracing::debug!(admitted = admitted.len(), "Admission tick");
        }
        admitted
    }

    /// Tick every `tick_interval` until `cancel` fires, then drain.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        tracing::info!(
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            "Task scheduler started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Task scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop admitting and accepting tasks, then wait for every running
    /// task to finish.
    pub async fn shutdown(&self) {
        {
            let table = self.table.write().await;
            if !self.shutting_down.swap(true, Ordering::SeqCst) {
                tracing::info!(
                    running = table.running.len(),
                    "Waiting for running tasks to finish",
                );
            }
            self.tracker.close();
        }
        self.tracker.wait().await;
        tracing::info!("Task scheduler drained");
    }

    // ---- execution ----

    async fn execute(&self, id: TaskId) {
        let snapshot = {
            let table = self.table.read().await;
            table
                .tasks
                .get(&id)
                .map(|t| (t.kind.clone(), t.profile_id.clone(), t.payload.clone()))
        };
        let Some((kind, profile_id, payload)) = snapshot else {
            tracing::error!(task_id = %id, "Admitted task vanished before execution");
            self.table.write().await.running.remove(&id);
            return;
        };

        let started = Instant::now();
        match self.attempt(id, &kind, profile_id, &payload).await {
            Ok(result) => self.complete(id, result, started).await,
            Err(failure) => self.fail(id, failure).await,
        }
    }

    /// Bind, activate, dispatch.
    async fn attempt(
        &self,
        id: TaskId,
        kind: &TaskKind,
        profile_id: Option<ProfileId>,
        payload: &Value,
    ) -> Result<Value, TaskFailure> {
        let profile = match profile_id {
            Some(profile_id) => self
                .profiles
                .get_profile(&profile_id)
                .await
                .map_err(TaskFailure::ProfileLookup)?
                .ok_or(TaskFailure::ProfileNotFound(profile_id))?,
            None => self.bind_profile(id).await?,
        };

        let profile = if profile.is_active() {
            profile
        } else {
            let activated = self
                .profiles
                .activate(&profile.id)
                .await
                .map_err(TaskFailure::Activation)?;
            self.append_log(id, format!("profile {} activated", activated.id))
                .await;
            activated
        };

        let handler = self
            .handlers
            .get(kind)
            .ok_or_else(|| TaskFailure::UnknownKind(kind.clone()))?;

        let timeout = self.config.task_timeout;
        match tokio::time::timeout(timeout, handler.handle(&profile, payload)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(HandlerError::Timeout {
                elapsed_ms: timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    /// Bind the task to the first profile (by id) not held by another
    /// running task.
    async fn bind_profile(&self, id: TaskId) -> Result<Profile, TaskFailure> {
        let mut candidates = self
            .profiles
            .get_all_profiles()
            .await
            .map_err(TaskFailure::ProfileLookup)?;
        candidates.retain(|p| p.status != ProfileStatus::Error);
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let mut table = self.table.write().await;
        let busy: HashSet<String> = table
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running && t.id != id)
            .filter_map(|t| t.profile_id.clone())
            .collect();

        let profile = candidates
            .into_iter()
            .find(|p| !busy.contains(&p.id))
            .ok_or(TaskFailure::NoProfileAvailable)?;

        if let Some(task) = table.tasks.get_mut(&id) {
            task.profile_id = Some(profile.id.clone());
            task.log(format!("bound to profile {}", profile.id));
        }
        tracing::debug!(task_id = %id, profile_id = %profile.id, "Task bound to profile");
        Ok(profile)
    }

    async fn complete(&self, id: TaskId, result: Value, started: Instant) {
        let finished = {
            let mut table = self.table.write().await;
            table.running.remove(&id);
            table.tasks.get_mut(&id).and_then(|task| {
                if task.mark_completed(result) {
                    task.log("completed");
                    Some(task.clone())
                } else {
                    None
                }
            })
        };
        let Some(task) = finished else {
            return;
        };

        tracing::info!(
            task_id = %id,
            kind = %task.kind,
            profile_id = task.profile_id.as_deref().unwrap_or("-"),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Task completed",
        );
        self.bus.publish(
            FleetEvent::new(event_names::TASK_COMPLETED)
                .with_subject("task", id)
                .with_payload(serde_json::json!({
                    "attempts": task.attempts,
                    "profile_id": task.profile_id,
                })),
        );
        self.report(&task).await;
    }

    async fn fail(&self, id: TaskId, failure: TaskFailure) {
        let message = failure.to_string();
        let outcome = {
            let mut table = self.table.write().await;
            table.running.remove(&id);
            table.tasks.get_mut(&id).and_then(|task| {
                let decision = task.record_failure(&message)?;
                task.log(format!("attempt {} failed: {message}", task.attempts));
                Some((decision, task.clone()))
            })
        };
        let Some((decision, task)) = outcome else {
            return;
        };

        match decision {
            RetryDecision::Requeued { attempts } => {
                tracing::warn!(
                    task_id = %id,
                    attempts,
                    max_attempts = task.max_attempts,
                    transient = failure.is_transient(),
                    error = %message,
                    "Task attempt failed, requeued",
                );
                self.bus.publish(
                    FleetEvent::new(event_names::TASK_RETRYING)
                        .with_subject("task", id)
                        .with_payload(serde_json::json!({
                            "attempts": attempts,
                            "error": message,
                        })),
                );
            }
            RetryDecision::Exhausted { attempts } => {
                tracing::error!(
                    task_id = %id,
                    attempts,
                    error = %message,
                    "Task failed",
                );
                self.bus.publish(
                    FleetEvent::new(event_names::TASK_FAILED)
                        .with_subject("task", id)
                        .with_payload(serde_json::json!({
                            "attempts": attempts,
                            "error": message,
                        })),
                );
                self.report(&task).await;
            }
        }
    }

    async fn append_log(&self, id: TaskId, line: String) {
        if let Some(task) = self.table.write().await.tasks.get_mut(&id) {
            task.log(line);
        }
    }

    /// Push a terminal outcome to the remote source. Failures are logged;
    /// there is no inline retry.
    async fn report(&self, task: &Task) {
        let (Some(reporter), TaskOrigin::Remote { remote_id }) = (&self.reporter, &task.origin)
        else {
            return;
        };
        if let Err(e) = reporter
            .report_completion(remote_id, &TaskOutcome::from_task(task))
            .await
        {
            tracing::warn!(
                task_id = %task.id,
                remote_id = %remote_id,
                error = %e,
                "Failed to report task outcome",
            );
        }
    }
}
