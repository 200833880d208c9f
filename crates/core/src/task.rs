//! Task model and status state machine.
//!
//! A [`Task`] is one queued unit of automation work. Status moves only
//! `Pending -> Running -> {Completed | Pending (retry) | Failed}`; the
//! transition helpers on [`Task`] are the only writers of `status` and
//! `attempts`, so the retry bound holds for every task.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ProfileId, TaskId, Timestamp};

// ---------------------------------------------------------------------------
// Kind / status / origin
// ---------------------------------------------------------------------------

/// What a task does. Each kind is served by one registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Run an arbitrary automation script against the profile's device.
    RunScript,
    /// Run a single shell command on the device over the debug bridge.
    DeviceShell,
    /// Any other operation, served by a handler registered under this name.
    Custom(String),
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunScript => f.write_str("run_script"),
            Self::DeviceShell => f.write_str("device_shell"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Returns the statuses reachable from `self`.
    ///
    /// `Running -> Pending` is the retry edge. Terminal states have none.
    pub fn valid_transitions(self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Running],
            Self::Running => &[Self::Completed, Self::Pending, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    pub fn can_transition(self, to: TaskStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Where a task came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOrigin {
    Local,
    /// Pulled from a remote task source; `remote_id` is the source's own key.
    Remote { remote_id: String },
}

// ---------------------------------------------------------------------------
// Submission spec
// ---------------------------------------------------------------------------

/// Caller-supplied description of a task to enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub kind: TaskKind,
    /// Unbound tasks are bound to any available profile before execution.
    #[serde(default)]
    pub profile_id: Option<ProfileId>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: i32,
    /// Overrides the scheduler's default attempt limit.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_origin")]
    pub origin: TaskOrigin,
}

fn default_origin() -> TaskOrigin {
    TaskOrigin::Local
}

impl TaskSpec {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            profile_id: None,
            payload: Value::Null,
            priority: crate::scheduling::PRIORITY_NORMAL,
            max_attempts: None,
            origin: TaskOrigin::Local,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_profile(mut self, profile_id: impl Into<ProfileId>) -> Self {
        self.profile_id = Some(profile_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_origin(mut self, origin: TaskOrigin) -> Self {
        self.origin = origin;
        self
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Monotonic submission order; breaks priority ties.
    pub seq: u64,
    pub kind: TaskKind,
    pub profile_id: Option<ProfileId>,
    pub payload: Value,
    pub status: TaskStatus,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub origin: TaskOrigin,
}

/// What happened to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back in the queue; re-competes on priority.
    Requeued { attempts: u32 },
    /// Attempt budget exhausted.
    Exhausted { attempts: u32 },
}

impl Task {
    /// Build a pending task from a spec. `max_attempts` is clamped to at
    /// least one.
    pub fn new(spec: TaskSpec, seq: u64, default_max_attempts: u32) -> Self {
        let max_attempts = spec.max_attempts.unwrap_or(default_max_attempts).max(1);
        Self {
            id: uuid::Uuid::new_v4(),
            seq,
            kind: spec.kind,
            profile_id: spec.profile_id,
            payload: spec.payload,
            status: TaskStatus::Pending,
            priority: spec.priority,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            logs: Vec::new(),
            origin: spec.origin,
        }
    }

    /// Append a timestamped line to the task log.
    pub fn log(&mut self, line: impl AsRef<str>) {
        self.logs
            .push(format!("[{}] {}", Utc::now().to_rfc3339(), line.as_ref()));
    }

    /// `Pending -> Running`. Returns `false` (and changes nothing) from any
    /// other status.
    pub fn mark_running(&mut self) -> bool {
        if !self.status.can_transition(TaskStatus::Running) {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// `Running -> Completed`.
    pub fn mark_completed(&mut self, result: Value) -> bool {
        if !self.status.can_transition(TaskStatus::Completed) {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Record a failed attempt on a running task.
    ///
    /// Increments `attempts`; requeues while `attempts < max_attempts`,
    /// otherwise marks the task failed. Returns `None` if the task was not
    /// running.
    pub fn record_failure(&mut self, error: impl Into<String>) -> Option<RetryDecision> {
        if self.status != TaskStatus::Running {
            return None;
        }
        let error = error.into();
        self.attempts += 1;
        self.error = Some(error);

        if self.attempts < self.max_attempts {
            self.status = TaskStatus::Pending;
            Some(RetryDecision::Requeued {
                attempts: self.attempts,
            })
        } else {
            self.status = TaskStatus::Failed;
            self.completed_at = Some(Utc::now());
            Some(RetryDecision::Exhausted {
                attempts: self.attempts,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn running_task(max_attempts: u32) -> Task {
        let mut task = Task::new(TaskSpec::new(TaskKind::RunScript), 0, max_attempts);
        assert!(task.mark_running());
        task
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        assert!(TaskStatus::Completed.valid_transitions().is_empty());
        assert!(TaskStatus::Failed.valid_transitions().is_empty());
    }

    #[test]
    fn pending_cannot_skip_to_completed() {
        assert!(!TaskStatus::Pending.can_transition(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.can_transition(TaskStatus::Failed));
    }

    #[test]
    fn running_can_retry_back_to_pending() {
        assert!(TaskStatus::Running.can_transition(TaskStatus::Pending));
    }

    #[test]
    fn new_task_is_pending_with_zero_attempts() {
        let task = Task::new(TaskSpec::new(TaskKind::RunScript), 7, 3);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.max_attempts, 3);
        assert_eq!(task.seq, 7);
    }

    #[test]
    fn spec_override_wins_over_default_attempts() {
        let spec = TaskSpec::new(TaskKind::RunScript).with_max_attempts(5);
        let task = Task::new(spec, 0, 3);
        assert_eq!(task.max_attempts, 5);
    }

    #[test]
    fn zero_attempt_limit_is_clamped_to_one() {
        let spec = TaskSpec::new(TaskKind::RunScript).with_max_attempts(0);
        let task = Task::new(spec, 0, 3);
        assert_eq!(task.max_attempts, 1);
    }

    #[test]
    fn failure_requeues_until_budget_exhausted() {
        let mut task = running_task(3);

        assert_matches!(
            task.record_failure("boom"),
            Some(RetryDecision::Requeued { attempts: 1 })
        );
        assert_eq!(task.status, TaskStatus::Pending);

        assert!(task.mark_running());
        assert_matches!(
            task.record_failure("boom"),
            Some(RetryDecision::Requeued { attempts: 2 })
        );

        assert!(task.mark_running());
        assert_matches!(
            task.record_failure("final"),
            Some(RetryDecision::Exhausted { attempts: 3 })
        );
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, task.max_attempts);
        assert_eq!(task.error.as_deref(), Some("final"));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn failure_on_pending_task_is_ignored() {
        let mut task = Task::new(TaskSpec::new(TaskKind::RunScript), 0, 3);
        assert!(task.record_failure("nope").is_none());
        assert_eq!(task.attempts, 0);
    }

    #[test]
    fn completion_stores_result() {
        let mut task = running_task(3);
        assert!(task.mark_completed(serde_json::json!({"ok": true})));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(serde_json::json!({"ok": true})));
        assert!(!task.mark_running());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_value(TaskKind::DeviceShell).unwrap();
        assert_eq!(json, "device_shell");
        let custom: TaskKind = serde_json::from_value(serde_json::json!({"custom": "warmup"})).unwrap();
        assert_eq!(custom, TaskKind::Custom("warmup".into()));
    }
}
