use droidfleet_core::profile::ProfileError;
use droidfleet_core::task::TaskKind;
use droidfleet_core::types::TaskId;

use crate::handler::HandlerError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),
}

/// Why one attempt of a task failed. Its `Display` form is what ends up in
/// the task's `error` field.
#[derive(Debug, thiserror::Error)]
pub enum TaskFailure {
    #[error("No free profile available")]
    NoProfileAvailable,

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Profile lookup failed: {0}")]
    ProfileLookup(#[source] ProfileError),

    #[error("Profile activation failed: {0}")]
    Activation(#[source] ProfileError),

    #[error("No handler registered for task kind {0}")]
    UnknownKind(TaskKind),

    #[error("Handler failed: {0}")]
    Handler(#[from] HandlerError),
}

impl TaskFailure {
    /// Timeouts and profile-layer hiccups may clear up on the next attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoProfileAvailable
                | Self::ProfileLookup(_)
                | Self::Activation(_)
                | Self::Handler(HandlerError::Timeout { .. })
        )
    }
}
