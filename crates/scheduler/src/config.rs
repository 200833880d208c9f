use std::time::Duration;

use droidfleet_core::scheduling::{DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_CONCURRENT_TASKS};

/// Default handler timeout per attempt.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Default admission tick period.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: usize,
    /// Attempt limit for tasks that do not set their own.
    pub default_max_attempts: u32,
    pub task_timeout: Duration,
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}
