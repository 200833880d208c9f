//! Task admission constants and ordering.
//!
//! Pure functions used by the scheduler's admission tick. Kept free of
//! locks and I/O so the ordering rules can be tested directly.

use crate::task::{Task, TaskStatus};
use crate::types::TaskId;

// ---------------------------------------------------------------------------
// Priority constants
// ---------------------------------------------------------------------------

/// Priority value for urgent tasks. Admitted before all others.
pub const PRIORITY_URGENT: i32 = 10;

/// Priority value for normal tasks. Default.
pub const PRIORITY_NORMAL: i32 = 0;

/// Priority value for background tasks. Admitted last.
pub const PRIORITY_BACKGROUND: i32 = -10;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Attempts allowed per task unless the submission overrides it.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Concurrent task bodies allowed unless configured otherwise.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Free execution slots given the current running count.
pub fn available_slots(max_concurrent: usize, running: usize) -> usize {
    max_concurrent.saturating_sub(running)
}

/// Pick up to `slots` pending tasks, highest priority first, then in
/// submission order.
///
/// Non-pending tasks in `tasks` are ignored, so callers can pass a snapshot
/// of the whole task table.
pub fn select_for_admission<'a, I>(tasks: I, slots: usize) -> Vec<TaskId>
where
    I: IntoIterator<Item = &'a Task>,
{
    if slots == 0 {
        return Vec::new();
    }

    let mut pending: Vec<&Task> = tasks
        .into_iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .collect();

    pending.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    pending.into_iter().take(slots).map(|t| t.id).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
