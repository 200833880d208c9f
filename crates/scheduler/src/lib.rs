//! Task scheduler: priority admission, per-kind handlers, retries and
//! optional remote intake.

pub mod config;
pub mod error;
pub mod handler;
pub mod remote;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use error::{SchedulerError, TaskFailure};
pub use handler::{HandlerError, HandlerRegistry, OperationHandler};
pub use remote::{
    poll_once, run_intake, HttpTaskSource, RemoteError, RemoteTaskSource, TaskDescriptor,
    TaskOutcome,
};
pub use scheduler::{SchedulerStats, TaskScheduler};
