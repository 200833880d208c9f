//! Remote task intake.
//!
//! An external service can feed tasks to the scheduler. [`run_intake`]
//! polls a [`RemoteTaskSource`] on a fixed interval and submits whatever
//! it returns; outcomes of remote-origin tasks are pushed back by the
//! scheduler when they reach a terminal state. Both directions are
//! best-effort: failures are logged and the next interval tries again.
//!
//! The HTTP protocol spoken by [`HttpTaskSource`]:
//!
//! | Call            | Request                              | Body               |
//! |-----------------|--------------------------------------|--------------------|
//! | fetch pending   | `GET {base}/tasks/pending?limit=N`   | `[TaskDescriptor]` |
//! | report outcome  | `POST {base}/tasks/{id}/complete`    | `TaskOutcome`      |

use std::sync::Arc;
use std::time::Duration;

use droidfleet_core::task::{Task, TaskKind, TaskOrigin, TaskSpec, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::scheduler::TaskScheduler;

/// Default number of descriptors pulled per poll.
pub const DEFAULT_INTAKE_BATCH: usize = 10;

/// A task as described by the remote source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Remote identifier, echoed back when reporting the outcome.
    pub id: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl TaskDescriptor {
    pub fn into_spec(self) -> TaskSpec {
        let mut spec = TaskSpec::new(self.kind)
            .with_priority(self.priority)
            .with_payload(self.payload)
            .with_origin(TaskOrigin::Remote { remote_id: self.id });
        if let Some(profile_id) = self.profile_id {
            spec = spec.with_profile(profile_id);
        }
        if let Some(max_attempts) = self.max_attempts {
            spec = spec.with_max_attempts(max_attempts);
        }
        spec
    }
}

/// Terminal result reported back to the remote source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
}

impl TaskOutcome {
    pub fn from_task(task: &Task) -> Self {
        Self {
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            attempts: task.attempts,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Remote task source error ({status}): {body}")]
    Api { status: u16, body: String },
}

#[async_trait::async_trait]
pub trait RemoteTaskSource: Send + Sync {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<TaskDescriptor>, RemoteError>;

    async fn report_completion(&self, remote_id: &str, outcome: &TaskOutcome)
        -> Result<(), RemoteError>;
}

// ---------------------------------------------------------------------------
// HTTP source
// ---------------------------------------------------------------------------

pub struct HttpTaskSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTaskSource {
    /// * `base_url` - e.g. `http://tasks.internal:8080/api`, no trailing slash.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(RemoteError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl RemoteTaskSource for HttpTaskSource {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<TaskDescriptor>, RemoteError> {
        let response = self
            .client
            .get(format!("{}/tasks/pending", self.base_url))
            .query(&[("limit", limit)])
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<Vec<TaskDescriptor>>().await?)
    }

    async fn report_completion(
        &self,
        remote_id: &str,
        outcome: &TaskOutcome,
    ) -> Result<(), RemoteError> {
        let response = self
            .client
            .post(format!("{}/tasks/{}/complete", self.base_url, remote_id))
            .json(outcome)
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Intake loop
// ---------------------------------------------------------------------------

/// One poll: fetch up to `limit` descriptors and submit those not already
/// known. Returns how many were submitted.
pub async fn poll_once(
    scheduler: &TaskScheduler,
    source: &dyn RemoteTaskSource,
    limit: usize,
) -> Result<usize, RemoteError> {
    let descriptors = source.fetch_pending(limit).await?;
    let mut submitted = 0;

    for descriptor in descriptors {
        if scheduler.knows_remote(&descriptor.id).await {
            tracing::debug!(remote_id = %descriptor.id, "Remote task already accepted");
            continue;
        }
        let remote_id = descriptor.id.clone();
        match scheduler.submit(descriptor.into_spec()).await {
            Ok(task) => {
                tracing::info!(task_id = %task.id, remote_id = %remote_id, "Accepted remote task");
                submitted += 1;
            }
            Err(SchedulerError::ShuttingDown) => break,
            Err(e) => {
                tracing::warn!(remote_id = %remote_id, error = %e, "Remote task rejected");
            }
        }
    }
    Ok(submitted)
}

/// Poll `source` every `interval` until `cancel` fires.
pub async fn run_intake(
    scheduler: Arc<TaskScheduler>,
    source: Arc<dyn RemoteTaskSource>,
    interval: Duration,
    limit: usize,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    tracing::info!(interval_secs = interval.as_secs(), limit, "Remote task intake started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Remote task intake shutting down");
                break;
            }
            _ = ticker.tick() => {
                match poll_once(&scheduler, source.as_ref(), limit).await {
                    Ok(0) => {}
                    Ok(submitted) => tracing::debug!(submitted, "Remote intake poll complete"),
                    Err(e) => tracing::warn!(error = %e, "Remote intake poll failed"),
                }
            }
        }
    }
}
