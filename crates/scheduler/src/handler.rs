//! Operation handlers: one per [`TaskKind`].

use std::collections::HashMap;
use std::sync::Arc;

use droidfleet_core::profile::Profile;
use droidfleet_core::task::TaskKind;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Handler timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Performs the device operation for one task kind.
#[async_trait::async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, profile: &Profile, payload: &Value) -> Result<Value, HandlerError>;
}

/// Kind-keyed handler lookup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn OperationHandler>) -> &mut Self {
        if self.handlers.insert(kind.clone(), handler).is_some() {
            tracing::warn!(kind = %kind, "Replaced existing task handler");
        }
        self
    }

    pub fn get(&self, kind: &TaskKind) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Registered kinds, sorted by name.
    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.handlers.keys().cloned().collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }
}
