//! Per-kind work strategies used by workers to execute assigned tasks.

use std::collections::HashMap;
use std::sync::Arc;

use crate::exception::FailureReason;
use crate::types::{Task, TaskKind};

#[derive(Clone, Debug, PartialEq)]
pub struct TaskReport {
    /// Quality of the result within `[0, 1]`; feeds the worker's history.
    pub quality: f64,
    pub summary: String,
}

impl TaskReport {
    pub fn new(quality: f64, summary: impl Into<String>) -> Self {
        Self {
            quality,
            summary: summary.into(),
        }
    }
}

pub trait TaskHandler: Send + Sync {
    fn handle(&self, task: &Task) -> Result<TaskReport, FailureReason>;
}

impl<F> TaskHandler for F
where
    F: Fn(&Task) -> Result<TaskReport, FailureReason> + Send + Sync,
{
    fn handle(&self, task: &Task) -> Result<TaskReport, FailureReason> {
        self(task)
    }
}

/// Lookup table from task kind to handler, with an optional catch-all.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
    fallback: Option<Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: TaskKind, handler: impl TaskHandler + 'static) -> &mut Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn set_fallback(&mut self, handler: impl TaskHandler + 'static) -> &mut Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    pub fn handler_for(&self, kind: TaskKind) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).or(self.fallback.as_ref())
    }

    /// Run the handler for `task`. A kind with no handler is rejected.
    pub fn dispatch(&self, task: &Task) -> Result<TaskReport, FailureReason> {
        match self.handler_for(task.kind) {
            Some(handler) => handler.handle(task),
            None => Err(FailureReason::Rejected(format!(
                "no handler for task kind {:?}",
                task.kind
            ))),
        }
    }
}
