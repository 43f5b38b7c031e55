//! Error taxonomy for ingestion, configuration, and engine operations.

use thiserror::Error;

use crate::types::{TaskId, TaskState, WorkerId};

/// Malformed task or worker input, rejected synchronously at ingestion.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("estimated effort must be positive, got {0}")]
    NonPositiveEffort(f64),

    #[error("field {field} must be a finite number")]
    NonFinite { field: &'static str },

    #[error("field {field} must not be negative, got {value}")]
    NegativeAmount { field: &'static str, value: f64 },

    #[error("deadline precedes task creation time")]
    DeadlineBeforeCreation,

    #[error("proficiency for skill {skill} must be within [0, 1], got {value}")]
    InvalidProficiency { skill: String, value: f64 },

    #[error("importance weight for skill {skill} must be positive, got {value}")]
    InvalidSkillWeight { skill: String, value: f64 },

    #[error("skill {0} is listed more than once")]
    DuplicateSkill(String),

    #[error("task {0} depends on itself")]
    SelfDependency(TaskId),

    #[error("task {0} is already known to the engine")]
    DuplicateTask(TaskId),

    #[error("worker {0} is already registered")]
    DuplicateWorker(WorkerId),

    #[error("worker {0} must accept at least one concurrent task")]
    ZeroCapacity(WorkerId),

    #[error("worker load must be within [0, 1], got {0}")]
    InvalidLoad(f64),

    #[error("task {0} must be pending to enter the queue")]
    NotPending(TaskId),

    #[error("task {id} cannot be restored in state {state:?}")]
    UnexpectedState { id: TaskId, state: TaskState },
}

/// Rejected engine configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("priority weights must sum to 1.0, got {sum}")]
    WeightSum { sum: f64 },

    #[error("priority weight {name} must be a finite, non-negative number, got {value}")]
    InvalidWeight { name: &'static str, value: f64 },

    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn setting(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            name,
            reason: reason.into(),
        }
    }
}

/// Failure of an engine operation requested by a caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("worker {0} has been terminated")]
    WorkerTerminated(WorkerId),

    #[error("task {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("task {0} is not assigned to any worker")]
    NotAssigned(TaskId),
}

/// The batch optimizer could not finish inside its budget.
///
/// Never surfaced to callers: the optimizer logs it and falls back to greedy
/// assignment.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapacityError {
    #[error("optimizer exceeded its time budget of {budget_ms}ms")]
    TimeBudget { budget_ms: u64 },

    #[error("optimizer exceeded {limit} relaxation steps")]
    IterationBudget { limit: usize },

    #[error("residual graph contains a negative cycle")]
    NegativeCycle,
}
