//! Priority-driven task dispatch: score pending work, match it to capable
//! workers, balance load and recover from failures.

pub mod capability;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod exception;
pub mod handler;
pub mod optimizer;
pub mod priority;
pub mod task_queue;
pub mod types;
pub mod validation;
pub mod workload;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{
    CancelStatus, DispatchEngine, EngineBuilder, EngineSnapshot, MonitoringSnapshot,
    OutcomeDisposition, TaskOutcome, TickReport,
};
pub use error::{CapacityError, ConfigError, EngineError, ValidationError};
pub use exception::{Escalation, EscalationReason, EscalationSink, FailureReason};
pub use handler::{HandlerRegistry, TaskHandler, TaskReport};
pub use priority::{PriorityCategory, PriorityScore};
pub use types::{
    Assignment, BusinessContext, ClientTier, RequiredCapability, StakeholderLevel,
    StrategicImportance, Task, TaskId, TaskKind, TaskState, Worker, WorkerId,
};
