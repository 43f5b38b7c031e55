//! Shared identifiers and the task/worker model used across the engine.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Unique identifier for a task.
pub type TaskId = String;
/// Unique identifier for a worker.
pub type WorkerId = String;
/// Name of a capability a task can require and a worker can declare.
pub type Skill = String;
/// Wall-clock instant used throughout the engine.
pub type Timestamp = DateTime<Utc>;

/// Domain category of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ClientDeliverable,
    RevenueGeneration,
    ComplianceRequirement,
    ContentCreation,
    DataAnalysis,
    SoftwareDevelopment,
    Marketing,
    Sales,
    Operations,
    General,
}

impl TaskKind {
    /// Kinds whose business impact carries the high-impact multiplier.
    pub fn is_high_impact(self) -> bool {
        matches!(
            self,
            Self::ClientDeliverable | Self::RevenueGeneration | Self::ComplianceRequirement
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientTier {
    Enterprise,
    Premium,
    #[default]
    Standard,
    Basic,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategicImportance {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeholderLevel {
    Ceo,
    Executive,
    Manager,
    #[default]
    Team,
}

/// Business attributes feeding the impact sub-score.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessContext {
    #[serde(default)]
    pub client_tier: ClientTier,
    #[serde(default)]
    pub strategic_importance: StrategicImportance,
    #[serde(default)]
    pub stakeholder: StakeholderLevel,
}

/// A skill the task needs, with the minimum proficiency that counts as qualified.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequiredCapability {
    pub skill: Skill,
    pub min_proficiency: f64,
    /// Relative importance within the task; uniform when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl RequiredCapability {
    pub fn new(skill: impl Into<Skill>, min_proficiency: f64) -> Self {
        Self {
            skill: skill.into(),
            min_proficiency,
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn weight(&self) -> f64 {
        self.weight.unwrap_or(1.0)
    }
}

/// Task lifecycle.
///
/// Transitions only move forward, except `Failed -> Pending` for an automated
/// retry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Assigned, InProgress)
                | (Assigned, Completed)
                | (Assigned, Failed)
                | (Assigned, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (Failed, Pending)
        )
    }
}

/// Unit of work distributed by the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub required_capabilities: Vec<RequiredCapability>,
    #[serde(default)]
    pub deadline: Option<Timestamp>,
    pub created_at: Timestamp,
    /// Estimated effort in hours.
    pub estimated_effort: f64,
    #[serde(default)]
    pub revenue_potential: f64,
    #[serde(default)]
    pub cost_estimate: f64,
    /// Tasks that must complete before this one may be dequeued.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub business: BusinessContext,
    #[serde(default)]
    pub state: TaskState,
    /// Automated retries already spent on this task.
    #[serde(default)]
    pub retry_count: u32,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        kind: TaskKind,
        estimated_effort: f64,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            title: String::new(),
            required_capabilities: Vec::new(),
            deadline: None,
            created_at,
            estimated_effort,
            revenue_potential: 0.0,
            cost_estimate: 0.0,
            dependencies: BTreeSet::new(),
            business: BusinessContext::default(),
            state: TaskState::Pending,
            retry_count: 0,
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Timestamp) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_revenue(mut self, revenue_potential: f64, cost_estimate: f64) -> Self {
        self.revenue_potential = revenue_potential;
        self.cost_estimate = cost_estimate;
        self
    }

    pub fn requiring(mut self, capability: RequiredCapability) -> Self {
        self.required_capabilities.push(capability);
        self
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn with_business(mut self, business: BusinessContext) -> Self {
        self.business = business;
        self
    }

    /// Move to `next`, rejecting anything the lifecycle does not allow.
    pub fn transition(&mut self, next: TaskState) -> Result<(), EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Estimated effort as a time span, for completion estimates.
    pub fn effort_span(&self) -> TimeDelta {
        let millis = (self.estimated_effort.max(0.0) * 3_600_000.0).min(i64::MAX as f64);
        TimeDelta::try_milliseconds(millis as i64).unwrap_or(TimeDelta::MAX)
    }
}

/// One completed task in a worker's rolling performance window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub kind: TaskKind,
    pub completion_hours: f64,
    /// Quality score within `[0, 1]`.
    pub quality: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    Terminated,
}

/// A worker (agent) that pulls tasks from the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    /// Declared proficiency per skill, within `[0, 1]`.
    #[serde(default)]
    pub capabilities: BTreeMap<Skill, f64>,
    /// Smoothed utilization within `[0, 1]`.
    #[serde(default)]
    pub current_load: f64,
    pub max_concurrent_tasks: usize,
    /// Assignments currently held (delivered or reserved).
    #[serde(default)]
    pub active_tasks: usize,
    #[serde(default)]
    pub performance_history: VecDeque<PerformanceRecord>,
    #[serde(default)]
    pub status: WorkerStatus,
}

impl Worker {
    pub fn new(id: impl Into<WorkerId>, max_concurrent_tasks: usize) -> Self {
        Self {
            id: id.into(),
            capabilities: BTreeMap::new(),
            current_load: 0.0,
            max_concurrent_tasks,
            active_tasks: 0,
            performance_history: VecDeque::new(),
            status: WorkerStatus::Idle,
        }
    }

    pub fn with_capability(mut self, skill: impl Into<Skill>, proficiency: f64) -> Self {
        self.capabilities.insert(skill.into(), proficiency);
        self
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.current_load = load;
        self
    }

    pub fn proficiency(&self, skill: &str) -> Option<f64> {
        self.capabilities.get(skill).copied()
    }

    pub fn is_terminated(&self) -> bool {
        self.status == WorkerStatus::Terminated
    }

    pub fn remaining_capacity(&self) -> usize {
        if self.is_terminated() {
            return 0;
        }
        self.max_concurrent_tasks.saturating_sub(self.active_tasks)
    }

    pub fn is_available(&self) -> bool {
        self.remaining_capacity() > 0
    }

    /// Append a record, discarding the oldest beyond `window`.
    pub fn record_performance(&mut self, record: PerformanceRecord, window: usize) {
        self.performance_history.push_back(record);
        while self.performance_history.len() > window.max(1) {
            self.performance_history.pop_front();
        }
    }
}

/// Pairing of a task with the worker that owns it until an outcome is reported.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub assigned_at: Timestamp,
    pub estimated_completion: Timestamp,
    /// Composite priority at assignment time.
    pub priority: f64,
    /// Compatibility score of the pairing.
    pub compatibility: f64,
}

impl Assignment {
    pub fn new(
        task: &Task,
        worker_id: impl Into<WorkerId>,
        assigned_at: Timestamp,
        priority: f64,
        compatibility: f64,
    ) -> Self {
        let estimated_completion = assigned_at
            .checked_add_signed(task.effort_span())
            .unwrap_or(assigned_at);
        Self {
            task_id: task.id.clone(),
            worker_id: worker_id.into(),
            assigned_at,
            estimated_completion,
            priority,
            compatibility,
        }
    }
}
