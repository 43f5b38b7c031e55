//! Composite priority scoring.
//!
//! The scorer is a pure function of a task and a [`SystemState`]; the same
//! inputs always produce the same [`PriorityScore`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{PriorityWeights, ScoringConfig};
use crate::error::ConfigError;
use crate::types::{Task, TaskId, Timestamp, Worker};

const EPSILON: f64 = 1e-9;
const HOURS_PER_DAY: f64 = 24.0;

const OVERDUE_URGENCY: f64 = 1.0;
const CRITICAL_URGENCY: f64 = 0.95;
const HIGH_URGENCY: f64 = 0.8;
const MEDIUM_URGENCY: f64 = 0.5;
const LOW_URGENCY: f64 = 0.2;

/// Engine state the scorer and optimizer read. Built fresh for each pass;
/// the terminal-task sets are shared with the engine, not copied.
#[derive(Clone, Debug)]
pub struct SystemState {
    pub now: Timestamp,
    pub workers: Vec<Worker>,
    /// Pending tasks that list a given task among their dependencies.
    pub dependents: HashMap<TaskId, usize>,
    pub completed: Arc<HashSet<TaskId>>,
    /// Tasks that were escalated or cancelled and will never complete.
    pub abandoned: Arc<HashSet<TaskId>>,
}

impl SystemState {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now,
            workers: Vec::new(),
            dependents: HashMap::new(),
            completed: Arc::default(),
            abandoned: Arc::default(),
        }
    }

    pub fn with_workers(mut self, workers: Vec<Worker>) -> Self {
        self.workers = workers;
        self
    }

    pub fn dependents_of(&self, id: &str) -> usize {
        self.dependents.get(id).copied().unwrap_or(0)
    }

    pub fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| self.completed.contains(dep))
    }

    /// First dependency of `task` that can no longer complete, if any.
    pub fn abandoned_dependency<'a>(&self, task: &'a Task) -> Option<&'a TaskId> {
        task.dependencies
            .iter()
            .find(|dep| self.abandoned.contains(*dep))
    }

    /// Workers that are alive and have spare capacity.
    pub fn available_workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter().filter(|worker| worker.is_available())
    }

    /// Workers that have not been terminated.
    pub fn live_workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter().filter(|worker| !worker.is_terminated())
    }
}

/// Bucket used for reporting the priority distribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityCategory {
    Critical,
    High,
    Medium,
    Low,
}

impl PriorityCategory {
    pub fn from_score(composite: f64) -> Self {
        if composite >= 0.8 {
            Self::Critical
        } else if composite >= 0.6 {
            Self::High
        } else if composite >= 0.4 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Composite priority plus the sub-scores it was derived from.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriorityScore {
    pub composite: f64,
    pub urgency: f64,
    pub impact: f64,
    pub resource: f64,
    pub revenue: f64,
    pub dependency: f64,
}

impl PriorityScore {
    pub fn category(&self) -> PriorityCategory {
        PriorityCategory::from_score(self.composite)
    }
}

#[derive(Clone, Debug)]
pub struct PriorityScorer {
    weights: PriorityWeights,
    scoring: ScoringConfig,
}

impl PriorityScorer {
    pub fn new(weights: PriorityWeights, scoring: ScoringConfig) -> Result<Self, ConfigError> {
        weights.validate()?;
        Ok(Self { weights, scoring })
    }

    pub fn weights(&self) -> &PriorityWeights {
        &self.weights
    }

    pub fn score(&self, task: &Task, state: &SystemState) -> PriorityScore {
        self.score_with_starvation(task, state, 0)
    }

    /// Score a task that has gone `starvation_cycles` rebalances without a
    /// qualified worker.
    pub fn score_with_starvation(
        &self,
        task: &Task,
        state: &SystemState,
        starvation_cycles: u32,
    ) -> PriorityScore {
        let urgency = self.urgency(task, state.now, starvation_cycles);
        let impact = self.business_impact(task);
        let resource = self.resource_efficiency(task, state);
        let revenue = self.revenue_impact(task);
        let dependency = self.dependency_impact(task, state);

        let w = &self.weights;
        let composite = unit(
            w.urgency * urgency
                + w.impact * impact
                + w.resource * resource
                + w.revenue * revenue
                + w.dependency * dependency,
        );
        PriorityScore {
            composite,
            urgency,
            impact,
            resource,
            revenue,
            dependency,
        }
    }

    fn urgency(&self, task: &Task, now: Timestamp, starvation_cycles: u32) -> f64 {
        let cfg = &self.scoring;
        let age_days = hours_between(task.created_at, now).max(0.0) / HOURS_PER_DAY;

        let base = match task.deadline {
            None => cfg.no_deadline_baseline + cfg.aging_per_day * age_days,
            Some(deadline) => {
                let hours_left = hours_between(now, deadline);
                let band = if hours_left <= 0.0 {
                    OVERDUE_URGENCY
                } else if hours_left <= cfg.critical_within_hours {
                    CRITICAL_URGENCY
                } else if hours_left <= cfg.high_within_hours {
                    HIGH_URGENCY
                } else if hours_left <= cfg.medium_within_hours {
                    MEDIUM_URGENCY
                } else {
                    LOW_URGENCY
                };
                let tight = if hours_left < task.estimated_effort * 1.5 {
                    cfg.tight_deadline_multiplier
                } else {
                    1.0
                };
                let aging = 1.0 + (age_days * cfg.aging_per_day).min(cfg.max_aging_bonus);
                band * aging * tight
            }
        };

        let boost = cfg.retry_boost * f64::from(task.retry_count)
            + cfg.starvation_boost * f64::from(starvation_cycles);
        unit(base + boost)
    }

    fn business_impact(&self, task: &Task) -> f64 {
        let tables = &self.scoring.impact;
        let type_multiplier = if task.kind.is_high_impact() {
            tables.high_impact_type_multiplier
        } else {
            1.0
        };
        unit(
            tables.base
                * tables.client_tier.get(task.business.client_tier)
                * tables.strategic_importance.get(task.business.strategic_importance)
                * tables.stakeholder.get(task.business.stakeholder)
                * type_multiplier,
        )
    }

    /// Mean scarcity of the required skills among available workers.
    fn resource_efficiency(&self, task: &Task, state: &SystemState) -> f64 {
        if task.required_capabilities.is_empty() {
            return 0.0;
        }
        let available: Vec<&Worker> = state.available_workers().collect();
        if available.is_empty() {
            return 1.0;
        }
        let total = available.len() as f64;
        let scarcity: f64 = task
            .required_capabilities
            .iter()
            .map(|req| {
                let supply = available
                    .iter()
                    .filter(|worker| {
                        worker
                            .proficiency(&req.skill)
                            .is_some_and(|p| p >= req.min_proficiency)
                    })
                    .count() as f64;
                1.0 - supply / total
            })
            .sum();
        unit(scarcity / task.required_capabilities.len() as f64)
    }

    fn revenue_impact(&self, task: &Task) -> f64 {
        let reference = self.scoring.pipeline_reference_value.max(EPSILON);
        unit((task.revenue_potential - task.cost_estimate) / reference)
    }

    fn dependency_impact(&self, task: &Task, state: &SystemState) -> f64 {
        unit(state.dependents_of(&task.id) as f64 * self.scoring.per_dependent)
    }
}

fn hours_between(from: Timestamp, to: Timestamp) -> f64 {
    (to - from).num_milliseconds() as f64 / 3_600_000.0
}

/// Clamp to `[0, 1]`, mapping NaN to 0.
fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        BusinessContext, ClientTier, RequiredCapability, StakeholderLevel, StrategicImportance,
        TaskKind,
    };
    use chrono::{TimeDelta, TimeZone, Utc};

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
    }

    fn scorer() -> PriorityScorer {
        PriorityScorer::new(PriorityWeights::default(), ScoringConfig::default()).unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn rejects_invalid_weights() {
        let weights = PriorityWeights {
            dependency: 0.3,
            ..PriorityWeights::default()
        };
        assert!(PriorityScorer::new(weights, ScoringConfig::default()).is_err());
    }

    #[test]
    fn score_is_deterministic() {
        let task = Task::new("a", TaskKind::Marketing, 3.0, t0())
            .with_deadline(t0() + TimeDelta::hours(30))
            .with_revenue(2_500.0, 500.0)
            .requiring(RequiredCapability::new("copy", 0.5));
        let state = SystemState::new(t0() + TimeDelta::hours(2))
            .with_workers(vec![Worker::new("w1", 1).with_capability("copy", 0.9)]);
        let s = scorer();
        assert_eq!(s.score(&task, &state), s.score(&task, &state));
    }

    #[test]
    fn no_deadline_urgency_never_decreases_with_age() {
        let s = scorer();
        let task = Task::new("a", TaskKind::General, 1.0, t0());
        let mut previous = 0.0;
        for hours in [0, 1, 6, 24, 72, 240, 2_400] {
            let state = SystemState::new(t0() + TimeDelta::hours(hours));
            let urgency = s.score(&task, &state).urgency;
            assert!(urgency >= previous, "urgency dropped at {hours}h");
            previous = urgency;
        }
        assert!(close(
            s.score(&task, &SystemState::new(t0())).urgency,
            0.2
        ));
        assert!(close(
            s.score(&task, &SystemState::new(t0() + TimeDelta::days(2))).urgency,
            0.4
        ));
        assert!(close(previous, 1.0));
    }

    #[test]
    fn deadline_bands_and_tight_multiplier() {
        let s = scorer();
        let state = SystemState::new(t0());
        let due_in = |hours: i64, effort: f64| {
            let task = Task::new("a", TaskKind::General, effort, t0())
                .with_deadline(t0() + TimeDelta::hours(hours));
            s.score(&task, &state).urgency
        };
        assert!(close(due_in(200, 1.0), 0.2));
        assert!(close(due_in(100, 1.0), 0.5));
        assert!(close(due_in(10, 1.0), 0.8));
        assert!(close(due_in(100, 80.0), 0.5 * 1.3));
        assert!(close(due_in(1, 0.5), 0.95));
        assert!(close(due_in(1, 2.0), 1.0));
    }

    #[test]
    fn overdue_task_is_maximally_urgent() {
        let s = scorer();
        let task = Task::new("a", TaskKind::General, 1.0, t0()).with_deadline(t0());
        let state = SystemState::new(t0() + TimeDelta::hours(3));
        assert!(close(s.score(&task, &state).urgency, 1.0));
    }

    #[test]
    fn retries_and_starvation_boost_urgency() {
        let s = scorer();
        let mut task = Task::new("a", TaskKind::General, 1.0, t0());
        let state = SystemState::new(t0());
        let plain = s.score(&task, &state).urgency;
        task.retry_count = 2;
        assert!(close(s.score(&task, &state).urgency, plain + 0.2));
        let starving = s.score_with_starvation(&task, &state, 3).urgency;
        assert!(close(starving, plain + 0.2 + 0.15));
    }

    #[test]
    fn business_impact_tables() {
        let s = scorer();
        let state = SystemState::new(t0());
        let standard = Task::new("a", TaskKind::General, 1.0, t0());
        assert!(close(s.score(&standard, &state).impact, 0.4));

        let premium = Task::new("b", TaskKind::ClientDeliverable, 1.0, t0()).with_business(
            BusinessContext {
                client_tier: ClientTier::Premium,
                strategic_importance: StrategicImportance::High,
                stakeholder: StakeholderLevel::Manager,
            },
        );
        // 0.5 * 1.2 * 1.5 * 1.0 * 1.3
        assert!(close(s.score(&premium, &state).impact, 1.0));

        let low = Task::new("c", TaskKind::Operations, 1.0, t0()).with_business(BusinessContext {
            client_tier: ClientTier::Basic,
            strategic_importance: StrategicImportance::Low,
            stakeholder: StakeholderLevel::Team,
        });
        assert!(close(s.score(&low, &state).impact, 0.5 * 0.8 * 0.5 * 0.8));
    }

    #[test]
    fn scarce_skills_raise_resource_score() {
        let s = scorer();
        let workers = vec![
            Worker::new("w1", 1).with_capability("rust", 0.9),
            Worker::new("w2", 1).with_capability("sql", 0.9),
            Worker::new("w3", 1).with_capability("sql", 0.8),
            Worker::new("w4", 1).with_capability("sql", 0.3),
        ];
        let state = SystemState::new(t0()).with_workers(workers);
        let rust = Task::new("a", TaskKind::General, 1.0, t0())
            .requiring(RequiredCapability::new("rust", 0.5));
        let sql = Task::new("b", TaskKind::General, 1.0, t0())
            .requiring(RequiredCapability::new("sql", 0.5));
        let none = Task::new("c", TaskKind::General, 1.0, t0());
        assert!(close(s.score(&rust, &state).resource, 0.75));
        assert!(close(s.score(&sql, &state).resource, 0.5));
        assert!(close(s.score(&none, &state).resource, 0.0));
    }

    #[test]
    fn no_available_workers_means_full_scarcity() {
        let s = scorer();
        let state = SystemState::new(t0());
        let task = Task::new("a", TaskKind::General, 1.0, t0())
            .requiring(RequiredCapability::new("rust", 0.5));
        assert!(close(s.score(&task, &state).resource, 1.0));
    }

    #[test]
    fn revenue_is_normalized_and_clamped() {
        let s = scorer();
        let state = SystemState::new(t0());
        let modest = Task::new("a", TaskKind::General, 1.0, t0()).with_revenue(3_000.0, 500.0);
        let loss = Task::new("b", TaskKind::General, 1.0, t0()).with_revenue(100.0, 900.0);
        let huge = Task::new("c", TaskKind::General, 1.0, t0()).with_revenue(1e9, 0.0);
        assert!(close(s.score(&modest, &state).revenue, 0.25));
        assert!(close(s.score(&loss, &state).revenue, 0.0));
        assert!(close(s.score(&huge, &state).revenue, 1.0));
    }

    #[test]
    fn dependents_raise_dependency_score() {
        let s = scorer();
        let mut state = SystemState::new(t0());
        let task = Task::new("a", TaskKind::General, 1.0, t0());
        assert!(close(s.score(&task, &state).dependency, 0.0));
        state.dependents.insert("a".into(), 2);
        assert!(close(s.score(&task, &state).dependency, 0.4));
        state.dependents.insert("a".into(), 9);
        assert!(close(s.score(&task, &state).dependency, 1.0));
    }

    #[test]
    fn blocking_task_outranks_urgent_one_under_dependency_heavy_weights() {
        let weights = PriorityWeights {
            urgency: 0.10,
            impact: 0.20,
            resource: 0.10,
            revenue: 0.10,
            dependency: 0.50,
        };
        let s = PriorityScorer::new(weights, ScoringConfig::default()).unwrap();
        let a = Task::new("a", TaskKind::General, 2.0, t0())
            .with_deadline(t0() + TimeDelta::hours(1))
            .with_revenue(1_000.0, 0.0);
        let b = Task::new("b", TaskKind::General, 1.0, t0()).with_revenue(100.0, 0.0);

        let mut state = SystemState::new(t0());
        let score_a = s.score(&a, &state);
        assert!(close(score_a.urgency, 1.0));
        assert!(close(score_a.composite, 0.19));
        assert!(close(s.score(&b, &state).composite, 0.101));

        state.dependents.insert("b".into(), 3);
        let score_b = s.score(&b, &state);
        assert!(close(score_b.composite, 0.401));
        assert!(score_b.composite > score_a.composite);

        let defaults = scorer();
        assert!(close(defaults.score(&a, &state).composite, 0.385));
        assert!(close(defaults.score(&b, &state).composite, 0.2315));
    }

    #[test]
    fn categories() {
        assert_eq!(PriorityCategory::from_score(0.85), PriorityCategory::Critical);
        assert_eq!(PriorityCategory::from_score(0.6), PriorityCategory::High);
        assert_eq!(PriorityCategory::from_score(0.45), PriorityCategory::Medium);
        assert_eq!(PriorityCategory::from_score(0.1), PriorityCategory::Low);
    }
}
