//! Pairwise fit between a task and a worker.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::config::MatchingConfig;
use crate::types::{Skill, Task, TaskId, Worker, WorkerId};

const EXACT_MATCH_BONUS: f64 = 0.1;
const EXPERIENCE_BONUS: f64 = 0.05;
const MAX_EXPERIENCE_BONUS: f64 = 0.2;
const GAP_PENALTY: f64 = 0.15;
const MIN_CONFIDENCE: f64 = 0.2;
/// Unrequested skills beyond this count are worth pointing out.
const SPARE_SKILLS_NOTE: usize = 3;
const LOW_QUALITY: f64 = 0.6;
/// Gaps named in a training recommendation.
const NAMED_GAPS: usize = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityAssessment {
    pub worker_id: WorkerId,
    pub task_id: TaskId,
    /// Final score within `[0, 1]`, including the performance shift.
    pub score: f64,
    /// Weighted proficiency coverage before the performance shift.
    pub skill_score: f64,
    /// Relative shift applied from recent quality on the same task kind.
    pub performance_shift: f64,
    /// Every required skill meets its minimum proficiency.
    pub meets_minimum: bool,
    /// Required skills below their minimum, or absent.
    pub missing: Vec<Skill>,
    pub reasoning: String,
    /// How much to trust this pairing, within `[0.2, 1]`.
    pub confidence: f64,
    /// Suggestions for closing gaps or using the worker better.
    pub recommendations: Vec<String>,
    /// Worker load at assessment time, kept for tie-breaking.
    pub load: f64,
}

impl CompatibilityAssessment {
    /// Preference order: higher score, then lower load, then lower id.
    pub fn cmp_preference(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.load.total_cmp(&other.load))
            .then_with(|| self.worker_id.cmp(&other.worker_id))
    }
}

#[derive(Clone, Debug, Default)]
pub struct CapabilityMatcher {
    config: MatchingConfig,
}

impl CapabilityMatcher {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    pub fn compatibility(&self, worker: &Worker, task: &Task) -> CompatibilityAssessment {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        let mut missing = Vec::new();
        let mut exact = 0usize;

        for req in &task.required_capabilities {
            let weight = req.weight();
            total_weight += weight;
            match worker.proficiency(&req.skill) {
                Some(p) => {
                    weighted += weight * p.clamp(0.0, 1.0);
                    if p < req.min_proficiency {
                        missing.push(req.skill.clone());
                    } else {
                        exact += 1;
                    }
                }
                None => missing.push(req.skill.clone()),
            }
        }

        let skill_score = if total_weight > 0.0 {
            weighted / total_weight
        } else {
            1.0
        };
        let experience = Self::experience_on(worker, task);
        let performance_shift = self.performance_shift(&experience);
        let score = (skill_score * (1.0 + performance_shift)).clamp(0.0, 1.0);
        let meets_minimum = missing.is_empty();

        let reasoning = if task.required_capabilities.is_empty() {
            "no skills required".to_string()
        } else if meets_minimum {
            format!(
                "meets all {} required skills (coverage {:.2}, history shift {:+.2})",
                task.required_capabilities.len(),
                skill_score,
                performance_shift
            )
        } else {
            format!("below minimum on {}", missing.join(", "))
        };

        let confidence = (score + exact as f64 * EXACT_MATCH_BONUS
            + (experience.count as f64 * EXPERIENCE_BONUS).min(MAX_EXPERIENCE_BONUS)
            - missing.len() as f64 * GAP_PENALTY)
            .clamp(MIN_CONFIDENCE, 1.0);
        let recommendations = Self::recommendations(worker, task, &missing);

        CompatibilityAssessment {
            worker_id: worker.id.clone(),
            task_id: task.id.clone(),
            score,
            skill_score,
            performance_shift,
            meets_minimum,
            missing,
            reasoning,
            confidence,
            recommendations,
            load: worker.current_load,
        }
    }

    pub fn meets_minimum(&self, worker: &Worker, task: &Task) -> bool {
        task.required_capabilities.iter().all(|req| {
            worker
                .proficiency(&req.skill)
                .is_some_and(|p| p >= req.min_proficiency)
        })
    }

    /// Assess every live worker with spare capacity, best first.
    pub fn rank_workers<'a, I>(&self, task: &Task, workers: I) -> Vec<CompatibilityAssessment>
    where
        I: IntoIterator<Item = &'a Worker>,
    {
        let mut ranked: Vec<_> = workers
            .into_iter()
            .filter(|worker| worker.is_available())
            .map(|worker| self.compatibility(worker, task))
            .collect();
        ranked.sort_by(|a, b| a.cmp_preference(b));
        ranked
    }

    /// Best qualified worker for `task`, if any.
    pub fn best_worker<'a, I>(&self, task: &Task, workers: I) -> Option<CompatibilityAssessment>
    where
        I: IntoIterator<Item = &'a Worker>,
    {
        self.rank_workers(task, workers)
            .into_iter()
            .find(|assessment| assessment.meets_minimum)
    }

    /// Average quality on the task's kind mapped onto `[-max, +max]`.
    fn performance_shift(&self, experience: &Experience) -> f64 {
        match experience.average_quality() {
            Some(average) => (average - 0.5) * 2.0 * self.config.max_performance_shift,
            None => 0.0,
        }
    }

    fn experience_on(worker: &Worker, task: &Task) -> Experience {
        worker
            .performance_history
            .iter()
            .filter(|record| record.kind == task.kind)
            .fold(Experience::default(), |acc, record| Experience {
                quality_sum: acc.quality_sum + record.quality.clamp(0.0, 1.0),
                count: acc.count + 1,
            })
    }

    fn recommendations(worker: &Worker, task: &Task, missing: &[Skill]) -> Vec<String> {
        let mut out = Vec::new();
        if !missing.is_empty() {
            let named: Vec<&str> = missing.iter().take(NAMED_GAPS).map(String::as_str).collect();
            out.push(format!("consider training in: {}", named.join(", ")));
        }
        let spare = worker
            .capabilities
            .keys()
            .filter(|skill| {
                !task
                    .required_capabilities
                    .iter()
                    .any(|req| &req.skill == *skill)
            })
            .count();
        if spare > SPARE_SKILLS_NOTE {
            out.push(format!("{spare} unrequested capabilities could be put to use"));
        }
        let (sum, count) = worker
            .performance_history
            .iter()
            .fold((0.0, 0usize), |(sum, count), record| {
                (sum + record.quality.clamp(0.0, 1.0), count + 1)
            });
        if count > 0 && sum / (count as f64) < LOW_QUALITY {
            out.push("low success rate; consider mentoring or lighter assignments".to_string());
        }
        out
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Experience {
    quality_sum: f64,
    count: usize,
}

impl Experience {
    fn average_quality(&self) -> Option<f64> {
        (self.count > 0).then(|| self.quality_sum / self.count as f64)
    }
}
