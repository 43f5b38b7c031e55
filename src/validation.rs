//! Ingestion checks for tasks and workers.
//!
//! Anything that could turn into a NaN or a nonsensical score is rejected
//! here, so scoring never has to deal with malformed input.

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::types::{Task, TaskState, Worker};

pub fn validate_task(task: &Task) -> Result<(), ValidationError> {
    validate_task_fields(task)?;
    if task.state != TaskState::Pending {
        return Err(ValidationError::NotPending(task.id.clone()));
    }
    Ok(())
}

/// Field checks for a task read back from a snapshot. A delivered task must
/// be with its worker; a reserved one must still be pending.
pub fn validate_restored_task(task: &Task, delivered: bool) -> Result<(), ValidationError> {
    validate_task_fields(task)?;
    let consistent = if delivered {
        matches!(task.state, TaskState::Assigned | TaskState::InProgress)
    } else {
        task.state == TaskState::Pending
    };
    if !consistent {
        return Err(ValidationError::UnexpectedState {
            id: task.id.clone(),
            state: task.state,
        });
    }
    Ok(())
}

fn validate_task_fields(task: &Task) -> Result<(), ValidationError> {
    if task.id.trim().is_empty() {
        return Err(ValidationError::MissingField("id"));
    }
    if !task.estimated_effort.is_finite() {
        return Err(ValidationError::NonFinite {
            field: "estimated_effort",
        });
    }
    if task.estimated_effort <= 0.0 {
        return Err(ValidationError::NonPositiveEffort(task.estimated_effort));
    }
    for (field, value) in [
        ("revenue_potential", task.revenue_potential),
        ("cost_estimate", task.cost_estimate),
    ] {
        if !value.is_finite() {
            return Err(ValidationError::NonFinite { field });
        }
        if value < 0.0 {
            return Err(ValidationError::NegativeAmount { field, value });
        }
    }
    if let Some(deadline) = task.deadline {
        if deadline < task.created_at {
            return Err(ValidationError::DeadlineBeforeCreation);
        }
    }

    let mut seen = HashSet::new();
    for req in &task.required_capabilities {
        if req.skill.trim().is_empty() {
            return Err(ValidationError::MissingField("required_capabilities.skill"));
        }
        if !seen.insert(req.skill.as_str()) {
            return Err(ValidationError::DuplicateSkill(req.skill.clone()));
        }
        if !req.min_proficiency.is_finite() || !(0.0..=1.0).contains(&req.min_proficiency) {
            return Err(ValidationError::InvalidProficiency {
                skill: req.skill.clone(),
                value: req.min_proficiency,
            });
        }
        let weight = req.weight();
        if !weight.is_finite() || weight <= 0.0 {
            return Err(ValidationError::InvalidSkillWeight {
                skill: req.skill.clone(),
                value: weight,
            });
        }
    }

    if task.dependencies.contains(&task.id) {
        return Err(ValidationError::SelfDependency(task.id.clone()));
    }
    Ok(())
}

pub fn validate_worker(worker: &Worker) -> Result<(), ValidationError> {
    if worker.id.trim().is_empty() {
        return Err(ValidationError::MissingField("id"));
    }
    if worker.max_concurrent_tasks == 0 {
        return Err(ValidationError::ZeroCapacity(worker.id.clone()));
    }
    if !worker.current_load.is_finite() || !(0.0..=1.0).contains(&worker.current_load) {
        return Err(ValidationError::InvalidLoad(worker.current_load));
    }
    for (skill, &value) in &worker.capabilities {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(ValidationError::InvalidProficiency {
                skill: skill.clone(),
                value,
            });
        }
    }
    Ok(())
}
