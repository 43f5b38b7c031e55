//! Failure classification, bounded retry and escalation.
//!
//! Each failure walks `Detected -> AutoRecoveryAttempted -> Recovered` when a
//! retry succeeds, or ends in `Escalated` through `AutoRecoveryFailed` (retry
//! budget spent) or directly (permanent failure). Escalation is terminal for
//! the engine: the task is recorded and handed to an [`EscalationSink`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::error::EngineError;
use crate::types::{Task, TaskId, TaskState, Timestamp};

/// Why a task attempt failed, as reported by a worker or detected by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FailureReason {
    Timeout,
    ResourceUnavailable,
    /// The owning worker terminated or went silent.
    WorkerLost,
    Rejected(String),
    InvalidResult(String),
    Internal(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
}

impl FailureReason {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Timeout | Self::ResourceUnavailable | Self::WorkerLost => FailureClass::Transient,
            Self::Rejected(_) | Self::InvalidResult(_) | Self::Internal(_) => FailureClass::Permanent,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::ResourceUnavailable => write!(f, "resource unavailable"),
            Self::WorkerLost => write!(f, "worker lost"),
            Self::Rejected(why) => write!(f, "rejected: {why}"),
            Self::InvalidResult(why) => write!(f, "invalid result: {why}"),
            Self::Internal(why) => write!(f, "internal error: {why}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Detected,
    AutoRecoveryAttempted,
    Recovered,
    AutoRecoveryFailed,
    Escalated,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EscalationReason {
    PermanentFailure { reason: FailureReason },
    RetriesExhausted { attempts: u32, last: FailureReason },
    StarvationTimeout { waited_secs: i64 },
    DependencyAbandoned { dependency: TaskId },
    InvariantViolation { detail: String },
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermanentFailure { reason } => write!(f, "permanent failure ({reason})"),
            Self::RetriesExhausted { attempts, last } => {
                write!(f, "retries exhausted after {attempts} attempts ({last})")
            }
            Self::StarvationTimeout { waited_secs } => {
                write!(f, "no qualified worker after {waited_secs}s")
            }
            Self::DependencyAbandoned { dependency } => {
                write!(f, "dependency {dependency} will never complete")
            }
            Self::InvariantViolation { detail } => write!(f, "invariant violation: {detail}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Uuid,
    pub task_id: TaskId,
    pub reason: EscalationReason,
    pub at: Timestamp,
}

/// External channel that receives escalations (ops, stakeholders).
pub trait EscalationSink: Send + Sync {
    fn escalate(&self, escalation: &Escalation);
}

/// Default sink: an error-level log event per escalation.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogEscalationSink;

impl EscalationSink for LogEscalationSink {
    fn escalate(&self, escalation: &Escalation) {
        error!(
            escalation_id = %escalation.id,
            task_id = %escalation.task_id,
            reason = %escalation.reason,
            "task escalated"
        );
    }
}

/// Sink that keeps escalations in memory, for callers that poll.
#[derive(Clone, Debug, Default)]
pub struct CollectingSink {
    seen: Arc<Mutex<Vec<Escalation>>>,
}

impl CollectingSink {
    pub fn escalations(&self) -> Vec<Escalation> {
        self.seen.lock().expect("escalation sink mutex poisoned").clone()
    }
}

impl EscalationSink for CollectingSink {
    fn escalate(&self, escalation: &Escalation) {
        self.seen
            .lock()
            .expect("escalation sink mutex poisoned")
            .push(escalation.clone());
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub task_id: TaskId,
    pub state: RecoveryState,
    pub attempts: u32,
    pub last_reason: Option<FailureReason>,
    pub updated_at: Timestamp,
}

#[derive(Debug)]
pub enum RecoveryDecision {
    /// Task moved back to `Pending` with its retry count bumped.
    Retry(Task),
    Escalated(Escalation),
}

#[derive(Default)]
struct RecordBook {
    records: HashMap<TaskId, FailureRecord>,
    /// Ids whose record reached `Recovered` or `Escalated`, oldest first.
    closed: VecDeque<TaskId>,
}

impl RecordBook {
    fn close(&mut self, task_id: &str, retention: usize) {
        self.closed.push_back(task_id.to_string());
        while self.closed.len() > retention {
            if let Some(oldest) = self.closed.pop_front() {
                self.records.remove(&oldest);
            }
        }
    }
}

#[derive(Default)]
struct EscalationLog {
    recent: VecDeque<Escalation>,
    total: usize,
}

pub struct ExceptionHandler {
    config: RecoveryConfig,
    sink: Arc<dyn EscalationSink>,
    book: Mutex<RecordBook>,
    escalations: Mutex<EscalationLog>,
}

impl ExceptionHandler {
    pub fn new(config: RecoveryConfig, sink: Arc<dyn EscalationSink>) -> Self {
        Self {
            config,
            sink,
            book: Mutex::new(RecordBook::default()),
            escalations: Mutex::new(EscalationLog::default()),
        }
    }

    fn book(&self) -> MutexGuard<'_, RecordBook> {
        self.book.lock().expect("failure records mutex poisoned")
    }

    fn escalation_log(&self) -> MutexGuard<'_, EscalationLog> {
        self.escalations.lock().expect("escalation log mutex poisoned")
    }

    /// Classify a failed attempt of `task` and decide between retry and
    /// escalation. `task` may be in any non-terminal state or already
    /// `Failed`; it is moved to `Failed` first.
    pub fn handle_failure(
        &self,
        mut task: Task,
        reason: FailureReason,
        now: Timestamp,
    ) -> Result<RecoveryDecision, EngineError> {
        if task.state != TaskState::Failed {
            task.transition(TaskState::Failed)?;
        }
        self.set_state(&task.id, RecoveryState::Detected, Some(&reason), task.retry_count, now);

        if reason.class() == FailureClass::Permanent {
            let escalation =
                self.escalate(&task.id, EscalationReason::PermanentFailure { reason }, now);
            return Ok(RecoveryDecision::Escalated(escalation));
        }

        if task.retry_count >= self.config.max_retries {
            self.set_state(
                &task.id,
                RecoveryState::AutoRecoveryFailed,
                Some(&reason),
                task.retry_count,
                now,
            );
            let escalation = self.escalate(
                &task.id,
                EscalationReason::RetriesExhausted {
                    attempts: task.retry_count + 1,
                    last: reason,
                },
                now,
            );
            return Ok(RecoveryDecision::Escalated(escalation));
        }

        task.transition(TaskState::Pending)?;
        task.retry_count += 1;
        self.set_state(
            &task.id,
            RecoveryState::AutoRecoveryAttempted,
            Some(&reason),
            task.retry_count,
            now,
        );
        info!(
            task_id = %task.id,
            attempt = task.retry_count,
            max = self.config.max_retries,
            reason = %reason,
            "retry scheduled"
        );
        Ok(RecoveryDecision::Retry(task))
    }

    /// Report an escalation to the sink and record it.
    pub fn escalate(&self, task_id: &str, reason: EscalationReason, now: Timestamp) -> Escalation {
        let escalation = Escalation {
            id: Uuid::new_v4(),
            task_id: task_id.to_string(),
            reason,
            at: now,
        };
        let attempts = self.book().records.get(task_id).map_or(0, |r| r.attempts);
        self.set_state(task_id, RecoveryState::Escalated, None, attempts, now);
        self.sink.escalate(&escalation);
        let mut log = self.escalation_log();
        log.total += 1;
        log.recent.push_back(escalation.clone());
        while log.recent.len() > self.config.record_retention {
            log.recent.pop_front();
        }
        escalation
    }

    /// A retried task completed; close out its record.
    pub fn mark_recovered(&self, task_id: &str, now: Timestamp) {
        let mut book = self.book();
        let Some(record) = book.records.get_mut(task_id) else {
            return;
        };
        if record.state == RecoveryState::AutoRecoveryAttempted {
            record.state = RecoveryState::Recovered;
            record.updated_at = now;
            book.close(task_id, self.config.record_retention);
        }
    }

    pub fn record(&self, task_id: &str) -> Option<FailureRecord> {
        self.book().records.get(task_id).cloned()
    }

    /// Escalations raised since start, including ones no longer retained.
    pub fn escalation_count(&self) -> usize {
        self.escalation_log().total
    }

    /// The most recent escalations, oldest first.
    pub fn escalations(&self) -> Vec<Escalation> {
        self.escalation_log().recent.iter().cloned().collect()
    }

    fn set_state(
        &self,
        task_id: &str,
        state: RecoveryState,
        reason: Option<&FailureReason>,
        attempts: u32,
        now: Timestamp,
    ) {
        let mut book = self.book();
        let record = book
            .records
            .entry(task_id.to_string())
            .or_insert_with(|| FailureRecord {
                task_id: task_id.to_string(),
                state,
                attempts,
                last_reason: None,
                updated_at: now,
            });
        record.state = state;
        record.attempts = attempts;
        record.updated_at = now;
        if let Some(reason) = reason {
            record.last_reason = Some(reason.clone());
        }
        if state == RecoveryState::Escalated {
            book.close(task_id, self.config.record_retention);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskKind;
    use chrono::{TimeZone, Utc};

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap()
    }

    fn handler(max_retries: u32) -> (ExceptionHandler, CollectingSink) {
        let sink = CollectingSink::default();
        let config = RecoveryConfig {
            max_retries,
            ..RecoveryConfig::default()
        };
        let handler = ExceptionHandler::new(config, Arc::new(sink.clone()));
        (handler, sink)
    }

    fn running(id: &str) -> Task {
        let mut task = Task::new(id, TaskKind::General, 1.0, now());
        task.transition(TaskState::Assigned).unwrap();
        task.transition(TaskState::InProgress).unwrap();
        task
    }

    fn fail(handler: &ExceptionHandler, task: Task) -> RecoveryDecision {
        handler
            .handle_failure(task, FailureReason::Timeout, now())
            .unwrap()
    }

    #[test]
    fn transient_failures_retry_until_budget_then_escalate() {
        let (handler, sink) = handler(3);
        let mut task = running("t1");
        for attempt in 1..=3 {
            match fail(&handler, task) {
                RecoveryDecision::Retry(retried) => {
                    assert_eq!(retried.state, TaskState::Pending);
                    assert_eq!(retried.retry_count, attempt);
                    task = retried;
                    task.transition(TaskState::Assigned).unwrap();
                }
                other => panic!("attempt {attempt} should retry, got {other:?}"),
            }
        }
        match fail(&handler, task) {
            RecoveryDecision::Escalated(escalation) => {
                assert_eq!(
                    escalation.reason,
                    EscalationReason::RetriesExhausted {
                        attempts: 4,
                        last: FailureReason::Timeout
                    }
                );
            }
            other => panic!("fourth failure should escalate, got {other:?}"),
        }
        assert_eq!(handler.record("t1").unwrap().state, RecoveryState::Escalated);
        assert_eq!(sink.escalations().len(), 1);
        assert_eq!(handler.escalation_count(), 1);
    }

    #[test]
    fn permanent_failure_escalates_immediately() {
        let (handler, sink) = handler(3);
        let decision = handler
            .handle_failure(
                running("t1"),
                FailureReason::Rejected("out of scope".into()),
                now(),
            )
            .unwrap();
        assert!(matches!(
            decision,
            RecoveryDecision::Escalated(Escalation {
                reason: EscalationReason::PermanentFailure { .. },
                ..
            })
        ));
        assert_eq!(sink.escalations()[0].task_id, "t1");
    }

    #[test]
    fn zero_retry_budget_escalates_first_transient_failure() {
        let (handler, _) = handler(0);
        assert!(matches!(
            fail(&handler, running("t1")),
            RecoveryDecision::Escalated(_)
        ));
    }

    #[test]
    fn completed_retry_is_marked_recovered() {
        let (handler, _) = handler(3);
        let RecoveryDecision::Retry(_) = fail(&handler, running("t1")) else {
            panic!("expected retry");
        };
        assert_eq!(
            handler.record("t1").unwrap().state,
            RecoveryState::AutoRecoveryAttempted
        );
        handler.mark_recovered("t1", now());
        assert_eq!(handler.record("t1").unwrap().state, RecoveryState::Recovered);
    }

    #[test]
    fn terminal_tasks_cannot_fail() {
        let (handler, _) = handler(3);
        let mut task = running("t1");
        task.transition(TaskState::Completed).unwrap();
        assert!(handler
            .handle_failure(task, FailureReason::Timeout, now())
            .is_err());
    }

    #[test]
    fn closed_records_and_escalations_are_bounded() {
        let sink = CollectingSink::default();
        let config = RecoveryConfig {
            max_retries: 3,
            record_retention: 2,
        };
        let handler = ExceptionHandler::new(config, Arc::new(sink.clone()));
        for id in ["t1", "t2", "t3"] {
            handler.escalate(
                id,
                EscalationReason::InvariantViolation {
                    detail: "test".into(),
                },
                now(),
            );
        }
        assert!(handler.record("t1").is_none());
        assert!(handler.record("t3").is_some());
        assert_eq!(handler.escalation_count(), 3);
        let kept: Vec<_> = handler
            .escalations()
            .into_iter()
            .map(|e| e.task_id)
            .collect();
        assert_eq!(kept, vec!["t2".to_string(), "t3".to_string()]);
        assert_eq!(sink.escalations().len(), 3);

        // Open records are never evicted.
        let RecoveryDecision::Retry(_) = fail(&handler, running("open")) else {
            panic!("expected retry");
        };
        handler.escalate(
            "t4",
            EscalationReason::InvariantViolation {
                detail: "test".into(),
            },
            now(),
        );
        assert_eq!(
            handler.record("open").unwrap().state,
            RecoveryState::AutoRecoveryAttempted
        );
    }

    #[test]
    fn classification() {
        assert_eq!(FailureReason::WorkerLost.class(), FailureClass::Transient);
        assert_eq!(FailureReason::ResourceUnavailable.class(), FailureClass::Transient);
        assert_eq!(
            FailureReason::InvalidResult("bad".into()).class(),
            FailureClass::Permanent
        );
    }
}
