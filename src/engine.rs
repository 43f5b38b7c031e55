//! The dispatch engine: ingestion, worker requests, outcome reporting and
//! periodic maintenance over a shared queue.
//!
//! Lock order is registry, then queue, then monitor. The queue and monitor
//! never call back into the engine.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::CapabilityMatcher;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, ValidationError};
use crate::exception::{
    Escalation, EscalationReason, EscalationSink, ExceptionHandler, FailureReason, FailureRecord,
    LogEscalationSink, RecoveryDecision,
};
use crate::handler::TaskReport;
use crate::optimizer::{AssignmentOptimizer, BatchOutcome};
use crate::priority::{PriorityCategory, PriorityScore, PriorityScorer, SystemState};
use crate::task_queue::{QueueSnapshot, QueuedTask, RebalanceReport, TaskQueue};
use crate::types::{
    Assignment, PerformanceRecord, Task, TaskId, TaskState, Timestamp, Worker, WorkerId,
    WorkerStatus,
};
use crate::validation::{validate_restored_task, validate_task, validate_worker};
use crate::workload::{UtilizationSnapshot, WorkloadMonitor};

/// Outcome a worker reports for a task it owns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { quality: f64 },
    Failed(FailureReason),
    /// The worker acknowledged a cancellation request.
    Cancelled,
}

impl From<Result<TaskReport, FailureReason>> for TaskOutcome {
    fn from(result: Result<TaskReport, FailureReason>) -> Self {
        match result {
            Ok(report) => Self::Completed {
                quality: report.quality,
            },
            Err(reason) => Self::Failed(reason),
        }
    }
}

/// What the engine did with a reported outcome.
#[derive(Clone, Debug, PartialEq)]
pub enum OutcomeDisposition {
    Completed,
    Retried { attempt: u32 },
    Escalated { escalation_id: Uuid },
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelStatus {
    Cancelled,
    /// Delivered to the owning worker; final once it reports `Cancelled`.
    Requested { worker_id: WorkerId },
    /// Unknown or already finished.
    NotFound,
}

/// A task that has left the queue and is owned by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InFlightTask {
    pub task: Task,
    pub assignment: Assignment,
    /// False while the task is only reserved by the batch optimizer; the
    /// task stays `Pending` until the worker collects it.
    pub delivered: bool,
    pub enqueued_at: Timestamp,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineCounters {
    pub submitted: u64,
    pub assigned: u64,
    pub reserved: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub escalated: u64,
    pub degraded_batches: u64,
}

/// Periodic export for dashboards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSnapshot {
    pub at: Timestamp,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub reserved: usize,
    /// Mean time currently queued tasks have waited.
    pub average_queue_wait_secs: f64,
    /// Mean time from enqueue to delivery over all assignments.
    pub average_assignment_wait_secs: f64,
    pub average_compatibility: f64,
    pub priority_distribution: BTreeMap<PriorityCategory, usize>,
    pub utilization: UtilizationSnapshot,
    pub offline_workers: Vec<WorkerId>,
    pub escalation_count: usize,
    pub counters: EngineCounters,
}

/// Serializable engine state for restarts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub taken_at: Timestamp,
    pub queue: QueueSnapshot,
    pub in_flight: Vec<InFlightTask>,
    pub workers: Vec<Worker>,
    pub finished: BTreeMap<TaskId, TaskState>,
}

impl EngineSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let raw = self.to_json().context("serialize engine snapshot")?;
        std::fs::write(path, raw).with_context(|| format!("write {}", path.display()))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parse {}", path.display()))
    }
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub offline: Vec<WorkerId>,
    pub rebalance: Option<RebalanceReport>,
    pub batch: Option<BatchOutcome>,
}

#[derive(Default)]
struct Registry {
    workers: BTreeMap<WorkerId, Worker>,
    in_flight: HashMap<TaskId, InFlightTask>,
    /// Terminal tasks: completed, escalated (failed) or cancelled.
    finished: BTreeMap<TaskId, TaskState>,
    /// `finished` split for dependency checks, shared with each `SystemState`.
    completed: Arc<HashSet<TaskId>>,
    abandoned: Arc<HashSet<TaskId>>,
    cancel_requests: HashSet<TaskId>,
    history: VecDeque<Assignment>,
    counters: EngineCounters,
    total_wait_secs: f64,
    total_compatibility: f64,
    last_optimize: Option<Timestamp>,
}

impl Registry {
    fn is_known(&self, id: &str) -> bool {
        self.in_flight.contains_key(id) || self.finished.contains_key(id)
    }

    /// Record a terminal state. Call with no `SystemState` alive, or the
    /// shared set is copied.
    fn finish(&mut self, id: &str, state: TaskState) {
        let set = if state == TaskState::Completed {
            &mut self.completed
        } else {
            &mut self.abandoned
        };
        Arc::make_mut(set).insert(id.to_string());
        self.finished.insert(id.to_string(), state);
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EscalationSink>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            sink: Arc::new(LogEscalationSink),
        }
    }
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn escalation_sink(mut self, sink: impl EscalationSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn build(self) -> Result<DispatchEngine, EngineError> {
        let config = self.config;
        config.validate()?;
        let scorer = PriorityScorer::new(config.weights, config.scoring.clone())?;
        let matcher = CapabilityMatcher::new(config.matching.clone());
        Ok(DispatchEngine {
            queue: TaskQueue::new(scorer, matcher.clone(), config.queue.clone()),
            optimizer: AssignmentOptimizer::new(matcher, config.optimizer.clone()),
            monitor: WorkloadMonitor::new(&config.monitor),
            exceptions: ExceptionHandler::new(config.recovery.clone(), self.sink),
            clock: self.clock,
            registry: Mutex::new(Registry::default()),
            rebalance_gate: Mutex::new(()),
            rebalance_pending: AtomicBool::new(false),
            config,
        })
    }
}

pub struct DispatchEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    queue: TaskQueue,
    optimizer: AssignmentOptimizer,
    monitor: WorkloadMonitor,
    exceptions: ExceptionHandler,
    registry: Mutex<Registry>,
    /// Held for the duration of a rebalance pass.
    rebalance_gate: Mutex<()>,
    /// A rebalance was asked for and has not run since; the gate holder
    /// repeats its pass until this is clear.
    rebalance_pending: AtomicBool,
}

impl DispatchEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("engine registry mutex poisoned")
    }

    fn system_state(&self, reg: &Registry, now: Timestamp) -> SystemState {
        let mut state = SystemState::new(now);
        state.workers = reg.workers.values().cloned().collect();
        state.dependents = self.queue.dependent_counts();
        state.completed = Arc::clone(&reg.completed);
        state.abandoned = Arc::clone(&reg.abandoned);
        state
    }

    /// Validate and enqueue a new task.
    pub fn submit_task(&self, task: Task) -> Result<PriorityScore, EngineError> {
        validate_task(&task)?;
        let now = self.clock.now();
        let mut reg = self.registry();
        if reg.is_known(&task.id) {
            return Err(ValidationError::DuplicateTask(task.id).into());
        }
        let id = task.id.clone();
        let state = self.system_state(&reg, now);
        let score = self.queue.enqueue(task, &state)?;
        reg.counters.submitted += 1;
        info!(
            task_id = %id,
            score = score.composite,
            category = ?score.category(),
            "task enqueued"
        );
        Ok(score)
    }

    pub fn register_worker(&self, mut worker: Worker) -> Result<(), EngineError> {
        validate_worker(&worker)?;
        let now = self.clock.now();
        {
            let mut reg = self.registry();
            if reg.workers.contains_key(&worker.id) {
                return Err(ValidationError::DuplicateWorker(worker.id).into());
            }
            worker.active_tasks = 0;
            worker.status = WorkerStatus::Idle;
            self.monitor.register_worker(
                &worker.id,
                worker.max_concurrent_tasks,
                worker.current_load,
                now,
            );
            info!(
                worker_id = %worker.id,
                capacity = worker.max_concurrent_tasks,
                skills = worker.capabilities.len(),
                "worker registered"
            );
            reg.workers.insert(worker.id.clone(), worker);
        }
        self.rebalance();
        Ok(())
    }

    /// Terminate a worker. Reserved tasks go back to the queue untouched;
    /// delivered tasks fail with `WorkerLost` and follow the retry policy.
    pub fn terminate_worker(&self, worker_id: &str) -> Result<Vec<TaskId>, EngineError> {
        let now = self.clock.now();
        let affected = {
            let mut guard = self.registry();
            let reg = &mut *guard;
            let worker = reg
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| EngineError::UnknownWorker(worker_id.to_string()))?;
            if worker.is_terminated() {
                return Ok(Vec::new());
            }
            worker.status = WorkerStatus::Terminated;
            self.monitor.remove_worker(worker_id);

            let mut owned: Vec<TaskId> = reg
                .in_flight
                .values()
                .filter(|flight| flight.assignment.worker_id == worker_id)
                .map(|flight| flight.task.id.clone())
                .collect();
            owned.sort();

            for task_id in &owned {
                let Some(flight) = reg.in_flight.remove(task_id) else {
                    continue;
                };
                self.release_worker(reg, worker_id, false);
                if flight.delivered {
                    self.fail_in_flight(reg, flight, FailureReason::WorkerLost, now)?;
                } else {
                    let state = self.system_state(reg, now);
                    self.queue.requeue(flight.task, flight.enqueued_at, &state)?;
                }
            }
            warn!(worker_id, requeued = owned.len(), "worker terminated");
            owned
        };
        self.rebalance();
        Ok(affected)
    }

    pub fn heartbeat(&self, worker_id: &str) -> Result<(), EngineError> {
        let now = self.clock.now();
        let reg = self.registry();
        let worker = reg
            .workers
            .get(worker_id)
            .ok_or_else(|| EngineError::UnknownWorker(worker_id.to_string()))?;
        if worker.is_terminated() {
            return Err(EngineError::WorkerTerminated(worker_id.to_string()));
        }
        self.monitor.heartbeat(worker_id, now);
        Ok(())
    }

    /// Terminate every worker that has been silent past the heartbeat timeout.
    pub fn reap_offline(&self) -> Vec<WorkerId> {
        let now = self.clock.now();
        let offline = self
            .monitor
            .detect_offline(now, self.config.monitor.heartbeat_timeout());
        for worker_id in &offline {
            warn!(worker_id = %worker_id, "worker detected offline");
            if let Err(err) = self.terminate_worker(worker_id) {
                warn!(worker_id = %worker_id, error = %err, "failed to terminate offline worker");
            }
        }
        offline
    }

    /// Next task for `worker_id`: work reserved by the optimizer first, then
    /// the best match from the queue. `None` when nothing qualifies.
    pub fn request_assignment(&self, worker_id: &str) -> Result<Option<Assignment>, EngineError> {
        let now = self.clock.now();
        let mut guard = self.registry();
        let reg = &mut *guard;
        let worker = reg
            .workers
            .get(worker_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownWorker(worker_id.to_string()))?;
        if worker.is_terminated() {
            return Err(EngineError::WorkerTerminated(worker_id.to_string()));
        }
        self.monitor.heartbeat(worker_id, now);

        let reserved = reg
            .in_flight
            .values()
            .filter(|flight| !flight.delivered && flight.assignment.worker_id == worker_id)
            .max_by(|a, b| {
                a.assignment
                    .priority
                    .total_cmp(&b.assignment.priority)
                    .then_with(|| b.task.id.cmp(&a.task.id))
            })
            .map(|flight| flight.task.id.clone());
        if let Some(task_id) = reserved {
            let (assignment, enqueued_at) = match reg.in_flight.get_mut(&task_id) {
                Some(flight) => {
                    flight.task.transition(TaskState::Assigned)?;
                    flight.delivered = true;
                    (flight.assignment.clone(), flight.enqueued_at)
                }
                None => return Ok(None),
            };
            self.note_delivery(reg, &assignment, enqueued_at, now, "reserved by batch optimizer");
            return Ok(Some(assignment));
        }

        if !worker.is_available() {
            return Ok(None);
        }
        let state = self.system_state(reg, now);
        let Some(dequeued) = self.queue.dequeue_best_for(&worker, &state) else {
            debug!(worker_id, "no task available");
            return Ok(None);
        };
        let assessment = &dequeued.assessment;
        debug!(
            task_id = %dequeued.task.id,
            worker_id,
            confidence = assessment.confidence,
            recommendations = ?assessment.recommendations,
            "match assessed"
        );
        let reasoning = format!(
            "{} (confidence {:.2})",
            assessment.reasoning, assessment.confidence
        );
        self.open_assignment(
            reg,
            dequeued.task,
            dequeued.assignment,
            dequeued.enqueued_at,
            true,
            now,
            &reasoning,
        )
        .map(Some)
    }

    /// Push the highest-priority ready task to its best qualified worker.
    /// Equal fits go to the less loaded worker, then the lower id.
    pub fn dispatch_next(&self) -> Result<Option<Assignment>, EngineError> {
        let now = self.clock.now();
        let mut guard = self.registry();
        let reg = &mut *guard;
        let state = self.system_state(reg, now);
        for entry in self.queue.ready_entries(&state) {
            let Some(best) = self
                .queue
                .matcher()
                .best_worker(&entry.task, &state.workers)
            else {
                continue;
            };
            let reasoning = format!("{} (confidence {:.2})", best.reasoning, best.confidence);
            let Some(entry) = self.queue.take(&entry.task.id) else {
                continue;
            };
            let assignment = Assignment::new(
                &entry.task,
                best.worker_id.clone(),
                now,
                entry.score.composite,
                best.score,
            );
            return self
                .open_assignment(
                    reg,
                    entry.task,
                    assignment,
                    entry.enqueued_at,
                    true,
                    now,
                    &reasoning,
                )
                .map(Some);
        }
        Ok(None)
    }

    /// Mark a delivered task as running. Counts as a heartbeat from its worker.
    pub fn start_task(&self, task_id: &str) -> Result<(), EngineError> {
        let now = self.clock.now();
        let mut reg = self.registry();
        let flight = reg
            .in_flight
            .get_mut(task_id)
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))?;
        if !flight.delivered {
            return Err(EngineError::NotAssigned(task_id.to_string()));
        }
        self.monitor.heartbeat(&flight.assignment.worker_id, now);
        flight.task.transition(TaskState::InProgress)
    }

    /// Settle a delivered task. Counts as a heartbeat from its worker.
    pub fn report_outcome(
        &self,
        task_id: &str,
        outcome: TaskOutcome,
    ) -> Result<OutcomeDisposition, EngineError> {
        let now = self.clock.now();
        let mut guard = self.registry();
        let reg = &mut *guard;
        let Some(mut flight) = reg.in_flight.remove(task_id) else {
            if self.queue.contains(task_id) {
                return Err(EngineError::NotAssigned(task_id.to_string()));
            }
            return Err(EngineError::UnknownTask(task_id.to_string()));
        };
        if !flight.delivered {
            reg.in_flight.insert(task_id.to_string(), flight);
            return Err(EngineError::NotAssigned(task_id.to_string()));
        }
        let worker_id = flight.assignment.worker_id.clone();
        self.monitor.heartbeat(&worker_id, now);

        match outcome {
            TaskOutcome::Completed { quality } => {
                if let Err(err) = flight.task.transition(TaskState::Completed) {
                    reg.in_flight.insert(task_id.to_string(), flight);
                    return Err(err);
                }
                reg.cancel_requests.remove(task_id);
                reg.finish(task_id, TaskState::Completed);
                let hours =
                    (now - flight.assignment.assigned_at).num_milliseconds().max(0) as f64
                        / 3_600_000.0;
                if let Some(worker) = reg.workers.get_mut(&worker_id) {
                    worker.record_performance(
                        PerformanceRecord {
                            kind: flight.task.kind,
                            completion_hours: hours,
                            quality: quality.clamp(0.0, 1.0),
                        },
                        self.config.monitor.history_window,
                    );
                }
                self.release_worker(reg, &worker_id, true);
                self.exceptions.mark_recovered(task_id, now);
                reg.counters.completed += 1;
                info!(task_id, worker_id = %worker_id, quality, "task completed");
                Ok(OutcomeDisposition::Completed)
            }
            TaskOutcome::Failed(reason) => {
                self.release_worker(reg, &worker_id, false);
                self.fail_in_flight(reg, flight, reason, now)
            }
            TaskOutcome::Cancelled => {
                if let Err(err) = flight.task.transition(TaskState::Cancelled) {
                    reg.in_flight.insert(task_id.to_string(), flight);
                    return Err(err);
                }
                reg.cancel_requests.remove(task_id);
                reg.finish(task_id, TaskState::Cancelled);
                self.release_worker(reg, &worker_id, false);
                reg.counters.cancelled += 1;
                info!(task_id, worker_id = %worker_id, "task cancelled by worker");
                Ok(OutcomeDisposition::Cancelled)
            }
        }
    }

    /// Cancel a task at any point of its life. Queued and reserved tasks are
    /// cancelled at once; delivered ones get an advisory request.
    pub fn cancel(&self, task_id: &str) -> CancelStatus {
        let mut guard = self.registry();
        let reg = &mut *guard;

        if self.queue.remove(task_id) {
            reg.finish(task_id, TaskState::Cancelled);
            reg.counters.cancelled += 1;
            info!(task_id, "queued task cancelled");
            return CancelStatus::Cancelled;
        }

        let Some(flight) = reg.in_flight.get(task_id) else {
            return CancelStatus::NotFound;
        };
        let worker_id = flight.assignment.worker_id.clone();
        if flight.delivered {
            reg.cancel_requests.insert(task_id.to_string());
            info!(task_id, worker_id = %worker_id, "cancellation requested");
            return CancelStatus::Requested { worker_id };
        }

        reg.in_flight.remove(task_id);
        self.release_worker(reg, &worker_id, false);
        reg.finish(task_id, TaskState::Cancelled);
        reg.counters.cancelled += 1;
        info!(task_id, worker_id = %worker_id, "reserved task cancelled");
        CancelStatus::Cancelled
    }

    /// Cancellation requests awaiting acknowledgement by `worker_id`.
    pub fn pending_cancellations(&self, worker_id: &str) -> Vec<TaskId> {
        let reg = self.registry();
        let mut ids: Vec<TaskId> = reg
            .cancel_requests
            .iter()
            .filter(|id| {
                reg.in_flight
                    .get(*id)
                    .is_some_and(|flight| flight.assignment.worker_id == worker_id)
            })
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Rescore the queue. Returns `None` when a pass is already running on
    /// another thread; that thread runs again before it lets go.
    pub fn rebalance(&self) -> Option<RebalanceReport> {
        self.rebalance_pending.store(true, Ordering::SeqCst);
        let mut last = None;
        while self.rebalance_pending.load(Ordering::SeqCst) {
            let _gate = match self.rebalance_gate.try_lock() {
                Ok(gate) => gate,
                Err(TryLockError::WouldBlock) => return last,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            };
            while self.rebalance_pending.swap(false, Ordering::SeqCst) {
                last = Some(self.rebalance_pass());
            }
        }
        last
    }

    fn rebalance_pass(&self) -> RebalanceReport {
        let now = self.clock.now();
        let mut guard = self.registry();
        let reg = &mut *guard;
        let state = self.system_state(reg, now);
        let report = self.queue.rebalance(&state);
        drop(state);

        for entry in &report.starved {
            let waited_secs = entry
                .unmatched_since
                .map_or(0, |since| (now - since).num_seconds());
            self.abandon(
                reg,
                entry,
                EscalationReason::StarvationTimeout { waited_secs },
                now,
            );
        }
        for (entry, dependency) in &report.blocked {
            self.abandon(
                reg,
                entry,
                EscalationReason::DependencyAbandoned {
                    dependency: dependency.clone(),
                },
                now,
            );
        }
        report
    }

    /// Run a batch optimization over ready tasks and reserve the result.
    pub fn optimize(&self) -> BatchOutcome {
        let now = self.clock.now();
        let mut guard = self.registry();
        let reg = &mut *guard;
        let state = self.system_state(reg, now);
        let tasks = self.queue.ready_entries(&state);
        let outcome = self.optimizer.optimize_batch(
            &tasks,
            &state.workers,
            |worker| {
                self.monitor
                    .available_capacity(&worker.id)
                    .min(worker.remaining_capacity())
            },
            now,
        );

        let mut reserved = 0;
        for assignment in &outcome.assignments {
            let Some(entry) = self.queue.take(&assignment.task_id) else {
                continue;
            };
            let reasoning = format!("batch slot (compatibility {:.2})", assignment.compatibility);
            match self.open_assignment(
                reg,
                entry.task,
                assignment.clone(),
                entry.enqueued_at,
                false,
                now,
                &reasoning,
            ) {
                Ok(_) => reserved += 1,
                Err(err) => warn!(task_id = %assignment.task_id, error = %err, "reservation failed"),
            }
        }
        reg.last_optimize = Some(now);
        reg.counters.reserved += reserved;
        if outcome.degraded {
            reg.counters.degraded_batches += 1;
        }
        info!(
            candidates = tasks.len(),
            reserved,
            degraded = outcome.degraded,
            "batch optimization"
        );
        outcome
    }

    /// One maintenance step: offline detection, rebalance when due, batch
    /// optimization on its cadence.
    pub fn tick(&self) -> TickReport {
        let offline = self.reap_offline();
        let now = self.clock.now();

        let rebalance = if !offline.is_empty()
            || self.rebalance_pending.load(Ordering::SeqCst)
            || self.queue.needs_rebalance(now)
            || self.monitor.above_high_water()
        {
            self.rebalance()
        } else {
            None
        };

        let optimize_due = {
            let reg = self.registry();
            reg.last_optimize
                .is_none_or(|last| now - last >= self.config.optimizer.interval())
        };
        let batch = optimize_due.then(|| self.optimize());

        TickReport {
            offline,
            rebalance,
            batch,
        }
    }

    /// Run `tick` every `poll` on a named thread until `stop` is set.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        stop: Arc<AtomicBool>,
        poll: Duration,
    ) -> io::Result<JoinHandle<()>> {
        let engine = Arc::clone(self);
        thread::Builder::new()
            .name("maintenance".to_string())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    engine.tick();
                    thread::sleep(poll);
                }
            })
    }

    /// Bounded wait for queued work; see [`TaskQueue::wait_for_work`].
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        self.queue.wait_for_work(timeout)
    }

    /// Wake every waiter; the engine keeps serving calls.
    pub fn shutdown(&self) {
        self.queue.close();
    }

    pub fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.registry().in_flight.is_empty()
    }

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        let reg = self.registry();
        if let Some(state) = reg.finished.get(task_id) {
            return Some(*state);
        }
        if let Some(flight) = reg.in_flight.get(task_id) {
            return Some(flight.task.state);
        }
        self.queue.contains(task_id).then_some(TaskState::Pending)
    }

    /// The task record behind a live or reserved assignment.
    pub fn in_flight_task(&self, task_id: &str) -> Option<Task> {
        self.registry()
            .in_flight
            .get(task_id)
            .map(|flight| flight.task.clone())
    }

    pub fn worker(&self, worker_id: &str) -> Option<Worker> {
        self.registry().workers.get(worker_id).cloned()
    }

    pub fn queue_order(&self) -> Vec<TaskId> {
        self.queue.ordered_ids()
    }

    pub fn score_of(&self, task_id: &str) -> Option<PriorityScore> {
        self.queue.score_of(task_id)
    }

    pub fn recent_assignments(&self, limit: usize) -> Vec<Assignment> {
        let reg = self.registry();
        reg.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn escalations(&self) -> Vec<Escalation> {
        self.exceptions.escalations()
    }

    pub fn failure_record(&self, task_id: &str) -> Option<FailureRecord> {
        self.exceptions.record(task_id)
    }

    pub fn metrics_snapshot(&self) -> MonitoringSnapshot {
        let now = self.clock.now();
        let reg = self.registry();
        let reserved = reg.in_flight.values().filter(|f| !f.delivered).count();
        let delivered = reg.counters.assigned.max(1) as f64;
        let (average_assignment_wait_secs, average_compatibility) = if reg.counters.assigned == 0 {
            (0.0, 0.0)
        } else {
            (
                reg.total_wait_secs / delivered,
                reg.total_compatibility / delivered,
            )
        };
        MonitoringSnapshot {
            at: now,
            queue_depth: self.queue.len(),
            in_flight: reg.in_flight.len() - reserved,
            reserved,
            average_queue_wait_secs: self.queue.average_wait_secs(now),
            average_assignment_wait_secs,
            average_compatibility,
            priority_distribution: self.queue.category_counts(),
            utilization: self.monitor.utilization_snapshot(),
            offline_workers: self.monitor.offline_workers().into_iter().collect(),
            escalation_count: self.exceptions.escalation_count(),
            counters: reg.counters.clone(),
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let reg = self.registry();
        let mut in_flight: Vec<InFlightTask> = reg.in_flight.values().cloned().collect();
        in_flight.sort_by(|a, b| a.task.id.cmp(&b.task.id));
        EngineSnapshot {
            taken_at: self.clock.now(),
            queue: self.queue.snapshot(),
            in_flight,
            workers: reg.workers.values().cloned().collect(),
            finished: reg.finished.clone(),
        }
    }

    /// Load a snapshot into an engine that has no tasks or workers yet.
    /// Every task and worker is validated before anything is loaded.
    pub fn restore(&self, snapshot: EngineSnapshot) -> Result<(), EngineError> {
        let now = self.clock.now();
        let mut guard = self.registry();
        let reg = &mut *guard;

        for entry in &snapshot.queue.entries {
            validate_task(&entry.task)?;
        }
        for flight in &snapshot.in_flight {
            validate_restored_task(&flight.task, flight.delivered)?;
        }
        for worker in &snapshot.workers {
            if reg.workers.contains_key(&worker.id) {
                return Err(ValidationError::DuplicateWorker(worker.id.clone()).into());
            }
            validate_worker(worker)?;
        }
        for flight in &snapshot.in_flight {
            if reg.is_known(&flight.task.id) || self.queue.contains(&flight.task.id) {
                return Err(ValidationError::DuplicateTask(flight.task.id.clone()).into());
            }
        }
        self.queue.restore(snapshot.queue)?;

        let mut owned: HashMap<&str, usize> = HashMap::new();
        for flight in &snapshot.in_flight {
            *owned.entry(flight.assignment.worker_id.as_str()).or_default() += 1;
        }
        for mut worker in snapshot.workers {
            worker.active_tasks = owned.get(worker.id.as_str()).copied().unwrap_or(0);
            if !worker.is_terminated() {
                self.monitor.register_worker(
                    &worker.id,
                    worker.max_concurrent_tasks,
                    worker.current_load,
                    now,
                );
                for _ in 0..worker.active_tasks {
                    self.monitor.record_assignment(&worker.id);
                }
            }
            reg.workers.insert(worker.id.clone(), worker);
        }
        for flight in snapshot.in_flight {
            reg.in_flight.insert(flight.task.id.clone(), flight);
        }
        for (task_id, state) in snapshot.finished {
            reg.finish(&task_id, state);
        }
        info!(
            queued = self.queue.len(),
            in_flight = reg.in_flight.len(),
            workers = reg.workers.len(),
            "engine restored"
        );
        Ok(())
    }

    /// Move a task out of the queue into a worker's hands.
    #[allow(clippy::too_many_arguments)]
    fn open_assignment(
        &self,
        reg: &mut Registry,
        mut task: Task,
        assignment: Assignment,
        enqueued_at: Timestamp,
        delivered: bool,
        now: Timestamp,
        reasoning: &str,
    ) -> Result<Assignment, EngineError> {
        if delivered {
            task.transition(TaskState::Assigned)?;
        }
        let worker_id = assignment.worker_id.clone();
        let estimate = self.monitor.record_assignment(&worker_id);
        if let Some(worker) = reg.workers.get_mut(&worker_id) {
            worker.active_tasks += 1;
            worker.status = WorkerStatus::Busy;
            if let Some(load) = estimate {
                worker.current_load = load;
            }
        }
        if delivered {
            self.note_delivery(reg, &assignment, enqueued_at, now, reasoning);
        } else {
            debug!(
                task_id = %assignment.task_id,
                worker_id = %worker_id,
                "task reserved"
            );
        }
        reg.in_flight.insert(
            task.id.clone(),
            InFlightTask {
                task,
                assignment: assignment.clone(),
                delivered,
                enqueued_at,
            },
        );
        Ok(assignment)
    }

    fn note_delivery(
        &self,
        reg: &mut Registry,
        assignment: &Assignment,
        enqueued_at: Timestamp,
        now: Timestamp,
        reasoning: &str,
    ) {
        reg.counters.assigned += 1;
        reg.total_wait_secs += (now - enqueued_at).num_milliseconds().max(0) as f64 / 1000.0;
        reg.total_compatibility += assignment.compatibility;
        reg.history.push_back(assignment.clone());
        while reg.history.len() > self.config.monitor.assignment_history {
            reg.history.pop_front();
        }
        info!(
            task_id = %assignment.task_id,
            worker_id = %assignment.worker_id,
            priority = assignment.priority,
            compatibility = assignment.compatibility,
            reasoning,
            "assignment created"
        );
    }

    fn release_worker(&self, reg: &mut Registry, worker_id: &str, succeeded: bool) {
        let estimate = self.monitor.record_release(worker_id, succeeded);
        if let Some(worker) = reg.workers.get_mut(worker_id) {
            worker.active_tasks = worker.active_tasks.saturating_sub(1);
            if let Some(load) = estimate {
                worker.current_load = load;
            }
            if !worker.is_terminated() {
                worker.status = if worker.active_tasks == 0 {
                    WorkerStatus::Idle
                } else {
                    WorkerStatus::Busy
                };
            }
        }
    }

    /// Route a failed delivered task: acknowledge a pending cancellation,
    /// or hand it to the exception handler for retry or escalation.
    fn fail_in_flight(
        &self,
        reg: &mut Registry,
        mut flight: InFlightTask,
        reason: FailureReason,
        now: Timestamp,
    ) -> Result<OutcomeDisposition, EngineError> {
        let task_id = flight.task.id.clone();
        reg.counters.failed += 1;

        if reg.cancel_requests.remove(&task_id) {
            flight.task.transition(TaskState::Cancelled)?;
            reg.finish(&task_id, TaskState::Cancelled);
            reg.counters.cancelled += 1;
            info!(task_id = %task_id, "cancelled task stopped by failure");
            return Ok(OutcomeDisposition::Cancelled);
        }

        match self.exceptions.handle_failure(flight.task, reason, now)? {
            RecoveryDecision::Retry(task) => {
                let attempt = task.retry_count;
                let state = self.system_state(reg, now);
                self.queue.enqueue(task, &state)?;
                reg.counters.retried += 1;
                Ok(OutcomeDisposition::Retried { attempt })
            }
            RecoveryDecision::Escalated(escalation) => {
                reg.finish(&task_id, TaskState::Failed);
                reg.counters.escalated += 1;
                Ok(OutcomeDisposition::Escalated {
                    escalation_id: escalation.id,
                })
            }
        }
    }

    /// Escalate a task removed from the queue by a rebalance pass.
    fn abandon(
        &self,
        reg: &mut Registry,
        entry: &QueuedTask,
        reason: EscalationReason,
        now: Timestamp,
    ) {
        self.exceptions.escalate(&entry.task.id, reason, now);
        reg.finish(&entry.task.id, TaskState::Failed);
        reg.counters.escalated += 1;
    }
}
