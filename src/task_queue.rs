//! Thread-safe priority queue of pending tasks.
//!
//! Every mutation happens under one mutex, so two callers can never remove
//! the same task. Dequeue never waits for work; `wait_for_work` offers a
//! bounded wait for consumers that want one.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capability::{CapabilityMatcher, CompatibilityAssessment};
use crate::config::QueueConfig;
use crate::error::{EngineError, ValidationError};
use crate::priority::{PriorityCategory, PriorityScore, PriorityScorer, SystemState};
use crate::types::{Assignment, Task, TaskId, TaskState, Timestamp, Worker};
use crate::validation::validate_task;

/// A pending task together with its current score and queue bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task: Task,
    pub score: PriorityScore,
    pub enqueued_at: Timestamp,
    /// Consecutive rebalances without any live qualified worker.
    #[serde(default)]
    pub starvation_cycles: u32,
    #[serde(default)]
    pub unmatched_since: Option<Timestamp>,
}

impl QueuedTask {
    fn key(&self) -> QueueKey {
        QueueKey {
            composite: self.score.composite,
            created_at: self.task.created_at,
            id: self.task.id.clone(),
        }
    }
}

/// Ordering key: higher composite first, then older, then lower id.
#[derive(Clone, Debug)]
struct QueueKey {
    composite: f64,
    created_at: Timestamp,
    id: TaskId,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .composite
            .total_cmp(&self.composite)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueKey {}

/// Result of a successful dequeue. The task is still `Pending`; the caller
/// owns the transition to `Assigned`.
#[derive(Clone, Debug)]
pub struct Dequeued {
    pub task: Task,
    pub assignment: Assignment,
    pub assessment: CompatibilityAssessment,
    pub enqueued_at: Timestamp,
}

#[derive(Clone, Debug, Default)]
pub struct RebalanceReport {
    pub rescored: usize,
    /// Tasks still held without any live qualified worker.
    pub starving: Vec<TaskId>,
    /// Tasks removed after waiting past the starvation limit.
    pub starved: Vec<QueuedTask>,
    /// Tasks removed because a dependency can never complete, with that dependency.
    pub blocked: Vec<(QueuedTask, TaskId)>,
}

/// Serializable queue contents, highest priority first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub entries: Vec<QueuedTask>,
}

pub struct TaskQueue {
    inner: Mutex<QueueState>,
    available: Condvar,
    scorer: PriorityScorer,
    matcher: CapabilityMatcher,
    config: QueueConfig,
}

#[derive(Default)]
struct QueueState {
    order: BTreeSet<QueueKey>,
    entries: HashMap<TaskId, QueuedTask>,
    enqueued_since_rebalance: usize,
    last_rebalance: Option<Timestamp>,
    closed: bool,
}

impl QueueState {
    fn insert(&mut self, entry: QueuedTask) {
        self.order.insert(entry.key());
        self.entries.insert(entry.task.id.clone(), entry);
    }

    fn remove(&mut self, id: &str) -> Option<QueuedTask> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.key());
        Some(entry)
    }

    fn ordered(&self) -> impl Iterator<Item = &QueuedTask> {
        self.order.iter().filter_map(|key| self.entries.get(&key.id))
    }
}

impl TaskQueue {
    pub fn new(scorer: PriorityScorer, matcher: CapabilityMatcher, config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            scorer,
            matcher,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock().expect("task queue mutex poisoned")
    }

    pub fn scorer(&self) -> &PriorityScorer {
        &self.scorer
    }

    pub fn matcher(&self) -> &CapabilityMatcher {
        &self.matcher
    }

    /// Score and insert a pending task.
    pub fn enqueue(&self, task: Task, state: &SystemState) -> Result<PriorityScore, EngineError> {
        if task.state != TaskState::Pending {
            return Err(ValidationError::NotPending(task.id).into());
        }
        let score = self.scorer.score(&task, state);
        let mut guard = self.lock();
        if guard.entries.contains_key(&task.id) {
            return Err(ValidationError::DuplicateTask(task.id).into());
        }
        debug!(task_id = %task.id, score = score.composite, "queue insert");
        guard.insert(QueuedTask {
            task,
            score,
            enqueued_at: state.now,
            starvation_cycles: 0,
            unmatched_since: None,
        });
        guard.enqueued_since_rebalance += 1;
        self.available.notify_all();
        Ok(score)
    }

    /// Return a task that left the queue without being worked, such as a
    /// reservation whose worker went away. Its retry count is untouched.
    pub fn requeue(
        &self,
        task: Task,
        enqueued_at: Timestamp,
        state: &SystemState,
    ) -> Result<PriorityScore, EngineError> {
        if task.state != TaskState::Pending {
            return Err(ValidationError::NotPending(task.id).into());
        }
        let score = self.scorer.score(&task, state);
        let mut guard = self.lock();
        guard.remove(&task.id);
        guard.insert(QueuedTask {
            task,
            score,
            enqueued_at,
            starvation_cycles: 0,
            unmatched_since: None,
        });
        self.available.notify_all();
        Ok(score)
    }

    /// Remove and return the task maximizing `composite * compatibility`
    /// among those whose dependencies are complete and whose minimum the
    /// worker meets. Returns `None` when nothing qualifies.
    pub fn dequeue_best_for(&self, worker: &Worker, state: &SystemState) -> Option<Dequeued> {
        let mut guard = self.lock();
        let (id, assessment) = self.select_for(&guard, worker, state)?;
        let entry = guard.remove(&id)?;
        let assignment = Assignment::new(
            &entry.task,
            worker.id.clone(),
            state.now,
            entry.score.composite,
            assessment.score,
        );
        Some(Dequeued {
            task: entry.task,
            assignment,
            assessment,
            enqueued_at: entry.enqueued_at,
        })
    }

    fn select_for(
        &self,
        guard: &QueueState,
        worker: &Worker,
        state: &SystemState,
    ) -> Option<(TaskId, CompatibilityAssessment)> {
        if !worker.is_available() {
            return None;
        }

        let mut best: Option<(f64, &QueuedTask, CompatibilityAssessment)> = None;
        let mut fallback: Option<(&QueuedTask, CompatibilityAssessment)> = None;

        for entry in guard.ordered() {
            let composite = entry.score.composite;
            if let Some((value, _, _)) = &best {
                // Compatibility never exceeds 1, so nothing further down can win.
                if composite <= *value {
                    break;
                }
            }
            if !state.dependencies_met(&entry.task) {
                continue;
            }
            let assessment = self.matcher.compatibility(worker, &entry.task);
            if assessment.meets_minimum {
                let value = composite * assessment.score;
                if best.as_ref().is_none_or(|(current, _, _)| value > *current) {
                    best = Some((value, entry, assessment));
                }
            } else if self.config.allow_unqualified_fallback
                && fallback.is_none()
                && assessment.score > 0.0
            {
                fallback = Some((entry, assessment));
            }
        }

        match (best, fallback) {
            (Some((_, entry, assessment)), _) => Some((entry.task.id.clone(), assessment)),
            (None, Some((entry, assessment))) => {
                debug!(
                    task_id = %entry.task.id,
                    worker_id = %worker.id,
                    "unqualified fallback"
                );
                Some((entry.task.id.clone(), assessment))
            }
            (None, None) => None,
        }
    }

    /// Remove a specific task, returning it if it was queued.
    pub fn take(&self, id: &str) -> Option<QueuedTask> {
        self.lock().remove(id)
    }

    /// Drop a task from the queue. Absent ids are a no-op.
    pub fn remove(&self, id: &str) -> bool {
        self.take(id).is_some()
    }

    /// Rescore every pending task against `state` and rebuild the order.
    ///
    /// Tasks with no live qualified worker gain a starvation boost each
    /// pass and are removed once they have waited past the configured
    /// limit. Tasks with an abandoned dependency are removed.
    pub fn rebalance(&self, state: &SystemState) -> RebalanceReport {
        let max_wait = self.config.max_starvation_wait();
        let mut guard = self.lock();
        let mut report = RebalanceReport::default();

        let drained: Vec<QueuedTask> = guard.entries.drain().map(|(_, entry)| entry).collect();
        guard.order.clear();

        for mut entry in drained {
            if let Some(dep) = state.abandoned_dependency(&entry.task) {
                let dep = dep.clone();
                report.blocked.push((entry, dep));
                continue;
            }

            let qualified = state
                .live_workers()
                .any(|worker| self.matcher.meets_minimum(worker, &entry.task));
            if qualified {
                entry.starvation_cycles = 0;
                entry.unmatched_since = None;
            } else {
                entry.starvation_cycles = entry.starvation_cycles.saturating_add(1);
                let since = *entry.unmatched_since.get_or_insert(state.now);
                if state.now - since >= max_wait {
                    report.starved.push(entry);
                    continue;
                }
                debug!(
                    task_id = %entry.task.id,
                    cycles = entry.starvation_cycles,
                    "starvation boost applied"
                );
                report.starving.push(entry.task.id.clone());
            }

            entry.score =
                self.scorer
                    .score_with_starvation(&entry.task, state, entry.starvation_cycles);
            report.rescored += 1;
            guard.insert(entry);
        }

        guard.enqueued_since_rebalance = 0;
        guard.last_rebalance = Some(state.now);
        report.starving.sort();
        info!(
            rescored = report.rescored,
            starving = report.starving.len(),
            starved = report.starved.len(),
            blocked = report.blocked.len(),
            "queue rebalanced"
        );
        report
    }

    /// Whether the interval has elapsed or a burst of enqueues arrived.
    pub fn needs_rebalance(&self, now: Timestamp) -> bool {
        let guard = self.lock();
        if guard.enqueued_since_rebalance >= self.config.burst_threshold {
            return true;
        }
        guard
            .last_rebalance
            .is_none_or(|last| now - last >= self.config.rebalance_interval())
    }

    /// Entries whose dependencies are complete, highest priority first.
    pub fn ready_entries(&self, state: &SystemState) -> Vec<QueuedTask> {
        self.lock()
            .ordered()
            .filter(|entry| state.dependencies_met(&entry.task))
            .cloned()
            .collect()
    }

    pub fn peek_highest(&self) -> Option<QueuedTask> {
        self.lock().ordered().next().cloned()
    }

    pub fn ordered_ids(&self) -> Vec<TaskId> {
        self.lock()
            .ordered()
            .map(|entry| entry.task.id.clone())
            .collect()
    }

    /// For every task id, how many queued tasks depend on it.
    pub fn dependent_counts(&self) -> HashMap<TaskId, usize> {
        let guard = self.lock();
        let mut counts = HashMap::new();
        for entry in guard.entries.values() {
            for dep in &entry.task.dependencies {
                *counts.entry(dep.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn score_of(&self, id: &str) -> Option<PriorityScore> {
        self.lock().entries.get(id).map(|entry| entry.score)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mean time queued entries have waited, in seconds.
    pub fn average_wait_secs(&self, now: Timestamp) -> f64 {
        let guard = self.lock();
        if guard.entries.is_empty() {
            return 0.0;
        }
        let total: f64 = guard
            .entries
            .values()
            .map(|entry| (now - entry.enqueued_at).num_milliseconds().max(0) as f64 / 1000.0)
            .sum();
        total / guard.entries.len() as f64
    }

    pub fn category_counts(&self) -> BTreeMap<PriorityCategory, usize> {
        let guard = self.lock();
        let mut counts = BTreeMap::new();
        for entry in guard.entries.values() {
            *counts.entry(entry.score.category()).or_insert(0) += 1;
        }
        counts
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            entries: self.lock().ordered().cloned().collect(),
        }
    }

    /// Load entries with their stored scores, so order matches the snapshot.
    pub fn restore(&self, snapshot: QueueSnapshot) -> Result<usize, EngineError> {
        let mut guard = self.lock();
        for entry in &snapshot.entries {
            validate_task(&entry.task)?;
            if guard.entries.contains_key(&entry.task.id) {
                return Err(ValidationError::DuplicateTask(entry.task.id.clone()).into());
            }
        }
        let count = snapshot.entries.len();
        for entry in snapshot.entries {
            guard.insert(entry);
        }
        self.available.notify_all();
        Ok(count)
    }

    /// Wait up to `timeout` for the queue to be non-empty. Returns `false`
    /// on timeout or once the queue is closed.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .available
            .wait_timeout_while(guard, timeout, |state| {
                state.entries.is_empty() && !state.closed
            })
            .expect("condvar wait failed");
        !guard.closed && !guard.entries.is_empty()
    }

    /// Wake every waiter; later waits return immediately.
    pub fn close(&self) {
        let mut guard = self.lock();
        guard.closed = true;
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MatchingConfig, PriorityWeights, ScoringConfig};
    use crate::types::{RequiredCapability, TaskKind};
    use chrono::{TimeDelta, TimeZone, Utc};
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 4, 2, 12, 0, 0).unwrap()
    }

    fn queue_with(config: QueueConfig) -> TaskQueue {
        let scorer = PriorityScorer::new(PriorityWeights::default(), ScoringConfig::default())
            .expect("default weights");
        TaskQueue::new(scorer, CapabilityMatcher::new(MatchingConfig::default()), config)
    }

    fn queue() -> TaskQueue {
        queue_with(QueueConfig::default())
    }

    fn state() -> SystemState {
        SystemState::new(t0())
    }

    fn task(id: &str) -> Task {
        Task::new(id, TaskKind::General, 1.0, t0())
    }

    fn sql_task(id: &str) -> Task {
        task(id).requiring(RequiredCapability::new("sql", 0.7))
    }

    #[test]
    fn higher_priority_is_dequeued_first() {
        let q = queue();
        q.enqueue(task("low"), &state()).unwrap();
        q.enqueue(task("high").with_revenue(8_000.0, 0.0), &state()).unwrap();
        let worker = Worker::new("w1", 2);
        let first = q.dequeue_best_for(&worker, &state()).unwrap();
        assert_eq!(first.task.id, "high");
        assert_eq!(first.assignment.worker_id, "w1");
        assert_eq!(first.task.state, TaskState::Pending);
        assert_eq!(q.ordered_ids(), vec!["low".to_string()]);
    }

    #[test]
    fn equal_scores_order_by_creation_then_id() {
        let q = queue();
        let newer = Task::new("a", TaskKind::General, 1.0, t0() + TimeDelta::seconds(1));
        q.enqueue(newer, &state()).unwrap();
        q.enqueue(task("c"), &state()).unwrap();
        q.enqueue(task("b"), &state()).unwrap();
        let ids = q.ordered_ids();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string(), "a".to_string()]);
    }

    #[test]
    fn rejects_duplicates_and_non_pending() {
        let q = queue();
        q.enqueue(task("a"), &state()).unwrap();
        assert!(matches!(
            q.enqueue(task("a"), &state()),
            Err(EngineError::Validation(ValidationError::DuplicateTask(_)))
        ));
        let mut done = task("b");
        done.state = TaskState::Completed;
        assert!(matches!(
            q.enqueue(done, &state()),
            Err(EngineError::Validation(ValidationError::NotPending(_)))
        ));
    }

    #[test]
    fn unresolved_dependencies_are_filtered() {
        let q = queue();
        q.enqueue(task("child").depends_on("parent").with_revenue(9_000.0, 0.0), &state())
            .unwrap();
        q.enqueue(task("other"), &state()).unwrap();
        let worker = Worker::new("w1", 3);

        let got = q.dequeue_best_for(&worker, &state()).unwrap();
        assert_eq!(got.task.id, "other");
        assert!(q.dequeue_best_for(&worker, &state()).is_none());
        assert!(q.contains("child"));

        let mut done = state();
        Arc::make_mut(&mut done.completed).insert("parent".into());
        assert_eq!(q.dequeue_best_for(&worker, &done).unwrap().task.id, "child");
    }

    #[test]
    fn unqualified_worker_gets_nothing_by_default() {
        let q = queue();
        q.enqueue(sql_task("a"), &state()).unwrap();
        let novice = Worker::new("w1", 1).with_capability("sql", 0.3);
        assert!(q.dequeue_best_for(&novice, &state()).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn fallback_hands_out_unqualified_task_when_enabled() {
        let q = queue_with(QueueConfig {
            allow_unqualified_fallback: true,
            ..QueueConfig::default()
        });
        q.enqueue(sql_task("a"), &state()).unwrap();
        let novice = Worker::new("w1", 1).with_capability("sql", 0.3);
        let got = q.dequeue_best_for(&novice, &state()).unwrap();
        assert!(!got.assessment.meets_minimum);

        q.enqueue(sql_task("b"), &state()).unwrap();
        assert!(q.dequeue_best_for(&Worker::new("w2", 1), &state()).is_none());
    }

    #[test]
    fn compatibility_can_outweigh_priority() {
        let q = queue();
        let rust = task("rust")
            .requiring(RequiredCapability::new("rust", 0.2))
            .with_revenue(1_000.0, 0.0);
        let sql = task("sql").requiring(RequiredCapability::new("sql", 0.2));
        q.enqueue(rust, &state()).unwrap();
        q.enqueue(sql, &state()).unwrap();
        let worker = Worker::new("w1", 1)
            .with_capability("rust", 0.2)
            .with_capability("sql", 1.0);
        assert_eq!(q.dequeue_best_for(&worker, &state()).unwrap().task.id, "sql");
    }

    #[test]
    fn saturated_worker_gets_nothing() {
        let q = queue();
        q.enqueue(task("a"), &state()).unwrap();
        let mut worker = Worker::new("w1", 1);
        worker.active_tasks = 1;
        assert!(q.dequeue_best_for(&worker, &state()).is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let q = queue();
        q.enqueue(task("a"), &state()).unwrap();
        assert!(q.remove("a"));
        assert!(!q.remove("a"));
        assert!(!q.remove("never-seen"));
        assert!(q.is_empty());
    }

    #[test]
    fn rebalance_boosts_then_expires_starving_tasks() {
        let q = queue_with(QueueConfig {
            max_starvation_wait_secs: 120,
            ..QueueConfig::default()
        });
        q.enqueue(sql_task("a"), &state()).unwrap();
        let before = q.score_of("a").unwrap();

        let mut s = state().with_workers(vec![Worker::new("w1", 1).with_capability("sql", 0.1)]);
        let report = q.rebalance(&s);
        assert_eq!(report.starving, vec!["a".to_string()]);
        assert!(q.score_of("a").unwrap().urgency > before.urgency);

        s.now = t0() + TimeDelta::seconds(60);
        let report = q.rebalance(&s);
        assert_eq!(report.starving.len(), 1);

        s.now = t0() + TimeDelta::seconds(120);
        let report = q.rebalance(&s);
        assert_eq!(report.starved.len(), 1);
        assert_eq!(report.starved[0].starvation_cycles, 3);
        assert!(q.is_empty());
    }

    #[test]
    fn rebalance_resets_starvation_when_a_worker_qualifies() {
        let q = queue();
        q.enqueue(sql_task("a"), &state()).unwrap();
        q.rebalance(&state());
        let s = state().with_workers(vec![Worker::new("w1", 1).with_capability("sql", 0.9)]);
        let report = q.rebalance(&s);
        assert!(report.starving.is_empty());
        assert_eq!(q.snapshot().entries[0].starvation_cycles, 0);
    }

    #[test]
    fn rebalance_removes_tasks_with_abandoned_dependencies() {
        let q = queue();
        q.enqueue(task("child").depends_on("gone"), &state()).unwrap();
        let mut s = state();
        Arc::make_mut(&mut s.abandoned).insert("gone".into());
        let report = q.rebalance(&s);
        assert_eq!(report.blocked.len(), 1);
        assert_eq!(report.blocked[0].1, "gone");
        assert!(q.is_empty());
    }

    #[test]
    fn needs_rebalance_on_interval_or_burst() {
        let q = queue_with(QueueConfig {
            burst_threshold: 3,
            ..QueueConfig::default()
        });
        assert!(q.needs_rebalance(t0()));
        q.rebalance(&state());
        assert!(!q.needs_rebalance(t0() + TimeDelta::seconds(30)));
        assert!(q.needs_rebalance(t0() + TimeDelta::seconds(60)));
        for id in ["a", "b", "c"] {
            q.enqueue(task(id), &state()).unwrap();
        }
        assert!(q.needs_rebalance(t0()));
    }

    #[test]
    fn snapshot_restores_identical_order() {
        let q = queue();
        q.enqueue(task("a").with_revenue(500.0, 0.0), &state()).unwrap();
        q.enqueue(task("b").with_revenue(5_000.0, 0.0), &state()).unwrap();
        q.enqueue(task("c"), &state()).unwrap();
        let snapshot = q.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();

        let restored = queue();
        let parsed: QueueSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.restore(parsed).unwrap(), 3);
        assert_eq!(restored.ordered_ids(), q.ordered_ids());
        assert_eq!(restored.peek_highest().unwrap().task.id, "b");
    }

    #[test]
    fn restore_rejects_malformed_entries() {
        let q = queue();
        q.enqueue(task("a"), &state()).unwrap();
        let mut snapshot = q.snapshot();
        snapshot.entries[0].task.estimated_effort = -2.0;

        let restored = queue();
        assert!(matches!(
            restored.restore(snapshot),
            Err(EngineError::Validation(ValidationError::NonPositiveEffort(_)))
        ));
        assert!(restored.is_empty());
    }

    #[test]
    fn dependent_counts_cover_queued_tasks() {
        let q = queue();
        q.enqueue(task("x").depends_on("root"), &state()).unwrap();
        q.enqueue(task("y").depends_on("root"), &state()).unwrap();
        assert_eq!(q.dependent_counts().get("root"), Some(&2));
    }

    #[test]
    fn tasks_are_dequeued_once_under_contention() {
        let q = Arc::new(queue());
        let total = 100;
        for id in 0..total {
            q.enqueue(task(&format!("task-{id:03}")), &state()).unwrap();
        }

        let consumers = 4;
        let barrier = Arc::new(Barrier::new(consumers));
        let seen: Arc<Mutex<HashSet<TaskId>>> = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = Vec::new();
        for n in 0..consumers {
            let q = Arc::clone(&q);
            let barrier = Arc::clone(&barrier);
            let seen = Arc::clone(&seen);
            handles.push(thread::spawn(move || {
                let worker = Worker::new(format!("w{n}"), 1);
                barrier.wait();
                while let Some(got) = q.dequeue_best_for(&worker, &state()) {
                    let mut guard = seen.lock().expect("seen mutex poisoned");
                    assert!(guard.insert(got.task.id));
                }
            }));
        }
        for handle in handles {
            handle.join().expect("consumer thread panicked");
        }

        assert_eq!(seen.lock().expect("seen mutex poisoned").len(), total);
        assert!(q.is_empty());
    }

    #[test]
    fn wait_for_work_wakes_on_enqueue() {
        let q = Arc::new(queue());
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let q_clone = Arc::clone(&q);
        let handle = thread::spawn(move || {
            ready_tx.send(()).expect("send ready");
            done_tx
                .send(q_clone.wait_for_work(Duration::from_secs(5)))
                .expect("send result");
        });

        ready_rx.recv_timeout(Duration::from_secs(1)).expect("ready");
        q.enqueue(task("wake"), &state()).unwrap();
        let woke = done_rx.recv_timeout(Duration::from_secs(5)).expect("result");
        assert!(woke);
        handle.join().expect("waiting thread panicked");
    }

    #[test]
    fn wait_for_work_returns_after_close() {
        let q = queue();
        q.close();
        assert!(!q.wait_for_work(Duration::from_secs(5)));
    }
}
