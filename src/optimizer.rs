//! Batch assignment as a min-cost flow.
//!
//! Source -> task (capacity 1) -> worker (qualified pairs only) -> sink
//! (remaining capacity). Edge costs are the negated `priority *
//! compatibility`, so the cheapest flow is the highest-value assignment.
//! Augmentation stops as soon as the next path would not add value.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::capability::{CapabilityMatcher, CompatibilityAssessment};
use crate::config::OptimizerConfig;
use crate::error::CapacityError;
use crate::task_queue::QueuedTask;
use crate::types::{Assignment, Timestamp, Worker};

/// Cost nudge per worker rank, so equal-value pairings go to the less
/// loaded worker, then the lower id.
const WORKER_TIE: f64 = 1e-9;
/// Cost nudge per task rank, favouring earlier (higher priority) tasks.
const TASK_TIE: f64 = 1e-12;
const RELAX_EPSILON: f64 = 1e-15;
const TIME_CHECK_EVERY: usize = 1024;

#[derive(Clone, Debug, Default)]
pub struct BatchOutcome {
    pub assignments: Vec<Assignment>,
    /// The solver ran out of budget and the greedy fallback was used.
    pub degraded: bool,
    pub iterations: usize,
}

pub struct AssignmentOptimizer {
    matcher: CapabilityMatcher,
    config: OptimizerConfig,
}

impl AssignmentOptimizer {
    pub fn new(matcher: CapabilityMatcher, config: OptimizerConfig) -> Self {
        Self { matcher, config }
    }

    /// Assign `tasks` (highest priority first) to `workers` without
    /// exceeding the slots `capacity` reports for each worker. Tasks left
    /// out stay queued.
    pub fn optimize_batch<C>(
        &self,
        tasks: &[QueuedTask],
        workers: &[Worker],
        capacity: C,
        now: Timestamp,
    ) -> BatchOutcome
    where
        C: Fn(&Worker) -> usize,
    {
        let slots: Vec<usize> = workers
            .iter()
            .map(|worker| {
                if worker.is_terminated() {
                    0
                } else {
                    capacity(worker)
                }
            })
            .collect();
        let mut budget = Budget::new(self.config.time_budget(), self.config.max_iterations);
        match self.solve(tasks, workers, &slots, now, &mut budget) {
            Ok(assignments) => {
                debug!(
                    tasks = tasks.len(),
                    workers = workers.len(),
                    assigned = assignments.len(),
                    iterations = budget.iterations,
                    "batch solved"
                );
                BatchOutcome {
                    assignments,
                    degraded: false,
                    iterations: budget.iterations,
                }
            }
            Err(err) => {
                warn!(error = %err, tasks = tasks.len(), "optimizer degraded to greedy assignment");
                BatchOutcome {
                    assignments: self.greedy(tasks, workers, &slots, now),
                    degraded: true,
                    iterations: budget.iterations,
                }
            }
        }
    }

    fn solve(
        &self,
        tasks: &[QueuedTask],
        workers: &[Worker],
        slots: &[usize],
        now: Timestamp,
        budget: &mut Budget,
    ) -> Result<Vec<Assignment>, CapacityError> {
        let mut ranked: Vec<usize> = (0..workers.len()).filter(|&i| slots[i] > 0).collect();
        ranked.sort_by(|&a, &b| {
            workers[a]
                .current_load
                .total_cmp(&workers[b].current_load)
                .then_with(|| workers[a].id.cmp(&workers[b].id))
        });
        if ranked.is_empty() || tasks.is_empty() {
            return Ok(Vec::new());
        }

        let source = 0;
        let task_node = |t: usize| 1 + t;
        let worker_node = |rank: usize| 1 + tasks.len() + rank;
        let sink = 1 + tasks.len() + ranked.len();
        let mut graph = FlowGraph::new(sink + 1);

        for (t, _) in tasks.iter().enumerate() {
            graph.add_edge(source, task_node(t), 1, t as f64 * TASK_TIE);
        }
        for (rank, &w) in ranked.iter().enumerate() {
            graph.add_edge(worker_node(rank), sink, slots[w] as i64, 0.0);
        }

        let mut pairs = Vec::new();
        for (t, entry) in tasks.iter().enumerate() {
            for (rank, &w) in ranked.iter().enumerate() {
                let assessment = self.matcher.compatibility(&workers[w], &entry.task);
                let value = entry.score.composite * assessment.score;
                if !assessment.meets_minimum || value <= 0.0 {
                    continue;
                }
                let cost = -value + rank as f64 * WORKER_TIE;
                let edge = graph.add_edge(task_node(t), worker_node(rank), 1, cost);
                pairs.push((edge, t, w, assessment.score));
            }
        }

        loop {
            budget.check_time()?;
            let Some((cost, prev)) = graph.shortest_path(source, sink, budget)? else {
                break;
            };
            if cost >= 0.0 {
                break;
            }
            graph.augment(source, sink, &prev);
        }

        let mut assignments: Vec<(usize, Assignment)> = pairs
            .into_iter()
            .filter(|(edge, ..)| graph.edges[*edge].cap == 0)
            .map(|(_, t, w, compatibility)| {
                let entry = &tasks[t];
                let assignment = Assignment::new(
                    &entry.task,
                    workers[w].id.clone(),
                    now,
                    entry.score.composite,
                    compatibility,
                );
                (t, assignment)
            })
            .collect();
        assignments.sort_by_key(|(t, _)| *t);
        Ok(assignments.into_iter().map(|(_, a)| a).collect())
    }

    /// Best available qualified worker for each task, in priority order.
    fn greedy(
        &self,
        tasks: &[QueuedTask],
        workers: &[Worker],
        slots: &[usize],
        now: Timestamp,
    ) -> Vec<Assignment> {
        let mut remaining = slots.to_vec();
        let mut assignments = Vec::new();
        for entry in tasks {
            let mut best: Option<(usize, CompatibilityAssessment)> = None;
            for (i, worker) in workers.iter().enumerate() {
                if remaining[i] == 0 {
                    continue;
                }
                let assessment = self.matcher.compatibility(worker, &entry.task);
                if !assessment.meets_minimum {
                    continue;
                }
                let better = best
                    .as_ref()
                    .is_none_or(|(_, current)| assessment.cmp_preference(current) == Ordering::Less);
                if better {
                    best = Some((i, assessment));
                }
            }
            if let Some((i, assessment)) = best {
                remaining[i] -= 1;
                assignments.push(Assignment::new(
                    &entry.task,
                    workers[i].id.clone(),
                    now,
                    entry.score.composite,
                    assessment.score,
                ));
            }
        }
        assignments
    }
}

struct Budget {
    started: Instant,
    limit: Duration,
    max_iterations: usize,
    iterations: usize,
}

impl Budget {
    fn new(limit: Duration, max_iterations: usize) -> Self {
        Self {
            started: Instant::now(),
            limit,
            max_iterations,
            iterations: 0,
        }
    }

    fn step(&mut self) -> Result<(), CapacityError> {
        self.iterations += 1;
        if self.iterations > self.max_iterations {
            return Err(CapacityError::IterationBudget {
                limit: self.max_iterations,
            });
        }
        if self.iterations % TIME_CHECK_EVERY == 0 {
            self.check_time()?;
        }
        Ok(())
    }

    fn check_time(&self) -> Result<(), CapacityError> {
        if self.started.elapsed() > self.limit {
            return Err(CapacityError::TimeBudget {
                budget_ms: self.limit.as_millis() as u64,
            });
        }
        Ok(())
    }
}

struct Edge {
    to: usize,
    cap: i64,
    cost: f64,
}

/// Residual graph; the reverse of edge `i` is `i ^ 1`.
struct FlowGraph {
    edges: Vec<Edge>,
    adj: Vec<Vec<usize>>,
}

impl FlowGraph {
    fn new(nodes: usize) -> Self {
        Self {
            edges: Vec::new(),
            adj: vec![Vec::new(); nodes],
        }
    }

    fn add_edge(&mut self, from: usize, to: usize, cap: i64, cost: f64) -> usize {
        let id = self.edges.len();
        self.edges.push(Edge { to, cap, cost });
        self.adj[from].push(id);
        self.edges.push(Edge {
            to: from,
            cap: 0,
            cost: -cost,
        });
        self.adj[to].push(id + 1);
        id
    }

    /// Bellman-Ford over edges with residual capacity. Returns the path
    /// cost and the incoming edge of each node, or `None` if the sink is
    /// unreachable.
    fn shortest_path(
        &self,
        source: usize,
        sink: usize,
        budget: &mut Budget,
    ) -> Result<Option<(f64, Vec<usize>)>, CapacityError> {
        let n = self.adj.len();
        let mut dist = vec![f64::INFINITY; n];
        let mut prev = vec![usize::MAX; n];
        dist[source] = 0.0;

        for round in 0..n {
            let mut changed = false;
            for u in 0..n {
                if !dist[u].is_finite() {
                    continue;
                }
                for &e in &self.adj[u] {
                    let edge = &self.edges[e];
                    if edge.cap <= 0 {
                        continue;
                    }
                    budget.step()?;
                    let candidate = dist[u] + edge.cost;
                    if candidate < dist[edge.to] - RELAX_EPSILON {
                        dist[edge.to] = candidate;
                        prev[edge.to] = e;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
            if round + 1 == n {
                return Err(CapacityError::NegativeCycle);
            }
        }

        if !dist[sink].is_finite() {
            return Ok(None);
        }
        Ok(Some((dist[sink], prev)))
    }

    /// Push one unit along the path recorded in `prev`.
    fn augment(&mut self, source: usize, sink: usize, prev: &[usize]) {
        let mut node = sink;
        while node != source {
            let e = prev[node];
            self.edges[e].cap -= 1;
            self.edges[e ^ 1].cap += 1;
            node = self.edges[e ^ 1].to;
        }
    }
}
