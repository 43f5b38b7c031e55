//! Demo and benchmark runners that drive the engine with worker threads.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::TimeDelta;
use tracing::{debug, info, warn};

use dispatch_engine::{
    BusinessContext, ClientTier, DispatchEngine, EngineConfig, EngineError, FailureReason,
    HandlerRegistry, RequiredCapability, StakeholderLevel, StrategicImportance, Task, TaskId,
    TaskKind, TaskOutcome, TaskReport, Worker, WorkerId,
};
use dispatch_engine::types::Timestamp;

// Demo timing knobs (small for quick CLI feedback).
const DEMO_HEARTBEAT_TIMEOUT_MS: u64 = 200;
const DEMO_WORK_MS: u64 = 60;
const DEMO_MAX_RUN: Duration = Duration::from_secs(10);
const DEMO_SILENT_WORKER: &str = "w-bravo";
// Benchmark runs are bounded so a stuck task cannot hang the CLI.
const BENCH_MAX_RUN: Duration = Duration::from_secs(120);
const MAINTENANCE_POLL: Duration = Duration::from_millis(50);
const IDLE_POLL: Duration = Duration::from_millis(10);
const SUPERVISE_POLL: Duration = Duration::from_millis(25);

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    use libc::{RUSAGE_SELF, getrusage, rusage};
    let mut usage = rusage {
        ru_utime: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        ru_stime: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        ru_maxrss: 0,
        ru_ixrss: 0,
        ru_idrss: 0,
        ru_isrss: 0,
        ru_minflt: 0,
        ru_majflt: 0,
        ru_nswap: 0,
        ru_inblock: 0,
        ru_oublock: 0,
        ru_msgsnd: 0,
        ru_msgrcv: 0,
        ru_nsignals: 0,
        ru_nvcsw: 0,
        ru_nivcsw: 0,
    };
    let rc = unsafe { getrusage(RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let user = usage.ru_utime.tv_sec as f64 + (usage.ru_utime.tv_usec as f64 / 1_000_000.0);
    let sys = usage.ru_stime.tv_sec as f64 + (usage.ru_stime.tv_usec as f64 / 1_000_000.0);
    Some((user, sys))
}

/// Stub on non-Unix platforms.
#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

/// Invariant checks shared by all worker threads.
#[derive(Default)]
struct RunMetrics {
    done: Mutex<BTreeMap<WorkerId, usize>>,
    running: Mutex<HashSet<TaskId>>,
    completed: Mutex<HashSet<TaskId>>,
    duplicate_assignment: AtomicBool,
    dependency_violation: AtomicBool,
}

impl RunMetrics {
    fn begin(&self, task: &Task) {
        {
            let completed = self.completed.lock().expect("completed mutex poisoned");
            if !task.dependencies.iter().all(|dep| completed.contains(dep)) {
                self.dependency_violation.store(true, Ordering::SeqCst);
            }
        }
        let mut running = self.running.lock().expect("running mutex poisoned");
        if !running.insert(task.id.clone()) {
            self.duplicate_assignment.store(true, Ordering::SeqCst);
        }
    }

    fn finish(&self, worker_id: &str, task_id: &str, succeeded: bool) {
        self.running
            .lock()
            .expect("running mutex poisoned")
            .remove(task_id);
        if succeeded {
            self.completed
                .lock()
                .expect("completed mutex poisoned")
                .insert(task_id.to_string());
        }
        *self
            .done
            .lock()
            .expect("done mutex poisoned")
            .entry(worker_id.to_string())
            .or_insert(0) += 1;
    }

    fn per_worker(&self) -> BTreeMap<WorkerId, usize> {
        self.done.lock().expect("done mutex poisoned").clone()
    }

    fn duplicate_assignment(&self) -> bool {
        self.duplicate_assignment.load(Ordering::SeqCst)
    }

    fn dependency_violation(&self) -> bool {
        self.dependency_violation.load(Ordering::SeqCst)
    }
}

/// One worker thread's view of the engine.
struct WorkerLoop {
    engine: Arc<DispatchEngine>,
    handlers: HandlerRegistry,
    metrics: Arc<RunMetrics>,
    stop: Arc<AtomicBool>,
    worker_id: WorkerId,
    work: Duration,
    /// Stop heartbeating (and abandon any held task) after this many tasks,
    /// or as soon as no work is offered.
    silent_after: Option<usize>,
    /// Exit once the engine has nothing queued or in flight.
    exit_when_drained: bool,
}

impl WorkerLoop {
    fn run(self) -> Result<(), EngineError> {
        let mut handled = 0usize;
        while !self.stop.load(Ordering::SeqCst) {
            for task_id in self.engine.pending_cancellations(&self.worker_id) {
                self.engine.report_outcome(&task_id, TaskOutcome::Cancelled)?;
                self.metrics.finish(&self.worker_id, &task_id, false);
            }

            let assignment = match self.engine.request_assignment(&self.worker_id) {
                Ok(Some(assignment)) => assignment,
                Ok(None) => {
                    if self.silent_after.is_some() {
                        warn!(worker_id = %self.worker_id, "worker going silent");
                        return Ok(());
                    }
                    if self.exit_when_drained && self.engine.is_drained() {
                        return Ok(());
                    }
                    // An empty queue blocks until enqueue or shutdown; queued
                    // work that does not fit this worker yet means back off.
                    if self.engine.wait_for_work(IDLE_POLL) {
                        thread::sleep(IDLE_POLL);
                    }
                    continue;
                }
                Err(EngineError::WorkerTerminated(_)) => return Ok(()),
                Err(err) => return Err(err),
            };

            if self.silent_after.is_some_and(|limit| handled >= limit) {
                warn!(
                    worker_id = %self.worker_id,
                    task_id = %assignment.task_id,
                    "worker going silent while holding a task"
                );
                return Ok(());
            }

            self.engine.start_task(&assignment.task_id)?;
            let Some(task) = self.engine.in_flight_task(&assignment.task_id) else {
                continue;
            };
            self.metrics.begin(&task);
            let result = self.handlers.dispatch(&task);
            if !self.work.is_zero() {
                thread::sleep(self.work);
            }
            let succeeded = result.is_ok();
            self.metrics.finish(&self.worker_id, &task.id, succeeded);
            let disposition = self.engine.report_outcome(&task.id, result.into())?;
            debug!(task_id = %task.id, ?disposition, "outcome reported");
            handled += 1;
        }
        Ok(())
    }
}

fn spawn_worker(
    worker: WorkerLoop,
) -> anyhow::Result<thread::JoinHandle<Result<(), EngineError>>> {
    thread::Builder::new()
        .name(worker.worker_id.clone())
        .spawn(move || worker.run())
        .context("spawn worker thread")
}

/// Block until `settled` holds or `max_run` elapses. Returns whether it settled.
fn supervise(max_run: Duration, settled: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if settled() {
            return true;
        }
        if start.elapsed() >= max_run {
            return false;
        }
        thread::sleep(SUPERVISE_POLL);
    }
}

fn demo_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers
        .register(
            TaskKind::ComplianceRequirement,
            |_: &Task| -> Result<TaskReport, FailureReason> {
                Err(FailureReason::InvalidResult("evidence bundle incomplete".into()))
            },
        )
        .register(
            TaskKind::Operations,
            |task: &Task| -> Result<TaskReport, FailureReason> {
                if task.retry_count == 0 {
                    Err(FailureReason::ResourceUnavailable)
                } else {
                    Ok(TaskReport::new(0.8, "maintenance window completed"))
                }
            },
        )
        .set_fallback(|task: &Task| -> Result<TaskReport, FailureReason> {
            Ok(TaskReport::new(0.85, format!("{} delivered", task.title)))
        });
    handlers
}

fn demo_workers() -> Vec<Worker> {
    vec![
        Worker::new("w-alpha", 2)
            .with_capability("analysis", 0.9)
            .with_capability("sql", 0.8)
            .with_capability("writing", 0.6),
        Worker::new(DEMO_SILENT_WORKER, 2)
            .with_capability("analysis", 0.7)
            .with_capability("writing", 0.9)
            .with_capability("sql", 0.6),
        Worker::new("w-charlie", 2)
            .with_capability("sql", 0.75)
            .with_capability("analysis", 0.65)
            .with_capability("writing", 0.6)
            .with_capability("operations", 0.85),
    ]
}

fn demo_tasks(engine: &DispatchEngine) -> Vec<Task> {
    let now = engine.now();
    let analysis = |min| RequiredCapability::new("analysis", min);
    let sql = |min| RequiredCapability::new("sql", min);
    let writing = |min| RequiredCapability::new("writing", min);
    vec![
        Task::new("q3-client-report", TaskKind::ClientDeliverable, 2.0, now)
            .titled("Q3 client report")
            .with_deadline(now + TimeDelta::hours(1))
            .with_revenue(12_000.0, 2_000.0)
            .requiring(writing(0.6))
            .requiring(analysis(0.5))
            .with_business(BusinessContext {
                client_tier: ClientTier::Enterprise,
                strategic_importance: StrategicImportance::High,
                stakeholder: StakeholderLevel::Executive,
            }),
        Task::new("churn-analysis", TaskKind::DataAnalysis, 3.0, now)
            .titled("Churn analysis")
            .with_revenue(4_000.0, 500.0)
            .requiring(analysis(0.6))
            .requiring(sql(0.6)),
        Task::new("pipeline-dashboard", TaskKind::DataAnalysis, 1.5, now)
            .titled("Pipeline dashboard")
            .requiring(sql(0.6))
            .depends_on("churn-analysis"),
        Task::new("pricing-page-copy", TaskKind::ContentCreation, 1.0, now)
            .titled("Pricing page copy")
            .with_deadline(now + TimeDelta::hours(26))
            .requiring(writing(0.6)),
        Task::new("launch-campaign", TaskKind::Marketing, 2.0, now)
            .titled("Launch campaign")
            .requiring(writing(0.6))
            .depends_on("pricing-page-copy"),
        Task::new("renewal-outreach", TaskKind::Sales, 1.0, now)
            .titled("Renewal outreach")
            .with_revenue(8_000.0, 500.0)
            .requiring(writing(0.5)),
        Task::new("db-maintenance", TaskKind::Operations, 0.5, now)
            .titled("Database maintenance")
            .requiring(sql(0.6)),
        Task::new("etl-backfill", TaskKind::SoftwareDevelopment, 4.0, now)
            .titled("ETL backfill")
            .requiring(sql(0.6)),
        Task::new("compliance-review", TaskKind::ComplianceRequirement, 2.0, now)
            .titled("Compliance review")
            .with_deadline(now + TimeDelta::hours(48))
            .requiring(analysis(0.6)),
        Task::new("audit-followup", TaskKind::General, 1.0, now)
            .titled("Audit follow-up")
            .depends_on("compliance-review"),
        Task::new("newsletter-draft", TaskKind::ContentCreation, 1.0, now)
            .titled("Newsletter draft")
            .requiring(writing(0.5)),
    ]
}

/// Run the default demo: scored intake, capability matching, retries,
/// escalation, cancellation and offline detection of a silent worker.
pub fn run_demo(base: EngineConfig) -> anyhow::Result<()> {
    let mut config = base;
    config.monitor.heartbeat_timeout_ms = DEMO_HEARTBEAT_TIMEOUT_MS;
    config.queue.rebalance_interval_secs = 1;
    config.optimizer.interval_secs = 1;
    let engine = Arc::new(DispatchEngine::new(config).context("build demo engine")?);
    info!("demo start");

    let workers = demo_workers();
    let worker_ids: Vec<WorkerId> = workers.iter().map(|w| w.id.clone()).collect();
    for worker in workers {
        engine.register_worker(worker)?;
    }
    let tasks = demo_tasks(&engine);
    let tasks_total = tasks.len();
    for task in tasks {
        engine.submit_task(task)?;
    }
    let cancelled_at_intake = engine.cancel("newsletter-draft");
    debug!(?cancelled_at_intake, "intake cancellation");

    let stop = Arc::new(AtomicBool::new(false));
    let maintenance = engine
        .spawn_maintenance(Arc::clone(&stop), MAINTENANCE_POLL)
        .context("spawn maintenance thread")?;
    let metrics = Arc::new(RunMetrics::default());
    let handlers = demo_handlers();

    let start = Instant::now();
    let mut handles = Vec::new();
    for worker_id in &worker_ids {
        let silent_after = (worker_id == DEMO_SILENT_WORKER).then_some(2);
        handles.push(spawn_worker(WorkerLoop {
            engine: Arc::clone(&engine),
            handlers: handlers.clone(),
            metrics: Arc::clone(&metrics),
            stop: Arc::clone(&stop),
            worker_id: worker_id.clone(),
            work: Duration::from_millis(DEMO_WORK_MS),
            silent_after,
            exit_when_drained: false,
        })?);
    }

    let settled = supervise(DEMO_MAX_RUN, || {
        engine.is_drained()
            && engine
                .worker(DEMO_SILENT_WORKER)
                .is_some_and(|worker| worker.is_terminated())
    });
    if !settled {
        warn!("demo stopped before the engine drained");
    }
    stop.store(true, Ordering::SeqCst);
    engine.shutdown();
    for handle in handles {
        handle.join().expect("worker thread panicked")?;
    }
    maintenance.join().expect("maintenance thread panicked");
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "demo finished");

    let snapshot = engine.metrics_snapshot();
    let terminated: Vec<WorkerId> = worker_ids
        .iter()
        .filter(|id| engine.worker(id).is_some_and(|w| w.is_terminated()))
        .cloned()
        .collect();
    let mut escalated: Vec<TaskId> = engine
        .escalations()
        .into_iter()
        .map(|escalation| escalation.task_id)
        .collect();
    escalated.sort();

    println!("DEMO SUMMARY");
    println!("workers={} tasks_total={tasks_total}", worker_ids.len());
    println!("tasks_per_worker_done={:?}", metrics.per_worker());
    println!(
        "completed={} retried={} escalated={} cancelled={}",
        snapshot.counters.completed,
        snapshot.counters.retried,
        snapshot.counters.escalated,
        snapshot.counters.cancelled
    );
    println!("average_compatibility={:.2}", snapshot.average_compatibility);
    println!("dependency_violation={}", metrics.dependency_violation());
    println!("duplicate_assignment={}", metrics.duplicate_assignment());
    println!("escalated_tasks={escalated:?}");
    println!("terminated_workers={terminated:?}");
    println!("queue_depth_at_end={}", snapshot.queue_depth);
    Ok(())
}

/// Aggregated metrics from a single benchmark run.
struct BenchResult {
    workers: usize,
    tasks_per_worker: usize,
    total_tasks: usize,
    elapsed_ms: f64,
    throughput: f64,
    avg_assignment_wait_ms: f64,
    avg_compatibility: f64,
    cpu_user_s: Option<f64>,
    cpu_sys_s: Option<f64>,
    completed: u64,
    retried: u64,
    escalated: u64,
    degraded_batches: u64,
    leftover: usize,
    duplicate_assignment: bool,
    dependency_violation: bool,
}

const BENCH_SKILLS: [&str; 3] = ["analysis", "sql", "writing"];
const BENCH_KINDS: [TaskKind; 5] = [
    TaskKind::DataAnalysis,
    TaskKind::SoftwareDevelopment,
    TaskKind::ContentCreation,
    TaskKind::Sales,
    TaskKind::ClientDeliverable,
];

fn bench_task(index: usize, now: Timestamp) -> Task {
    let mut task = Task::new(
        format!("bench-{index:05}"),
        BENCH_KINDS[index % BENCH_KINDS.len()],
        1.0 + (index % 4) as f64,
        now,
    )
    .requiring(RequiredCapability::new(BENCH_SKILLS[index % 3], 0.5))
    .with_revenue((index % 7) as f64 * 1_000.0, 200.0);
    if index % 5 == 0 {
        task = task.with_deadline(now + TimeDelta::hours((index % 48) as i64 + 1));
    }
    if index % 10 == 9 {
        task = task.depends_on(format!("bench-{:05}", index - 3));
    }
    if index % 13 == 0 {
        task = task.titled("flaky");
    }
    task
}

fn bench_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.set_fallback(|task: &Task| -> Result<TaskReport, FailureReason> {
        if task.title == "flaky" && task.retry_count == 0 {
            Err(FailureReason::Timeout)
        } else {
            Ok(TaskReport::new(0.9, "ok"))
        }
    });
    handlers
}

fn benchmark_once(
    base: &EngineConfig,
    workers: usize,
    tasks_per_worker: usize,
    work_ms: u64,
) -> anyhow::Result<BenchResult> {
    let engine = Arc::new(DispatchEngine::new(base.clone()).context("build bench engine")?);
    let mut worker_ids = Vec::with_capacity(workers);
    for i in 0..workers {
        let step = (i % 4) as f64 * 0.1;
        let worker = Worker::new(format!("bench-w{i:02}"), 2)
            .with_capability("analysis", 0.6 + step)
            .with_capability("sql", 0.9 - step)
            .with_capability("writing", 0.7);
        worker_ids.push(worker.id.clone());
        engine.register_worker(worker)?;
    }

    let total_tasks = workers * tasks_per_worker;
    let now = engine.now();
    for index in 0..total_tasks {
        engine.submit_task(bench_task(index, now))?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let maintenance = engine
        .spawn_maintenance(Arc::clone(&stop), MAINTENANCE_POLL)
        .context("spawn maintenance thread")?;
    let metrics = Arc::new(RunMetrics::default());
    let handlers = bench_handlers();

    let cpu_start = cpu_times_seconds();
    let start = Instant::now();
    let mut handles = Vec::with_capacity(workers);
    for worker_id in worker_ids {
        handles.push(spawn_worker(WorkerLoop {
            engine: Arc::clone(&engine),
            handlers: handlers.clone(),
            metrics: Arc::clone(&metrics),
            stop: Arc::clone(&stop),
            worker_id,
            work: Duration::from_millis(work_ms),
            silent_after: None,
            exit_when_drained: true,
        })?);
    }

    if !supervise(BENCH_MAX_RUN, || engine.is_drained()) {
        warn!("benchmark stopped before the engine drained");
    }
    stop.store(true, Ordering::SeqCst);
    engine.shutdown();
    for handle in handles {
        handle.join().expect("benchmark thread panicked")?;
    }
    maintenance.join().expect("maintenance thread panicked");

    let elapsed_ms = start.elapsed().as_millis() as f64;
    let throughput = if elapsed_ms > 0.0 {
        (total_tasks as f64) / (elapsed_ms / 1000.0)
    } else {
        0.0
    };
    let (cpu_user_s, cpu_sys_s) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => {
            (Some(user_end - user_start), Some(sys_end - sys_start))
        }
        _ => (None, None),
    };

    let snapshot = engine.metrics_snapshot();
    Ok(BenchResult {
        workers,
        tasks_per_worker,
        total_tasks,
        elapsed_ms,
        throughput,
        avg_assignment_wait_ms: snapshot.average_assignment_wait_secs * 1000.0,
        avg_compatibility: snapshot.average_compatibility,
        cpu_user_s,
        cpu_sys_s,
        completed: snapshot.counters.completed,
        retried: snapshot.counters.retried,
        escalated: snapshot.counters.escalated,
        degraded_batches: snapshot.counters.degraded_batches,
        leftover: snapshot.queue_depth + snapshot.in_flight + snapshot.reserved,
        duplicate_assignment: metrics.duplicate_assignment(),
        dependency_violation: metrics.dependency_violation(),
    })
}

/// Run one benchmark and print a CSV row.
pub fn run_benchmark(
    base: &EngineConfig,
    workers: usize,
    tasks_per_worker: usize,
    work_ms: u64,
    validate: bool,
) -> anyhow::Result<()> {
    anyhow::ensure!(workers > 0, "workers must be > 0");
    anyhow::ensure!(tasks_per_worker > 0, "tasks_per_worker must be > 0");
    let result = benchmark_once(base, workers, tasks_per_worker, work_ms)?;

    println!(
        "workers,tasks_per_worker,total_tasks,elapsed_ms,throughput_tasks_per_s,avg_assignment_wait_ms,avg_compatibility,cpu_user_s,cpu_sys_s,completed,retried,escalated,degraded_batches"
    );
    let cpu_user = result
        .cpu_user_s
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "NA".to_string());
    let cpu_sys = result
        .cpu_sys_s
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "NA".to_string());
    println!(
        "{},{},{},{:.2},{:.2},{:.2},{:.3},{},{},{},{},{},{}",
        result.workers,
        result.tasks_per_worker,
        result.total_tasks,
        result.elapsed_ms,
        result.throughput,
        result.avg_assignment_wait_ms,
        result.avg_compatibility,
        cpu_user,
        cpu_sys,
        result.completed,
        result.retried,
        result.escalated,
        result.degraded_batches
    );
    if result.leftover > 0 {
        eprintln!("# warning,leftover_tasks,{}", result.leftover);
    }
    if validate {
        if result.duplicate_assignment {
            eprintln!("# violation,duplicate_assignment");
        }
        if result.dependency_violation {
            eprintln!("# violation,dependency_order");
        }
    }
    Ok(())
}
