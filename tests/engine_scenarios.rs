//! Scenario tests against the public engine facade.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Barrier};
use std::thread;

use chrono::{TimeDelta, TimeZone, Utc};
use pretty_assertions::assert_eq;

use dispatch_engine::config::PriorityWeights;
use dispatch_engine::exception::CollectingSink;
use dispatch_engine::types::Timestamp;
use dispatch_engine::{
    CancelStatus, DispatchEngine, EngineConfig, EngineError, EngineSnapshot, EscalationReason,
    FailureReason, ManualClock, OutcomeDisposition, RequiredCapability, Task, TaskKind,
    TaskOutcome, TaskState, Worker,
};

fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 11, 4, 9, 0, 0).unwrap()
}

struct Harness {
    engine: DispatchEngine,
    clock: ManualClock,
    sink: CollectingSink,
}

fn harness_with(config: EngineConfig) -> Harness {
    let clock = ManualClock::new(t0());
    let sink = CollectingSink::default();
    let engine = DispatchEngine::builder()
        .config(config)
        .clock(clock.clone())
        .escalation_sink(sink.clone())
        .build()
        .expect("valid config");
    Harness {
        engine,
        clock,
        sink,
    }
}

fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

fn task(id: &str) -> Task {
    Task::new(id, TaskKind::General, 1.0, t0())
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn waiting_never_lowers_urgency_without_deadline() {
    let h = harness();
    h.engine.register_worker(Worker::new("w1", 1)).unwrap();
    h.engine.submit_task(task("idle")).unwrap();

    let mut previous = h.engine.score_of("idle").unwrap().urgency;
    for _ in 0..10 {
        h.clock.advance(TimeDelta::days(1));
        h.engine.rebalance().unwrap();
        let urgency = h.engine.score_of("idle").unwrap().urgency;
        assert!(urgency >= previous, "{urgency} < {previous}");
        previous = urgency;
    }
    assert!(previous > 0.2);
}

#[test]
fn dependent_task_waits_for_its_dependency() {
    let h = harness();
    h.engine.register_worker(Worker::new("w1", 2)).unwrap();
    h.engine.submit_task(task("parent")).unwrap();
    h.engine
        .submit_task(task("child").depends_on("parent").with_revenue(9_000.0, 0.0))
        .unwrap();

    let first = h.engine.request_assignment("w1").unwrap().unwrap();
    assert_eq!(first.task_id, "parent");
    assert!(h.engine.request_assignment("w1").unwrap().is_none());

    h.engine
        .report_outcome("parent", TaskOutcome::Completed { quality: 0.9 })
        .unwrap();
    let second = h.engine.request_assignment("w1").unwrap().unwrap();
    assert_eq!(second.task_id, "child");
}

#[test]
fn identical_workers_tie_break_on_load_then_id() {
    let h = harness();
    for (id, load) in [("w-b", 0.0), ("w-a", 0.3), ("w-c", 0.0)] {
        h.engine
            .register_worker(
                Worker::new(id, 2)
                    .with_capability("rust", 0.8)
                    .with_load(load),
            )
            .unwrap();
    }
    h.engine
        .submit_task(task("t1").requiring(RequiredCapability::new("rust", 0.5)))
        .unwrap();
    let assignment = h.engine.dispatch_next().unwrap().unwrap();
    assert_eq!(assignment.worker_id, "w-b");
}

#[test]
fn cancelling_a_task_that_left_the_queue_is_a_no_op() {
    let h = harness();
    h.engine.register_worker(Worker::new("w1", 1)).unwrap();
    h.engine.submit_task(task("t1")).unwrap();
    h.engine.request_assignment("w1").unwrap().unwrap();
    h.engine
        .report_outcome("t1", TaskOutcome::Completed { quality: 1.0 })
        .unwrap();

    assert_eq!(h.engine.cancel("t1"), CancelStatus::NotFound);
    assert_eq!(h.engine.cancel("t1"), CancelStatus::NotFound);
    assert_eq!(h.engine.task_state("t1"), Some(TaskState::Completed));
}

#[test]
fn batch_optimization_respects_remaining_capacity() {
    let h = harness();
    h.engine.register_worker(Worker::new("small", 1)).unwrap();
    h.engine.register_worker(Worker::new("large", 3)).unwrap();
    h.engine.submit_task(task("pre")).unwrap();
    h.engine.request_assignment("large").unwrap().unwrap();
    for i in 0..6 {
        h.engine.submit_task(task(&format!("t{i}"))).unwrap();
    }

    let outcome = h.engine.optimize();
    let mut per_worker: BTreeMap<String, usize> = BTreeMap::new();
    for assignment in &outcome.assignments {
        *per_worker.entry(assignment.worker_id.clone()).or_default() += 1;
    }
    assert_eq!(
        per_worker,
        BTreeMap::from([("large".to_string(), 2), ("small".to_string(), 1)])
    );
    assert_eq!(h.engine.queue_order().len(), 3);
    assert_eq!(h.engine.worker("large").unwrap().active_tasks, 3);
}

#[test]
fn snapshot_file_round_trip_keeps_the_top_task() {
    let h = harness();
    h.engine.register_worker(Worker::new("w1", 1)).unwrap();
    h.engine
        .submit_task(task("urgent").with_deadline(t0() + TimeDelta::hours(3)))
        .unwrap();
    h.engine.submit_task(task("later")).unwrap();
    h.engine
        .submit_task(task("rich").with_revenue(6_000.0, 1_000.0))
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.json");
    h.engine.snapshot().save(&path).unwrap();

    let restored = harness();
    restored
        .engine
        .restore(EngineSnapshot::load(&path).unwrap())
        .unwrap();
    assert_eq!(restored.engine.queue_order(), h.engine.queue_order());
    assert_eq!(
        restored.engine.score_of("urgent"),
        h.engine.score_of("urgent")
    );

    let original = h.engine.request_assignment("w1").unwrap().unwrap();
    let reloaded = restored.engine.request_assignment("w1").unwrap().unwrap();
    assert_eq!(original.task_id, reloaded.task_id);
}

#[test]
fn blocking_task_outranks_urgent_task_with_enough_dependents() {
    let mut config = EngineConfig::default();
    config.weights = PriorityWeights {
        urgency: 0.10,
        impact: 0.20,
        resource: 0.10,
        revenue: 0.10,
        dependency: 0.50,
    };
    let h = harness_with(config);
    h.engine.register_worker(Worker::new("w1", 1)).unwrap();
    h.engine
        .submit_task(
            Task::new("a", TaskKind::General, 2.0, t0())
                .with_deadline(t0() + TimeDelta::hours(1))
                .with_revenue(1_000.0, 0.0),
        )
        .unwrap();
    h.engine
        .submit_task(task("b").with_revenue(100.0, 0.0))
        .unwrap();
    assert_eq!(h.engine.queue_order(), vec!["a", "b"]);

    for i in 0..3 {
        h.engine
            .submit_task(task(&format!("blocked-{i}")).depends_on("b"))
            .unwrap();
    }
    h.engine.rebalance().unwrap();

    assert!(close(h.engine.score_of("a").unwrap().composite, 0.19));
    assert!(close(h.engine.score_of("b").unwrap().composite, 0.401));
    assert_eq!(&h.engine.queue_order()[..2], ["b", "a"]);
    let next = h.engine.request_assignment("w1").unwrap().unwrap();
    assert_eq!(next.task_id, "b");
}

#[test]
fn empty_worker_pool_yields_nothing_without_errors() {
    let h = harness();
    h.engine.register_worker(Worker::new("w1", 2)).unwrap();
    h.engine.register_worker(Worker::new("w2", 2)).unwrap();
    for i in 0..4 {
        h.engine.submit_task(task(&format!("t{i}"))).unwrap();
    }
    h.engine.terminate_worker("w1").unwrap();
    h.engine.terminate_worker("w2").unwrap();

    assert!(h.engine.dispatch_next().unwrap().is_none());
    assert!(h.engine.optimize().assignments.is_empty());
    assert!(matches!(
        h.engine.request_assignment("w1"),
        Err(EngineError::WorkerTerminated(_))
    ));
    assert_eq!(h.engine.queue_order().len(), 4);
}

#[test]
fn fourth_transient_failure_escalates() {
    let h = harness();
    h.engine.register_worker(Worker::new("w1", 1)).unwrap();
    h.engine.submit_task(task("flaky")).unwrap();

    let mut dispositions = Vec::new();
    for _ in 0..4 {
        let assignment = h.engine.request_assignment("w1").unwrap().unwrap();
        assert_eq!(assignment.task_id, "flaky");
        dispositions.push(
            h.engine
                .report_outcome("flaky", TaskOutcome::Failed(FailureReason::Timeout))
                .unwrap(),
        );
    }

    assert_eq!(
        &dispositions[..3],
        [
            OutcomeDisposition::Retried { attempt: 1 },
            OutcomeDisposition::Retried { attempt: 2 },
            OutcomeDisposition::Retried { attempt: 3 },
        ]
    );
    assert!(matches!(
        dispositions[3],
        OutcomeDisposition::Escalated { .. }
    ));
    assert_eq!(h.engine.task_state("flaky"), Some(TaskState::Failed));
    assert!(h.engine.request_assignment("w1").unwrap().is_none());

    let escalations = h.sink.escalations();
    assert_eq!(escalations.len(), 1);
    assert_eq!(
        escalations[0].reason,
        EscalationReason::RetriesExhausted {
            attempts: 4,
            last: FailureReason::Timeout
        }
    );
}

#[test]
fn lost_worker_tasks_move_to_another_worker() {
    let h = harness();
    h.engine
        .register_worker(Worker::new("w1", 1).with_capability("sql", 0.9))
        .unwrap();
    h.engine
        .submit_task(task("report").requiring(RequiredCapability::new("sql", 0.6)))
        .unwrap();
    h.engine.request_assignment("w1").unwrap().unwrap();
    h.engine.start_task("report").unwrap();

    assert_eq!(h.engine.terminate_worker("w1").unwrap(), vec!["report"]);
    assert_eq!(h.engine.task_state("report"), Some(TaskState::Pending));

    h.engine
        .register_worker(Worker::new("w2", 1).with_capability("sql", 0.7))
        .unwrap();
    let again = h.engine.request_assignment("w2").unwrap().unwrap();
    assert_eq!(again.task_id, "report");
    assert_eq!(
        h.engine.in_flight_task("report").unwrap().retry_count,
        1
    );
}

#[test]
fn concurrent_requests_never_share_a_task() {
    let h = harness();
    let engine = Arc::new(h.engine);
    let workers = 4;
    for i in 0..workers {
        engine
            .register_worker(Worker::new(format!("w{i}"), 10))
            .unwrap();
    }
    for i in 0..30 {
        engine.submit_task(task(&format!("t{i:02}"))).unwrap();
    }

    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let worker_id = format!("w{i}");
                let mut taken = Vec::new();
                barrier.wait();
                while let Some(assignment) = engine.request_assignment(&worker_id).unwrap() {
                    engine
                        .report_outcome(
                            &assignment.task_id,
                            TaskOutcome::Completed { quality: 0.8 },
                        )
                        .unwrap();
                    taken.push(assignment.task_id);
                }
                taken
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.join().expect("worker thread panicked") {
            total += 1;
            assert!(seen.insert(id.clone()), "{id} handed out twice");
        }
    }
    assert_eq!(total, 30);
    assert!(engine.is_drained());
    assert_eq!(engine.metrics_snapshot().counters.completed, 30);
}
