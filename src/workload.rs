//! Per-worker load tracking, heartbeats and offline detection.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::config::MonitorConfig;
use crate::types::{Timestamp, WorkerId};

struct WorkerLoad {
    active: usize,
    max: usize,
    /// Exponentially weighted utilization.
    estimate: f64,
    last_seen: Timestamp,
    completed: u64,
    failed: u64,
}

impl WorkerLoad {
    fn update(&mut self, alpha: f64) {
        let instant = if self.max == 0 {
            1.0
        } else {
            (self.active as f64 / self.max as f64).min(1.0)
        };
        self.estimate = alpha * instant + (1.0 - alpha) * self.estimate;
    }
}

struct MonitorState {
    workers: HashMap<WorkerId, WorkerLoad>,
    offline: HashSet<WorkerId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerUtilization {
    pub active: usize,
    pub max: usize,
    pub load: f64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSnapshot {
    pub workers: BTreeMap<WorkerId, WorkerUtilization>,
    /// Active assignments over total capacity.
    pub overall: f64,
    pub overloaded: bool,
}

/// Load counters are updated after the fact and may trail the registry
/// briefly; readers treat them as estimates.
pub struct WorkloadMonitor {
    state: Mutex<MonitorState>,
    alpha: f64,
    high_water_mark: f64,
}

impl WorkloadMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            state: Mutex::new(MonitorState {
                workers: HashMap::new(),
                offline: HashSet::new(),
            }),
            alpha: config.ewma_alpha,
            high_water_mark: config.high_water_mark,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().expect("workload monitor mutex poisoned")
    }

    fn overdue_workers(state: &MonitorState, now: Timestamp, timeout: TimeDelta) -> Vec<WorkerId> {
        state
            .workers
            .iter()
            .filter_map(|(id, load)| {
                if now - load.last_seen > timeout {
                    Some(id.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Start tracking a worker; no-op if already registered.
    pub fn register_worker(&self, id: &str, max: usize, initial_load: f64, now: Timestamp) {
        let mut guard = self.lock();
        guard.workers.entry(id.to_string()).or_insert(WorkerLoad {
            active: 0,
            max,
            estimate: initial_load,
            last_seen: now,
            completed: 0,
            failed: 0,
        });
    }

    pub fn remove_worker(&self, id: &str) {
        let mut guard = self.lock();
        guard.workers.remove(id);
        guard.offline.remove(id);
    }

    /// Count a new assignment and return the updated load estimate.
    pub fn record_assignment(&self, id: &str) -> Option<f64> {
        let alpha = self.alpha;
        let mut guard = self.lock();
        let load = guard.workers.get_mut(id)?;
        load.active += 1;
        load.update(alpha);
        Some(load.estimate)
    }

    /// Release an assignment slot and return the updated load estimate.
    pub fn record_release(&self, id: &str, succeeded: bool) -> Option<f64> {
        let alpha = self.alpha;
        let mut guard = self.lock();
        let load = guard.workers.get_mut(id)?;
        load.active = load.active.saturating_sub(1);
        if succeeded {
            load.completed += 1;
        } else {
            load.failed += 1;
        }
        load.update(alpha);
        Some(load.estimate)
    }

    /// Free slots for `id`; zero for offline or unknown workers.
    pub fn available_capacity(&self, id: &str) -> usize {
        let guard = self.lock();
        if guard.offline.contains(id) {
            return 0;
        }
        guard
            .workers
            .get(id)
            .map_or(0, |load| load.max.saturating_sub(load.active))
    }

    pub fn utilization_snapshot(&self) -> UtilizationSnapshot {
        let guard = self.lock();
        let mut workers = BTreeMap::new();
        let mut active = 0;
        let mut capacity = 0;
        for (id, load) in &guard.workers {
            active += load.active;
            capacity += load.max;
            workers.insert(
                id.clone(),
                WorkerUtilization {
                    active: load.active,
                    max: load.max,
                    load: load.estimate,
                    completed: load.completed,
                    failed: load.failed,
                },
            );
        }
        let overall = if capacity == 0 {
            0.0
        } else {
            active as f64 / capacity as f64
        };
        UtilizationSnapshot {
            workers,
            overall,
            overloaded: capacity > 0 && overall >= self.high_water_mark,
        }
    }

    pub fn above_high_water(&self) -> bool {
        self.utilization_snapshot().overloaded
    }

    /// Record a heartbeat; clears any prior offline mark.
    pub fn heartbeat(&self, id: &str, now: Timestamp) -> bool {
        let mut guard = self.lock();
        let Some(load) = guard.workers.get_mut(id) else {
            return false;
        };
        load.last_seen = now;
        guard.offline.remove(id);
        true
    }

    /// Mark workers silent for longer than `timeout` as offline and return
    /// the ones newly marked, sorted by id.
    pub fn detect_offline(&self, now: Timestamp, timeout: Duration) -> Vec<WorkerId> {
        let timeout = TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);
        let mut guard = self.lock();
        let overdue = Self::overdue_workers(&guard, now, timeout);
        let mut newly: Vec<WorkerId> = overdue
            .into_iter()
            .filter(|id| guard.offline.insert(id.clone()))
            .collect();
        newly.sort();
        newly
    }

    pub fn offline_workers(&self) -> BTreeSet<WorkerId> {
        self.lock().offline.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    fn monitor() -> WorkloadMonitor {
        WorkloadMonitor::new(&MonitorConfig::default())
    }

    #[test]
    fn load_estimate_is_smoothed() {
        let m = monitor();
        m.register_worker("w1", 2, 0.0, t0());
        assert_eq!(m.record_assignment("w1"), Some(0.25));
        assert_eq!(m.record_assignment("w1"), Some(0.625));
        assert_eq!(m.record_release("w1", true), Some(0.5625));
        assert_eq!(m.available_capacity("w1"), 1);
        assert!(m.record_assignment("ghost").is_none());
    }

    #[test]
    fn snapshot_reports_overall_utilization() {
        let m = monitor();
        m.register_worker("w1", 1, 0.0, t0());
        m.register_worker("w2", 1, 0.0, t0());
        m.record_assignment("w1");
        let snap = m.utilization_snapshot();
        assert_eq!(snap.overall, 0.5);
        assert!(!snap.overloaded);
        m.record_assignment("w2");
        assert!(m.above_high_water());
        assert_eq!(m.utilization_snapshot().workers["w2"].active, 1);
    }

    #[test]
    fn detects_offline_after_timeout() {
        let m = monitor();
        m.register_worker("w1", 1, 0.0, t0());
        m.register_worker("w2", 1, 0.0, t0());
        m.heartbeat("w2", t0() + TimeDelta::seconds(20));
        let now = t0() + TimeDelta::seconds(31);
        let offline = m.detect_offline(now, Duration::from_secs(30));
        assert_eq!(offline, vec!["w1".to_string()]);
        assert_eq!(m.available_capacity("w1"), 0);
        // Already-offline workers are not reported twice.
        assert!(m.detect_offline(now, Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn heartbeat_clears_offline() {
        let m = monitor();
        m.register_worker("w1", 1, 0.0, t0());
        m.detect_offline(t0() + TimeDelta::seconds(5), Duration::from_secs(1));
        assert!(m.offline_workers().contains("w1"));
        assert!(m.heartbeat("w1", t0() + TimeDelta::seconds(6)));
        assert!(!m.offline_workers().contains("w1"));
        assert!(!m.heartbeat("ghost", t0()));
    }

    #[test]
    fn removed_worker_is_forgotten() {
        let m = monitor();
        m.register_worker("w1", 3, 0.2, t0());
        assert_eq!(m.utilization_snapshot().workers["w1"].load, 0.2);
        assert_eq!(m.available_capacity("w1"), 3);
        m.remove_worker("w1");
        assert_eq!(m.available_capacity("w1"), 0);
        assert!(m.utilization_snapshot().workers.is_empty());
    }
}
