use crate::types::{Worker, WorkerStatus};
use keystone_core::{KeystoneError, KeystoneResult};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Default load skew above which affinity is ignored.
pub const DEFAULT_SKEW_THRESHOLD: f64 = 0.2;

/// A worker and its current assignments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerLoad {
    pub worker: Worker,
    pub status: WorkerStatus,
    pub active: u32,
}

impl WorkerLoad {
    /// Fraction of capacity in use.
    pub fn load(&self) -> f64 {
        if self.worker.capacity == 0 {
            return 1.0;
        }
        f64::from(self.active) / f64::from(self.worker.capacity)
    }

    fn online(&self) -> bool {
        !matches!(self.status, WorkerStatus::Offline | WorkerStatus::Error)
    }

    fn has_room(&self) -> bool {
        self.online() && self.active < self.worker.capacity
    }
}

/// Least-loaded selection with data-locality affinity.
///
/// While the spread between the busiest and idlest online worker exceeds the
/// skew threshold, affinity is suspended and selection is purely
/// least-loaded, which pulls work back toward the idle side.
pub struct LoadBalancer {
    workers: BTreeMap<String, WorkerLoad>,
    skew_threshold: f64,
    rebalancing: bool,
}

impl LoadBalancer {
    pub fn new(skew_threshold: f64) -> Self {
        Self {
            workers: BTreeMap::new(),
            skew_threshold,
            rebalancing: false,
        }
    }

    /// Add or replace a worker. Existing assignments are kept on replace.
    pub fn register(&mut self, worker: Worker) {
        let active = self.workers.get(&worker.id).map_or(0, |w| w.active);
        let status = if active > 0 {
            WorkerStatus::Working
        } else {
            WorkerStatus::Idle
        };
        info!(worker = %worker.id, capacity = worker.capacity, "Worker registered");
        self.workers.insert(
            worker.id.clone(),
            WorkerLoad {
                worker,
                status,
                active,
            },
        );
    }

    pub fn remove(&mut self, id: &str) -> Option<Worker> {
        self.workers.remove(id).map(|w| w.worker)
    }

    pub fn set_status(&mut self, id: &str, status: WorkerStatus) -> bool {
        match self.workers.get_mut(id) {
            Some(w) => {
                w.status = status;
                true
            }
            None => false,
        }
    }

    /// Whether some online worker could ever take `task_type`.
    pub fn can_serve(&self, task_type: &str) -> bool {
        self.workers
            .values()
            .any(|w| w.online() && w.worker.accepts(task_type))
    }

    /// Pick a worker for a task without assigning it.
    pub fn select(&mut self, task_type: &str, affinity: Option<&str>) -> Option<String> {
        let skew = self.skew();
        let rebalancing = skew > self.skew_threshold;
        if rebalancing != self.rebalancing {
            if rebalancing {
                info!(skew, threshold = self.skew_threshold, "Load skew high, suspending affinity");
            } else {
                info!(skew, "Load evened out, affinity restored");
            }
            self.rebalancing = rebalancing;
        }

        let candidates: Vec<&WorkerLoad> = self
            .workers
            .values()
            .filter(|w| w.has_room() && w.worker.accepts(task_type))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let least_loaded = |pool: &[&WorkerLoad]| -> Option<String> {
            pool.iter()
                .min_by(|a, b| a.load().total_cmp(&b.load()))
                .map(|w| w.worker.id.clone())
        };

        if let (Some(key), false) = (affinity, rebalancing) {
            let near: Vec<&WorkerLoad> = candidates
                .iter()
                .copied()
                .filter(|w| w.worker.affinity.iter().any(|k| k == key))
                .collect();
            if let Some(id) = least_loaded(&near) {
                debug!(worker = %id, affinity = key, "Selected by affinity");
                return Some(id);
            }
        }
        least_loaded(&candidates)
    }

    pub fn assign(&mut self, id: &str) -> KeystoneResult<()> {
        let w = self
            .workers
            .get_mut(id)
            .ok_or_else(|| KeystoneError::NotFound(format!("worker '{id}'")))?;
        if !w.has_room() {
            return Err(KeystoneError::Transient(format!("worker '{id}' is at capacity")));
        }
        w.active += 1;
        w.status = WorkerStatus::Working;
        Ok(())
    }

    pub fn release(&mut self, id: &str) {
        if let Some(w) = self.workers.get_mut(id) {
            w.active = w.active.saturating_sub(1);
            if w.active == 0 && w.status == WorkerStatus::Working {
                w.status = WorkerStatus::Idle;
            }
        }
    }

    /// Spread between the highest and lowest load among online workers.
    pub fn skew(&self) -> f64 {
        let loads: Vec<f64> = self
            .workers
            .values()
            .filter(|w| w.online())
            .map(WorkerLoad::load)
            .collect();
        if loads.len() < 2 {
            return 0.0;
        }
        let max = loads.iter().copied().fold(f64::MIN, f64::max);
        let min = loads.iter().copied().fold(f64::MAX, f64::min);
        max - min
    }

    pub fn is_rebalancing(&self) -> bool {
        self.rebalancing
    }

    pub fn loads(&self) -> Vec<WorkerLoad> {
        self.workers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(DEFAULT_SKEW_THRESHOLD)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_least_loaded() {
        let mut lb = LoadBalancer::default();
        lb.register(Worker::new("a").with_capacity(2));
        lb.register(Worker::new("b").with_capacity(2));
        lb.assign("a").unwrap();
        assert_eq!(lb.select("any", None).as_deref(), Some("b"));
    }

    #[test]
    fn test_task_type_filter_and_capacity() {
        let mut lb = LoadBalancer::default();
        lb.register(Worker::new("billing").accepting(["invoice"]));
        assert!(lb.select("report", None).is_none());
        assert!(!lb.can_serve("report"));
        assert_eq!(lb.select("invoice", None).as_deref(), Some("billing"));
        lb.assign("billing").unwrap();
        assert!(lb.select("invoice", None).is_none());
        assert!(lb.assign("billing").is_err());
        lb.release("billing");
        assert_eq!(lb.loads()[0].status, WorkerStatus::Idle);
    }

    #[test]
    fn test_affinity_preferred_when_balanced() {
        let mut lb = LoadBalancer::default();
        lb.register(Worker::new("a").with_capacity(10));
        lb.register(Worker::new("b").with_capacity(10).near(["eu"]));
        lb.assign("b").unwrap();
        // skew 0.1 is within threshold, so locality wins over load
        assert_eq!(lb.select("t", Some("eu")).as_deref(), Some("b"));
        assert!(!lb.is_rebalancing());
    }

    #[test]
    fn test_affinity_suspended_when_skewed() {
        let mut lb = LoadBalancer::default();
        lb.register(Worker::new("a").with_capacity(10));
        lb.register(Worker::new("b").with_capacity(10).near(["eu"]));
        for _ in 0..3 {
            lb.assign("b").unwrap();
        }
        assert!((lb.skew() - 0.3).abs() < 1e-9);
        assert_eq!(lb.select("t", Some("eu")).as_deref(), Some("a"));
        assert!(lb.is_rebalancing());
    }

    #[test]
    fn test_offline_workers_ignored() {
        let mut lb = LoadBalancer::default();
        lb.register(Worker::new("a"));
        lb.register(Worker::new("b"));
        assert!(lb.set_status("a", WorkerStatus::Offline));
        assert_eq!(lb.select("t", None).as_deref(), Some("b"));
        assert!(!lb.set_status("ghost", WorkerStatus::Idle));
        assert_eq!(lb.skew(), 0.0);
    }
}
