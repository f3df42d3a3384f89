use crate::types::Task;
use chrono::{DateTime, Duration, Utc};
use keystone_core::Priority;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// Scheduling record for a queued task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task_id: Uuid,
    pub task_type: String,
    pub affinity: Option<String>,
    /// Priority the task was submitted with.
    pub base_priority: Priority,
    /// Priority after aging and deadline boosts.
    pub priority: Priority,
    pub deadline: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub boosted: bool,
    pub deadline_missed: bool,
    seq: u64,
}

impl QueueEntry {
    fn sort_key(&self) -> (std::cmp::Reverse<Priority>, u64) {
        (std::cmp::Reverse(self.priority), self.seq)
    }
}

/// Strict-priority queue with age-based anti-starvation.
///
/// Each full aging period spent waiting raises a task one priority level;
/// a deadline that lapses while queued raises it once more. Within a level
/// tasks leave in submission order.
pub struct TaskQueue {
    entries: Vec<QueueEntry>,
    aging: Duration,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new(aging: Duration) -> Self {
        Self {
            entries: Vec::new(),
            aging,
            next_seq: 0,
        }
    }

    /// Add a task. Returns `false` if it is already queued.
    pub fn enqueue(&mut self, task: &Task, now: DateTime<Utc>) -> bool {
        if self.contains(task.id) {
            return false;
        }
        let entry = QueueEntry {
            task_id: task.id,
            task_type: task.task_type.clone(),
            affinity: task.affinity.clone(),
            base_priority: task.priority,
            priority: task.priority,
            deadline: task.deadline,
            enqueued_at: now,
            boosted: false,
            deadline_missed: false,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.push(entry);
        self.sort();
        true
    }

    /// Recompute effective priorities at `now`. Returns the tasks whose
    /// priority or boost flag changed.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut changed = Vec::new();
        for entry in &mut self.entries {
            let mut levels = if self.aging > Duration::zero() {
                let waited = now - entry.enqueued_at;
                waited.num_milliseconds().max(0) / self.aging.num_milliseconds().max(1)
            } else {
                0
            };
            let missed = entry.deadline.is_some_and(|d| now > d);
            if missed {
                levels += 1;
            }
            let mut priority = entry.base_priority;
            for _ in 0..levels.min(Priority::ALL.len() as i64) {
                priority = priority.boosted();
            }
            let boosted = levels > 0;
            if priority != entry.priority || boosted != entry.boosted || missed != entry.deadline_missed {
                debug!(
                    task_id = %entry.task_id,
                    from = %entry.priority,
                    to = %priority,
                    deadline_missed = missed,
                    "Queue priority boost"
                );
                entry.priority = priority;
                entry.boosted = boosted;
                entry.deadline_missed = missed;
                changed.push(entry.task_id);
            }
        }
        if !changed.is_empty() {
            self.sort();
        }
        changed
    }

    /// Entries in dispatch order.
    pub fn ordered(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn remove(&mut self, task_id: Uuid) -> Option<QueueEntry> {
        let pos = self.entries.iter().position(|e| e.task_id == task_id)?;
        Some(self.entries.remove(pos))
    }

    pub fn entry(&self, task_id: Uuid) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.task_id == task_id)
    }

    pub fn contains(&self, task_id: Uuid) -> bool {
        self.entry(task_id).is_some()
    }

    /// Queue depth per effective priority; every level is present.
    pub fn depth_by_priority(&self) -> BTreeMap<Priority, usize> {
        let mut depth: BTreeMap<Priority, usize> = Priority::ALL.iter().map(|p| (*p, 0)).collect();
        for entry in &self.entries {
            *depth.entry(entry.priority).or_default() += 1;
        }
        depth
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sort(&mut self) {
        self.entries.sort_by_key(QueueEntry::sort_key);
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(Duration::minutes(10))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(priority: Priority) -> Task {
        Task::new("t", json!(null)).with_priority(priority)
    }

    #[test]
    fn test_empty_queue() {
        let queue = TaskQueue::default();
        assert!(queue.is_empty());
        assert_eq!(queue.depth_by_priority().values().sum::<usize>(), 0);
        assert_eq!(queue.depth_by_priority().len(), 5);
    }

    #[test]
    fn test_strict_priority_then_fifo() {
        let now = Utc::now();
        let mut queue = TaskQueue::default();
        let low = task(Priority::Low);
        let normal_a = task(Priority::Normal);
        let critical = task(Priority::Critical);
        let normal_b = task(Priority::Normal);
        for t in [&low, &normal_a, &critical, &normal_b] {
            assert!(queue.enqueue(t, now));
        }
        let order: Vec<Uuid> = queue.ordered().iter().map(|e| e.task_id).collect();
        assert_eq!(order, vec![critical.id, normal_a.id, normal_b.id, low.id]);
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let now = Utc::now();
        let mut queue = TaskQueue::default();
        let t = task(Priority::Normal);
        assert!(queue.enqueue(&t, now));
        assert!(!queue.enqueue(&t, now));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_aging_boost() {
        let t0 = Utc::now();
        let mut queue = TaskQueue::default();
        let old = task(Priority::Low);
        queue.enqueue(&old, t0);
        let fresh = task(Priority::High);
        queue.enqueue(&fresh, t0 + Duration::minutes(19));

        assert!(queue.refresh(t0 + Duration::minutes(9)).is_empty());
        assert_eq!(queue.refresh(t0 + Duration::minutes(21)), vec![old.id]);
        let entry = queue.entry(old.id).unwrap();
        assert_eq!(entry.priority, Priority::High);
        assert!(entry.boosted);
        // Equal priority: the older submission goes first.
        assert_eq!(queue.ordered()[0].task_id, old.id);
    }

    #[test]
    fn test_missed_deadline_flags_boost_even_at_critical() {
        let t0 = Utc::now();
        let mut queue = TaskQueue::default();
        let t = task(Priority::Critical).with_deadline(t0 + Duration::seconds(1));
        queue.enqueue(&t, t0);

        queue.refresh(t0 + Duration::seconds(2));
        let entry = queue.entry(t.id).unwrap();
        assert_eq!(entry.priority, Priority::Critical);
        assert!(entry.boosted);
        assert!(entry.deadline_missed);
    }

    #[test]
    fn test_remove_and_depth() {
        let now = Utc::now();
        let mut queue = TaskQueue::default();
        let a = task(Priority::High);
        let b = task(Priority::High);
        queue.enqueue(&a, now);
        queue.enqueue(&b, now);
        assert_eq!(queue.depth_by_priority()[&Priority::High], 2);
        assert_eq!(queue.remove(a.id).unwrap().task_id, a.id);
        assert!(queue.remove(a.id).is_none());
        assert_eq!(queue.depth_by_priority()[&Priority::High], 1);
    }
}
