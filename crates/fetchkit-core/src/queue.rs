//! Waiting queue and admission scheduler.
//!
//! The queue is an ordered sequence of task ids; `queue_order` is simply a
//! task's 1-based position, re-compacted after every mutation. The scheduler
//! walks it in order and admits the first task that passes the global
//! concurrency cap, its host's cap, and its scheduled start time. The
//! dispatcher parks on a `Notify` until an enqueue, completion, or host-slot
//! event wakes it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::task::TaskId;

/// One queued task, with the fields admission control needs.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: TaskId,
    pub host: String,
    /// Admission is deferred until this instant when set.
    pub start_time: Option<DateTime<Utc>>,
}

/// Reorder directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveTo {
    First,
    Prev,
    Next,
    Last,
}

impl MoveTo {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "first" => Some(MoveTo::First),
            "prev" => Some(MoveTo::Prev),
            "next" => Some(MoveTo::Next),
            "last" => Some(MoveTo::Last),
            _ => None,
        }
    }
}

/// Result of one admission attempt.
#[derive(Debug)]
pub struct Admission {
    /// Task to start now, removed from the queue.
    pub task: Option<QueueEntry>,
    /// Delay until the earliest scheduled start among skipped tasks, so the
    /// dispatcher can set a wakeup timer.
    pub next_start_in: Option<Duration>,
}

#[derive(Debug, Default)]
struct SchedState {
    queue: Vec<QueueEntry>,
    active_per_host: HashMap<String, usize>,
    /// Max concurrent tasks per host; 0 or absent = unlimited.
    host_limits: HashMap<String, usize>,
}

impl SchedState {
    fn host_allows(&self, host: &str) -> bool {
        let limit = self.host_limits.get(host).copied().unwrap_or(0);
        if limit == 0 {
            return true;
        }
        self.active_per_host.get(host).copied().unwrap_or(0) < limit
    }
}

/// Queue plus host bookkeeping behind one short-lived mutex.
#[derive(Debug, Default)]
pub struct Scheduler {
    state: Mutex<SchedState>,
    notify: Notify,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the back of the queue and wake the dispatcher.
    pub fn enqueue(&self, entry: QueueEntry) {
        self.state.lock().unwrap().queue.push(entry);
        self.notify.notify_one();
    }

    /// Remove a task from the queue. True if it was present.
    pub fn remove(&self, id: TaskId) -> bool {
        let mut s = self.state.lock().unwrap();
        let before = s.queue.len();
        s.queue.retain(|e| e.id != id);
        before != s.queue.len()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.state.lock().unwrap().queue.iter().any(|e| e.id == id)
    }

    /// Queued ids in order.
    pub fn queued_ids(&self) -> Vec<TaskId> {
        self.state.lock().unwrap().queue.iter().map(|e| e.id).collect()
    }

    /// Move a task within the queue. Returns the full compacted
    /// `(id, queue_order)` assignment (1..N, in order) for persistence, or
    /// None if the task is not queued.
    pub fn move_task(&self, id: TaskId, to: MoveTo) -> Option<Vec<(TaskId, i64)>> {
        let mut s = self.state.lock().unwrap();
        let pos = s.queue.iter().position(|e| e.id == id)?;
        let entry = s.queue.remove(pos);
        let new_pos = match to {
            MoveTo::First => 0,
            MoveTo::Prev => pos.saturating_sub(1),
            MoveTo::Next => (pos + 1).min(s.queue.len()),
            MoveTo::Last => s.queue.len(),
        };
        s.queue.insert(new_pos, entry);
        Some(
            s.queue
                .iter()
                .enumerate()
                .map(|(i, e)| (e.id, i as i64 + 1))
                .collect(),
        )
    }

    /// Per-host concurrent-task cap. 0 removes the limit. Raising a limit
    /// may free a slot, so the dispatcher is woken.
    pub fn set_host_limit(&self, host: &str, limit: usize) {
        {
            let mut s = self.state.lock().unwrap();
            if limit == 0 {
                s.host_limits.remove(host);
            } else {
                s.host_limits.insert(host.to_string(), limit);
            }
        }
        self.notify.notify_one();
    }

    pub fn host_limit(&self, host: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .host_limits
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    /// Current number of running tasks on `host`.
    pub fn active_on_host(&self, host: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .active_per_host
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    /// Pick the next admissible task, removing it from the queue.
    pub fn get_next(&self, active_count: usize, max_concurrent: usize, now: DateTime<Utc>) -> Admission {
        let mut s = self.state.lock().unwrap();
        if active_count >= max_concurrent {
            return Admission {
                task: None,
                next_start_in: None,
            };
        }
        let mut next_start_in: Option<Duration> = None;
        let mut pick: Option<usize> = None;
        for (i, e) in s.queue.iter().enumerate() {
            if let Some(at) = e.start_time {
                if at > now {
                    let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
                    next_start_in = Some(match next_start_in {
                        Some(cur) => cur.min(wait),
                        None => wait,
                    });
                    continue;
                }
            }
            if !s.host_allows(&e.host) {
                continue;
            }
            pick = Some(i);
            break;
        }
        let task = pick.map(|i| s.queue.remove(i));
        Admission { task, next_start_in }
    }

    /// Account a dispatched task against its host.
    pub fn on_task_started(&self, host: &str) {
        let mut s = self.state.lock().unwrap();
        *s.active_per_host.entry(host.to_string()).or_insert(0) += 1;
    }

    /// Release the host slot and wake the dispatcher.
    pub fn on_task_completed(&self, host: &str) {
        {
            let mut s = self.state.lock().unwrap();
            if let Some(n) = s.active_per_host.get_mut(host) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    s.active_per_host.remove(host);
                }
            }
        }
        self.notify.notify_one();
    }

    /// Wake the dispatcher for any external state change.
    pub fn kick(&self) {
        self.notify.notify_one();
    }

    /// True if any queued task is admissible time-wise (host caps aside).
    pub fn has_ready(&self, now: DateTime<Utc>) -> bool {
        self.state
            .lock()
            .unwrap()
            .queue
            .iter()
            .any(|e| e.start_time.map_or(true, |at| at <= now))
    }

    /// Park until woken or until `timeout` elapses.
    pub async fn wait(&self, timeout: Option<Duration>) {
        match timeout {
            Some(t) => {
                let _ = tokio::time::timeout(t, self.notify.notified()).await;
            }
            None => self.notify.notified().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: TaskId, host: &str) -> QueueEntry {
        QueueEntry {
            id,
            host: host.to_string(),
            start_time: None,
        }
    }

    #[test]
    fn fifo_admission_under_caps() {
        let s = Scheduler::new();
        s.enqueue(entry(1, "a"));
        s.enqueue(entry(2, "b"));
        let now = Utc::now();
        assert_eq!(s.get_next(0, 2, now).task.unwrap().id, 1);
        assert_eq!(s.get_next(1, 2, now).task.unwrap().id, 2);
        assert!(s.get_next(2, 2, now).task.is_none());
    }

    #[test]
    fn global_cap_blocks_admission() {
        let s = Scheduler::new();
        s.enqueue(entry(1, "a"));
        assert!(s.get_next(3, 3, Utc::now()).task.is_none());
        assert!(s.contains(1));
    }

    #[test]
    fn host_cap_skips_to_other_hosts() {
        let s = Scheduler::new();
        s.set_host_limit("a", 1);
        s.enqueue(entry(1, "a"));
        s.enqueue(entry(2, "a"));
        s.enqueue(entry(3, "b"));
        let now = Utc::now();

        let first = s.get_next(0, 10, now).task.unwrap();
        assert_eq!(first.id, 1);
        s.on_task_started("a");

        // Host "a" is full: task 2 is skipped, task 3 admitted.
        let second = s.get_next(1, 10, now).task.unwrap();
        assert_eq!(second.id, 3);
        s.on_task_started("b");

        assert!(s.get_next(2, 10, now).task.is_none());
        s.on_task_completed("a");
        assert_eq!(s.get_next(1, 10, now).task.unwrap().id, 2);
    }

    #[test]
    fn zero_host_limit_means_unlimited() {
        let s = Scheduler::new();
        s.set_host_limit("a", 2);
        s.set_host_limit("a", 0);
        for id in 1..=5 {
            s.enqueue(entry(id, "a"));
            s.on_task_started("a");
        }
        s.enqueue(entry(6, "a"));
        assert!(s.get_next(5, 10, Utc::now()).task.is_some());
    }

    #[test]
    fn scheduled_tasks_wait_their_turn() {
        let s = Scheduler::new();
        let now = Utc::now();
        s.enqueue(QueueEntry {
            id: 1,
            host: "a".into(),
            start_time: Some(now + chrono::Duration::seconds(60)),
        });
        s.enqueue(entry(2, "a"));

        let adm = s.get_next(0, 10, now);
        assert_eq!(adm.task.unwrap().id, 2);
        let wait = adm.next_start_in.unwrap();
        assert!(wait > Duration::from_secs(58) && wait <= Duration::from_secs(60));

        let later = now + chrono::Duration::seconds(61);
        assert_eq!(s.get_next(0, 10, later).task.unwrap().id, 1);
    }

    #[test]
    fn reorder_compacts_to_one_through_n() {
        let s = Scheduler::new();
        for id in 1..=4 {
            s.enqueue(entry(id, "a"));
        }
        let orders = s.move_task(3, MoveTo::First).unwrap();
        assert_eq!(
            orders,
            vec![(3, 1), (1, 2), (2, 3), (4, 4)]
        );
        assert_eq!(s.queued_ids(), vec![3, 1, 2, 4]);

        let orders = s.move_task(3, MoveTo::Next).unwrap();
        assert_eq!(s.queued_ids(), vec![1, 3, 2, 4]);
        assert_eq!(orders.iter().map(|&(_, o)| o).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

        let orders = s.move_task(4, MoveTo::Prev).unwrap();
        assert_eq!(s.queued_ids(), vec![1, 3, 4, 2]);
        let mut ids: Vec<TaskId> = orders.iter().map(|&(id, _)| id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4]);

        s.move_task(1, MoveTo::Last).unwrap();
        assert_eq!(s.queued_ids(), vec![3, 4, 2, 1]);
    }

    #[test]
    fn move_edges_are_clamped() {
        let s = Scheduler::new();
        s.enqueue(entry(1, "a"));
        s.enqueue(entry(2, "a"));
        s.move_task(1, MoveTo::Prev).unwrap();
        assert_eq!(s.queued_ids(), vec![1, 2]);
        s.move_task(2, MoveTo::Next).unwrap();
        assert_eq!(s.queued_ids(), vec![1, 2]);
        assert!(s.move_task(99, MoveTo::First).is_none());
    }

    #[test]
    fn remove_and_contains() {
        let s = Scheduler::new();
        s.enqueue(entry(1, "a"));
        assert!(s.contains(1));
        assert!(s.remove(1));
        assert!(!s.remove(1));
        assert!(!s.contains(1));
    }
}
