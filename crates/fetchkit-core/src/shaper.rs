//! Global bandwidth shaper: token bucket with a lock-free disabled path.
//!
//! Workers call `wait` before every buffer read (32 KiB or less). With no
//! limit configured the call is a single atomic load and an early return, so
//! unshaped transfers pay nothing. With a limit, a shared token bucket is
//! drained under a short mutex; waiting happens in small sleeps outside the
//! lock so the cancellation token is observed promptly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::task::{Priority, TaskId};

/// Returned when the cancellation token fires during a shaped wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitCancelled;

/// Slice of waiting done between cancellation checks.
const WAIT_SLICE: Duration = Duration::from_millis(20);
/// Extra sleep applied to low-priority tasks after each grant, yielding
/// bucket refills to normal/high tasks.
const LOW_PRIORITY_PENALTY: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Bucket {
    /// Bytes per second; invariant: > 0 while enabled.
    rate: u64,
    /// Current tokens, capped at one second's worth (burst).
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        self.last_refill = now;
    }
}

/// Global byte/sec limiter shared by every worker of every task.
#[derive(Debug)]
pub struct BandwidthShaper {
    enabled: AtomicBool,
    bucket: Mutex<Bucket>,
    priorities: Mutex<HashMap<TaskId, Priority>>,
}

impl Default for BandwidthShaper {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthShaper {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            bucket: Mutex::new(Bucket {
                rate: 0,
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
            priorities: Mutex::new(HashMap::new()),
        }
    }

    /// Set the global limit in bytes/sec. 0 disables shaping entirely.
    pub fn set_limit(&self, bytes_per_sec: u64) {
        if bytes_per_sec == 0 {
            self.enabled.store(false, Ordering::Release);
            return;
        }
        {
            let mut b = self.bucket.lock().unwrap();
            b.rate = bytes_per_sec;
            // Start with a full second of burst so the first reads fly.
            b.tokens = bytes_per_sec as f64;
            b.last_refill = Instant::now();
        }
        self.enabled.store(true, Ordering::Release);
    }

    /// Current limit (0 = disabled).
    pub fn limit(&self) -> u64 {
        if !self.enabled.load(Ordering::Acquire) {
            return 0;
        }
        self.bucket.lock().unwrap().rate
    }

    pub fn set_task_priority(&self, task: TaskId, priority: Priority) {
        self.priorities.lock().unwrap().insert(task, priority);
    }

    /// Drop a finished task's priority entry.
    pub fn forget_task(&self, task: TaskId) {
        self.priorities.lock().unwrap().remove(&task);
    }

    /// Block until `bytes` may be read, or until `cancel` fires.
    ///
    /// The disabled path is branch-only and allocation-free.
    pub fn wait(
        &self,
        task: TaskId,
        bytes: u64,
        cancel: &AtomicBool,
    ) -> Result<(), WaitCancelled> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(WaitCancelled);
            }
            let deficit = {
                let mut b = self.bucket.lock().unwrap();
                let now = Instant::now();
                b.refill(now);
                if b.tokens >= bytes as f64 {
                    b.tokens -= bytes as f64;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (bytes as f64 - b.tokens) / b.rate as f64,
                    ))
                }
            };
            match deficit {
                None => {
                    let low = {
                        let p = self.priorities.lock().unwrap();
                        p.get(&task) == Some(&Priority::Low)
                    };
                    if low {
                        std::thread::sleep(LOW_PRIORITY_PENALTY);
                    }
                    return Ok(());
                }
                Some(needed) => std::thread::sleep(needed.min(WAIT_SLICE)),
            }
        }
    }
}
