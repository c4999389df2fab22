//! Worker swarm: bounded spawning, outcome collection, progress cadence.
//!
//! Runs on a blocking thread. Worker threads are spawned toward the
//! congestion controller's recommendation, at most two per 2 s tick; when
//! the recommendation drops, surplus workers simply are not replaced as
//! they drain. Part completions arrive on one channel and only update the
//! bitfield here, so worker completion order never matters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::congestion::CongestionController;
use crate::resume::PartBitfield;
use crate::shaper::BandwidthShaper;
use crate::storage::FileWriter;
use crate::task::TaskId;
use crate::worker::{self, PartError, PartOutcome, PartQueue, WorkerContext};

/// AIMD poll cadence.
const TICK_INTERVAL: Duration = Duration::from_secs(2);
/// Worker spawn bound per tick.
const MAX_SPAWN_PER_TICK: usize = 2;
/// Gauge/progress cadence.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);
/// Sliding window for the speed gauge.
const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Inputs for one swarm run.
pub(crate) struct SwarmParams {
    pub task: TaskId,
    pub url: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
    pub cookie: Option<String>,
    pub user_agent: String,
    pub ranged: bool,
    pub single_part: bool,
    pub total_size: Option<u64>,
    pub storage: FileWriter,
    pub shaper: Arc<BandwidthShaper>,
    pub controller: Arc<CongestionController>,
    pub cancel: Arc<std::sync::atomic::AtomicBool>,
    pub parts: Vec<crate::part::Part>,
    pub bitfield: PartBitfield,
    pub already_downloaded: u64,
    pub progress_tx: tokio::sync::mpsc::Sender<ProgressUpdate>,
}

/// Periodic gauge snapshot sent to the async side.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProgressUpdate {
    pub downloaded: u64,
    pub total: u64,
    pub speed_bps: u64,
    /// Bytes completed since the previous update (daily accounting).
    pub bytes_delta: u64,
}

/// Result of the swarm phase.
pub(crate) struct SwarmOutcome {
    pub bitfield: PartBitfield,
    pub downloaded: u64,
    /// Fatal part failure (retries exhausted or non-retryable).
    pub failure: Option<PartError>,
    pub worker_panicked: bool,
}

struct Monitor {
    bitfield: PartBitfield,
    downloaded: u64,
    done: usize,
    failure: Option<PartError>,
    delta: u64,
    speed: SpeedWindow,
}

impl Monitor {
    fn apply(&mut self, outcome: PartOutcome, cancel: &std::sync::atomic::AtomicBool) {
        match outcome {
            PartOutcome::Done { index, bytes } => {
                self.bitfield.set_complete(index);
                self.downloaded += bytes;
                self.delta += bytes;
                self.done += 1;
                self.speed.push(bytes);
            }
            PartOutcome::Failed { part, error } => {
                tracing::warn!(
                    part = part.index,
                    attempts = part.attempts,
                    %error,
                    "part failed fatally"
                );
                if self.failure.is_none() {
                    self.failure = Some(error);
                }
                // Sibling workers drain within one buffer read.
                cancel.store(true, Ordering::Release);
            }
        }
    }
}

/// Decrements the live-worker counter even if the worker panics.
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Release);
    }
}

pub(crate) fn run_swarm(p: SwarmParams) -> SwarmOutcome {
    let target = p.parts.len();
    let total_gauge = p.total_size.unwrap_or(0);
    let queue = Arc::new(PartQueue::new(p.parts));
    let (outcome_tx, outcome_rx) = mpsc::channel::<PartOutcome>();
    let live = Arc::new(AtomicUsize::new(0));

    let ctx = Arc::new(WorkerContext {
        task: p.task,
        url: p.url,
        host: p.host.clone(),
        headers: p.headers,
        cookie: p.cookie,
        user_agent: p.user_agent,
        ranged: p.ranged,
        total_size: p.total_size,
        single_part: p.single_part,
        storage: p.storage,
        shaper: p.shaper,
        controller: Arc::clone(&p.controller),
        cancel: Arc::clone(&p.cancel),
        queue: Arc::clone(&queue),
        outcomes: outcome_tx,
    });

    let mut monitor = Monitor {
        bitfield: p.bitfield,
        downloaded: p.already_downloaded,
        done: 0,
        failure: None,
        delta: 0,
        speed: SpeedWindow::new(),
    };
    let mut handles = Vec::new();
    let mut worker_panicked = false;
    let mut last_progress = Instant::now();
    // First tick fires immediately so the swarm starts without a 2 s stall.
    let mut last_tick = Instant::now() - TICK_INTERVAL;

    loop {
        if monitor.done >= target
            || monitor.failure.is_some()
            || p.cancel.load(Ordering::Acquire)
        {
            break;
        }

        if last_tick.elapsed() >= TICK_INTERVAL {
            last_tick = Instant::now();
            let ideal = p.controller.ideal(&p.host);
            let alive = live.load(Ordering::Acquire);
            let want = ideal
                .saturating_sub(alive)
                .min(MAX_SPAWN_PER_TICK)
                .min(queue.remaining());
            for _ in 0..want {
                let ctx = Arc::clone(&ctx);
                let guard_counter = Arc::clone(&live);
                live.fetch_add(1, Ordering::Release);
                let handle = std::thread::Builder::new()
                    .name(format!("fetchkit-w{}", p.task))
                    .spawn(move || {
                        let _guard = LiveGuard(guard_counter);
                        worker::run_worker(ctx);
                    });
                match handle {
                    Ok(h) => handles.push(h),
                    Err(e) => {
                        live.fetch_sub(1, Ordering::Release);
                        tracing::warn!(error = %e, "failed to spawn worker thread");
                    }
                }
            }
        }

        match outcome_rx.recv_timeout(PROGRESS_INTERVAL) {
            Ok(first) => {
                monitor.apply(first, &p.cancel);
                while let Ok(more) = outcome_rx.try_recv() {
                    monitor.apply(more, &p.cancel);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                // All workers exited with nothing in flight: nothing more
                // will arrive. Either the work is done, or a worker died
                // without reporting (join() below surfaces the panic and the
                // executor flags any missing parts).
                if live.load(Ordering::Acquire) == 0 && monitor.done < target {
                    while let Ok(more) = outcome_rx.try_recv() {
                        monitor.apply(more, &p.cancel);
                    }
                    if monitor.done < target && monitor.failure.is_none() && queue.remaining() > 0 {
                        // Spawn-capable ticks will not help if spawning keeps
                        // failing; bail out rather than spin.
                        tracing::warn!(task = p.task, "workers gone with work remaining");
                    }
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            last_progress = Instant::now();
            let _ = p.progress_tx.try_send(ProgressUpdate {
                downloaded: monitor.downloaded,
                total: total_gauge,
                speed_bps: monitor.speed.bytes_per_sec(),
                bytes_delta: std::mem::take(&mut monitor.delta),
            });
        }
    }

    if monitor.failure.is_some() {
        p.cancel.store(true, Ordering::Release);
    }
    drop(ctx);
    for h in handles {
        if h.join().is_err() {
            worker_panicked = true;
        }
    }
    // Late completions that raced the exit still count.
    while let Ok(more) = outcome_rx.try_recv() {
        monitor.apply(more, &p.cancel);
    }

    let _ = p.progress_tx.try_send(ProgressUpdate {
        downloaded: monitor.downloaded,
        total: total_gauge,
        speed_bps: monitor.speed.bytes_per_sec(),
        bytes_delta: std::mem::take(&mut monitor.delta),
    });

    SwarmOutcome {
        bitfield: monitor.bitfield,
        downloaded: monitor.downloaded,
        failure: monitor.failure,
        worker_panicked,
    }
}

/// Sliding-window throughput gauge.
struct SpeedWindow {
    samples: std::collections::VecDeque<(Instant, u64)>,
}

impl SpeedWindow {
    fn new() -> Self {
        Self {
            samples: std::collections::VecDeque::new(),
        }
    }

    fn push(&mut self, bytes: u64) {
        self.samples.push_back((Instant::now(), bytes));
        self.prune();
    }

    fn prune(&mut self) {
        let cutoff = Instant::now() - SPEED_WINDOW;
        while matches!(self.samples.front(), Some(&(t, _)) if t < cutoff) {
            self.samples.pop_front();
        }
    }

    fn bytes_per_sec(&mut self) -> u64 {
        self.prune();
        let Some(&(first, _)) = self.samples.front() else {
            return 0;
        };
        let span = first.elapsed().as_secs_f64().clamp(0.25, SPEED_WINDOW.as_secs_f64());
        let sum: u64 = self.samples.iter().map(|&(_, b)| b).sum();
        (sum as f64 / span) as u64
    }
}
