//! Per-task orchestration.
//!
//! One executor owns a task from dispatch to rest: probe the URL, resolve
//! the destination, reconcile persisted resume state against the remote
//! validators, allocate the file, then run the worker swarm and finalize
//! (verify, complete, or park the task in a resumable state). The executor
//! owns its workers, channels and bitfield outright; the engine only keeps
//! the cancellation handle.

mod swarm;

pub(crate) use swarm::{ProgressUpdate, SwarmOutcome, SwarmParams};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use crate::allocator::{self, AllocError};
use crate::congestion::{host_of, CongestionController};
use crate::error::ErrorKind;
use crate::events::Event;
use crate::naming;
use crate::part::{self, CHUNK_SIZE};
use crate::probe::{self, ProbeResult};
use crate::resume::{PartBitfield, ResumeState};
use crate::shaper::BandwidthShaper;
use crate::store::Store;
use crate::task::{Task, TaskId, TaskStatus};
use crate::verify;

/// What a cancellation is asking for; decides the task's resting status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopIntent {
    Pause,
    Stop,
    Delete,
    Shutdown,
}

/// Live gauges mirrored out of the monitor loop for `get_task` readers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gauges {
    pub downloaded: u64,
    pub total: u64,
    pub speed_bps: u64,
}

/// Cancellation handle for one active task. This is all the engine holds.
#[derive(Debug)]
pub struct TaskHandle {
    cancel: Arc<AtomicBool>,
    intent: Mutex<Option<StopIntent>>,
    gauges: Mutex<Gauges>,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            intent: Mutex::new(None),
            gauges: Mutex::new(Gauges::default()),
        }
    }

    /// Token observed by every blocking wait and HTTP read of the task.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Request cancellation. The first intent wins; later requests only
    /// matter if they escalate to delete.
    pub fn request_stop(&self, intent: StopIntent) {
        let mut slot = self.intent.lock().unwrap();
        if slot.is_none() || intent == StopIntent::Delete {
            *slot = Some(intent);
        }
        drop(slot);
        self.cancel.store(true, Ordering::Release);
    }

    pub fn intent(&self) -> Option<StopIntent> {
        *self.intent.lock().unwrap()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn set_gauges(&self, g: Gauges) {
        *self.gauges.lock().unwrap() = g;
    }

    pub fn gauges(&self) -> Gauges {
        *self.gauges.lock().unwrap()
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Collaborator handles passed down from the engine.
pub(crate) struct ExecutorCtx {
    pub id: TaskId,
    pub store: Store,
    pub shaper: Arc<BandwidthShaper>,
    pub controller: Arc<CongestionController>,
    pub events: broadcast::Sender<Event>,
    pub handle: Arc<TaskHandle>,
    pub user_agent: String,
    pub free_space_margin: u64,
    pub completion_hook: Option<String>,
}

impl ExecutorCtx {
    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

/// Drive one task to a resting state. The returned error is for internal
/// faults only; expected failures are persisted and evented in here.
pub(crate) async fn run_task(ctx: ExecutorCtx) -> Result<()> {
    let id = ctx.id;
    let Some(task) = ctx.store.get_task(id).await? else {
        return Ok(());
    };
    // A pause/stop/delete can land between admission and this point; the
    // record is then already at rest.
    if !task.status.is_queued() {
        return Ok(());
    }
    ctx.store.set_status(id, TaskStatus::Downloading).await?;
    tracing::info!(task = id, url = %task.url, "task started");

    // Probe on a blocking thread; it owns its own 30 s deadline.
    let probe_input = (
        task.url.clone(),
        task.headers.clone(),
        task.cookie.clone(),
        ctx.user_agent.clone(),
    );
    let probed = tokio::task::spawn_blocking(move || {
        probe::probe(
            &probe_input.0,
            &probe_input.1,
            probe_input.2.as_deref(),
            &probe_input.3,
        )
    })
    .await
    .context("probe task join")?;

    if ctx.handle.is_cancelled() {
        return settle_cancelled(&ctx).await;
    }
    let probed = match probed {
        Ok(p) => p,
        Err(e) => return settle_failed(&ctx, e.kind(), &e.to_string()).await,
    };

    let (save_path, filename) = resolve_destination(&ctx, &task, &probed).await?;
    let size_known = probed.size;
    let total = size_known.unwrap_or(0);
    let ranged = probed.accept_ranges && total > 0;
    let nparts = part::num_parts(total, ranged);
    ctx.store
        .set_file_info(id, &save_path.to_string_lossy(), &filename, total as i64)
        .await?;

    // Reconcile persisted resume state with the on-disk file and the remote
    // validators before trusting a single bit of it.
    let (bitfield, resuming) =
        hydrate_resume(&ctx, &task, &probed, &save_path, total, nparts).await?;
    let already = completed_bytes(&bitfield, nparts, total);

    let parts = part::plan_parts(total, ranged, &bitfield);
    let storage = {
        let path = save_path.clone();
        let margin = ctx.free_space_margin;
        let open_existing = resuming && path.exists();
        match tokio::task::spawn_blocking(move || {
            allocator::prepare(&path, total, margin, open_existing)
        })
        .await
        .context("allocator task join")?
        {
            Ok(w) => w,
            Err(e @ AllocError::DiskFull { .. }) => {
                return settle_failed(&ctx, ErrorKind::DiskFull, &e.to_string()).await;
            }
            Err(e) => return settle_failed(&ctx, ErrorKind::Io, &e.to_string()).await,
        }
    };

    let outcome = if parts.is_empty() {
        SwarmOutcome {
            bitfield,
            downloaded: already,
            failure: None,
            worker_panicked: false,
        }
    } else {
        let host = host_of(&task.url).unwrap_or_else(|_| "unknown".to_string());
        let (progress_tx, progress_rx) = tokio::sync::mpsc::channel::<ProgressUpdate>(8);
        let pump = tokio::spawn(pump_progress(ctx.store.clone(), ctx.events.clone(), Arc::clone(&ctx.handle), id, progress_rx));

        let params = SwarmParams {
            task: id,
            url: task.url.clone(),
            host,
            headers: task.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            cookie: task.cookie.clone(),
            user_agent: ctx.user_agent.clone(),
            ranged,
            single_part: nparts == 1,
            total_size: size_known,
            storage: storage.clone(),
            shaper: Arc::clone(&ctx.shaper),
            controller: Arc::clone(&ctx.controller),
            cancel: ctx.handle.cancel_token(),
            parts,
            bitfield,
            already_downloaded: already,
            progress_tx,
        };
        let outcome = tokio::task::spawn_blocking(move || swarm::run_swarm(params))
            .await
            .context("swarm join")?;
        pump.await.ok();
        outcome
    };

    // Settle written bytes on disk before any of them are claimed by the
    // checkpoint bitfield.
    let flushed = {
        let writer = storage.clone();
        tokio::task::spawn_blocking(move || writer.flush())
            .await
            .context("flush join")?
    };
    if let Err(e) = flushed {
        // Nothing new may enter the bitfield; the previous checkpoint is
        // still the durable truth.
        if ctx.handle.is_cancelled() {
            return settle_cancelled(&ctx).await;
        }
        return settle_failed(&ctx, ErrorKind::Io, &format!("flush to disk failed: {}", e)).await;
    }

    // Unknown-length fallback learns the real size on completion.
    let total = if !ranged && size_known.is_none() && outcome.failure.is_none() {
        ctx.store
            .set_file_info(id, &save_path.to_string_lossy(), &filename, outcome.downloaded as i64)
            .await?;
        outcome.downloaded
    } else {
        total
    };

    // Checkpoint: only durably written parts are in the bitfield.
    let state = ResumeState {
        etag: probed.etag.clone().unwrap_or_default(),
        last_modified: probed.last_modified.clone().unwrap_or_default(),
        total_size: total,
        num_parts: nparts as u32,
        bitfield: outcome.bitfield.clone(),
    };
    ctx.store
        .set_progress(id, outcome.downloaded as i64, Some(&state.encode()))
        .await?;

    if let Some(error) = outcome.failure {
        let kind = error.kind();
        let message = format!("download failed: {}", error);
        return settle_failed(&ctx, kind, &message).await;
    }
    if ctx.handle.is_cancelled() {
        return settle_cancelled(&ctx).await;
    }
    if outcome.worker_panicked {
        return settle_failed(&ctx, ErrorKind::Fatal, "internal worker error").await;
    }
    if !outcome.bitfield.all_complete(nparts) {
        return settle_failed(&ctx, ErrorKind::Fatal, "download ended with missing parts").await;
    }

    finalize(&ctx, &task, &save_path, total, &state).await
}

/// Verify and complete, or park the corrupted artifact.
async fn finalize(
    ctx: &ExecutorCtx,
    task: &Task,
    save_path: &Path,
    total: u64,
    state: &ResumeState,
) -> Result<()> {
    let id = ctx.id;
    ctx.store.set_status(id, TaskStatus::Verifying).await?;
    ctx.emit(Event::Verifying { id });

    if let (Some(expected), Some(algorithm)) = (&task.expected_hash, task.hash_algorithm) {
        let path = save_path.to_path_buf();
        let expected_owned = expected.clone();
        let matches = tokio::task::spawn_blocking(move || {
            verify::verify_file(&path, algorithm, &expected_owned)
        })
        .await
        .context("verify join")?;
        match matches {
            Ok(true) => {}
            Ok(false) => {
                let corrupted = corrupted_path(save_path);
                if let Err(e) = std::fs::rename(save_path, &corrupted) {
                    tracing::warn!(task = id, error = %e, "failed to rename corrupted file");
                }
                let message = format!(
                    "integrity mismatch: expected {} {}",
                    algorithm.as_str(),
                    expected
                );
                return settle_failed(ctx, ErrorKind::IntegrityMismatch, &message).await;
            }
            Err(e) => {
                return settle_failed(ctx, ErrorKind::Io, &format!("verify failed: {}", e)).await;
            }
        }
    }

    ctx.store
        .set_progress(id, total as i64, Some(&state.encode()))
        .await?;
    ctx.store.set_status(id, TaskStatus::Completed).await?;
    ctx.store.add_daily_file(&today()).await.ok();
    if let Some(hook) = &ctx.completion_hook {
        let hook = hook.clone();
        let path = save_path.to_path_buf();
        tokio::task::spawn_blocking(move || crate::hook::run_completion_hook(&hook, &path))
            .await
            .ok();
    }
    ctx.emit(Event::Completed { id });
    tracing::info!(task = id, path = %save_path.display(), "task completed");
    Ok(())
}

/// Rest the task according to the cancellation intent.
async fn settle_cancelled(ctx: &ExecutorCtx) -> Result<()> {
    let id = ctx.id;
    match ctx.handle.intent() {
        Some(StopIntent::Stop) => {
            ctx.store.set_status(id, TaskStatus::Stopped).await?;
            ctx.emit(Event::Stopped { id });
        }
        Some(StopIntent::Delete) => {
            // The engine removes the record and emits the deleted event.
            ctx.store.set_status(id, TaskStatus::Stopped).await?;
        }
        _ => {
            ctx.store.set_status(id, TaskStatus::Paused).await?;
            ctx.emit(Event::Paused { id });
        }
    }
    tracing::info!(task = id, intent = ?ctx.handle.intent(), "task cancelled");
    Ok(())
}

/// Park the task in `error` or `needs_auth` with a display message.
async fn settle_failed(ctx: &ExecutorCtx, kind: ErrorKind, message: &str) -> Result<()> {
    let id = ctx.id;
    if kind == ErrorKind::Cancelled {
        return settle_cancelled(ctx).await;
    }
    let status = if kind == ErrorKind::NeedsAuth {
        TaskStatus::NeedsAuth
    } else {
        TaskStatus::Error
    };
    let tagged = format!("{}: {}", kind.as_str(), message);
    ctx.store.set_status_with_error(id, status, &tagged).await?;
    if status == TaskStatus::NeedsAuth {
        ctx.emit(Event::NeedsAuth { id });
    } else {
        ctx.emit(Event::Error {
            id,
            message: tagged.clone(),
        });
    }
    tracing::warn!(task = id, kind = kind.as_str(), message, "task failed");
    Ok(())
}

/// Choose the final `<dest_dir>/<Category>/<filename>` path, suffixing on
/// collision, the first time a task runs; later runs reuse the stored path.
async fn resolve_destination(
    ctx: &ExecutorCtx,
    task: &Task,
    probed: &ProbeResult,
) -> Result<(PathBuf, String)> {
    if !task.save_path.is_empty() {
        return Ok((PathBuf::from(&task.save_path), task.filename.clone()));
    }
    let filename = if task.filename.is_empty() {
        probed.filename.clone()
    } else {
        task.filename.clone()
    };
    let mut dir = PathBuf::from(&task.dest_dir);
    if !task.category.is_empty() {
        dir = dir.join(&task.category);
    }
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("create download dir {}", dir.display()))?;
    let path = naming::unique_path(&dir, &filename);
    let final_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(filename);
    Ok((path, final_name))
}

/// Load and validate persisted resume state. Any doubt (missing file,
/// validator change, size change, codec error) discards it.
async fn hydrate_resume(
    ctx: &ExecutorCtx,
    task: &Task,
    probed: &ProbeResult,
    save_path: &Path,
    total: u64,
    nparts: usize,
) -> Result<(PartBitfield, bool)> {
    let Some(blob) = &task.meta else {
        return Ok((PartBitfield::new(nparts), false));
    };
    if !save_path.exists() {
        tracing::info!(task = ctx.id, "destination missing on disk, restarting from scratch");
        ctx.store.reset_resume(ctx.id).await?;
        return Ok((PartBitfield::new(nparts), false));
    }
    match ResumeState::decode(blob) {
        Ok(state)
            if state.validators_match(probed.etag.as_deref(), probed.last_modified.as_deref())
                && state.total_size == total
                && state.num_parts as usize == nparts =>
        {
            Ok((state.bitfield, true))
        }
        Ok(_) => {
            tracing::info!(task = ctx.id, "remote changed since last run, discarding resume state");
            ctx.store.reset_resume(ctx.id).await?;
            Ok((PartBitfield::new(nparts), false))
        }
        Err(e) => {
            tracing::warn!(task = ctx.id, error = %e, "resume blob rejected, restarting");
            ctx.store.reset_resume(ctx.id).await?;
            Ok((PartBitfield::new(nparts), false))
        }
    }
}

fn completed_bytes(bitfield: &PartBitfield, nparts: usize, total: u64) -> u64 {
    let mut sum = 0u64;
    for i in 0..nparts {
        if bitfield.is_complete(i) {
            let start = i as u64 * CHUNK_SIZE;
            let end = ((i as u64 + 1) * CHUNK_SIZE).min(total);
            sum += end.saturating_sub(start);
        }
    }
    sum
}

fn corrupted_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".corrupted");
    PathBuf::from(os)
}

fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// Forward swarm progress to gauges, events, and the daily byte counter.
async fn pump_progress(
    store: Store,
    events: broadcast::Sender<Event>,
    handle: Arc<TaskHandle>,
    id: TaskId,
    mut rx: tokio::sync::mpsc::Receiver<ProgressUpdate>,
) {
    while let Some(u) = rx.recv().await {
        handle.set_gauges(Gauges {
            downloaded: u.downloaded,
            total: u.total,
            speed_bps: u.speed_bps,
        });
        if u.bytes_delta > 0 {
            if store.add_daily_bytes(&today(), u.bytes_delta as i64).await.is_err() {
                tracing::debug!(task = id, "daily byte counter update failed");
            }
        }
        let progress = if u.total > 0 {
            (u.downloaded as f64 / u.total as f64).min(1.0)
        } else {
            0.0
        };
        let eta_secs = if u.speed_bps > 0 && u.total > u.downloaded {
            Some((u.total - u.downloaded) / u.speed_bps)
        } else {
            None
        };
        let _ = events.send(Event::Progress {
            id,
            progress,
            speed_bps: u.speed_bps,
            eta_secs,
            downloaded: u.downloaded,
            total: u.total,
        });
    }
}
