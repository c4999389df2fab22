//! Engine facade: task lifecycle, recovery, limits, and event fan-out.
//!
//! The engine owns the store, the scheduler, the shaper and the congestion
//! controller; active tasks are represented only by their cancellation
//! handles. Everything else lives inside the per-task executor.

mod dispatcher;
mod options;

pub use options::StartOptions;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::congestion::{host_of, CongestionController};
use crate::events::Event;
use crate::executor::{StopIntent, TaskHandle};
use crate::probe::{self, ProbeResult};
use crate::queue::{MoveTo, QueueEntry, Scheduler};
use crate::shaper::BandwidthShaper;
use crate::store::Store;
use crate::task::{NewTask, Priority, Task, TaskId, TaskStatus};

const SETTING_GLOBAL_LIMIT: &str = "global_limit_bps";
const SETTING_MAX_CONCURRENT: &str = "max_concurrent";
const SETTING_HOST_LIMIT_PREFIX: &str = "host_limit:";

pub(crate) struct EngineInner {
    pub(crate) store: Store,
    pub(crate) config: EngineConfig,
    pub(crate) shaper: Arc<BandwidthShaper>,
    pub(crate) controller: Arc<CongestionController>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) active: Mutex<HashMap<TaskId, Arc<TaskHandle>>>,
    pub(crate) events: broadcast::Sender<Event>,
    pub(crate) max_concurrent: AtomicUsize,
    pub(crate) shutdown: AtomicBool,
}

/// Handle to a running engine. Clone freely.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open the engine over a store: run the crash-recovery pass, hydrate
    /// persisted settings and the queue, and start the dispatcher.
    pub async fn open(config: EngineConfig, store: Store) -> Result<Engine> {
        let recovered = store.recover_stale().await?;
        if recovered > 0 {
            tracing::info!(recovered, "recovery: stale tasks moved to paused");
        }

        let shaper = Arc::new(BandwidthShaper::new());
        let limit = match store.get_setting(SETTING_GLOBAL_LIMIT).await? {
            Some(v) => v.parse::<u64>().unwrap_or(config.global_limit_bps),
            None => config.global_limit_bps,
        };
        shaper.set_limit(limit);

        let scheduler = Arc::new(Scheduler::new());
        for (key, value) in store.settings_with_prefix(SETTING_HOST_LIMIT_PREFIX).await? {
            let host = &key[SETTING_HOST_LIMIT_PREFIX.len()..];
            scheduler.set_host_limit(host, value.parse().unwrap_or(0));
        }

        let max_concurrent = match store.get_setting(SETTING_MAX_CONCURRENT).await? {
            Some(v) => v.parse::<usize>().unwrap_or(config.effective_max_concurrent()),
            None => config.effective_max_concurrent(),
        }
        .clamp(1, 10);

        // Scheduled tasks survive restarts in the queue; stale pending ones
        // were just recovered to paused.
        for task in store.queued_tasks().await? {
            scheduler.enqueue(queue_entry(&task));
        }

        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(EngineInner {
            store,
            config,
            shaper,
            controller: Arc::new(CongestionController::new()),
            scheduler,
            active: Mutex::new(HashMap::new()),
            events,
            max_concurrent: AtomicUsize::new(max_concurrent),
            shutdown: AtomicBool::new(false),
        });
        tokio::spawn(dispatcher::run(Arc::clone(&inner)));
        Ok(Engine { inner })
    }

    /// Subscribe to engine events. Lagging subscribers lose old events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Enqueue a download. See `options` module docs for recognized keys.
    pub async fn start_download(
        &self,
        url: &str,
        dest_dir: &str,
        filename: Option<String>,
        options: Option<HashMap<String, String>>,
    ) -> Result<TaskId> {
        let host = host_of(url)?;
        let opts = options::parse_options(&options.unwrap_or_default())?;
        let now = Utc::now();
        let status = match opts.start_at {
            Some(at) if at > now => TaskStatus::Scheduled,
            _ => TaskStatus::Pending,
        };
        let dest_dir = if dest_dir.is_empty() {
            self.inner
                .config
                .download_dir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| ".".to_string())
        } else {
            dest_dir.to_string()
        };
        let new = NewTask {
            url: url.to_string(),
            headers: opts.headers,
            cookie: opts.cookie,
            dest_dir,
            filename,
            category: opts.category,
            priority: opts.priority,
            expected_hash: opts.expected_hash,
            hash_algorithm: opts.hash_algorithm,
            start_time: opts.start_time,
        };
        let order = self.inner.store.next_queue_order().await?;
        let id = self.inner.store.add_task(&new, status, order).await?;
        self.inner.scheduler.enqueue(QueueEntry {
            id,
            host,
            start_time: opts.start_at,
        });
        tracing::info!(task = id, url, status = status.as_str(), "task enqueued");
        Ok(id)
    }

    /// Probe a URL without creating a task.
    pub async fn probe(
        &self,
        url: &str,
        headers: Option<HashMap<String, String>>,
        cookie: Option<String>,
    ) -> Result<ProbeResult> {
        let url = url.to_string();
        let headers = headers.unwrap_or_default();
        let user_agent = self.inner.config.user_agent.clone();
        tokio::task::spawn_blocking(move || {
            probe::probe(&url, &headers, cookie.as_deref(), &user_agent)
        })
        .await
        .context("probe join")?
        .map_err(Into::into)
    }

    /// Pause a running or queued task.
    pub async fn pause(&self, id: TaskId) -> Result<()> {
        if let Some(handle) = self.active_handle(id) {
            handle.request_stop(StopIntent::Pause);
            return Ok(());
        }
        self.inner.scheduler.remove(id);
        let task = self.require_task(id).await?;
        match task.status {
            // Covers the window between admission and executor start too:
            // the executor re-checks the status before downloading.
            TaskStatus::Pending | TaskStatus::Scheduled | TaskStatus::Downloading => {
                self.inner.store.set_status(id, TaskStatus::Paused).await?;
                self.emit(Event::Paused { id });
                Ok(())
            }
            other => bail!("task {} is {}, nothing to pause", id, other.as_str()),
        }
    }

    /// Re-queue a task from `paused`, `stopped`, `error` or `needs_auth`.
    pub async fn resume(&self, id: TaskId) -> Result<()> {
        let task = self.require_task(id).await?;
        if !task.status.is_resumable() {
            bail!(
                "task {} cannot be resumed from {}",
                id,
                task.status.as_str()
            );
        }
        // A destination that vanished invalidates all progress.
        if !task.save_path.is_empty() && !std::path::Path::new(&task.save_path).exists() {
            self.inner.store.reset_resume(id).await?;
        }
        let start_at = task
            .start_time
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        let status = match start_at {
            Some(at) if at > Utc::now() => TaskStatus::Scheduled,
            _ => TaskStatus::Pending,
        };
        self.inner.store.set_status(id, status).await?;
        self.inner.scheduler.enqueue(QueueEntry {
            id,
            host: host_of(&task.url)?,
            start_time: start_at,
        });
        Ok(())
    }

    /// Stop a task. Unlike pause this is meant as "done with it for now";
    /// the state is still resumable.
    pub async fn stop(&self, id: TaskId) -> Result<()> {
        if let Some(handle) = self.active_handle(id) {
            handle.request_stop(StopIntent::Stop);
            return Ok(());
        }
        self.inner.scheduler.remove(id);
        let task = self.require_task(id).await?;
        match task.status {
            TaskStatus::Pending | TaskStatus::Scheduled | TaskStatus::Downloading => {
                self.inner.store.set_status(id, TaskStatus::Stopped).await?;
                self.emit(Event::Stopped { id });
                Ok(())
            }
            other => bail!("task {} is {}, nothing to stop", id, other.as_str()),
        }
    }

    /// Remove a task, optionally deleting the partial or finished file.
    pub async fn delete(&self, id: TaskId, delete_file: bool) -> Result<()> {
        let task = self.require_task(id).await?;
        if let Some(handle) = self.active_handle(id) {
            handle.request_stop(StopIntent::Delete);
        }
        self.inner.scheduler.remove(id);
        if delete_file && !task.save_path.is_empty() {
            if let Err(e) = tokio::fs::remove_file(&task.save_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(task = id, error = %e, "could not delete file");
                }
            }
        }
        self.inner.store.delete_task(id).await?;
        self.emit(Event::Deleted { id });
        Ok(())
    }

    /// Move a queued task and persist the compacted ordering.
    pub async fn reorder(&self, id: TaskId, to: MoveTo) -> Result<()> {
        let Some(orders) = self.inner.scheduler.move_task(id, to) else {
            bail!("task {} is not queued", id);
        };
        self.inner.store.set_queue_orders(&orders).await?;
        self.emit(Event::QueueReordered);
        Ok(())
    }

    pub async fn set_priority(&self, id: TaskId, priority: Priority) -> Result<()> {
        self.require_task(id).await?;
        self.inner.store.set_priority(id, priority).await?;
        self.inner.shaper.set_task_priority(id, priority);
        Ok(())
    }

    /// Global bandwidth cap in bytes/sec; 0 disables shaping.
    pub async fn set_global_limit(&self, bytes_per_sec: u64) -> Result<()> {
        self.inner.shaper.set_limit(bytes_per_sec);
        self.inner
            .store
            .set_setting(SETTING_GLOBAL_LIMIT, &bytes_per_sec.to_string())
            .await
    }

    /// Per-host concurrent-task cap; 0 removes the cap.
    pub async fn set_host_limit(&self, host: &str, limit: usize) -> Result<()> {
        self.inner.scheduler.set_host_limit(host, limit);
        self.inner
            .store
            .set_setting(
                &format!("{SETTING_HOST_LIMIT_PREFIX}{host}"),
                &limit.to_string(),
            )
            .await
    }

    /// Concurrent task ceiling, within [1, 10].
    pub async fn set_max_concurrent(&self, n: usize) -> Result<()> {
        if !(1..=10).contains(&n) {
            bail!("max_concurrent must be within [1, 10], got {n}");
        }
        self.inner.max_concurrent.store(n, Ordering::Relaxed);
        self.inner.scheduler.kick();
        self.inner
            .store
            .set_setting(SETTING_MAX_CONCURRENT, &n.to_string())
            .await
    }

    /// Swap in a fresh URL for a task parked in `needs_auth`, `paused` or
    /// `error`; the task rests in `paused` keeping its progress.
    pub async fn update_url(&self, id: TaskId, new_url: &str) -> Result<()> {
        host_of(new_url)?;
        let task = self.require_task(id).await?;
        match task.status {
            TaskStatus::NeedsAuth | TaskStatus::Paused | TaskStatus::Error => {}
            other => bail!(
                "task {} is {}; update_url is only legal from needs_auth/paused/error",
                id,
                other.as_str()
            ),
        }
        self.inner.store.set_url(id, new_url).await?;
        self.inner.store.set_status(id, TaskStatus::Paused).await?;
        self.emit(Event::UrlUpdated { id });
        Ok(())
    }

    /// Task by id, with live gauges overlaid for active tasks.
    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let Some(mut task) = self.inner.store.get_task(id).await? else {
            return Ok(None);
        };
        self.overlay_gauges(&mut task);
        Ok(Some(task))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = self.inner.store.list_tasks().await?;
        for t in &mut tasks {
            self.overlay_gauges(t);
        }
        Ok(tasks)
    }

    /// Queued tasks in queue order.
    pub async fn list_queued(&self) -> Result<Vec<Task>> {
        self.inner.store.queued_tasks().await
    }

    /// Today's `(bytes, files)` transfer totals.
    pub async fn daily_totals(&self) -> Result<(i64, i64)> {
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        self.inner.store.daily_totals(&date).await
    }

    /// Block until no task is running and nothing is admissible. Tasks
    /// scheduled for the future do not count.
    pub async fn wait_until_idle(&self) {
        let mut stable = 0;
        loop {
            let active = self.inner.active.lock().unwrap().len();
            let ready = self.inner.scheduler.has_ready(Utc::now());
            if active == 0 && !ready {
                stable += 1;
                if stable >= 3 {
                    return;
                }
            } else {
                stable = 0;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Graceful shutdown: cancel active tasks, give them up to 2 s to
    /// checkpoint, then flush the store. Residual work is rediscovered by
    /// recovery on the next start.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.scheduler.kick();
        let handles: Vec<Arc<TaskHandle>> = self
            .inner
            .active
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for handle in handles {
            handle.request_stop(StopIntent::Shutdown);
        }
        let deadline = tokio::time::Instant::now() + dispatcher::SHUTDOWN_GRACE;
        while tokio::time::Instant::now() < deadline {
            if self.inner.active.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if let Err(e) = self.inner.store.checkpoint().await {
            tracing::warn!(error = %e, "store checkpoint failed at shutdown");
        }
        tracing::info!("engine shut down");
    }

    fn active_handle(&self, id: TaskId) -> Option<Arc<TaskHandle>> {
        self.inner.active.lock().unwrap().get(&id).cloned()
    }

    fn overlay_gauges(&self, task: &mut Task) {
        if let Some(handle) = self.active_handle(task.id) {
            let g = handle.gauges();
            if g.total > 0 || g.downloaded > 0 {
                task.downloaded = g.downloaded as i64;
                if g.total > 0 {
                    task.total_size = g.total as i64;
                }
                task.speed_bps = g.speed_bps;
                task.progress = task.fraction();
                task.eta_secs = if g.speed_bps > 0 && g.total > g.downloaded {
                    Some((g.total - g.downloaded) / g.speed_bps)
                } else {
                    None
                };
            }
        }
    }

    async fn require_task(&self, id: TaskId) -> Result<Task> {
        self.inner
            .store
            .get_task(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {} not found", id))
    }

    fn emit(&self, event: Event) {
        let _ = self.inner.events.send(event);
    }
}

fn queue_entry(task: &Task) -> QueueEntry {
    QueueEntry {
        id: task.id,
        host: host_of(&task.url).unwrap_or_else(|_| "unknown".to_string()),
        start_time: task
            .start_time
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)),
    }
}
