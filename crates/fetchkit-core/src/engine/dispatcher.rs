//! Dispatcher: drains the queue into running executors.
//!
//! A single async task parks on the scheduler's notifier and starts one
//! executor per admitted task. A watcher task per executor is the recovery
//! boundary: panics and internal errors land the task in `error` and the
//! bookkeeping (active map, host slot, shaper entry) is always released.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::events::Event;
use crate::executor::{self, ExecutorCtx, TaskHandle};
use crate::queue::QueueEntry;
use crate::task::TaskStatus;

use super::EngineInner;

pub(super) async fn run(inner: Arc<EngineInner>) {
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        let active_count = inner.active.lock().unwrap().len();
        let max = inner.max_concurrent.load(Ordering::Relaxed);
        let admission = inner.scheduler.get_next(active_count, max, Utc::now());
        match admission.task {
            Some(entry) => dispatch(&inner, entry).await,
            None => inner.scheduler.wait(admission.next_start_in).await,
        }
    }
    tracing::debug!("dispatcher stopped");
}

async fn dispatch(inner: &Arc<EngineInner>, entry: QueueEntry) {
    let id = entry.id;
    let task = match inner.store.get_task(id).await {
        Ok(Some(t)) => t,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(task = id, error = %e, "store read failed at dispatch");
            return;
        }
    };
    // A pause/stop/delete may have raced the admission.
    if !task.status.is_queued() {
        return;
    }

    let handle = Arc::new(TaskHandle::new());
    inner
        .active
        .lock()
        .unwrap()
        .insert(id, Arc::clone(&handle));
    inner.scheduler.on_task_started(&entry.host);
    inner.shaper.set_task_priority(id, task.priority);

    let ctx = ExecutorCtx {
        id,
        store: inner.store.clone(),
        shaper: Arc::clone(&inner.shaper),
        controller: Arc::clone(&inner.controller),
        events: inner.events.clone(),
        handle: Arc::clone(&handle),
        user_agent: inner.config.user_agent.clone(),
        free_space_margin: inner.config.free_space_margin,
        completion_hook: inner.config.completion_hook.clone(),
    };
    let executor = tokio::spawn(executor::run_task(ctx));

    let inner = Arc::clone(inner);
    let host = entry.host;
    tokio::spawn(async move {
        match executor.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(task = id, error = %e, "executor failed internally");
                fail_internal(&inner, id, &format!("fatal: internal error: {e}")).await;
            }
            Err(join_error) => {
                tracing::error!(task = id, %join_error, "executor panicked");
                fail_internal(&inner, id, "fatal: internal worker error").await;
            }
        }
        inner.shaper.forget_task(id);
        inner.active.lock().unwrap().remove(&id);
        inner.scheduler.on_task_completed(&host);
    });
}

async fn fail_internal(inner: &EngineInner, id: crate::task::TaskId, message: &str) {
    if inner
        .store
        .set_status_with_error(id, TaskStatus::Error, message)
        .await
        .is_ok()
    {
        let _ = inner.events.send(Event::Error {
            id,
            message: message.to_string(),
        });
    }
}

/// Grace period for active tasks to checkpoint at shutdown.
pub(super) const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
