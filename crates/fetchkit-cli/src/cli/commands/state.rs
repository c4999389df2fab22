//! Task state commands: pause, resume, stop, remove, move.

use anyhow::{bail, Result};
use fetchkit_core::congestion::host_of;
use fetchkit_core::queue::{MoveTo, QueueEntry, Scheduler};
use fetchkit_core::store::Store;
use fetchkit_core::task::{TaskId, TaskStatus};

pub async fn run_pause(store: &Store, id: TaskId) -> Result<()> {
    require(store, id).await?;
    store.set_status(id, TaskStatus::Paused).await?;
    println!("Paused task {id}");
    Ok(())
}

pub async fn run_resume(store: &Store, id: TaskId) -> Result<()> {
    let task = require(store, id).await?;
    if !task.status.is_resumable() {
        bail!("task {id} is {}, not resumable", task.status.as_str());
    }
    if !task.save_path.is_empty() && !std::path::Path::new(&task.save_path).exists() {
        store.reset_resume(id).await?;
        println!("Destination missing, task {id} will restart from scratch");
    }
    store.set_status(id, TaskStatus::Pending).await?;
    println!("Queued task {id}; run `fetchkit run` to download");
    Ok(())
}

pub async fn run_stop(store: &Store, id: TaskId) -> Result<()> {
    require(store, id).await?;
    store.set_status(id, TaskStatus::Stopped).await?;
    println!("Stopped task {id}");
    Ok(())
}

pub async fn run_remove(store: &Store, id: TaskId, delete_file: bool) -> Result<()> {
    let task = require(store, id).await?;
    if delete_file && !task.save_path.is_empty() {
        match tokio::fs::remove_file(&task.save_path).await {
            Ok(()) => println!("Deleted {}", task.save_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => println!("Could not delete {}: {e}", task.save_path),
        }
    }
    store.delete_task(id).await?;
    println!("Removed task {id}");
    Ok(())
}

/// Reorders offline by replaying the stored queue through the scheduler's
/// queue logic, then persisting the compacted assignment.
pub async fn run_move(store: &Store, id: TaskId, direction: &str) -> Result<()> {
    let Some(to) = MoveTo::from_str(direction) else {
        bail!("direction must be first, prev, next or last; got {direction}");
    };
    let queued = store.queued_tasks().await?;
    let scheduler = Scheduler::new();
    for t in &queued {
        scheduler.enqueue(QueueEntry {
            id: t.id,
            host: host_of(&t.url).unwrap_or_else(|_| "unknown".to_string()),
            start_time: None,
        });
    }
    let Some(orders) = scheduler.move_task(id, to) else {
        bail!("task {id} is not queued");
    };
    store.set_queue_orders(&orders).await?;
    println!("Moved task {id} {direction}");
    Ok(())
}

async fn require(store: &Store, id: TaskId) -> Result<fetchkit_core::task::Task> {
    store
        .get_task(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task {id} not found"))
}
