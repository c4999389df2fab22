//! `fetchkit list` / `fetchkit queue` – show tasks.

use anyhow::Result;
use fetchkit_core::store::Store;

pub async fn run_list(store: &Store) -> Result<()> {
    let tasks = store.list_tasks().await?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    println!(
        "{:<6} {:<12} {:<7} {:>8} {:>12} {}",
        "ID", "STATUS", "PRIO", "PROGRESS", "SIZE", "URL"
    );
    for t in tasks {
        let size = if t.total_size > 0 {
            t.total_size.to_string()
        } else {
            "-".to_string()
        };
        println!(
            "{:<6} {:<12} {:<7} {:>7.1}% {:>12} {}",
            t.id,
            t.status.as_str(),
            t.priority.as_str(),
            t.progress * 100.0,
            size,
            t.url
        );
        if let Some(err) = &t.last_error {
            println!("       last error: {err}");
        }
    }
    Ok(())
}

pub async fn run_queue(store: &Store) -> Result<()> {
    let tasks = store.queued_tasks().await?;
    if tasks.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    println!("{:<6} {:<6} {:<12} {}", "ORDER", "ID", "STATUS", "URL");
    for t in tasks {
        println!(
            "{:<6} {:<6} {:<12} {}",
            t.queue_order,
            t.id,
            t.status.as_str(),
            t.url
        );
    }
    Ok(())
}
