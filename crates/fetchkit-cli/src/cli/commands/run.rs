//! `fetchkit run` – drive the engine until the queue drains.

use anyhow::Result;
use fetchkit_core::config::EngineConfig;
use fetchkit_core::engine::Engine;
use fetchkit_core::events::Event;
use fetchkit_core::store::Store;
use fetchkit_core::task::TaskStatus;

pub async fn run_scheduler(
    cfg: &EngineConfig,
    store: &Store,
    jobs: usize,
    retry_errors: bool,
) -> Result<()> {
    let engine = Engine::open(cfg.clone(), store.clone()).await?;
    engine.set_max_concurrent(jobs.clamp(1, 10)).await?;

    // Print progress lines as events arrive.
    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::Progress {
                    id,
                    progress,
                    speed_bps,
                    ..
                } => {
                    println!(
                        "task {id}: {:>5.1}% at {} KiB/s",
                        progress * 100.0,
                        speed_bps / 1024
                    );
                }
                Event::Completed { id } => println!("task {id}: completed"),
                Event::Error { id, message } => println!("task {id}: error: {message}"),
                Event::NeedsAuth { id } => {
                    println!("task {id}: needs a fresh URL (use `fetchkit` update-url via API)")
                }
                Event::Verifying { id } => println!("task {id}: verifying"),
                _ => {}
            }
        }
    });

    // The recovery pass parks interrupted work in `paused`; re-queue it so a
    // plain `add` + `run` flow downloads everything.
    for task in engine.list_tasks().await? {
        let eligible = task.status == TaskStatus::Paused
            || (retry_errors && task.status == TaskStatus::Error);
        if eligible {
            if let Err(e) = engine.resume(task.id).await {
                tracing::warn!(task = task.id, error = %e, "could not re-queue task");
            }
        }
    }

    engine.wait_until_idle().await;
    engine.shutdown().await;
    printer.abort();

    let mut done = 0;
    let mut failed = 0;
    for task in engine.list_tasks().await? {
        match task.status {
            TaskStatus::Completed => done += 1,
            TaskStatus::Error | TaskStatus::NeedsAuth => failed += 1,
            _ => {}
        }
    }
    let (bytes, files) = engine.daily_totals().await?;
    println!("{done} completed, {failed} failed; {bytes} bytes over {files} files today");
    Ok(())
}
