use tempfile::tempdir;

use crate::task::{NewTask, Priority, TaskStatus};
use crate::verify::HashAlgorithm;

use super::Store;

async fn open_temp() -> (Store, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let store = Store::open_at(&dir.path().join("tasks.db")).await.unwrap();
    (store, dir)
}

fn sample_task(url: &str) -> NewTask {
    let mut headers = std::collections::HashMap::new();
    headers.insert("Referer".to_string(), "https://example.com/".to_string());
    NewTask {
        url: url.to_string(),
        headers,
        cookie: Some("sid=abc".to_string()),
        dest_dir: "/tmp".to_string(),
        filename: None,
        category: "iso".to_string(),
        priority: Priority::High,
        expected_hash: Some("deadbeef".to_string()),
        hash_algorithm: Some(HashAlgorithm::Md5),
        start_time: None,
    }
}

#[tokio::test]
async fn add_and_get_roundtrip() {
    let (store, _dir) = open_temp().await;
    let id = store
        .add_task(&sample_task("https://example.com/a.iso"), TaskStatus::Pending, 1)
        .await
        .unwrap();

    let task = store.get_task(id).await.unwrap().expect("task exists");
    assert_eq!(task.url, "https://example.com/a.iso");
    assert_eq!(task.headers.get("Referer").unwrap(), "https://example.com/");
    assert_eq!(task.cookie.as_deref(), Some("sid=abc"));
    assert_eq!(task.category, "iso");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.priority, Priority::High);
    assert_eq!(task.queue_order, 1);
    assert_eq!(task.expected_hash.as_deref(), Some("deadbeef"));
    assert_eq!(task.hash_algorithm, Some(HashAlgorithm::Md5));
    assert!(task.meta.is_none());
}

#[tokio::test]
async fn lookup_by_url_returns_newest() {
    let (store, _dir) = open_temp().await;
    let url = "https://example.com/dup.bin";
    store
        .add_task(&sample_task(url), TaskStatus::Pending, 1)
        .await
        .unwrap();
    let second = store
        .add_task(&sample_task(url), TaskStatus::Pending, 2)
        .await
        .unwrap();
    let found = store.get_task_by_url(url).await.unwrap().unwrap();
    assert_eq!(found.id, second);
}

#[tokio::test]
async fn progress_and_meta_checkpoint() {
    let (store, _dir) = open_temp().await;
    let id = store
        .add_task(&sample_task("https://example.com/x"), TaskStatus::Pending, 1)
        .await
        .unwrap();

    store.set_progress(id, 4096, Some(&[2u8, 0, 0][..])).await.unwrap();
    let task = store.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.downloaded, 4096);
    assert_eq!(task.meta.as_deref(), Some(&[2u8, 0, 0][..]));

    store.reset_resume(id).await.unwrap();
    let task = store.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.downloaded, 0);
    assert!(task.meta.is_none());
}

#[tokio::test]
async fn recover_stale_moves_running_and_pending_to_paused() {
    let (store, _dir) = open_temp().await;
    let a = store
        .add_task(&sample_task("https://example.com/a"), TaskStatus::Pending, 1)
        .await
        .unwrap();
    let b = store
        .add_task(&sample_task("https://example.com/b"), TaskStatus::Pending, 2)
        .await
        .unwrap();
    let c = store
        .add_task(&sample_task("https://example.com/c"), TaskStatus::Pending, 3)
        .await
        .unwrap();
    store.set_status(b, TaskStatus::Downloading).await.unwrap();
    store.set_status(c, TaskStatus::Completed).await.unwrap();

    let moved = store.recover_stale().await.unwrap();
    assert_eq!(moved, 2);
    assert_eq!(store.get_task(a).await.unwrap().unwrap().status, TaskStatus::Paused);
    assert_eq!(store.get_task(b).await.unwrap().unwrap().status, TaskStatus::Paused);
    assert_eq!(store.get_task(c).await.unwrap().unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn queue_orders_batch_update() {
    let (store, _dir) = open_temp().await;
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            store
                .add_task(
                    &sample_task(&format!("https://example.com/{i}")),
                    TaskStatus::Pending,
                    i + 1,
                )
                .await
                .unwrap(),
        );
    }
    store
        .set_queue_orders(&[(ids[0], 3), (ids[1], 1), (ids[2], 2)])
        .await
        .unwrap();
    let queued = store.queued_tasks().await.unwrap();
    assert_eq!(
        queued.iter().map(|t| t.id).collect::<Vec<_>>(),
        vec![ids[1], ids[2], ids[0]]
    );
    assert_eq!(store.next_queue_order().await.unwrap(), 4);
}

#[tokio::test]
async fn settings_roundtrip_and_prefix_scan() {
    let (store, _dir) = open_temp().await;
    assert!(store.get_setting("missing").await.unwrap().is_none());
    store.set_setting("global_limit_bps", "1048576").await.unwrap();
    store.set_setting("global_limit_bps", "2097152").await.unwrap();
    assert_eq!(
        store.get_setting("global_limit_bps").await.unwrap().as_deref(),
        Some("2097152")
    );

    store.set_setting("host_limit:a.example.com", "2").await.unwrap();
    store.set_setting("host_limit:b.example.com", "4").await.unwrap();
    let mut limits = store.settings_with_prefix("host_limit:").await.unwrap();
    limits.sort();
    assert_eq!(limits.len(), 2);
    assert_eq!(limits[0].0, "host_limit:a.example.com");
}

#[tokio::test]
async fn concurrent_daily_increments_do_not_lose_updates() {
    let (store, _dir) = open_temp().await;
    let date = "2026-08-01";
    let mut handles = Vec::new();
    for _ in 0..2 {
        let store = store.clone();
        let date = date.to_string();
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                store.add_daily_bytes(&date, 10).await.unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    store.add_daily_file(date).await.unwrap();
    store.add_daily_file(date).await.unwrap();
    let (bytes, files) = store.daily_totals(date).await.unwrap();
    assert_eq!(bytes, 1000);
    assert_eq!(files, 2);
}

#[tokio::test]
async fn delete_removes_record() {
    let (store, _dir) = open_temp().await;
    let id = store
        .add_task(&sample_task("https://example.com/gone"), TaskStatus::Pending, 1)
        .await
        .unwrap();
    store.delete_task(id).await.unwrap();
    assert!(store.get_task(id).await.unwrap().is_none());
}
