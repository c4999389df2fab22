//! `fetchkit add <url>` – enqueue a new task.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::PathBuf;

use fetchkit_core::store::Store;
use fetchkit_core::task::{NewTask, Priority, TaskStatus};
use fetchkit_core::verify::HashAlgorithm;

pub struct AddArgs {
    pub url: String,
    pub dir: Option<PathBuf>,
    pub filename: Option<String>,
    pub category: String,
    pub priority: String,
    pub headers: Vec<String>,
    pub cookie: Option<String>,
    pub start_at: Option<String>,
    pub sha256: Option<String>,
    pub md5: Option<String>,
}

pub async fn run_add(store: &Store, args: AddArgs) -> Result<()> {
    let mut headers = HashMap::new();
    for raw in &args.headers {
        let Some((name, value)) = raw.split_once(':') else {
            bail!("header must be `Name: value`, got: {raw}");
        };
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }
    let (expected_hash, hash_algorithm) = match (&args.sha256, &args.md5) {
        (Some(_), Some(_)) => bail!("give either --sha256 or --md5, not both"),
        (Some(h), None) => (Some(h.clone()), Some(HashAlgorithm::Sha256)),
        (None, Some(h)) => (Some(h.clone()), Some(HashAlgorithm::Md5)),
        (None, None) => (None, None),
    };
    if let Some(ref at) = args.start_at {
        if chrono_parse_ok(at).is_none() {
            bail!("--start-at must be RFC3339 (e.g. 2026-08-01T22:00:00Z), got: {at}");
        }
    }

    let status = match args.start_at.as_deref().and_then(chrono_parse_ok) {
        Some(at) if at > now_utc() => TaskStatus::Scheduled,
        _ => TaskStatus::Pending,
    };
    let dest_dir = args
        .dir
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());

    let new = NewTask {
        url: args.url.clone(),
        headers,
        cookie: args.cookie,
        dest_dir,
        filename: args.filename,
        category: args.category,
        priority: Priority::from_str(&args.priority),
        expected_hash,
        hash_algorithm,
        start_time: args.start_at,
    };
    let order = store.next_queue_order().await?;
    let id = store.add_task(&new, status, order).await?;
    println!("Added task {id} ({}) for URL: {}", status.as_str(), args.url);
    Ok(())
}

fn chrono_parse_ok(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&chrono::Utc))
}

fn now_utc() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
