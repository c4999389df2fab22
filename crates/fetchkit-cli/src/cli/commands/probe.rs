//! `fetchkit probe <url>` – print remote metadata.

use anyhow::{Context, Result};
use fetchkit_core::config::EngineConfig;
use fetchkit_core::probe;

pub async fn run_probe(cfg: &EngineConfig, url: &str) -> Result<()> {
    let url_owned = url.to_string();
    let user_agent = cfg.user_agent.clone();
    let result = tokio::task::spawn_blocking(move || {
        let headers = std::collections::HashMap::new();
        probe::probe(&url_owned, &headers, None, &user_agent)
    })
    .await
    .context("probe join")??;

    println!("status:        {}", result.status);
    println!("filename:      {}", result.filename);
    println!(
        "size:          {}",
        result
            .size
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );
    println!("accept-ranges: {}", result.accept_ranges);
    println!("etag:          {}", result.etag.as_deref().unwrap_or("-"));
    println!(
        "last-modified: {}",
        result.last_modified.as_deref().unwrap_or("-")
    );
    Ok(())
}
