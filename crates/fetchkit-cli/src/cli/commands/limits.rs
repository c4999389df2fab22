//! Bandwidth and host limit commands. Settings are picked up by the engine
//! on its next start.

use anyhow::{bail, Result};
use fetchkit_core::store::Store;

pub async fn run_limit(store: &Store, bytes_per_sec: u64) -> Result<()> {
    store
        .set_setting("global_limit_bps", &bytes_per_sec.to_string())
        .await?;
    if bytes_per_sec == 0 {
        println!("Global bandwidth limit removed");
    } else {
        println!("Global bandwidth limit set to {bytes_per_sec} bytes/sec");
    }
    Ok(())
}

pub async fn run_host_limit(store: &Store, host: &str, limit: usize) -> Result<()> {
    if host.is_empty() {
        bail!("host must not be empty");
    }
    store
        .set_setting(&format!("host_limit:{host}"), &limit.to_string())
        .await?;
    if limit == 0 {
        println!("Host limit for {host} removed");
    } else {
        println!("Host limit for {host} set to {limit} concurrent tasks");
    }
    Ok(())
}
