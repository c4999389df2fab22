//! Key-value settings and daily transfer counters.

use anyhow::Result;
use sqlx::Row;

use super::Store;

impl Store {
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All settings whose key starts with `prefix` (e.g. per-host limits).
    pub async fn settings_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%"));
        let rows = sqlx::query("SELECT key, value FROM settings WHERE key LIKE ?1 ESCAPE '\\'")
            .bind(pattern)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("key"), r.get("value")))
            .collect())
    }

    /// Add `n` to the byte counter for `date` (YYYY-MM-DD). The upsert adds
    /// atomically, so concurrent increments cannot lose updates.
    pub async fn add_daily_bytes(&self, date: &str, n: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO daily_stats (date, bytes, files) VALUES (?1, ?2, 0) \
             ON CONFLICT(date) DO UPDATE SET bytes = bytes + excluded.bytes",
        )
        .bind(date)
        .bind(n)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bump the completed-file counter for `date`.
    pub async fn add_daily_file(&self, date: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO daily_stats (date, bytes, files) VALUES (?1, 0, 1) \
             ON CONFLICT(date) DO UPDATE SET files = files + 1",
        )
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `(bytes, files)` recorded for `date`.
    pub async fn daily_totals(&self, date: &str) -> Result<(i64, i64)> {
        let row = sqlx::query("SELECT bytes, files FROM daily_stats WHERE date = ?1")
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| (r.get("bytes"), r.get("files")))
            .unwrap_or((0, 0)))
    }
}
