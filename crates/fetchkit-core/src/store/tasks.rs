//! Task record CRUD.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;

use crate::task::{NewTask, Priority, Task, TaskId, TaskStatus};
use crate::verify::HashAlgorithm;

use super::{unix_timestamp, Store};

fn task_from_row(row: &SqliteRow) -> Task {
    let headers_json: Option<String> = row.get("headers_json");
    let headers: HashMap<String, String> = headers_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    let status_str: String = row.get("status");
    let priority_str: String = row.get("priority");
    let hash_algorithm: Option<String> = row.get("hash_algorithm");

    let mut task = Task {
        id: row.get("id"),
        url: row.get("url"),
        headers,
        cookie: row.get("cookie"),
        dest_dir: row.get("dest_dir"),
        save_path: row.get("save_path"),
        filename: row.get("filename"),
        category: row.get("category"),
        status: TaskStatus::from_str(&status_str),
        priority: Priority::from_str(&priority_str),
        queue_order: row.get("queue_order"),
        total_size: row.get("total_size"),
        downloaded: row.get("downloaded"),
        meta: row.get("meta"),
        expected_hash: row.get("expected_hash"),
        hash_algorithm: hash_algorithm.as_deref().and_then(HashAlgorithm::from_str),
        start_time: row.get("start_time"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        progress: 0.0,
        speed_bps: 0,
        eta_secs: None,
    };
    task.progress = task.fraction();
    task
}

const TASK_COLUMNS: &str = "id, url, headers_json, cookie, dest_dir, save_path, filename, \
     category, status, priority, queue_order, total_size, downloaded, meta, expected_hash, \
     hash_algorithm, start_time, last_error, created_at, updated_at";

impl Store {
    /// Insert a new task. `status` is `pending` or `scheduled`; probe
    /// results fill in the file fields later.
    pub async fn add_task(
        &self,
        new: &NewTask,
        status: TaskStatus,
        queue_order: i64,
    ) -> Result<TaskId> {
        let now = unix_timestamp();
        let headers_json = if new.headers.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&new.headers)?)
        };
        let id = sqlx::query(
            r#"
            INSERT INTO tasks (
                url, headers_json, cookie, dest_dir, save_path, filename, category,
                status, priority, queue_order, total_size, downloaded, meta,
                expected_hash, hash_algorithm, start_time, last_error,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, '', ?5, ?6, ?7, ?8, ?9, 0, 0, NULL, ?10, ?11, ?12, NULL, ?13, ?13)
            "#,
        )
        .bind(&new.url)
        .bind(headers_json)
        .bind(&new.cookie)
        .bind(&new.dest_dir)
        .bind(new.filename.as_deref().unwrap_or(""))
        .bind(&new.category)
        .bind(status.as_str())
        .bind(new.priority.as_str())
        .bind(queue_order)
        .bind(&new.expected_hash)
        .bind(new.hash_algorithm.map(HashAlgorithm::as_str))
        .bind(&new.start_time)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(task_from_row))
    }

    pub async fn get_task_by_url(&self, url: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE url = ?1 ORDER BY id DESC"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(task_from_row))
    }

    /// All tasks, newest first.
    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(task_from_row).collect())
    }

    /// Queued (pending/scheduled) tasks in queue order.
    pub async fn queued_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status IN ('pending', 'scheduled') ORDER BY queue_order, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(task_from_row).collect())
    }

    pub async fn set_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(unix_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transition to `error` (or `needs_auth`) keeping the display message.
    pub async fn set_status_with_error(
        &self,
        id: TaskId,
        status: TaskStatus,
        message: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4")
            .bind(status.as_str())
            .bind(message)
            .bind(unix_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist the resolved destination after the first successful probe.
    pub async fn set_file_info(
        &self,
        id: TaskId,
        save_path: &str,
        filename: &str,
        total_size: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET save_path = ?1, filename = ?2, total_size = ?3, updated_at = ?4 \
             WHERE id = ?5",
        )
        .bind(save_path)
        .bind(filename)
        .bind(total_size)
        .bind(unix_timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Checkpoint the byte counter and resume blob together.
    pub async fn set_progress(
        &self,
        id: TaskId,
        downloaded: i64,
        meta: Option<&[u8]>,
    ) -> Result<()> {
        sqlx::query("UPDATE tasks SET downloaded = ?1, meta = ?2, updated_at = ?3 WHERE id = ?4")
            .bind(downloaded)
            .bind(meta)
            .bind(unix_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop resume state (fresh start after validator mismatch or a missing
    /// file on disk).
    pub async fn reset_resume(&self, id: TaskId) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET downloaded = 0, meta = NULL, updated_at = ?1 WHERE id = ?2",
        )
        .bind(unix_timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_url(&self, id: TaskId, url: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET url = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(url)
            .bind(unix_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_priority(&self, id: TaskId, priority: Priority) -> Result<()> {
        sqlx::query("UPDATE tasks SET priority = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(priority.as_str())
            .bind(unix_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist a compacted queue assignment in one transaction.
    pub async fn set_queue_orders(&self, orders: &[(TaskId, i64)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = unix_timestamp();
        for &(id, order) in orders {
            sqlx::query("UPDATE tasks SET queue_order = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(order)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Next free queue position (1-based).
    pub async fn next_queue_order(&self) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(queue_order), 0) AS m FROM tasks \
             WHERE status IN ('pending', 'scheduled')",
        )
        .fetch_one(&self.pool)
        .await?;
        let max: i64 = row.get("m");
        Ok(max + 1)
    }

    pub async fn delete_task(&self, id: TaskId) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Startup recovery: anything left `downloading` or `pending` by a
    /// previous process becomes `paused`. Returns the number of rows moved.
    pub async fn recover_stale(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'paused', updated_at = ?1 \
             WHERE status IN ('downloading', 'pending')",
        )
        .bind(unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
