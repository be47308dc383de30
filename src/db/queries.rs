use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use uuid::Uuid;

use crate::models::task::{TaskKind, TaskStatus, UploadTask};

const TASK_COLUMNS: &str = "id, kind, user_id, front_image_path, back_image_path, latitude, \
     longitude, retry_count, max_retries, requires_network, status, next_attempt_at, \
     last_error, created_at";

fn path_to_text(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().into_owned())
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn task_from_row(row: &SqliteRow) -> Result<UploadTask, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let front: Option<String> = row.try_get("front_image_path")?;
    let back: Option<String> = row.try_get("back_image_path")?;

    Ok(UploadTask {
        id: row.try_get("id")?,
        kind: kind
            .parse::<TaskKind>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        user_id: row.try_get("user_id")?,
        front_image_path: front.map(PathBuf::from),
        back_image_path: back.map(PathBuf::from),
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        requires_network: row.try_get("requires_network")?,
        status: status
            .parse::<TaskStatus>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        next_attempt_at: millis_to_datetime(row.try_get("next_attempt_at")?),
        last_error: row.try_get("last_error")?,
        created_at: millis_to_datetime(row.try_get("created_at")?),
    })
}

/// Insert a task unless one with the same id already exists.
/// Returns true when a new row was written.
pub async fn insert_task(pool: &SqlitePool, task: &UploadTask) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO upload_tasks
            (id, kind, user_id, front_image_path, back_image_path, latitude, longitude,
             retry_count, max_retries, requires_network, status, next_attempt_at,
             last_error, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)
        "#,
    )
    .bind(task.id)
    .bind(task.kind.to_string())
    .bind(&task.user_id)
    .bind(path_to_text(&task.front_image_path))
    .bind(path_to_text(&task.back_image_path))
    .bind(task.latitude)
    .bind(task.longitude)
    .bind(task.retry_count)
    .bind(task.max_retries)
    .bind(task.requires_network)
    .bind(task.next_attempt_at.timestamp_millis())
    .bind(&task.last_error)
    .bind(task.created_at.timestamp_millis())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Atomically move the earliest due pending task to `running`.
///
/// Tasks that require the network are skipped while `online` is false.
pub async fn claim_due_task(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    online: bool,
) -> Result<Option<UploadTask>, sqlx::Error> {
    let sql = format!(
        r#"
        UPDATE upload_tasks
        SET status = 'running'
        WHERE id = (
            SELECT id FROM upload_tasks
            WHERE status = 'pending'
              AND next_attempt_at <= ?
              AND (requires_network = 0 OR ? = 1)
            ORDER BY next_attempt_at ASC, created_at ASC
            LIMIT 1
        )
        RETURNING {TASK_COLUMNS}
        "#
    );

    let row = sqlx::query(&sql)
        .bind(now.timestamp_millis())
        .bind(online)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(task_from_row).transpose()
}

/// Return a running task to `pending` with its next attempt scheduled.
pub async fn reschedule_task(
    pool: &SqlitePool,
    task_id: Uuid,
    retry_count: i32,
    next_attempt_at: DateTime<Utc>,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE upload_tasks
        SET status = 'pending',
            retry_count = ?,
            next_attempt_at = ?,
            last_error = ?
        WHERE id = ?
        "#,
    )
    .bind(retry_count)
    .bind(next_attempt_at.timestamp_millis())
    .bind(error)
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Return a running task to `pending` without touching its retry count.
/// Used when the outcome of an attempt could not be recorded.
pub async fn release_task(
    pool: &SqlitePool,
    task_id: Uuid,
    next_attempt_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE upload_tasks SET status = 'pending', next_attempt_at = ? WHERE id = ? AND status = 'running'",
    )
    .bind(next_attempt_at.timestamp_millis())
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Remove a task that reached a terminal state
pub async fn delete_task(pool: &SqlitePool, task_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM upload_tasks WHERE id = ?")
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Return tasks left `running` by a previous process to `pending`.
pub async fn reset_running_tasks(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE upload_tasks SET status = 'pending' WHERE status = 'running'")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Get a task by ID
pub async fn get_task(pool: &SqlitePool, task_id: Uuid) -> Result<Option<UploadTask>, sqlx::Error> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM upload_tasks WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(task_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(task_from_row).transpose()
}

/// List queued tasks, oldest first
pub async fn list_tasks(pool: &SqlitePool, limit: i64) -> Result<Vec<UploadTask>, sqlx::Error> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM upload_tasks ORDER BY created_at ASC LIMIT ?");
    let rows = sqlx::query(&sql).bind(limit).fetch_all(pool).await?;
    rows.iter().map(task_from_row).collect()
}

/// Number of tasks not yet terminal
pub async fn count_tasks(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM upload_tasks")
        .fetch_one(pool)
        .await
}

/// Number of tasks waiting to be claimed
pub async fn count_pending_tasks(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM upload_tasks WHERE status = 'pending'")
        .fetch_one(pool)
        .await
}

/// Earliest scheduled attempt among pending tasks
pub async fn next_due_at(pool: &SqlitePool) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let millis: Option<i64> =
        sqlx::query_scalar("SELECT MIN(next_attempt_at) FROM upload_tasks WHERE status = 'pending'")
            .fetch_one(pool)
            .await?;
    Ok(millis.map(millis_to_datetime))
}
