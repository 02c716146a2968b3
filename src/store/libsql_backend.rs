//! libSQL backend — async `TaskStore` trait implementation.
//!
//! Supports local file and in-memory databases. All status transitions are
//! expressed as guarded `UPDATE ... WHERE status IN (...)` statements so two
//! concurrent terminal transitions can never race on one row.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Row, params};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{EventRow, NewEvent, TaskStore};
use crate::task::model::{TaskKind, TaskRecord, TaskStatus, clamp_progress};

const TASK_COLUMNS: &str = "id, kind, status, progress, payload, result, error_code, \
     error_message, target_type, target_id, dedupe_key, billing_info, user_id, project_id, \
     episode_id, priority, attempt, enqueued_at, enqueue_attempts, last_enqueue_error, \
     created_at, updated_at, started_at, finished_at, heartbeat_at";

/// libSQL task store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self { db: Arc::new(db), conn };
        store.run_migrations().await?;
        info!(path = %path.display(), "Task ledger opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to create in-memory db: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self { db: Arc::new(db), conn };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn parse_json(s: Option<String>) -> Option<Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

fn json_to_string(value: &Value) -> String {
    value.to_string()
}

fn query_err(e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn task_from_row(row: &Row) -> Result<TaskRecord, DatabaseError> {
    let id_str: String = row.get(0).map_err(query_err)?;
    let kind_str: String = row.get(1).map_err(query_err)?;
    let status_str: String = row.get(2).map_err(query_err)?;
    let progress: i64 = row.get(3).map_err(query_err)?;
    let payload_str: String = row.get(4).map_err(query_err)?;
    let result_str: Option<String> = row.get(5).ok();
    let created_str: String = row.get(20).map_err(query_err)?;
    let updated_str: String = row.get(21).map_err(query_err)?;

    Ok(TaskRecord {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("task id: {e}")))?,
        kind: TaskKind::parse(&kind_str)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown task kind: {kind_str}")))?,
        status: TaskStatus::parse(&status_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown task status: {status_str}"))
        })?,
        progress: clamp_progress(progress),
        payload: parse_json(Some(payload_str)).unwrap_or(Value::Null),
        result: parse_json(result_str),
        error_code: row.get(6).ok(),
        error_message: row.get(7).ok(),
        target_type: row.get(8).map_err(query_err)?,
        target_id: row.get(9).map_err(query_err)?,
        dedupe_key: row.get(10).ok(),
        billing_info: parse_json(row.get(11).ok()),
        user_id: row.get(12).map_err(query_err)?,
        project_id: row.get(13).map_err(query_err)?,
        episode_id: row.get(14).ok(),
        priority: row.get::<i64>(15).map_err(query_err)? as i32,
        attempt: row.get::<i64>(16).map_err(query_err)? as u32,
        enqueued_at: parse_optional_datetime(row.get(17).ok()),
        enqueue_attempts: row.get::<i64>(18).map_err(query_err)? as u32,
        last_enqueue_error: row.get(19).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        started_at: parse_optional_datetime(row.get(22).ok()),
        finished_at: parse_optional_datetime(row.get(23).ok()),
        heartbeat_at: parse_optional_datetime(row.get(24).ok()),
    })
}

fn event_from_row(row: &Row) -> Result<EventRow, DatabaseError> {
    let id: i64 = row.get(0).map_err(query_err)?;
    let task_id_str: String = row.get(1).map_err(query_err)?;
    let payload_str: String = row.get(5).map_err(query_err)?;
    let created_str: String = row.get(6).map_err(query_err)?;
    Ok(EventRow {
        id,
        task_id: Uuid::parse_str(&task_id_str)
            .map_err(|e| DatabaseError::Serialization(format!("event task id: {e}")))?,
        project_id: row.get(2).map_err(query_err)?,
        user_id: row.get(3).map_err(query_err)?,
        event_type: row.get(4).map_err(query_err)?,
        payload: parse_json(Some(payload_str)).unwrap_or(Value::Null),
        created_at: parse_datetime(&created_str),
    })
}

async fn collect_tasks(mut rows: libsql::Rows) -> Result<Vec<TaskRecord>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err)? {
        out.push(task_from_row(&row)?);
    }
    Ok(out)
}

#[async_trait]
impl TaskStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tasks (id, kind, status, progress, payload, result, error_code, \
                 error_message, target_type, target_id, dedupe_key, billing_info, user_id, \
                 project_id, episode_id, priority, attempt, enqueued_at, enqueue_attempts, \
                 last_enqueue_error, created_at, updated_at, started_at, finished_at, heartbeat_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, ?6, ?7, ?8, ?9, ?10, ?11, ?12, \
                 ?13, 0, NULL, 0, NULL, ?14, ?15, NULL, NULL, NULL)",
                params![
                    task.id.to_string(),
                    task.kind.as_str(),
                    task.status.as_str(),
                    task.progress as i64,
                    json_to_string(&task.payload),
                    task.target_type.as_str(),
                    task.target_id.as_str(),
                    task.dedupe_key.clone(),
                    task.billing_info.as_ref().map(json_to_string),
                    task.user_id.as_str(),
                    task.project_id.as_str(),
                    task.episode_id.clone(),
                    task.priority as i64,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    DatabaseError::DedupeCollision(msg)
                } else {
                    DatabaseError::Query(msg)
                }
            })?;
        Ok(())
    }

    async fn mark_processing(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'processing', started_at = ?1, heartbeat_at = ?1, \
                 attempt = attempt + 1, updated_at = ?1 \
                 WHERE id = ?2 AND status IN ('queued', 'processing')",
                params![now, id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    async fn update_progress(
        &self,
        id: Uuid,
        progress: u8,
        payload: Option<&Value>,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = match payload {
            Some(payload) => self
                .conn()
                .execute(
                    "UPDATE tasks SET progress = ?1, payload = ?2, updated_at = ?3 \
                     WHERE id = ?4 AND status = 'processing'",
                    params![progress as i64, json_to_string(payload), now, id.to_string()],
                )
                .await
                .map_err(query_err)?,
            None => self
                .conn()
                .execute(
                    "UPDATE tasks SET progress = ?1, updated_at = ?2 \
                     WHERE id = ?3 AND status = 'processing'",
                    params![progress as i64, now, id.to_string()],
                )
                .await
                .map_err(query_err)?,
        };
        Ok(affected > 0)
    }

    async fn touch_heartbeat(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET heartbeat_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'processing'",
                params![now, id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        result: Option<&Value>,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'completed', progress = 100, result = ?1, \
                 finished_at = ?2, updated_at = ?2, heartbeat_at = NULL, dedupe_key = NULL \
                 WHERE id = ?3 AND status = 'processing'",
                params![result.map(json_to_string), now, id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'failed', error_code = ?1, error_message = ?2, \
                 finished_at = ?3, updated_at = ?3, heartbeat_at = NULL, dedupe_key = NULL \
                 WHERE id = ?4 AND status IN ('queued', 'processing')",
                params![
                    truncate(error_code, 80),
                    truncate(error_message, 2000),
                    now,
                    id.to_string()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    async fn record_enqueue_failure(&self, id: Uuid, error: &str) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET enqueue_attempts = enqueue_attempts + 1, \
                 last_enqueue_error = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'queued'",
                params![truncate(error, 500), now, id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    async fn mark_enqueued(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET enqueued_at = ?1, last_enqueue_error = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'queued'",
                params![now, id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    async fn update_billing_info(
        &self,
        id: Uuid,
        billing_info: Option<&Value>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET billing_info = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    billing_info.map(json_to_string),
                    Utc::now().to_rfc3339(),
                    id.to_string()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn release_dedupe_key(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET dedupe_key = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND status IN ('completed', 'failed') AND dedupe_key IS NOT NULL",
                params![Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(task_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE dedupe_key = ?1 \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![key],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(task_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_active_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ('queued', 'processing') \
                     ORDER BY updated_at ASC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(query_err)?;
        collect_tasks(rows).await
    }

    async fn list_stale_processing(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'processing' AND ( \
                       heartbeat_at < ?1 \
                       OR (heartbeat_at IS NULL AND started_at < ?1) \
                       OR (heartbeat_at IS NULL AND started_at IS NULL AND updated_at < ?1) \
                     ) ORDER BY updated_at ASC LIMIT ?2"
                ),
                params![before.to_rfc3339(), limit as i64],
            )
            .await
            .map_err(query_err)?;
        collect_tasks(rows).await
    }

    async fn list_tasks_for_targets(
        &self,
        project_id: &str,
        user_id: &str,
        pairs: &[(String, String)],
        kinds: Option<&[TaskKind]>,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let mut values: Vec<libsql::Value> =
            vec![project_id.to_string().into(), user_id.to_string().into()];
        let pair_clause = pairs
            .iter()
            .map(|(target_type, target_id)| {
                values.push(target_type.clone().into());
                values.push(target_id.clone().into());
                "(target_type = ? AND target_id = ?)"
            })
            .collect::<Vec<_>>()
            .join(" OR ");

        let kind_clause = match kinds {
            Some(kinds) if !kinds.is_empty() => {
                for kind in kinds {
                    values.push(kind.as_str().to_string().into());
                }
                format!(
                    " AND kind IN ({})",
                    std::iter::repeat_n("?", kinds.len()).collect::<Vec<_>>().join(", ")
                )
            }
            _ => String::new(),
        };

        // No ORDER BY here: the resolver sorts per target group in memory.
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE project_id = ? AND user_id = ? AND ({pair_clause}){kind_clause}"
        );
        let rows = self
            .conn()
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(query_err)?;
        collect_tasks(rows).await
    }

    async fn insert_event(&self, event: &NewEvent) -> Result<EventRow, DatabaseError> {
        let created_at = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO task_events (task_id, project_id, user_id, event_type, payload, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.task_id.to_string(),
                    event.project_id.as_str(),
                    event.user_id.as_str(),
                    event.event_type.as_str(),
                    json_to_string(&event.payload),
                    created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        let id = self.conn().last_insert_rowid();
        Ok(EventRow {
            id,
            task_id: event.task_id,
            project_id: event.project_id.clone(),
            user_id: event.user_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            created_at,
        })
    }

    async fn list_task_events(
        &self,
        task_id: Uuid,
        limit: usize,
    ) -> Result<Vec<EventRow>, DatabaseError> {
        // Fetch the most recent `limit` rows, then restore log order.
        let mut rows = self
            .conn()
            .query(
                "SELECT id, task_id, project_id, user_id, event_type, payload, created_at \
                 FROM task_events WHERE task_id = ?1 ORDER BY id DESC LIMIT ?2",
                params![task_id.to_string(), limit as i64],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(event_from_row(&row)?);
        }
        out.reverse();
        Ok(out)
    }

    async fn list_events_after(
        &self,
        project_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<EventRow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, task_id, project_id, user_id, event_type, payload, created_at \
                 FROM task_events WHERE project_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
                params![project_id, after_id, limit as i64],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(event_from_row(&row)?);
        }
        Ok(out)
    }
}
