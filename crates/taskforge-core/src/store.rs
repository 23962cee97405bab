//! Durable Store — the system of record (spec §2, §3, §6).
//!
//! An append-only event log plus a task record and a per-stage-run
//! record. The trait is the shape the engine requires; `SqliteStore` is
//! the reference backing implementation, built on `sqlx`'s runtime query
//! API (not the `query!` macro family, which would require a live
//! database connection at build time).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::error::{EngineError, EngineResult};
use crate::task::{AgentRunStatus, Task, TaskStatus};

/// A durably-logged event, as read back from the event log (spec §3:
/// "EventLog entry"). Distinct from the in-memory `Event` — the payload
/// here is the opaque serialized text the Worker wrote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogRow {
    pub id: i64,
    pub task_id: String,
    pub event_kind: String,
    pub stage_name: Option<String>,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// The shape the engine requires of its durable backing store.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn create_task(&self, task: &Task) -> EngineResult<()>;

    async fn fetch_task(&self, task_id: &str) -> EngineResult<Option<Task>>;

    async fn list_tasks(&self) -> EngineResult<Vec<Task>>;

    async fn delete_task(&self, task_id: &str) -> EngineResult<()>;

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result_summary: Option<&str>,
    ) -> EngineResult<()>;

    async fn insert_event(
        &self,
        task_id: &str,
        event_kind: &str,
        stage_name: Option<&str>,
        payload_text: &str,
    ) -> EngineResult<i64>;

    async fn fetch_events(
        &self,
        task_id: &str,
        since_id: Option<i64>,
        limit: Option<i64>,
    ) -> EngineResult<Vec<EventLogRow>>;

    async fn count_events(&self, task_id: &str) -> EngineResult<i64>;

    async fn start_agent_run(&self, task_id: &str, stage_name: &str) -> EngineResult<i64>;

    async fn finish_agent_run(
        &self,
        id: i64,
        status: AgentRunStatus,
        output_summary: Option<&str>,
    ) -> EngineResult<()>;
}

/// Reference `DurableStore` implementation on SQLite via `sqlx`.
///
/// Three relations — `tasks`, `event_log`, `agent_runs` — with foreign
/// keys from `event_log`/`agent_runs` to `tasks` and `ON DELETE CASCADE`
/// (spec §6).
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `database_url` (e.g. `sqlite::memory:` or
    /// `sqlite:///var/lib/taskforge/db.sqlite`) and ensure the schema
    /// exists. Schema administration beyond this inline bootstrap is out
    /// of scope (spec §1).
    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> EngineResult<()> {
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT,
                input_prompt TEXT NOT NULL,
                status TEXT NOT NULL,
                result_summary TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                event_kind TEXT NOT NULL,
                stage_name TEXT,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_event_log_task_id ON event_log(task_id, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                stage_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                output_summary TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn create_task(&self, task: &Task) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, title, input_prompt, status, result_summary, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.title)
        .bind(&task.input_prompt)
        .bind(task.status.to_string())
        .bind(&task.result_summary)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(EngineError::from)?;
        Ok(())
    }

    async fn fetch_task(&self, task_id: &str) -> EngineResult<Option<Task>> {
        let row = sqlx::query(
            "SELECT id, title, input_prompt, status, result_summary, created_at, updated_at FROM tasks WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_task).transpose()
    }

    async fn list_tasks(&self) -> EngineResult<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT id, title, input_prompt, status, result_summary, created_at, updated_at FROM tasks ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_task).collect()
    }

    async fn delete_task(&self, task_id: &str) -> EngineResult<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result_summary: Option<&str>,
    ) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, result_summary = COALESCE(?, result_summary), updated_at = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(result_summary)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(task_id.to_string()));
        }
        Ok(())
    }

    async fn insert_event(
        &self,
        task_id: &str,
        event_kind: &str,
        stage_name: Option<&str>,
        payload_text: &str,
    ) -> EngineResult<i64> {
        let result = sqlx::query(
            "INSERT INTO event_log (task_id, event_kind, stage_name, payload, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(event_kind)
        .bind(stage_name)
        .bind(payload_text)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn fetch_events(
        &self,
        task_id: &str,
        since_id: Option<i64>,
        limit: Option<i64>,
    ) -> EngineResult<Vec<EventLogRow>> {
        let since_id = since_id.unwrap_or(0);
        let limit = limit.unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"
            SELECT id, task_id, event_kind, stage_name, payload, created_at
            FROM event_log
            WHERE task_id = ? AND id > ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(task_id)
        .bind(since_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_event_log).collect()
    }

    async fn count_events(&self, task_id: &str) -> EngineResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM event_log WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    async fn start_agent_run(&self, task_id: &str, stage_name: &str) -> EngineResult<i64> {
        let result = sqlx::query(
            "INSERT INTO agent_runs (task_id, stage_name, status, started_at) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(stage_name)
        .bind(AgentRunStatus::Started.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn finish_agent_run(
        &self,
        id: i64,
        status: AgentRunStatus,
        output_summary: Option<&str>,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE agent_runs SET status = ?, finished_at = ?, output_summary = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(output_summary)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_task(row: sqlx::sqlite::SqliteRow) -> EngineResult<Task> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Task {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        input_prompt: row.try_get("input_prompt")?,
        status: parse_task_status(&status)?,
        result_summary: row.try_get("result_summary")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_event_log(row: sqlx::sqlite::SqliteRow) -> EngineResult<EventLogRow> {
    let created_at: String = row.try_get("created_at")?;
    Ok(EventLogRow {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        event_kind: row.try_get("event_kind")?,
        stage_name: row.try_get("stage_name")?,
        payload: row.try_get("payload")?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn parse_task_status(raw: &str) -> EngineResult<TaskStatus> {
    match raw {
        "PENDING" => Ok(TaskStatus::Pending),
        "RUNNING" => Ok(TaskStatus::Running),
        "SUCCEEDED" => Ok(TaskStatus::Succeeded),
        "FAILED" => Ok(TaskStatus::Failed),
        "CANCELLED" => Ok(TaskStatus::Cancelled),
        other => Err(EngineError::PersistenceError(format!(
            "unrecognized task status in store: {other}"
        ))),
    }
}

fn parse_timestamp(raw: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::PersistenceError(format!("bad timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_task() {
        let store = memory_store().await;
        let task = Task::new("build a todo app", Some("Todo App".into()));
        store.create_task(&task).await.unwrap();

        let fetched = store.fetch_task(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.input_prompt, "build a todo app");
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn fetch_missing_task_returns_none() {
        let store = memory_store().await;
        assert!(store.fetch_task("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_status_requires_existing_task() {
        let store = memory_store().await;
        let err = store
            .update_task_status("nope", TaskStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn events_are_ordered_and_since_id_filters() {
        let store = memory_store().await;
        let task = Task::new("x", None);
        store.create_task(&task).await.unwrap();

        let id1 = store
            .insert_event(&task.id, "LOG", None, "{}")
            .await
            .unwrap();
        let id2 = store
            .insert_event(&task.id, "LOG", None, "{}")
            .await
            .unwrap();
        assert!(id2 > id1);

        let all = store.fetch_events(&task.id, None, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let since = store
            .fetch_events(&task.id, Some(id1), None)
            .await
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, id2);
    }

    #[tokio::test]
    async fn cascade_delete_removes_events_and_runs() {
        let store = memory_store().await;
        let task = Task::new("x", None);
        store.create_task(&task).await.unwrap();
        store.insert_event(&task.id, "LOG", None, "{}").await.unwrap();
        store.start_agent_run(&task.id, "PM").await.unwrap();

        store.delete_task(&task.id).await.unwrap();

        assert_eq!(store.count_events(&task.id).await.unwrap(), 0);
    }
}
