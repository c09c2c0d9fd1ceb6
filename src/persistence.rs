//! Persistence sink: durably records step results and task
//! status so a caller can resume or audit a run. Writes are idempotent on
//! `(task_id, step_index, content_type)` so a replayed or adapted step
//! overwrites rather than duplicates its row.

use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection};

use crate::types::TaskStatus;

/// Durable write side the Engine calls after every step and at run end.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn record_step_result(
        &self,
        task_id: &str,
        step_index: u32,
        tool_metadata: &str,
        content_type: &str,
        content: &serde_json::Value,
    ) -> anyhow::Result<()>;

    async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> anyhow::Result<()>;

    /// Persist the final run summary, keyed only by `task_id``).
    async fn save_final_result(&self, task_id: &str, summary: &str) -> anyhow::Result<()>;
}

/// SQLite-backed sink: a `Mutex<Connection>` guarding three tables.
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let sink = Self { conn: Mutex::new(conn) };
        sink.init_schema()?;
        Ok(sink)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let sink = Self { conn: Mutex::new(conn) };
        sink.init_schema()?;
        Ok(sink)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        self.conn.lock().unwrap().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS step_results (
                task_id TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                content_type TEXT NOT NULL,
                tool_metadata TEXT NOT NULL,
                content TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (task_id, step_index, content_type)
            );
            CREATE TABLE IF NOT EXISTS task_status (
                task_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS final_results (
                task_id TEXT PRIMARY KEY,
                summary TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Read back a persisted final summary, for tests and inspection tools.
    pub fn get_final_result(&self, task_id: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT summary FROM final_results WHERE task_id = ?1")?;
        let mut rows = stmt.query(params![task_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    /// Read back a recorded step result, for tests and inspection tools.
    pub fn get_step_result(&self, task_id: &str, step_index: u32, content_type: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT content FROM step_results WHERE task_id = ?1 AND step_index = ?2 AND content_type = ?3",
        )?;
        let mut rows = stmt.query(params![task_id, step_index, content_type])?;
        if let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            Ok(Some(serde_json::from_str(&text)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_task_status(&self, task_id: &str) -> anyhow::Result<Option<TaskStatus>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT status FROM task_status WHERE task_id = ?1")?;
        let mut rows = stmt.query(params![task_id])?;
        if let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            Ok(serde_json::from_str(&format!("\"{text}\"")).ok())
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl PersistenceSink for SqlitePersistence {
    async fn record_step_result(&self, task_id: &str, step_index: u32, tool_metadata: &str, content_type: &str, content: &serde_json::Value) -> anyhow::Result<()> {
        let text = serde_json::to_string(content)?;
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.lock().unwrap().execute(
            "INSERT INTO step_results (task_id, step_index, content_type, tool_metadata, content, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(task_id, step_index, content_type) DO UPDATE SET
                tool_metadata = excluded.tool_metadata,
                content = excluded.content,
                updated_at = excluded.updated_at",
            params![task_id, step_index, content_type, tool_metadata, text, now],
        )?;
        Ok(())
    }

    async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> anyhow::Result<()> {
        let status_text = serde_json::to_value(status)?.as_str().unwrap().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.lock().unwrap().execute(
            "INSERT INTO task_status (task_id, status, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(task_id) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
            params![task_id, status_text, now],
        )?;
        Ok(())
    }

    async fn save_final_result(&self, task_id: &str, summary: &str) -> anyhow::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.lock().unwrap().execute(
            "INSERT INTO final_results (task_id, summary, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(task_id) DO UPDATE SET summary = excluded.summary, updated_at = excluded.updated_at",
            params![task_id, summary, now],
        )?;
        Ok(())
    }
}

/// No-op sink for tests and the demo binary's default run mode.
#[derive(Default)]
pub struct NullPersistence;

#[async_trait]
impl PersistenceSink for NullPersistence {
    async fn record_step_result(&self, _task_id: &str, _step_index: u32, _tool_metadata: &str, _content_type: &str, _content: &serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update_task_status(&self, _task_id: &str, _status: TaskStatus) -> anyhow::Result<()> {
        Ok(())
    }

    async fn save_final_result(&self, _task_id: &str, _summary: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
