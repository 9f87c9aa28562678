use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use tokio::sync::Mutex;

use super::{ContextEntry, EntryKind, StateChange};
use crate::core::types::Task;

/// Durable home of context entries.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&self, entry: &ContextEntry) -> Result<()>;

    async fn load(&self, task_id: &str) -> Result<Vec<ContextEntry>>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub mode: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct SqliteJournal {
    db: Arc<Mutex<Connection>>,
}

impl SqliteJournal {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = Connection::open(path)
            .with_context(|| format!("opening journal {}", path.display()))?;
        Self::from_connection(db)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(db: Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS context_entries (
                task_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                payload_ref TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                caused_by_seq INTEGER,
                PRIMARY KEY (task_id, seq)
            )",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT task_id, mode, status, created_at, updated_at FROM tasks ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TaskRecord {
                task_id: row.get(0)?,
                mode: row.get(1)?,
                status: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self
            .list_tasks()
            .await?
            .into_iter()
            .find(|t| t.task_id == task_id))
    }
}

#[async_trait]
impl Journal for SqliteJournal {
    async fn append(&self, entry: &ContextEntry) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO context_entries
                (task_id, seq, kind, payload_json, payload_ref, timestamp, caused_by_seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.task_id,
                entry.seq as i64,
                entry.kind.as_str(),
                serde_json::to_string(&entry.payload)?,
                entry.payload_ref,
                entry.timestamp.to_rfc3339(),
                entry.caused_by_seq.map(|s| s as i64),
            ],
        )?;

        let now = entry.timestamp.to_rfc3339();
        match entry.kind {
            EntryKind::TaskCreated => {
                let task: Task = serde_json::from_value(entry.payload.clone())?;
                tx.execute(
                    "INSERT OR REPLACE INTO tasks (task_id, mode, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        task.id,
                        task.mode.as_str(),
                        task.status.as_str(),
                        task.created_at.to_rfc3339(),
                        now
                    ],
                )?;
            }
            EntryKind::StateChanged => {
                let change: StateChange = serde_json::from_value(entry.payload.clone())?;
                tx.execute(
                    "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE task_id = ?3",
                    params![change.task_status.as_str(), now, entry.task_id],
                )?;
            }
            _ => {}
        }
        tx.commit()?;
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Vec<ContextEntry>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT seq, kind, payload_json, payload_ref, timestamp, caused_by_seq
             FROM context_entries WHERE task_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<i64>>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (seq, kind, payload_json, payload_ref, timestamp, caused_by) = row?;
            let kind = EntryKind::from_name(&kind)
                .ok_or_else(|| anyhow::anyhow!("unknown entry kind '{}' at seq {}", kind, seq))?;
            out.push(ContextEntry {
                seq: seq as u64,
                task_id: task_id.to_string(),
                kind,
                payload: serde_json::from_str(&payload_json)?,
                payload_ref,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
                caused_by_seq: caused_by.map(|s| s as u64),
            });
        }
        Ok(out)
    }
}
