use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::domain::{Idea, Project, ProjectStatus, ProjectStore, Task};
use crate::history::{ConversationScope, ConversationTurn, HistoryFilter, HistoryStore, Role};
use crate::memory::{MemoryEntry, MemoryStore};

/// Fixed-width RFC 3339 so lexical order in SQLite matches time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_ts(idx, raw)).transpose()
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    let owners_json: String = row.get(4)?;
    Ok(Project {
        id: row.get(0)?,
        community_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        owners: serde_json::from_str(&owners_json).unwrap_or_default(),
        status: ProjectStatus::from_db(&row.get::<_, String>(5)?),
        created_at: parse_ts(6, row.get(6)?)?,
        archived_at: parse_opt_ts(7, row.get(7)?)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        label: row.get(2)?,
        is_done: row.get::<_, i64>(3)? != 0,
        created_by: row.get(4)?,
        created_at: parse_ts(5, row.get(5)?)?,
    })
}

fn idea_from_row(row: &Row<'_>) -> rusqlite::Result<Idea> {
    Ok(Idea {
        id: row.get(0)?,
        community_id: row.get(1)?,
        author_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        used_project_id: row.get(5)?,
        created_at: parse_ts(6, row.get(6)?)?,
    })
}

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryEntry> {
    Ok(MemoryEntry {
        key: row.get(0)?,
        value: row.get(1)?,
        context: row.get(2)?,
        created_at: parse_ts(3, row.get(3)?)?,
        updated_at: parse_ts(4, row.get(4)?)?,
    })
}

const PROJECT_COLUMNS: &str =
    "id, community_id, title, description, owners, status, created_at, archived_at";
const TASK_COLUMNS: &str = "id, project_id, label, is_done, created_by, created_at";
const IDEA_COLUMNS: &str =
    "id, community_id, author_id, title, description, used_project_id, created_at";

/// SQLite-backed storage for memories, conversation history and the project board.
pub struct BotDatabase {
    conn: Mutex<Connection>,
}

impl BotDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database, creating its parent directory if needed.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Throwaway database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                community_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                owners TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                archived_at TEXT
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                label TEXT NOT NULL,
                is_done INTEGER NOT NULL DEFAULT 0,
                created_by INTEGER,
                created_at TEXT NOT NULL,
                FOREIGN KEY (project_id) REFERENCES projects(id)
            );

            CREATE TABLE IF NOT EXISTS ideas (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                community_id INTEGER NOT NULL,
                author_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                used_project_id INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                community_id INTEGER NOT NULL,
                memory_key TEXT NOT NULL,
                memory_value TEXT NOT NULL,
                context TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, community_id, memory_key)
            );

            CREATE TABLE IF NOT EXISTS conversation_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                community_id INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_scope
                ON conversation_history(user_id, community_id, channel_id, id);
            CREATE INDEX IF NOT EXISTS idx_history_created
                ON conversation_history(created_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(())
    }

    fn insert_turn_at(
        &self,
        scope: ConversationScope,
        role: Role,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO conversation_history
                (user_id, community_id, channel_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                scope.user_id,
                scope.community_id,
                scope.channel_id,
                role.as_db_str(),
                content,
                format_ts(at)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

#[async_trait]
impl MemoryStore for BotDatabase {
    async fn set_memory(
        &self,
        user_id: i64,
        community_id: i64,
        key: &str,
        value: &str,
        context: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        let now = format_ts(Utc::now());
        conn.execute(
            "INSERT INTO user_memories
                (user_id, community_id, memory_key, memory_value, context, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(user_id, community_id, memory_key) DO UPDATE SET
                memory_value = excluded.memory_value,
                context = excluded.context,
                updated_at = excluded.updated_at",
            params![user_id, community_id, key, value, context, now],
        )
        .with_context(|| format!("Failed to save memory '{}'", key))?;
        Ok(())
    }

    async fn get_memory(
        &self,
        user_id: i64,
        community_id: i64,
        key: &str,
    ) -> Result<Option<MemoryEntry>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT memory_key, memory_value, context, created_at, updated_at
             FROM user_memories
             WHERE user_id = ?1 AND community_id = ?2 AND memory_key = ?3",
            params![user_id, community_id, key],
            memory_from_row,
        );

        match result {
            Ok(entry) => Ok(Some(entry)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_all_memories(&self, user_id: i64, community_id: i64) -> Result<Vec<MemoryEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT memory_key, memory_value, context, created_at, updated_at
             FROM user_memories
             WHERE user_id = ?1 AND community_id = ?2
             ORDER BY created_at ASC, id ASC",
        )?;
        let memories = stmt
            .query_map(params![user_id, community_id], memory_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }

    async fn delete_memory(&self, user_id: i64, community_id: i64, key: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM user_memories
             WHERE user_id = ?1 AND community_id = ?2 AND memory_key = ?3",
            params![user_id, community_id, key],
        )?;
        Ok(removed > 0)
    }

    async fn clear_all_for_user(&self, user_id: i64, community_id: i64) -> Result<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM user_memories WHERE user_id = ?1 AND community_id = ?2",
            params![user_id, community_id],
        )?;
        Ok(removed)
    }
}

#[async_trait]
impl HistoryStore for BotDatabase {
    async fn append_turn(
        &self,
        scope: ConversationScope,
        role: Role,
        content: &str,
    ) -> Result<i64> {
        self.insert_turn_at(scope, role, content, Utc::now())
    }

    async fn get_recent_turns(
        &self,
        scope: ConversationScope,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, role, content, created_at
             FROM conversation_history
             WHERE user_id = ?1 AND community_id = ?2 AND channel_id = ?3
             ORDER BY id DESC
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![
                    scope.user_id,
                    scope.community_id,
                    scope.channel_id,
                    limit as i64
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        parse_ts(3, row.get(3)?)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut turns: Vec<ConversationTurn> = rows
            .into_iter()
            .filter_map(|(id, role, content, created_at)| {
                let Some(role) = Role::from_db(&role) else {
                    tracing::warn!("Skipping history row {} with unknown role '{}'", id, role);
                    return None;
                };
                Some(ConversationTurn {
                    id,
                    scope,
                    role,
                    content,
                    created_at,
                })
            })
            .collect();
        turns.reverse();
        Ok(turns)
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM conversation_history WHERE created_at < ?1",
            [format_ts(cutoff)],
        )?;
        Ok(removed)
    }

    async fn clear_history(&self, filter: HistoryFilter) -> Result<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM conversation_history
             WHERE (?1 IS NULL OR user_id = ?1)
               AND (?2 IS NULL OR community_id = ?2)
               AND (?3 IS NULL OR channel_id = ?3)",
            params![filter.user_id, filter.community_id, filter.channel_id],
        )?;
        Ok(removed)
    }
}

#[async_trait]
impl ProjectStore for BotDatabase {
    async fn create_project(
        &self,
        community_id: i64,
        title: &str,
        description: Option<&str>,
        owners: &[i64],
    ) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO projects (community_id, title, description, owners, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                community_id,
                title,
                description,
                serde_json::to_string(owners)?,
                ProjectStatus::Active.as_db_str(),
                format_ts(Utc::now())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_project(&self, project_id: i64) -> Result<Option<Project>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
            [project_id],
            project_from_row,
        );

        match result {
            Ok(project) => Ok(Some(project)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_projects(
        &self,
        community_id: i64,
        status: Option<ProjectStatus>,
    ) -> Result<Vec<Project>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM projects
             WHERE community_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, id DESC",
            PROJECT_COLUMNS
        ))?;
        let projects = stmt
            .query_map(
                params![community_id, status.map(ProjectStatus::as_db_str)],
                project_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    async fn archive_project(&self, project_id: i64) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE projects SET status = ?1, archived_at = ?2 WHERE id = ?3",
            params![
                ProjectStatus::Archived.as_db_str(),
                format_ts(Utc::now()),
                project_id
            ],
        )?;
        Ok(())
    }

    async fn complete_project(&self, project_id: i64) -> Result<()> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE projects SET status = ?1 WHERE id = ?2",
            params![ProjectStatus::Completed.as_db_str(), project_id],
        )?;
        if updated == 0 {
            anyhow::bail!("Project {} does not exist", project_id);
        }
        Ok(())
    }

    async fn create_task(
        &self,
        project_id: i64,
        label: &str,
        created_by: Option<i64>,
    ) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO tasks (project_id, label, is_done, created_by, created_at)
             VALUES (?1, ?2, 0, ?3, ?4)",
            params![project_id, label, created_by, format_ts(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            [task_id],
            task_from_row,
        );

        match result {
            Ok(task) => Ok(Some(task)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_tasks(&self, project_id: i64) -> Result<Vec<Task>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE project_id = ?1 ORDER BY id ASC",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map([project_id], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    async fn toggle_task(&self, task_id: i64) -> Result<bool> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE tasks SET is_done = CASE is_done WHEN 0 THEN 1 ELSE 0 END WHERE id = ?1",
            [task_id],
        )?;
        if updated == 0 {
            anyhow::bail!("Task {} does not exist", task_id);
        }
        let is_done: i64 =
            conn.query_row("SELECT is_done FROM tasks WHERE id = ?1", [task_id], |row| {
                row.get(0)
            })?;
        Ok(is_done != 0)
    }

    async fn delete_task(&self, task_id: i64) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM tasks WHERE id = ?1", [task_id])?;
        Ok(())
    }

    async fn create_idea(
        &self,
        community_id: i64,
        author_id: i64,
        title: &str,
        description: Option<&str>,
    ) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO ideas (community_id, author_id, title, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                community_id,
                author_id,
                title,
                description,
                format_ts(Utc::now())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_idea(&self, idea_id: i64) -> Result<Option<Idea>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            &format!("SELECT {} FROM ideas WHERE id = ?1", IDEA_COLUMNS),
            [idea_id],
            idea_from_row,
        );

        match result {
            Ok(idea) => Ok(Some(idea)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_ideas(&self, community_id: i64, unused_only: bool) -> Result<Vec<Idea>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM ideas
             WHERE community_id = ?1 AND (?2 = 0 OR used_project_id IS NULL)
             ORDER BY created_at DESC, id DESC",
            IDEA_COLUMNS
        ))?;
        let ideas = stmt
            .query_map(params![community_id, unused_only], idea_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ideas)
    }

    async fn mark_idea_used(&self, idea_id: i64, project_id: i64) -> Result<()> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE ideas SET used_project_id = ?1 WHERE id = ?2",
            params![project_id, idea_id],
        )?;
        if updated == 0 {
            anyhow::bail!("Idea {} does not exist", idea_id);
        }
        Ok(())
    }

    async fn delete_idea(&self, idea_id: i64) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM ideas WHERE id = ?1", [idea_id])?;
        Ok(())
    }
}
