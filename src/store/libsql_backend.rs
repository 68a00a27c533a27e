//! libSQL implementation of the `RecordStore` trait.
//!
//! One local database file (or `:memory:` for tests) holds the quest tables
//! and the job queue. The store keeps a single connection; the queue clones
//! it, so every statement in the process goes through the same handle.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::quests::{
    InvestigationStatus, Quest, QuestStatus, Task, TaskInvestigation, TaskStatus,
};
use crate::store::migrations;
use crate::store::traits::{QuestSnapshot, RecordStore};

/// libSQL-backed record store.
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
    pub async fn new_local(db_path: &str) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Connection(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(db_path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open database: {e}")))?;

        Self::from_database(db).await
    }

    /// In-memory database for tests.
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open database: {e}")))?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to connect: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Clone of the underlying connection, for the job queue.
    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    // Try SQLite datetime() output without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert a QuestStatus to its DB string.
fn quest_status_to_str(status: &QuestStatus) -> &'static str {
    match status {
        QuestStatus::Draft => "draft",
        QuestStatus::Active => "active",
        QuestStatus::Completed => "completed",
        QuestStatus::Failed => "failed",
        QuestStatus::Archived => "archived",
    }
}

/// Convert a DB string back to a QuestStatus.
fn str_to_quest_status(s: &str) -> QuestStatus {
    match s {
        "active" => QuestStatus::Active,
        "completed" => QuestStatus::Completed,
        "failed" => QuestStatus::Failed,
        "archived" => QuestStatus::Archived,
        _ => QuestStatus::Draft,
    }
}

fn task_status_to_str(status: &TaskStatus) -> &'static str {
    match status {
        TaskStatus::Draft => "draft",
        TaskStatus::Todo => "todo",
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in-progress",
        TaskStatus::Completed => "completed",
    }
}

fn str_to_task_status(s: &str) -> TaskStatus {
    match s {
        "draft" => TaskStatus::Draft,
        "pending" => TaskStatus::Pending,
        "in-progress" => TaskStatus::InProgress,
        "completed" => TaskStatus::Completed,
        _ => TaskStatus::Todo,
    }
}

fn investigation_status_to_str(status: &InvestigationStatus) -> &'static str {
    match status {
        InvestigationStatus::Pending => "pending",
        InvestigationStatus::InProgress => "in-progress",
        InvestigationStatus::Completed => "completed",
        InvestigationStatus::Failed => "failed",
    }
}

fn str_to_investigation_status(s: &str) -> InvestigationStatus {
    match s {
        "in-progress" => InvestigationStatus::InProgress,
        "completed" => InvestigationStatus::Completed,
        "failed" => InvestigationStatus::Failed,
        _ => InvestigationStatus::Pending,
    }
}

fn text_or_null(s: &Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.clone()),
        None => libsql::Value::Null,
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

const QUEST_COLUMNS: &str =
    "id, title, goal, context, constraints, status, owner_id, is_public, created_at, updated_at";

const TASK_COLUMNS: &str = "id, quest_id, title, details, extra_content, status, task_order";

const INVESTIGATION_COLUMNS: &str =
    "id, task_id, initiated_by_id, prompt, model_type, status, result, created_at, completed_at";

fn row_to_quest(row: &libsql::Row) -> Result<Quest, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("quest.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| StoreError::Query(format!("quest.id parse: {e}")))?;

    let title: String = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("quest.title: {e}")))?;
    let goal: Option<String> = row.get(2).ok();
    let context: Option<String> = row.get(3).ok();
    let constraints: Option<String> = row.get(4).ok();

    let status_str: String = row
        .get(5)
        .map_err(|e| StoreError::Query(format!("quest.status: {e}")))?;
    let owner_id: String = row
        .get(6)
        .map_err(|e| StoreError::Query(format!("quest.owner_id: {e}")))?;
    let is_public: i64 = row.get(7).unwrap_or(0);

    let created_str: String = row
        .get(8)
        .map_err(|e| StoreError::Query(format!("quest.created_at: {e}")))?;
    let updated_str: String = row
        .get(9)
        .map_err(|e| StoreError::Query(format!("quest.updated_at: {e}")))?;

    Ok(Quest {
        id,
        title,
        goal,
        context,
        constraints,
        status: str_to_quest_status(&status_str),
        owner_id,
        is_public: is_public != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_task(row: &libsql::Row) -> Result<Task, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("task.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| StoreError::Query(format!("task.id parse: {e}")))?;

    let quest_id_str: String = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("task.quest_id: {e}")))?;
    let quest_id = Uuid::parse_str(&quest_id_str)
        .map_err(|e| StoreError::Query(format!("task.quest_id parse: {e}")))?;

    let title: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("task.title: {e}")))?;
    let details: Option<String> = row.get(3).ok();
    let extra_content: Option<String> = row.get(4).ok();

    let status_str: String = row
        .get(5)
        .map_err(|e| StoreError::Query(format!("task.status: {e}")))?;
    let order: i64 = row.get(6).unwrap_or(0);

    Ok(Task {
        id,
        quest_id,
        title,
        details,
        extra_content,
        status: str_to_task_status(&status_str),
        order: order as i32,
    })
}

fn row_to_investigation(row: &libsql::Row) -> Result<TaskInvestigation, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("investigation.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| StoreError::Query(format!("investigation.id parse: {e}")))?;

    let task_id_str: String = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("investigation.task_id: {e}")))?;
    let task_id = Uuid::parse_str(&task_id_str)
        .map_err(|e| StoreError::Query(format!("investigation.task_id parse: {e}")))?;

    let initiated_by_id: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("investigation.initiated_by_id: {e}")))?;
    let prompt: Option<String> = row.get(3).ok();
    let model_type: Option<String> = row.get(4).ok();

    let status_str: String = row
        .get(5)
        .map_err(|e| StoreError::Query(format!("investigation.status: {e}")))?;
    let result: Option<String> = row.get(6).ok();

    let created_str: String = row
        .get(7)
        .map_err(|e| StoreError::Query(format!("investigation.created_at: {e}")))?;
    let completed_str: Option<String> = row.get(8).ok();

    Ok(TaskInvestigation {
        id,
        task_id,
        initiated_by_id,
        prompt,
        model_type,
        status: str_to_investigation_status(&status_str),
        result,
        created_at: parse_datetime(&created_str),
        completed_at: parse_optional_datetime(&completed_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl RecordStore for LibSqlStore {
    // ── Quests ──────────────────────────────────────────────────────

    async fn insert_quest(&self, quest: &Quest) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO quests (id, title, goal, context, constraints, status, owner_id, is_public, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                quest.id.to_string(),
                quest.title.clone(),
                quest.goal.clone(),
                quest.context.clone(),
                quest.constraints.clone(),
                quest_status_to_str(&quest.status),
                quest.owner_id.clone(),
                quest.is_public as i64,
                quest.created_at.to_rfc3339(),
                quest.updated_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("insert_quest: {e}")))?;

        debug!(quest_id = %quest.id, "Quest inserted");
        Ok(())
    }

    async fn get_quest(&self, id: Uuid) -> Result<Option<Quest>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {QUEST_COLUMNS} FROM quests WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_quest: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_quest(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_quest: {e}"))),
        }
    }

    async fn transition_quest_status(
        &self,
        id: Uuid,
        from: QuestStatus,
        to: QuestStatus,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            warn!(quest_id = %id, from = %from, to = %to, "Refusing illegal status transition");
            return Ok(false);
        }
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let affected = conn
            .execute(
                "UPDATE quests SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    quest_status_to_str(&to),
                    now,
                    id.to_string(),
                    quest_status_to_str(&from),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("transition_quest_status: {e}")))?;

        if affected == 1 {
            debug!(quest_id = %id, from = %from, to = %to, "Quest status updated");
        }
        Ok(affected == 1)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_decomposed_tasks(
        &self,
        quest_id: Uuid,
        tasks: &[Task],
    ) -> Result<bool, StoreError> {
        if tasks.is_empty() {
            return Ok(false);
        }
        let conn = self.conn();

        // One statement keeps the whole write atomic on the shared
        // connection. The VALUES rows land only if the quest is still
        // decomposable and has no tasks yet; a redelivered decompose job
        // therefore writes nothing.
        let mut rows_sql = String::new();
        let mut args: Vec<libsql::Value> = Vec::with_capacity(tasks.len() * 7 + 2);
        for (i, task) in tasks.iter().enumerate() {
            if i > 0 {
                rows_sql.push_str(", ");
            }
            rows_sql.push_str("(?, ?, ?, ?, ?, ?, ?)");
            args.push(libsql::Value::Text(task.id.to_string()));
            args.push(libsql::Value::Text(task.quest_id.to_string()));
            args.push(libsql::Value::Text(task.title.clone()));
            args.push(text_or_null(&task.details));
            args.push(text_or_null(&task.extra_content));
            args.push(libsql::Value::Text(
                task_status_to_str(&task.status).to_string(),
            ));
            args.push(libsql::Value::Integer(task.order as i64));
        }
        args.push(libsql::Value::Text(quest_id.to_string()));
        args.push(libsql::Value::Text(quest_id.to_string()));

        // Status guard mirrors QuestStatus::is_decomposable
        let sql = format!(
            "INSERT INTO tasks (id, quest_id, title, details, extra_content, status, task_order) \
             SELECT column1, column2, column3, column4, column5, column6, column7 \
             FROM (VALUES {rows_sql}) \
             WHERE EXISTS (SELECT 1 FROM quests WHERE id = ? AND status IN ('draft', 'active')) \
             AND NOT EXISTS (SELECT 1 FROM tasks WHERE quest_id = ?)"
        );

        let affected = conn
            .execute(&sql, args)
            .await
            .map_err(|e| StoreError::Query(format!("insert_decomposed_tasks: {e}")))?;

        let written = affected == tasks.len() as u64;
        if written {
            debug!(quest_id = %quest_id, count = tasks.len(), "Decomposed tasks inserted");
        } else {
            debug!(quest_id = %quest_id, "Decomposed task insert skipped, guard failed");
        }
        Ok(written)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_task: {e}"))),
        }
    }

    async fn list_tasks(&self, quest_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE quest_id = ?1 ORDER BY task_order ASC"
                ),
                params![quest_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!("Skipping task row: {e}");
                }
            }
        }
        Ok(tasks)
    }

    async fn transition_task_status(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            warn!(task_id = %id, from = %from, to = %to, "Refusing illegal status transition");
            return Ok(false);
        }
        let conn = self.conn();
        let affected = conn
            .execute(
                "UPDATE tasks SET status = ?1 WHERE id = ?2 AND status = ?3",
                params![
                    task_status_to_str(&to),
                    id.to_string(),
                    task_status_to_str(&from),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("transition_task_status: {e}")))?;

        if affected == 1 {
            debug!(task_id = %id, from = %from, to = %to, "Task status updated");
        }
        Ok(affected == 1)
    }

    async fn mark_task_in_progress(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.conn();
        let affected = conn
            .execute(
                "UPDATE tasks SET status = 'in-progress' WHERE id = ?1 AND status IN ('todo', 'pending')",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_task_in_progress: {e}")))?;

        Ok(affected == 1)
    }

    // ── Investigations ──────────────────────────────────────────────

    async fn insert_investigation(&self, inv: &TaskInvestigation) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO task_investigations (id, task_id, initiated_by_id, prompt, model_type, status, result, created_at, completed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                inv.id.to_string(),
                inv.task_id.to_string(),
                inv.initiated_by_id.clone(),
                inv.prompt.clone(),
                inv.model_type.clone(),
                investigation_status_to_str(&inv.status),
                inv.result.clone(),
                inv.created_at.to_rfc3339(),
                inv.completed_at.map(|dt| dt.to_rfc3339()),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("insert_investigation: {e}")))?;

        debug!(investigation_id = %inv.id, task_id = %inv.task_id, "Investigation inserted");
        Ok(())
    }

    async fn get_investigation(
        &self,
        id: Uuid,
    ) -> Result<Option<TaskInvestigation>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {INVESTIGATION_COLUMNS} FROM task_investigations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_investigation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_investigation(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_investigation: {e}"))),
        }
    }

    async fn transition_investigation_status(
        &self,
        id: Uuid,
        from: InvestigationStatus,
        to: InvestigationStatus,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            warn!(investigation_id = %id, from = %from, to = %to, "Refusing illegal status transition");
            return Ok(false);
        }
        let conn = self.conn();
        let affected = conn
            .execute(
                "UPDATE task_investigations SET status = ?1 WHERE id = ?2 AND status = ?3",
                params![
                    investigation_status_to_str(&to),
                    id.to_string(),
                    investigation_status_to_str(&from),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("transition_investigation_status: {e}")))?;

        if affected == 1 {
            debug!(investigation_id = %id, from = %from, to = %to, "Investigation status updated");
        }
        Ok(affected == 1)
    }

    async fn complete_investigation(&self, id: Uuid, result: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let affected = conn
            .execute(
                "UPDATE task_investigations SET status = 'completed', result = ?1, completed_at = ?2 WHERE id = ?3 AND status = 'in-progress'",
                params![result, now, id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("complete_investigation: {e}")))?;

        if affected == 1 {
            debug!(investigation_id = %id, "Investigation completed");
        }
        Ok(affected == 1)
    }

    async fn fail_investigation(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let affected = conn
            .execute(
                "UPDATE task_investigations SET status = 'failed', completed_at = ?1 WHERE id = ?2 AND status IN ('pending', 'in-progress')",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("fail_investigation: {e}")))?;

        if affected == 1 {
            debug!(investigation_id = %id, "Investigation failed");
        }
        Ok(affected == 1)
    }

    async fn list_investigations(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<TaskInvestigation>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {INVESTIGATION_COLUMNS} FROM task_investigations WHERE task_id = ?1 ORDER BY created_at ASC"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_investigations: {e}")))?;

        let mut investigations = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_investigation(&row) {
                Ok(inv) => investigations.push(inv),
                Err(e) => {
                    warn!("Skipping investigation row: {e}");
                }
            }
        }
        Ok(investigations)
    }

    async fn has_active_investigation(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT 1 FROM task_investigations WHERE task_id = ?1 AND status IN ('pending', 'in-progress') LIMIT 1",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("has_active_investigation: {e}")))?;

        match rows.next().await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(StoreError::Query(format!("has_active_investigation: {e}"))),
        }
    }

    // ── Snapshot ────────────────────────────────────────────────────

    async fn quest_snapshot(
        &self,
        quest_id: Uuid,
    ) -> Result<Option<QuestSnapshot>, StoreError> {
        let Some(quest) = self.get_quest(quest_id).await? else {
            return Ok(None);
        };

        let tasks = self.list_tasks(quest_id).await?;

        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT i.id, i.task_id, i.initiated_by_id, i.prompt, i.model_type, i.status, i.result, i.created_at, i.completed_at \
                 FROM task_investigations i JOIN tasks t ON i.task_id = t.id \
                 WHERE t.quest_id = ?1 ORDER BY i.created_at ASC",
                params![quest_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("quest_snapshot: {e}")))?;

        let mut investigations = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_investigation(&row) {
                Ok(inv) => investigations.push(inv),
                Err(e) => {
                    warn!("Skipping investigation row: {e}");
                }
            }
        }

        Ok(Some(QuestSnapshot {
            quest,
            tasks,
            investigations,
        }))
    }
}
