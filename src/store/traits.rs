//! `RecordStore` trait — single async interface for quest persistence.
//!
//! Workers and the HTTP layer consume this trait behind `Arc<dyn RecordStore>`
//! so tests can swap in an in-memory backend. Every status-changing operation
//! is a guarded conditional write: it names the status it expects to find and
//! reports whether the write landed, which is what makes redelivered jobs
//! safe to replay.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::quests::{
    InvestigationStatus, Quest, QuestStatus, Task, TaskInvestigation, TaskStatus,
};

/// Everything a polling client needs about one quest in a single read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestSnapshot {
    pub quest: Quest,
    pub tasks: Vec<Task>,
    pub investigations: Vec<TaskInvestigation>,
}

/// Backend-agnostic record store covering quests, tasks, and investigations.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // ── Quests ──────────────────────────────────────────────────────

    /// Insert a new quest.
    async fn insert_quest(&self, quest: &Quest) -> Result<(), StoreError>;

    /// Get a quest by ID.
    async fn get_quest(&self, id: Uuid) -> Result<Option<Quest>, StoreError>;

    /// Move a quest from `from` to `to`. Returns false if the quest was not
    /// in `from` at write time (someone else got there first).
    async fn transition_quest_status(
        &self,
        id: Uuid,
        from: QuestStatus,
        to: QuestStatus,
    ) -> Result<bool, StoreError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Persist a decomposition result: all tasks or none, in one atomic
    /// write, guarded on the quest still being decomposable with no tasks
    /// yet. Returns false if the guard failed and nothing was written.
    async fn insert_decomposed_tasks(
        &self,
        quest_id: Uuid,
        tasks: &[Task],
    ) -> Result<bool, StoreError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// All tasks of a quest, in decomposition order.
    async fn list_tasks(&self, quest_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Move a task from `from` to `to`. Returns false if the task was not in
    /// `from` at write time.
    async fn transition_task_status(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool, StoreError>;

    /// Mark a task in-progress while a worker holds its investigation job.
    /// Only `todo` and `pending` tasks are eligible; returns false otherwise.
    async fn mark_task_in_progress(&self, id: Uuid) -> Result<bool, StoreError>;

    // ── Investigations ──────────────────────────────────────────────

    /// Insert a new investigation.
    async fn insert_investigation(&self, inv: &TaskInvestigation) -> Result<(), StoreError>;

    /// Get an investigation by ID.
    async fn get_investigation(
        &self,
        id: Uuid,
    ) -> Result<Option<TaskInvestigation>, StoreError>;

    /// Move an investigation from `from` to `to`. Returns false if it was
    /// not in `from` at write time.
    async fn transition_investigation_status(
        &self,
        id: Uuid,
        from: InvestigationStatus,
        to: InvestigationStatus,
    ) -> Result<bool, StoreError>;

    /// Store a result and mark the investigation completed with a completion
    /// timestamp. Only an `in-progress` investigation can complete.
    async fn complete_investigation(&self, id: Uuid, result: &str) -> Result<bool, StoreError>;

    /// Mark an investigation failed. Pending and in-progress investigations
    /// are eligible; terminal ones are left alone.
    async fn fail_investigation(&self, id: Uuid) -> Result<bool, StoreError>;

    /// All investigations of a task, oldest first.
    async fn list_investigations(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<TaskInvestigation>, StoreError>;

    /// Whether the task has a pending or in-progress investigation. Producer
    /// policy uses this to refuse double-enqueue; the core does not.
    async fn has_active_investigation(&self, task_id: Uuid) -> Result<bool, StoreError>;

    // ── Snapshot ────────────────────────────────────────────────────

    /// One-read view of a quest with its tasks and their investigations,
    /// the poll target for clients.
    async fn quest_snapshot(&self, quest_id: Uuid)
    -> Result<Option<QuestSnapshot>, StoreError>;
}
