//! Quest data model — quests, tasks, investigations, and their status machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Quest lifecycle status.
///
/// Transitions move forward only, with one exception: `active → failed` when
/// decomposition fails terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestStatus {
    Draft,
    Active,
    Completed,
    Failed,
    Archived,
}

impl QuestStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: QuestStatus) -> bool {
        use QuestStatus::*;

        matches!(
            (self, target),
            (Draft, Active) | (Draft, Archived) |
            // Failed is the terminal exit for quests whose decomposition
            // fails for good, from either decomposable status
            (Draft, Failed) | (Active, Completed) | (Active, Failed) |
            (Completed, Archived) | (Failed, Archived)
        )
    }

    /// Whether a decompose job may still act on a quest in this status.
    pub fn is_decomposable(&self) -> bool {
        matches!(self, Self::Draft | Self::Active)
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Archived)
    }
}

impl std::fmt::Display for QuestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

/// Task lifecycle status.
///
/// `pending` means an investigation job has been enqueued for the task;
/// `in-progress` means a worker currently holds that job. Completion is a
/// user action, never an investigation side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Draft,
    Todo,
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Draft, Todo) |
            (Todo, Pending) | (Todo, InProgress) | (Todo, Completed) |
            (Pending, InProgress) | (Pending, Completed) |
            (InProgress, Completed)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Todo => "todo",
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Investigation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvestigationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl InvestigationStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: InvestigationStatus) -> bool {
        use InvestigationStatus::*;

        matches!(
            (self, target),
            (Pending, InProgress) | (Pending, Failed) |
            (InProgress, Completed) | (InProgress, Failed)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for InvestigationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A top-level user goal, decomposed into tasks by a background worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quest {
    /// Unique ID.
    pub id: Uuid,
    /// Short title.
    pub title: String,
    /// What the user wants to achieve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    /// Background the model should know about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Hard constraints on how the goal may be achieved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
    /// Lifecycle status.
    pub status: QuestStatus,
    /// Owner of this quest.
    pub owner_id: String,
    /// Whether the quest is visible to other users.
    pub is_public: bool,
    /// When the quest was created.
    pub created_at: DateTime<Utc>,
    /// When the quest was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Quest {
    /// Create a new draft quest.
    pub fn new(owner_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            goal: None,
            context: None,
            constraints: None,
            status: QuestStatus::Draft,
            owner_id: owner_id.into(),
            is_public: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set the goal description.
    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    /// Builder: set background context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Builder: set constraints.
    pub fn with_constraints(mut self, constraints: impl Into<String>) -> Self {
        self.constraints = Some(constraints.into());
        self
    }

    /// Builder: set the initial status.
    pub fn with_status(mut self, status: QuestStatus) -> Self {
        self.status = status;
        self
    }

    /// Builder: make the quest publicly visible.
    pub fn with_public(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }
}

/// A unit of work generated from a quest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique ID.
    pub id: Uuid,
    /// Owning quest (deletion cascades).
    pub quest_id: Uuid,
    /// Short title.
    pub title: String,
    /// Longer description of the work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Extra model-generated material (notes, suggestions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_content: Option<String>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Position within the quest's task list.
    pub order: i32,
}

impl Task {
    /// Create a new todo task.
    pub fn new(quest_id: Uuid, title: impl Into<String>, order: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            quest_id,
            title: title.into(),
            details: None,
            extra_content: None,
            status: TaskStatus::Todo,
            order,
        }
    }

    /// Builder: set details.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Builder: set extra content.
    pub fn with_extra_content(mut self, extra: impl Into<String>) -> Self {
        self.extra_content = Some(extra.into());
        self
    }
}

/// A user-requested, model-generated analysis of one task.
///
/// A task accumulates investigations over time; each is its own record with
/// its own lifecycle, distinct from the task's completion state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInvestigation {
    /// Unique ID.
    pub id: Uuid,
    /// Task under investigation.
    pub task_id: Uuid,
    /// User who requested the investigation.
    pub initiated_by_id: String,
    /// User-supplied prompt, if any; the worker builds a default otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Model requested for this investigation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    /// Lifecycle status.
    pub status: InvestigationStatus,
    /// Model-generated analysis, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// When the investigation was requested.
    pub created_at: DateTime<Utc>,
    /// When the investigation reached `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskInvestigation {
    /// Create a new pending investigation.
    pub fn new(task_id: Uuid, initiated_by_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            initiated_by_id: initiated_by_id.into(),
            prompt: None,
            model_type: None,
            status: InvestigationStatus::Pending,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Builder: set the user-supplied prompt.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Builder: set the requested model.
    pub fn with_model_type(mut self, model_type: impl Into<String>) -> Self {
        self.model_type = Some(model_type.into());
        self
    }
}
