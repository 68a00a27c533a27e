//! Job payload wire format.
//!
//! A discriminated union tagged by `type`. Payloads carry identifiers plus
//! the minimum context needed to build a prompt; workers re-read
//! authoritative state from the record store and never trust payload fields
//! for anything else.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::quests::Quest;

/// Queue job payload, one variant per job type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobPayload {
    /// Break a quest into tasks.
    #[serde(rename_all = "camelCase")]
    Decompose {
        quest_id: Uuid,
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        goal: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        constraints: Option<String>,
    },
    /// Investigate a single task.
    #[serde(rename_all = "camelCase")]
    InvestigateTask {
        investigation_id: Uuid,
        task_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
}

impl JobPayload {
    /// Decompose payload for a quest record.
    pub fn decompose(quest: &Quest) -> Self {
        Self::Decompose {
            quest_id: quest.id,
            title: quest.title.clone(),
            goal: quest.goal.clone(),
            context: quest.context.clone(),
            constraints: quest.constraints.clone(),
        }
    }

    /// Investigate payload for an investigation record.
    pub fn investigate(investigation_id: Uuid, task_id: Uuid, prompt: Option<String>) -> Self {
        Self::InvestigateTask {
            investigation_id,
            task_id,
            prompt,
        }
    }

    /// The wire `type` tag, for logging.
    pub fn job_type(&self) -> &'static str {
        match self {
            Self::Decompose { .. } => "decompose",
            Self::InvestigateTask { .. } => "investigate-task",
        }
    }
}
