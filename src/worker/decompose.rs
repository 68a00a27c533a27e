//! Decomposition handler — asks the model to break a quest into tasks.
//!
//! Redelivery-safe: the quest is re-read before any work, and the bulk task
//! write is guarded on the quest still being decomposable with no tasks, so
//! running the same job twice cannot duplicate anything.

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::llm::parse::parse_model_output;
use crate::llm::provider::{ChatMessage, CompletionRequest};
use crate::quests::{Quest, QuestStatus, Task};
use crate::worker::runner::WorkerDeps;

const DECOMPOSE_TEMPERATURE: f32 = 0.4;
const DECOMPOSE_MAX_TOKENS: u32 = 2048;

/// Run one decompose job to completion.
///
/// Retryable model failures propagate so the queue redelivers; terminal
/// failures mark the quest `failed` and return Ok so the job is acked.
pub async fn handle(
    deps: &WorkerDeps,
    quest_id: Uuid,
    title: &str,
    goal: Option<&str>,
    context: Option<&str>,
    constraints: Option<&str>,
) -> Result<()> {
    // Re-read authoritative state; payload fields only feed the prompt
    let Some(quest) = deps.store.get_quest(quest_id).await? else {
        warn!(quest_id = %quest_id, "Decompose job for unknown quest, skipping");
        return Ok(());
    };
    if !quest.status.is_decomposable() {
        info!(quest_id = %quest_id, status = %quest.status, "Quest no longer decomposable, skipping");
        return Ok(());
    }
    if !deps.store.list_tasks(quest_id).await?.is_empty() {
        info!(quest_id = %quest_id, "Quest already has tasks, skipping redelivered job");
        return Ok(());
    }

    let request = decompose_request(title, goal, context, constraints);

    let response = match deps.provider.complete(request).await {
        Ok(response) => response,
        Err(e) if e.is_retryable() => return Err(e.into()),
        Err(e) => {
            warn!(quest_id = %quest_id, error = %e, "Model rejected decomposition request");
            mark_quest_failed(deps, &quest).await?;
            return Ok(());
        }
    };

    let parsed = match parse_model_output(&response.content) {
        Ok(value) => value,
        Err(e) => {
            warn!(quest_id = %quest_id, error = %e, "Unparseable decomposition output");
            mark_quest_failed(deps, &quest).await?;
            return Ok(());
        }
    };

    let tasks = tasks_from_value(quest_id, &parsed);
    if tasks.is_empty() {
        warn!(quest_id = %quest_id, "Model produced no usable tasks");
        mark_quest_failed(deps, &quest).await?;
        return Ok(());
    }

    let written = deps.store.insert_decomposed_tasks(quest_id, &tasks).await?;
    if written {
        info!(quest_id = %quest_id, count = tasks.len(), "Quest decomposed");
    } else {
        // A concurrent delivery won the write race
        info!(quest_id = %quest_id, "Decomposition write skipped, quest already handled");
    }
    Ok(())
}

async fn mark_quest_failed(deps: &WorkerDeps, quest: &Quest) -> Result<()> {
    let moved = deps
        .store
        .transition_quest_status(quest.id, quest.status, QuestStatus::Failed)
        .await?;
    if !moved {
        warn!(quest_id = %quest.id, "Quest status changed mid-job, failed mark skipped");
    }
    Ok(())
}

fn decompose_request(
    title: &str,
    goal: Option<&str>,
    context: Option<&str>,
    constraints: Option<&str>,
) -> CompletionRequest {
    let system_prompt = "You are a quest planner. Given a person's high-level goal, break it \
         into 3-10 concrete, ordered tasks they can work through one at a time.\n\n\
         Rules:\n\
         - Each task is a single actionable step\n\
         - Order tasks so earlier ones unblock later ones\n\
         - Keep titles short; put specifics in details\n\n\
         Respond with a JSON array of objects, each with:\n\
         - \"title\": short task name\n\
         - \"details\": 1-3 sentences on how to approach it\n\n\
         Example output:\n\
         [{\"title\": \"Pick a course platform\", \"details\": \"Compare two or three options and pick one.\"}]\n\n\
         ONLY output the JSON array. No other text.";

    let mut user_prompt = format!("Quest: {title}");
    if let Some(goal) = goal {
        user_prompt.push_str(&format!("\nGoal: {goal}"));
    }
    if let Some(context) = context {
        user_prompt.push_str(&format!("\nContext: {context}"));
    }
    if let Some(constraints) = constraints {
        user_prompt.push_str(&format!("\nConstraints: {constraints}"));
    }

    CompletionRequest::new(vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user(user_prompt),
    ])
    .with_temperature(DECOMPOSE_TEMPERATURE)
    .with_max_tokens(DECOMPOSE_MAX_TOKENS)
}

/// One task-like entry from the model.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskDraft {
    title: Option<String>,
    details: Option<String>,
    extra_content: Option<String>,
}

/// Turn parsed model output into ordered task records, dropping entries
/// without a usable title.
fn tasks_from_value(quest_id: Uuid, value: &Value) -> Vec<Task> {
    let Some(entries) = value.as_array() else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| serde_json::from_value::<TaskDraft>(entry.clone()).ok())
        .filter_map(|draft| {
            let title = draft.title?.trim().to_string();
            if title.is_empty() {
                return None;
            }
            Some((title, draft.details, draft.extra_content))
        })
        .enumerate()
        .map(|(i, (title, details, extra_content))| {
            let mut task = Task::new(quest_id, title, i as i32);
            task.details = details;
            task.extra_content = extra_content;
            task
        })
        .collect()
}
