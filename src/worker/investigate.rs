//! Investigation handler — asks the model to analyze one task.
//!
//! The investigation record owns the outcome; the task only tracks that a
//! worker is on it. An investigation failing never reverts the task, so the
//! user can retry with a fresh investigation.

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::llm::parse::parse_model_output;
use crate::llm::provider::{ChatMessage, CompletionRequest};
use crate::quests::{InvestigationStatus, Task, TaskInvestigation};
use crate::worker::runner::WorkerDeps;

const INVESTIGATE_TEMPERATURE: f32 = 0.3;
const INVESTIGATE_MAX_TOKENS: u32 = 1024;

/// Run one investigate-task job to completion.
///
/// Retryable model failures propagate with the investigation left
/// `in-progress` for the redelivery to pick up; terminal failures mark it
/// `failed` and return Ok so the job is acked.
pub async fn handle(
    deps: &WorkerDeps,
    investigation_id: Uuid,
    task_id: Uuid,
    payload_prompt: Option<&str>,
) -> Result<()> {
    let Some(investigation) = deps.store.get_investigation(investigation_id).await? else {
        warn!(investigation_id = %investigation_id, "Job for unknown investigation, skipping");
        return Ok(());
    };
    if investigation.status.is_terminal() {
        info!(
            investigation_id = %investigation_id,
            status = %investigation.status,
            "Investigation already settled, skipping redelivered job"
        );
        return Ok(());
    }

    // First delivery moves pending → in-progress; a redelivery after a
    // crash finds in-progress and just runs again
    if investigation.status == InvestigationStatus::Pending {
        let started = deps
            .store
            .transition_investigation_status(
                investigation_id,
                InvestigationStatus::Pending,
                InvestigationStatus::InProgress,
            )
            .await?;
        if !started {
            info!(investigation_id = %investigation_id, "Another delivery took this investigation, skipping");
            return Ok(());
        }
    }

    // Claim on every delivery: the write is guarded on an open task status,
    // and a crash between the status walk and the claim heals on redelivery
    deps.store.mark_task_in_progress(task_id).await?;

    let task = deps.store.get_task(task_id).await?;
    let request = investigate_request(&investigation, task.as_ref(), payload_prompt);

    let response = match deps.provider.complete(request).await {
        Ok(response) => response,
        Err(e) if e.is_retryable() => return Err(e.into()),
        Err(e) => {
            warn!(investigation_id = %investigation_id, error = %e, "Model rejected investigation request");
            deps.store.fail_investigation(investigation_id).await?;
            return Ok(());
        }
    };

    match parse_model_output(&response.content) {
        Ok(value) => {
            let result = value.to_string();
            let completed = deps
                .store
                .complete_investigation(investigation_id, &result)
                .await?;
            if completed {
                info!(investigation_id = %investigation_id, task_id = %task_id, "Investigation completed");
            } else {
                warn!(investigation_id = %investigation_id, "Investigation settled elsewhere, result dropped");
            }
        }
        Err(e) => {
            warn!(investigation_id = %investigation_id, error = %e, "Unparseable investigation output");
            deps.store.fail_investigation(investigation_id).await?;
        }
    }
    Ok(())
}

fn investigate_request(
    investigation: &TaskInvestigation,
    task: Option<&Task>,
    payload_prompt: Option<&str>,
) -> CompletionRequest {
    let system_prompt = "You are a research assistant. Investigate the task below and report \
         what the person should know before working on it.\n\n\
         Respond with a JSON object with:\n\
         - \"summary\": one-sentence answer\n\
         - \"details\": a short paragraph of analysis\n\
         - \"suggestions\": array of concrete next steps\n\n\
         ONLY output the JSON object. No other text.";

    let mut user_prompt = String::new();
    if let Some(task) = task {
        user_prompt.push_str(&format!("Task: {}\n", task.title));
        if let Some(details) = &task.details {
            user_prompt.push_str(&format!("Details: {details}\n"));
        }
    }
    // Stored prompt is authoritative; the payload copy is a fallback
    match investigation.prompt.as_deref().or(payload_prompt) {
        Some(focus) => user_prompt.push_str(&format!("Question: {focus}")),
        None => user_prompt.push_str("Question: What should I know before starting this task?"),
    }

    let mut request = CompletionRequest::new(vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user(user_prompt),
    ])
    .with_temperature(INVESTIGATE_TEMPERATURE)
    .with_max_tokens(INVESTIGATE_MAX_TOKENS);

    if let Some(model) = &investigation.model_type {
        request = request.with_model(model.clone());
    }
    request
}
