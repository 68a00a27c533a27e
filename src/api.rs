//! REST endpoints for quest submission and polling.
//!
//! The producer side of the pipeline: creating a quest enqueues its
//! decompose job, requesting an investigation enqueues an investigate-task
//! job, and the snapshot read is the poll target for clients. Enqueue
//! failures are loud; a job that cannot be submitted fails the request and
//! the owning record is marked failed rather than left silently stuck.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::queue::{JobPayload, JobQueue, QUEST_QUEUE};
use crate::quests::{Quest, QuestStatus, TaskInvestigation, TaskStatus};
use crate::store::RecordStore;

/// Shared state for API routes.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn RecordStore>,
    pub queue: JobQueue,
}

/// Build the Axum router for the quest API.
pub fn api_routes(store: Arc<dyn RecordStore>, queue: JobQueue) -> Router {
    let state = ApiState { store, queue };

    Router::new()
        .route("/health", get(health))
        .route("/api/quests", post(create_quest))
        .route("/api/quests/{id}", get(get_quest))
        .route("/api/tasks/{id}/investigations", post(create_investigation))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "service": "questline"
        })),
    )
}

fn default_owner() -> String {
    "local".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateQuestRequest {
    title: String,
    #[serde(default)]
    goal: Option<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    constraints: Option<String>,
    #[serde(default = "default_owner")]
    owner_id: String,
    #[serde(default)]
    is_public: bool,
}

/// POST /api/quests
///
/// Insert an active quest and enqueue its decompose job. Returns 502 when
/// the job cannot be submitted; the quest is then marked failed so it does
/// not sit active with no worker ever coming.
async fn create_quest(
    State(state): State<ApiState>,
    Json(body): Json<CreateQuestRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let title = body.title.trim();
    if title.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Quest title must not be empty"})),
        );
    }

    let mut quest = Quest::new(body.owner_id, title)
        .with_status(QuestStatus::Active)
        .with_public(body.is_public);
    if let Some(goal) = body.goal {
        quest = quest.with_goal(goal);
    }
    if let Some(context) = body.context {
        quest = quest.with_context(context);
    }
    if let Some(constraints) = body.constraints {
        quest = quest.with_constraints(constraints);
    }

    if let Err(e) = state.store.insert_quest(&quest).await {
        error!(error = %e, "Failed to insert quest");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "Failed to store quest"})),
        );
    }

    let payload = JobPayload::decompose(&quest);
    if let Err(e) = state.queue.enqueue(QUEST_QUEUE, &payload).await {
        error!(quest_id = %quest.id, error = %e, "Failed to enqueue decompose job");
        if let Err(e) = state
            .store
            .transition_quest_status(quest.id, QuestStatus::Active, QuestStatus::Failed)
            .await
        {
            error!(quest_id = %quest.id, error = %e, "Failed to mark quest failed");
        }
        return (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"error": "Failed to submit decompose job"})),
        );
    }

    info!(quest_id = %quest.id, title = %quest.title, "Quest created");
    (StatusCode::CREATED, Json(serde_json::json!(quest)))
}

/// GET /api/quests/{id}
///
/// One-read snapshot of a quest with its tasks and their investigations.
async fn get_quest(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let quest_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid quest ID"})),
            );
        }
    };

    match state.store.quest_snapshot(quest_id).await {
        Ok(Some(snapshot)) => (StatusCode::OK, Json(serde_json::json!(snapshot))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Quest not found"})),
        ),
        Err(e) => {
            error!(quest_id = %quest_id, error = %e, "Failed to read quest snapshot");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to read quest"})),
            )
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateInvestigationRequest {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    model_type: Option<String>,
    #[serde(default = "default_owner")]
    initiated_by_id: String,
}

/// POST /api/tasks/{id}/investigations
///
/// Create a pending investigation for a task and enqueue its job. One
/// active investigation per task: a second request while one is pending or
/// in-progress gets 409. Multiple settled investigations accumulate as
/// history.
async fn create_investigation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<CreateInvestigationRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let task_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid task ID"})),
            );
        }
    };

    let task = match state.store.get_task(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": "Task not found"})),
            );
        }
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Failed to read task");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to read task"})),
            );
        }
    };

    match state.store.has_active_investigation(task.id).await {
        Ok(true) => {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({"error": "Task already has an active investigation"})),
            );
        }
        Ok(false) => {}
        Err(e) => {
            error!(task_id = %task.id, error = %e, "Failed to check active investigations");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to read task"})),
            );
        }
    }

    let mut investigation = TaskInvestigation::new(task.id, body.initiated_by_id);
    if let Some(prompt) = body.prompt {
        investigation = investigation.with_prompt(prompt);
    }
    if let Some(model_type) = body.model_type {
        investigation = investigation.with_model_type(model_type);
    }

    if let Err(e) = state.store.insert_investigation(&investigation).await {
        error!(task_id = %task.id, error = %e, "Failed to insert investigation");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "Failed to store investigation"})),
        );
    }

    // Only a todo task moves to pending here; anything further along keeps
    // its status, which is fine for re-investigation of a completed task
    match state
        .store
        .transition_task_status(task.id, TaskStatus::Todo, TaskStatus::Pending)
        .await
    {
        Ok(_) => {}
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "Failed to mark task pending");
        }
    }

    let payload = JobPayload::investigate(
        investigation.id,
        task.id,
        investigation.prompt.clone(),
    );
    if let Err(e) = state.queue.enqueue(QUEST_QUEUE, &payload).await {
        error!(investigation_id = %investigation.id, error = %e, "Failed to enqueue investigate job");
        if let Err(e) = state.store.fail_investigation(investigation.id).await {
            error!(investigation_id = %investigation.id, error = %e, "Failed to mark investigation failed");
        }
        return (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"error": "Failed to submit investigate job"})),
        );
    }

    info!(
        investigation_id = %investigation.id,
        task_id = %task.id,
        "Investigation requested"
    );
    (
        StatusCode::CREATED,
        Json(serde_json::json!(investigation)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    use crate::quests::InvestigationStatus;
    use crate::store::LibSqlStore;

    async fn test_app() -> (Arc<LibSqlStore>, Router) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let queue = JobQueue::new(store.connection());
        let app = api_routes(store.clone(), queue);
        (store, app)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn queue_depth(store: &LibSqlStore) -> i64 {
        let conn = store.connection();
        let mut rows = conn
            .query("SELECT COUNT(*) FROM jobs", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get::<i64>(0).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (_store, app) = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_quest_stores_record_and_enqueues_job() {
        let (store, app) = test_app().await;

        let response = app
            .oneshot(post_json(
                "/api/quests",
                serde_json::json!({
                    "title": "Learn blacksmithing",
                    "goal": "Forge a usable knife",
                    "ownerId": "user-1"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response_json(response).await;
        assert_eq!(body["title"], "Learn blacksmithing");
        assert_eq!(body["status"], "active");
        assert_eq!(body["ownerId"], "user-1");

        let quest_id = Uuid::parse_str(body["id"].as_str().unwrap()).unwrap();
        let stored = store.get_quest(quest_id).await.unwrap().unwrap();
        assert_eq!(stored.status, QuestStatus::Active);
        assert_eq!(queue_depth(&store).await, 1);
    }

    #[tokio::test]
    async fn create_quest_rejects_blank_title() {
        let (store, app) = test_app().await;

        let response = app
            .oneshot(post_json(
                "/api/quests",
                serde_json::json!({"title": "   "}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(queue_depth(&store).await, 0);
    }

    #[tokio::test]
    async fn snapshot_returns_quest_with_tasks() {
        let (store, app) = test_app().await;

        let quest = Quest::new("user-1", "Plant a garden").with_status(QuestStatus::Active);
        store.insert_quest(&quest).await.unwrap();
        let tasks = vec![
            crate::quests::Task::new(quest.id, "Clear the beds", 0),
            crate::quests::Task::new(quest.id, "Buy seeds", 1),
        ];
        store.insert_decomposed_tasks(quest.id, &tasks).await.unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/quests/{}", quest.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["quest"]["title"], "Plant a garden");
        assert_eq!(body["tasks"].as_array().unwrap().len(), 2);
        assert_eq!(body["tasks"][0]["title"], "Clear the beds");
        assert_eq!(body["investigations"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn snapshot_of_unknown_quest_is_404() {
        let (_store, app) = test_app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/quests/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_quest_id_is_400() {
        let (_store, app) = test_app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/quests/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn investigation_request_marks_task_pending_and_enqueues() {
        let (store, app) = test_app().await;

        let quest = Quest::new("user-1", "Q").with_status(QuestStatus::Active);
        store.insert_quest(&quest).await.unwrap();
        let task = crate::quests::Task::new(quest.id, "Research options", 0);
        store
            .insert_decomposed_tasks(quest.id, std::slice::from_ref(&task))
            .await
            .unwrap();

        let response = app
            .oneshot(post_json(
                &format!("/api/tasks/{}/investigations", task.id),
                serde_json::json!({"prompt": "What are the tradeoffs?"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response_json(response).await;
        assert_eq!(body["status"], "pending");
        assert_eq!(body["prompt"], "What are the tradeoffs?");

        let stored_task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored_task.status, TaskStatus::Pending);
        assert_eq!(queue_depth(&store).await, 1);

        let inv_id = Uuid::parse_str(body["id"].as_str().unwrap()).unwrap();
        let stored = store.get_investigation(inv_id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvestigationStatus::Pending);
    }

    #[tokio::test]
    async fn second_active_investigation_is_rejected() {
        let (store, app) = test_app().await;

        let quest = Quest::new("user-1", "Q").with_status(QuestStatus::Active);
        store.insert_quest(&quest).await.unwrap();
        let task = crate::quests::Task::new(quest.id, "T", 0);
        store
            .insert_decomposed_tasks(quest.id, std::slice::from_ref(&task))
            .await
            .unwrap();

        let uri = format!("/api/tasks/{}/investigations", task.id);
        let first = app
            .clone()
            .oneshot(post_json(&uri, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .oneshot(post_json(&uri, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(queue_depth(&store).await, 1);
    }

    #[tokio::test]
    async fn investigation_for_unknown_task_is_404() {
        let (store, app) = test_app().await;

        let response = app
            .oneshot(post_json(
                &format!("/api/tasks/{}/investigations", Uuid::new_v4()),
                serde_json::json!({}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(queue_depth(&store).await, 0);
    }
}
