//! Worker consumer loop — claims jobs, dispatches by type, settles them.
//!
//! Each worker is an independent consumer; any number may run against the
//! same queue. A handled job is acked; a retryably-failed job is released
//! back with backoff; a job whose payload cannot be read is dropped so one
//! bad message can never wedge the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::llm::ModelProvider;
use crate::queue::{ClaimedJob, JobPayload, JobQueue, QUEST_QUEUE};
use crate::store::RecordStore;
use crate::worker::{decompose, investigate};

/// Default pause between claim attempts when the queue is empty.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long a claimed job stays leased before redelivery. Long enough to
/// cover a slow model call.
const JOB_LEASE: Duration = Duration::from_secs(300);

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn RecordStore>,
    pub queue: JobQueue,
    pub provider: Arc<dyn ModelProvider>,
}

/// Spawn a background consumer that pulls jobs off the quest queue.
///
/// Returns a `JoinHandle` and shutdown flag. Setting the flag stops the
/// loop at the next claim attempt; a job already in flight finishes first.
pub fn spawn_worker(
    worker_id: usize,
    deps: WorkerDeps,
    poll_interval: Option<Duration>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let poll_interval = poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL);

    let handle = tokio::spawn(async move {
        info!(worker_id, "Quest worker started");

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!(worker_id, "Quest worker shutting down");
                return;
            }

            match deps.queue.claim(QUEST_QUEUE, JOB_LEASE).await {
                Ok(Some(job)) => {
                    handle_job(worker_id, &deps, job).await;
                }
                Ok(None) => {
                    tokio::time::sleep(poll_interval).await;
                }
                Err(e) => {
                    error!(worker_id, error = %e, "Job claim failed");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    });

    (handle, shutdown_flag)
}

/// Run one claimed job to a settled state: acked, or released for retry.
async fn handle_job(worker_id: usize, deps: &WorkerDeps, job: ClaimedJob) {
    let payload: JobPayload = match serde_json::from_str(&job.payload) {
        Ok(payload) => payload,
        Err(e) => {
            // Unknown or malformed job types must not crash the consumer
            // loop, and redelivering them would never help
            warn!(worker_id, job_id = job.id, error = %e, "Dropping unreadable job payload");
            ack_job(worker_id, deps, job.id).await;
            return;
        }
    };

    let job_type = payload.job_type();
    debug!(worker_id, job_id = job.id, job_type, attempts = job.attempts, "Job picked up");

    let result = match payload {
        JobPayload::Decompose {
            quest_id,
            title,
            goal,
            context,
            constraints,
        } => {
            decompose::handle(
                deps,
                quest_id,
                &title,
                goal.as_deref(),
                context.as_deref(),
                constraints.as_deref(),
            )
            .await
        }
        JobPayload::InvestigateTask {
            investigation_id,
            task_id,
            prompt,
        } => investigate::handle(deps, investigation_id, task_id, prompt.as_deref()).await,
    };

    match result {
        Ok(()) => {
            ack_job(worker_id, deps, job.id).await;
        }
        Err(err) if is_retryable(&err) => {
            warn!(
                worker_id,
                job_id = job.id,
                job_type,
                error = %err,
                "Job failed, scheduling redelivery"
            );
            if let Err(e) = deps.queue.release(&job).await {
                error!(worker_id, job_id = job.id, error = %e, "Failed to release job");
            }
        }
        Err(err) => {
            // Terminal paths record their own failed status; landing here
            // means even that write did not go through
            error!(worker_id, job_id = job.id, job_type, error = %err, "Job failed terminally");
            ack_job(worker_id, deps, job.id).await;
        }
    }
}

async fn ack_job(worker_id: usize, deps: &WorkerDeps, job_id: i64) {
    if let Err(e) = deps.queue.ack(job_id).await {
        error!(worker_id, job_id, error = %e, "Failed to ack job");
    }
}

/// Whether redelivery could plausibly succeed where this attempt failed.
fn is_retryable(err: &Error) -> bool {
    match err {
        Error::Model(e) => e.is_retryable(),
        // Infrastructure hiccups: retry rather than lose the job
        Error::Store(_) | Error::Queue(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use libsql::params;

    use crate::error::ModelError;
    use crate::llm::provider::{CompletionRequest, CompletionResponse};
    use crate::quests::{Quest, QuestStatus};
    use crate::store::LibSqlStore;

    struct MockProvider {
        content: String,
    }

    #[async_trait]
    impl ModelProvider for MockProvider {
        fn model_name(&self) -> &str {
            "mock"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, ModelError> {
            Ok(CompletionResponse {
                content: self.content.clone(),
                input_tokens: 0,
                output_tokens: 0,
            })
        }
    }

    async fn test_deps(content: &str) -> (Arc<LibSqlStore>, WorkerDeps) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let queue = JobQueue::new(store.connection());
        let deps = WorkerDeps {
            store: store.clone(),
            queue,
            provider: Arc::new(MockProvider {
                content: content.to_string(),
            }),
        };
        (store, deps)
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("Condition not reached in time");
    }

    #[tokio::test]
    async fn worker_drains_a_decompose_job() {
        let (store, deps) = test_deps(r#"[{"title": "First step"}, {"title": "Second step"}]"#)
            .await;

        let quest = Quest::new("user-1", "Plant a garden").with_status(QuestStatus::Active);
        store.insert_quest(&quest).await.unwrap();
        deps.queue
            .enqueue(QUEST_QUEUE, &JobPayload::decompose(&quest))
            .await
            .unwrap();

        let (handle, shutdown) =
            spawn_worker(0, deps.clone(), Some(Duration::from_millis(10)));

        let check_store = store.clone();
        let quest_id = quest.id;
        wait_for(|| {
            let store = check_store.clone();
            async move { store.list_tasks(quest_id).await.unwrap().len() == 2 }
        })
        .await;

        shutdown.store(true, Ordering::Relaxed);
        handle.await.unwrap();

        // Job acked, nothing left to claim
        let leftover = deps
            .queue
            .claim(QUEST_QUEUE, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(leftover.is_none());
    }

    #[tokio::test]
    async fn unreadable_payload_is_dropped_and_loop_survives() {
        let (store, deps) = test_deps(r#"[{"title": "Only task"}]"#).await;

        // A payload with an unknown type lands on the queue, bypassing the
        // typed enqueue path
        let conn = store.connection();
        conn.execute(
            "INSERT INTO jobs (queue, payload, created_at) VALUES (?1, ?2, ?3)",
            params![
                QUEST_QUEUE,
                r#"{"type":"mint-badge","badgeId":"b1"}"#,
                Utc::now().to_rfc3339(),
            ],
        )
        .await
        .unwrap();

        let quest = Quest::new("user-1", "Fix the fence").with_status(QuestStatus::Active);
        store.insert_quest(&quest).await.unwrap();
        deps.queue
            .enqueue(QUEST_QUEUE, &JobPayload::decompose(&quest))
            .await
            .unwrap();

        let (handle, shutdown) =
            spawn_worker(0, deps.clone(), Some(Duration::from_millis(10)));

        // The good job behind the bad one still gets processed
        let check_store = store.clone();
        let quest_id = quest.id;
        wait_for(|| {
            let store = check_store.clone();
            async move { !store.list_tasks(quest_id).await.unwrap().is_empty() }
        })
        .await;

        shutdown.store(true, Ordering::Relaxed);
        handle.await.unwrap();

        let leftover = deps
            .queue
            .claim(QUEST_QUEUE, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(leftover.is_none());
    }

    #[tokio::test]
    async fn decompose_job_for_missing_quest_is_acked() {
        let (store, deps) = test_deps("[]").await;

        let ghost = Quest::new("user-1", "Ghost quest");
        deps.queue
            .enqueue(QUEST_QUEUE, &JobPayload::decompose(&ghost))
            .await
            .unwrap();

        let (handle, shutdown) =
            spawn_worker(0, deps.clone(), Some(Duration::from_millis(10)));

        // Acked jobs are deleted outright
        let conn = store.connection();
        wait_for(|| {
            let conn = conn.clone();
            async move {
                let mut rows = conn
                    .query("SELECT COUNT(*) FROM jobs", ())
                    .await
                    .unwrap();
                let row = rows.next().await.unwrap().unwrap();
                row.get::<i64>(0).unwrap() == 0
            }
        })
        .await;

        shutdown.store(true, Ordering::Relaxed);
        handle.await.unwrap();
    }
}
