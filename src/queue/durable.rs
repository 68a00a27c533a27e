//! Durable job queue on the jobs table.
//!
//! FIFO per named queue, at-least-once delivery. A claim takes a lease
//! rather than removing the row; only `ack` deletes. If a worker dies
//! mid-job the lease expires and the job is redelivered to the next
//! claimer, so consumers must be idempotent.

use std::time::Duration;

use chrono::Utc;
use libsql::{Connection, params};
use rand::Rng;
use tracing::debug;

use crate::error::QueueError;
use crate::queue::payload::JobPayload;

/// Backoff cap for released jobs.
const MAX_BACKOFF_SECS: u64 = 60;

/// A job held under lease by a worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub payload: String,
    pub attempts: u32,
}

/// Durable queue handle. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct JobQueue {
    conn: Connection,
}

impl JobQueue {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Durably accept a job. Returns the job id once the row is written;
    /// acceptance says nothing about when (or whether) the job runs.
    pub async fn enqueue(&self, queue: &str, payload: &JobPayload) -> Result<i64, QueueError> {
        let body = serde_json::to_string(payload)
            .map_err(|e| QueueError::Payload(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO jobs (queue, payload, created_at) VALUES (?1, ?2, ?3)",
                params![queue, body, now],
            )
            .await
            .map_err(|e| QueueError::Enqueue {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let id = self.conn.last_insert_rowid();
        debug!(queue = %queue, job_id = id, job_type = payload.job_type(), "Job enqueued");
        Ok(id)
    }

    /// Claim the oldest ready job on `queue` under a lease, or None if no
    /// job is ready. A ready job is past its availability time and not
    /// held under an unexpired lease.
    pub async fn claim(
        &self,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        let now_ms = Utc::now().timestamp_millis();

        let mut rows = self
            .conn
            .query(
                "SELECT id, payload, attempts FROM jobs \
                 WHERE queue = ?1 AND available_at_ms <= ?2 \
                 AND (claim_expires_at_ms IS NULL OR claim_expires_at_ms <= ?2) \
                 ORDER BY id ASC LIMIT 1",
                params![queue, now_ms],
            )
            .await
            .map_err(|e| QueueError::Claim {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => {
                return Err(QueueError::Claim {
                    queue: queue.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let id: i64 = row.get(0).map_err(|e| QueueError::Claim {
            queue: queue.to_string(),
            reason: format!("job.id: {e}"),
        })?;
        let payload: String = row.get(1).map_err(|e| QueueError::Claim {
            queue: queue.to_string(),
            reason: format!("job.payload: {e}"),
        })?;
        let attempts: i64 = row.get(2).unwrap_or(0);

        // Take the lease only if nobody beat us to it
        let expires_at_ms = now_ms + lease.as_millis() as i64;
        let affected = self
            .conn
            .execute(
                "UPDATE jobs SET claim_expires_at_ms = ?1 WHERE id = ?2 \
                 AND (claim_expires_at_ms IS NULL OR claim_expires_at_ms <= ?3)",
                params![expires_at_ms, id, now_ms],
            )
            .await
            .map_err(|e| QueueError::Claim {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        if affected != 1 {
            return Ok(None);
        }

        debug!(queue = %queue, job_id = id, attempts, "Job claimed");
        Ok(Some(ClaimedJob {
            id,
            payload,
            attempts: attempts as u32,
        }))
    }

    /// Acknowledge a finished job, removing it from the queue. Acking a
    /// job that was already redelivered and acked elsewhere is a no-op.
    pub async fn ack(&self, id: i64) -> Result<(), QueueError> {
        self.conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .await
            .map_err(|e| QueueError::Ack {
                id,
                reason: e.to_string(),
            })?;

        debug!(job_id = id, "Job acked");
        Ok(())
    }

    /// Return a claimed job to the queue for retry after an exponential
    /// backoff with jitter.
    pub async fn release(&self, job: &ClaimedJob) -> Result<(), QueueError> {
        let attempts = job.attempts + 1;
        let base_secs = 2u64.pow(attempts.min(6)).min(MAX_BACKOFF_SECS);
        let jitter_ms = rand::thread_rng().gen_range(0..500);
        let delay_ms = base_secs * 1000 + jitter_ms;
        let available_at_ms = Utc::now().timestamp_millis() + delay_ms as i64;

        self.conn
            .execute(
                "UPDATE jobs SET claim_expires_at_ms = NULL, attempts = ?1, available_at_ms = ?2 WHERE id = ?3",
                params![attempts as i64, available_at_ms, job.id],
            )
            .await
            .map_err(|e| QueueError::Release {
                id: job.id,
                reason: e.to_string(),
            })?;

        debug!(job_id = job.id, attempts, delay_ms, "Job released for retry");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;
    use uuid::Uuid;

    async fn test_queue() -> (LibSqlStore, JobQueue) {
        let store = LibSqlStore::new_memory().await.unwrap();
        let queue = JobQueue::new(store.connection());
        (store, queue)
    }

    fn sample_payload() -> JobPayload {
        JobPayload::investigate(Uuid::new_v4(), Uuid::new_v4(), None)
    }

    #[tokio::test]
    async fn claim_on_empty_queue_returns_none() {
        let (_store, queue) = test_queue().await;
        let claimed = queue.claim("quests", Duration::from_secs(30)).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn jobs_are_delivered_oldest_first() {
        let (_store, queue) = test_queue().await;
        let first = queue.enqueue("quests", &sample_payload()).await.unwrap();
        let second = queue.enqueue("quests", &sample_payload()).await.unwrap();
        assert!(second > first);

        let a = queue
            .claim("quests", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let b = queue
            .claim("quests", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.id, first);
        assert_eq!(b.id, second);
    }

    #[tokio::test]
    async fn queues_are_isolated_by_name() {
        let (_store, queue) = test_queue().await;
        queue.enqueue("other", &sample_payload()).await.unwrap();

        let claimed = queue.claim("quests", Duration::from_secs(30)).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn leased_job_is_not_redelivered() {
        let (_store, queue) = test_queue().await;
        queue.enqueue("quests", &sample_payload()).await.unwrap();

        let first = queue.claim("quests", Duration::from_secs(30)).await.unwrap();
        assert!(first.is_some());
        let second = queue.claim("quests", Duration::from_secs(30)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let (_store, queue) = test_queue().await;
        let payload = sample_payload();
        queue.enqueue("quests", &payload).await.unwrap();

        // Zero-length lease expires immediately
        let first = queue
            .claim("quests", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let again = queue
            .claim("quests", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, first.id);

        // Expiry redelivers without counting an attempt; only release does
        assert_eq!(again.attempts, first.attempts);

        let back: JobPayload = serde_json::from_str(&again.payload).unwrap();
        assert_eq!(back, payload);
    }

    #[tokio::test]
    async fn ack_removes_the_job() {
        let (_store, queue) = test_queue().await;
        queue.enqueue("quests", &sample_payload()).await.unwrap();

        let job = queue
            .claim("quests", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        queue.ack(job.id).await.unwrap();

        let claimed = queue.claim("quests", Duration::from_secs(30)).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn release_defers_the_job_and_counts_the_attempt() {
        let (store, queue) = test_queue().await;
        queue.enqueue("quests", &sample_payload()).await.unwrap();

        let job = queue
            .claim("quests", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.attempts, 0);
        queue.release(&job).await.unwrap();

        // Backed off into the future, so not immediately claimable
        let claimed = queue.claim("quests", Duration::from_secs(30)).await.unwrap();
        assert!(claimed.is_none());

        let conn = store.connection();
        let mut rows = conn
            .query(
                "SELECT attempts, available_at_ms, claim_expires_at_ms FROM jobs WHERE id = ?1",
                params![job.id],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let attempts: i64 = row.get(0).unwrap();
        let available_at_ms: i64 = row.get(1).unwrap();
        let lease: Option<i64> = row.get(2).ok();

        assert_eq!(attempts, 1);
        assert!(available_at_ms > Utc::now().timestamp_millis());
        assert!(lease.is_none());
    }
}
