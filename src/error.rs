//! Error types for Questline.

use std::time::Duration;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Record store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Queue transport errors. Enqueue failures surface to the producer loudly;
/// nothing on this path is silently dropped.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Enqueue to {queue} failed: {reason}")]
    Enqueue { queue: String, reason: String },

    #[error("Claim on {queue} failed: {reason}")]
    Claim { queue: String, reason: String },

    #[error("Ack for job {id} failed: {reason}")]
    Ack { id: i64, reason: String },

    #[error("Release for job {id} failed: {reason}")]
    Release { id: i64, reason: String },

    #[error("Malformed payload: {0}")]
    Payload(String),
}

/// Model provider errors, split into retryable and terminal kinds.
///
/// Retryable errors propagate out of a worker so the queue redelivers the
/// job; terminal errors make the worker write a `failed` status and ack.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} timed out")]
    Timeout { provider: String },

    #[error("Provider {provider} unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("Invalid request to {provider}: {reason}")]
    InvalidRequest { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

impl ModelError {
    /// Whether the queue should redeliver the job after this error.
    ///
    /// Timeouts, rate limits and transient transport failures are worth a
    /// retry; a request the provider rejected as malformed never will be.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModelError::RateLimited { .. }
                | ModelError::Timeout { .. }
                | ModelError::Unavailable { .. }
                | ModelError::RequestFailed { .. }
        )
    }
}

/// Model output parse errors.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid JSON in model output: {0}")]
    InvalidJson(String),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
