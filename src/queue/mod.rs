//! Queue transport — durable, typed job submission and delivery.

pub mod durable;
pub mod payload;

pub use durable::{ClaimedJob, JobQueue};
pub use payload::JobPayload;

/// The single queue both job types travel on.
pub const QUEST_QUEUE: &str = "quests";
