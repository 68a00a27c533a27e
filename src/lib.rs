//! Questline — queue-backed quest decomposition pipeline.

pub mod api;
pub mod config;
pub mod error;
pub mod llm;
pub mod queue;
pub mod quests;
pub mod store;
pub mod sync;
pub mod worker;
