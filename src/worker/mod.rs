//! Worker system — queue consumers that execute model jobs.
//!
//! Core components:
//! - `runner` — the consumer loop: claim, dispatch, ack/release
//! - `decompose` — turns a quest into an ordered set of tasks
//! - `investigate` — produces an analysis for a single task

pub mod decompose;
pub mod investigate;
pub mod runner;

pub use runner::{WorkerDeps, spawn_worker};
