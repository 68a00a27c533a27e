//! Quest domain — records and status state machines.

pub mod model;

pub use model::{
    InvestigationStatus, Quest, QuestStatus, Task, TaskInvestigation, TaskStatus,
};
