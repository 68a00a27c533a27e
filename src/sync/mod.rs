//! Client-side sync — adaptive polling and highlight reconciliation.

pub mod controller;
pub mod highlight;

pub use controller::{SyncController, SyncSignals};
pub use highlight::{HighlightTracker, TaskTab, resolve_active_tab};
