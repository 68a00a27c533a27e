//! Highlight-follows-task tab reconciliation.
//!
//! A highlighted task moves between the todo and completed collections as
//! server state refreshes. Whenever the highlight, the loading flag, or
//! either collection changes, the active tab switches to whichever
//! collection holds the highlighted task. No switch happens while a load is
//! in flight or when the id is in neither collection, so the view does not
//! flicker on stale intermediate states.

use uuid::Uuid;

/// The two task collections a view can show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTab {
    Todo,
    Completed,
}

/// Decide which tab should be active for the current highlight, if any
/// switch is warranted. Todo is checked first and wins if a task somehow
/// appears in both collections.
pub fn resolve_active_tab(
    highlighted: Option<Uuid>,
    todo_ids: &[Uuid],
    completed_ids: &[Uuid],
    loading: bool,
) -> Option<TaskTab> {
    if loading {
        return None;
    }
    let id = highlighted?;
    if todo_ids.contains(&id) {
        Some(TaskTab::Todo)
    } else if completed_ids.contains(&id) {
        Some(TaskTab::Completed)
    } else {
        None
    }
}

/// Carries the active tab across evaluations, keeping the previous tab
/// whenever no switch is warranted.
#[derive(Debug, Clone)]
pub struct HighlightTracker {
    active_tab: TaskTab,
}

impl HighlightTracker {
    pub fn new() -> Self {
        Self {
            active_tab: TaskTab::Todo,
        }
    }

    pub fn active_tab(&self) -> TaskTab {
        self.active_tab
    }

    /// Re-run reconciliation against fresh state and return the tab the
    /// view should now show.
    pub fn evaluate(
        &mut self,
        highlighted: Option<Uuid>,
        todo_ids: &[Uuid],
        completed_ids: &[Uuid],
        loading: bool,
    ) -> TaskTab {
        if let Some(tab) = resolve_active_tab(highlighted, todo_ids, completed_ids, loading) {
            self.active_tab = tab;
        }
        self.active_tab
    }
}

impl Default for HighlightTracker {
    fn default() -> Self {
        Self::new()
    }
}
