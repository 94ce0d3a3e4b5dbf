//! Groups: named, durable sets of tabs stored as folders under one root.

mod color;
mod convert;
mod manager;
mod prune;

use serde::{Deserialize, Serialize};

use crate::host::WindowId;

pub use color::{format_name, parse_name, Color};
pub use convert::{Converter, RecordDraft, TabSpec, ACTIVE_MARK, PINNED_MARK};
pub use manager::{GroupManager, Stores};
pub use prune::PruneReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    /// Bound to the queried window
    Open,
    /// Bound to another window
    Locked,
    Closed,
    /// The queried window's own tabs, not saved to any group
    Unsaved,
}

/// One row of [`GroupManager::list_groups`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub id: Option<String>,
    pub name: String,
    pub color: Option<Color>,
    pub size: Option<usize>,
    pub state: GroupState,
}

/// A window was bound to a group, unbound, or its group was recolored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingChanged {
    pub window_id: WindowId,
    pub group_id: Option<String>,
    pub name: Option<String>,
    pub color: Option<Color>,
}
