//! The browser host: live windows and tabs, per-window session storage and
//! the lifecycle events the rest of the crate reacts to.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

pub use memory::MemoryHost;

pub type WindowId = u64;
pub type TabId = u64;

/// A live tab as reported by the host
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostTab {
    pub id: TabId,
    pub window_id: WindowId,
    pub index: usize,
    pub title: String,
    pub url: String,
    pub active: bool,
    pub pinned: bool,
    pub discarded: bool,
    pub fav_icon_url: Option<String>,
    pub cookie_store_id: Option<String>,
}

/// Tab creation request. `url: None` opens the host's default page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateTab {
    pub window_id: WindowId,
    pub url: Option<String>,
    pub title: Option<String>,
    pub active: bool,
    pub pinned: bool,
    pub discarded: bool,
    pub cookie_store_id: Option<String>,
}

/// Fields reported as changed by a tab update
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TabChanges {
    pub title: Option<String>,
    pub url: Option<String>,
    pub pinned: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleState {
    Active,
    Idle,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    TabCreated(HostTab),
    TabActivated {
        tab_id: TabId,
        previous_tab_id: Option<TabId>,
        window_id: WindowId,
    },
    TabMoved {
        tab_id: TabId,
        window_id: WindowId,
        to_index: usize,
    },
    TabAttached {
        tab_id: TabId,
        new_window_id: WindowId,
        new_position: usize,
    },
    TabDetached {
        tab_id: TabId,
        old_window_id: WindowId,
    },
    TabRemoved {
        tab_id: TabId,
        window_id: WindowId,
        is_window_closing: bool,
    },
    /// `tab` is the full state after the update
    TabUpdated {
        tab_id: TabId,
        changes: TabChanges,
        tab: HostTab,
    },
    WindowCreated(WindowId),
    WindowRemoved(WindowId),
    IdleStateChanged(IdleState),
}

#[async_trait]
pub trait Host: Send + Sync {
    async fn all_tabs(&self) -> Result<Vec<HostTab>>;
    async fn window_ids(&self) -> Result<Vec<WindowId>>;
    /// Tabs of one window in display order
    async fn window_tabs(&self, window_id: WindowId) -> Result<Vec<HostTab>>;
    /// Fails with `Error::ContainerNotFound` when the requested container is gone
    async fn create_tab(&self, props: CreateTab) -> Result<HostTab>;
    async fn activate_tab(&self, tab_id: TabId) -> Result<()>;
    async fn remove_tabs(&self, tab_ids: &[TabId]) -> Result<()>;

    async fn get_window_value(&self, window_id: WindowId, key: &str) -> Result<Option<String>>;
    async fn set_window_value(&self, window_id: WindowId, key: &str, value: &str) -> Result<()>;
    async fn remove_window_value(&self, window_id: WindowId, key: &str) -> Result<()>;

    /// Absolute URL of a page bundled with the extension
    fn extension_url(&self, path: &str) -> String;

    fn subscribe(&self) -> mpsc::UnboundedReceiver<HostEvent>;
}
