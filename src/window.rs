//! Incremental per-window tab tracking.
//!
//! The [`WindowManager`] never polls the host. It keeps one shared snapshot
//! per tab, referenced both from the tab index and from its window's ordered
//! list, so field updates through one index are visible through the other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::event::Subscribers;
use crate::host::{HostEvent, HostTab, TabId, WindowId};

/// In-memory projection of one live tab
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TabSnapshot {
    pub id: TabId,
    pub title: String,
    pub url: String,
    pub active: bool,
    pub pinned: bool,
    pub favicon: Option<String>,
    pub container: Option<String>,
}

impl From<&HostTab> for TabSnapshot {
    fn from(tab: &HostTab) -> Self {
        Self {
            id: tab.id,
            title: tab.title.clone(),
            url: tab.url.clone(),
            active: tab.active,
            pinned: tab.pinned,
            favicon: tab.fav_icon_url.clone(),
            container: tab.cookie_store_id.clone(),
        }
    }
}

/// Final state of a window, emitted once when it closes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowClosed {
    pub window_id: WindowId,
    pub tabs: Vec<TabSnapshot>,
}

type SharedTab = Arc<RwLock<TabSnapshot>>;

#[derive(Debug, Default)]
struct WindowState {
    tabs: HashMap<TabId, SharedTab>,
    windows: HashMap<WindowId, Vec<SharedTab>>,
    /// Hosts never reuse window ids
    closed: HashSet<WindowId>,
}

impl WindowState {
    fn window(&mut self, window_id: WindowId) -> &mut Vec<SharedTab> {
        self.windows.entry(window_id).or_default()
    }

    fn create_tab(&mut self, tab: &HostTab) {
        // Startup population and the creation event may both report a tab
        if self.tabs.contains_key(&tab.id) {
            return;
        }
        let shared = Arc::new(RwLock::new(TabSnapshot::from(tab)));
        self.tabs.insert(tab.id, shared.clone());
        let list = self.window(tab.window_id);
        let index = tab.index.min(list.len());
        list.insert(index, shared);
    }

    fn detach_tab(&mut self, tab_id: TabId, window_id: WindowId) -> Option<SharedTab> {
        let tab = self.tabs.get(&tab_id)?.clone();
        remove_one(self.window(window_id), &tab);
        Some(tab)
    }
}

fn remove_one(list: &mut Vec<SharedTab>, tab: &SharedTab) -> bool {
    match list.iter().position(|t| Arc::ptr_eq(t, tab)) {
        Some(i) => {
            list.remove(i);
            true
        }
        None => false,
    }
}

/// Live, ordered snapshot of every open window's tabs
#[derive(Debug, Default)]
pub struct WindowManager {
    state: Mutex<WindowState>,
    closed: Subscribers<WindowClosed>,
}

impl WindowManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a full host query. Safe to combine with creation events
    /// for the same tabs.
    pub fn populate(&self, mut tabs: Vec<HostTab>) {
        tabs.sort_by_key(|t| (t.window_id, t.index));
        let mut state = self.state.lock();
        for tab in &tabs {
            state.create_tab(tab);
        }
    }

    /// Receive a [`WindowClosed`] for every window that closes from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WindowClosed> {
        self.closed.subscribe()
    }

    /// Current tabs of a window, in display order
    pub fn window_tabs(&self, window_id: WindowId) -> Vec<TabSnapshot> {
        self.state
            .lock()
            .windows
            .get(&window_id)
            .map(|tabs| tabs.iter().map(|t| t.read().clone()).collect())
            .unwrap_or_default()
    }

    pub fn tab(&self, tab_id: TabId) -> Option<TabSnapshot> {
        self.state.lock().tabs.get(&tab_id).map(|t| t.read().clone())
    }

    pub fn handle(&self, event: &HostEvent) {
        let mut state = self.state.lock();
        match event {
            HostEvent::TabCreated(tab) => state.create_tab(tab),

            HostEvent::TabActivated {
                tab_id,
                previous_tab_id,
                ..
            } => {
                if let Some(prev) = previous_tab_id.and_then(|id| state.tabs.get(&id)) {
                    prev.write().active = false;
                }
                if let Some(tab) = state.tabs.get(tab_id) {
                    tab.write().active = true;
                }
            }

            HostEvent::TabMoved {
                tab_id,
                window_id,
                to_index,
            } => {
                let Some(tab) = state.tabs.get(tab_id).cloned() else {
                    return;
                };
                let list = state.window(*window_id);
                if !remove_one(list, &tab) {
                    return;
                }
                let index = (*to_index).min(list.len());
                list.insert(index, tab);
            }

            HostEvent::TabAttached {
                tab_id,
                new_window_id,
                new_position,
            } => {
                let Some(tab) = state.tabs.get(tab_id).cloned() else {
                    return;
                };
                let list = state.window(*new_window_id);
                let index = (*new_position).min(list.len());
                list.insert(index, tab);
            }

            HostEvent::TabDetached {
                tab_id,
                old_window_id,
            } => {
                state.detach_tab(*tab_id, *old_window_id);
            }

            HostEvent::TabRemoved {
                tab_id,
                window_id,
                is_window_closing,
            } => {
                // A closing window keeps its list until WindowRemoved
                if !is_window_closing {
                    state.detach_tab(*tab_id, *window_id);
                }
                state.tabs.remove(tab_id);
            }

            HostEvent::TabUpdated {
                tab_id,
                changes,
                tab: full,
            } => {
                let Some(tab) = state.tabs.get(tab_id) else {
                    return;
                };
                let mut tab = tab.write();
                // The host does not reliably report favicon changes
                tab.favicon = full.fav_icon_url.clone();
                if let Some(title) = &changes.title {
                    tab.title = title.clone();
                }
                if let Some(url) = &changes.url {
                    tab.url = url.clone();
                }
                if let Some(pinned) = changes.pinned {
                    tab.pinned = pinned;
                }
            }

            HostEvent::WindowRemoved(window_id) => {
                if !state.closed.insert(*window_id) {
                    return;
                }
                // Untracked windows still close, with nothing to save
                let tabs = state.windows.remove(window_id).unwrap_or_default();
                drop(state);
                let tabs = tabs.iter().map(|t| t.read().clone()).collect();
                tracing::debug!("window {} closed", window_id);
                self.closed.dispatch(WindowClosed {
                    window_id: *window_id,
                    tabs,
                });
            }

            HostEvent::WindowCreated(_) | HostEvent::IdleStateChanged(_) => {}
        }
    }
}
