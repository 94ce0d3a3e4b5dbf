use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{CreateTab, Host, HostEvent, HostTab, IdleState, TabChanges, TabId, WindowId};
use crate::error::{Error, Result};
use crate::event::Subscribers;

/// URL a tab opens with when no URL is requested
pub const NEW_TAB_URL: &str = "about:newtab";

#[derive(Debug, Default)]
struct HostState {
    windows: BTreeMap<WindowId, Vec<HostTab>>,
    session: HashMap<(WindowId, String), String>,
    containers: HashSet<String>,
    failing_urls: HashSet<String>,
    next_id: u64,
}

impl HostState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn locate(&self, tab_id: TabId) -> Option<(WindowId, usize)> {
        self.windows.iter().find_map(|(w, tabs)| {
            tabs.iter().position(|t| t.id == tab_id).map(|i| (*w, i))
        })
    }

    fn window_mut(&mut self, window_id: WindowId) -> Result<&mut Vec<HostTab>> {
        self.windows
            .get_mut(&window_id)
            .ok_or_else(|| Error::host(format!("no such window: {window_id}")))
    }

    fn close_window(&mut self, window_id: WindowId, events: &mut Vec<HostEvent>) {
        let Some(tabs) = self.windows.remove(&window_id) else {
            return;
        };
        for tab in tabs {
            events.push(HostEvent::TabRemoved {
                tab_id: tab.id,
                window_id,
                is_window_closing: true,
            });
        }
        self.session.retain(|(w, _), _| *w != window_id);
        events.push(HostEvent::WindowRemoved(window_id));
    }
}

fn reindex(tabs: &mut [HostTab]) {
    for (i, tab) in tabs.iter_mut().enumerate() {
        tab.index = i;
    }
}

/// A browser simulated in memory.
///
/// Mirrors the host behaviours the group engine depends on: a window closes
/// when its last tab is removed, containers must exist to be used, and every
/// mutation is reported as a [`HostEvent`].
#[derive(Debug)]
pub struct MemoryHost {
    base_url: String,
    state: Mutex<HostState>,
    events: Subscribers<HostEvent>,
}

impl MemoryHost {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            state: Mutex::new(HostState::default()),
            events: Subscribers::new(),
        }
    }

    fn emit(&self, events: Vec<HostEvent>) {
        for event in events {
            self.events.dispatch(event);
        }
    }

    /// Open a window holding one tab per URL; the first tab is active
    pub fn open_window(&self, urls: &[&str]) -> WindowId {
        let mut events = Vec::new();
        let window_id = {
            let mut state = self.state.lock();
            let window_id = state.next_id();
            events.push(HostEvent::WindowCreated(window_id));

            let mut tabs = Vec::new();
            for (index, url) in urls.iter().enumerate() {
                let tab = HostTab {
                    id: state.next_id(),
                    window_id,
                    index,
                    title: url.to_string(),
                    url: url.to_string(),
                    active: index == 0,
                    ..Default::default()
                };
                events.push(HostEvent::TabCreated(tab.clone()));
                tabs.push(tab);
            }
            state.windows.insert(window_id, tabs);
            window_id
        };
        self.emit(events);
        window_id
    }

    pub fn close_window(&self, window_id: WindowId) {
        let mut events = Vec::new();
        self.state.lock().close_window(window_id, &mut events);
        self.emit(events);
    }

    /// Apply `changes` (and an optional new favicon) and report the update
    pub fn update_tab(
        &self,
        tab_id: TabId,
        changes: TabChanges,
        fav_icon_url: Option<String>,
    ) -> Result<()> {
        let event = {
            let mut state = self.state.lock();
            let (window_id, index) = state
                .locate(tab_id)
                .ok_or_else(|| Error::host(format!("no such tab: {tab_id}")))?;
            let tab = &mut state.window_mut(window_id)?[index];
            if let Some(title) = &changes.title {
                tab.title = title.clone();
            }
            if let Some(url) = &changes.url {
                tab.url = url.clone();
            }
            if let Some(pinned) = changes.pinned {
                tab.pinned = pinned;
            }
            if fav_icon_url.is_some() {
                tab.fav_icon_url = fav_icon_url;
            }
            HostEvent::TabUpdated {
                tab_id,
                changes,
                tab: tab.clone(),
            }
        };
        self.events.dispatch(event);
        Ok(())
    }

    /// Move a tab within its window or into another one
    pub fn move_tab(&self, tab_id: TabId, window_id: WindowId, to_index: usize) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let (from_window, index) = state
                .locate(tab_id)
                .ok_or_else(|| Error::host(format!("no such tab: {tab_id}")))?;
            state.window_mut(window_id)?;

            let source = state.window_mut(from_window)?;
            let mut tab = source.remove(index);
            reindex(source);
            let source_empty = source.is_empty();

            tab.window_id = window_id;
            tab.active = tab.active && from_window == window_id;
            let target = state.window_mut(window_id)?;
            let to_index = to_index.min(target.len());
            target.insert(to_index, tab);
            reindex(target);

            if from_window == window_id {
                events.push(HostEvent::TabMoved {
                    tab_id,
                    window_id,
                    to_index,
                });
            } else {
                events.push(HostEvent::TabDetached {
                    tab_id,
                    old_window_id: from_window,
                });
                events.push(HostEvent::TabAttached {
                    tab_id,
                    new_window_id: window_id,
                    new_position: to_index,
                });
                if source_empty {
                    state.close_window(from_window, &mut events);
                }
            }
        }
        self.emit(events);
        Ok(())
    }

    pub fn add_container(&self, cookie_store_id: impl Into<String>) {
        self.state.lock().containers.insert(cookie_store_id.into());
    }

    pub fn remove_container(&self, cookie_store_id: &str) {
        self.state.lock().containers.remove(cookie_store_id);
    }

    /// Make every later attempt to open `url` fail
    pub fn fail_url(&self, url: impl Into<String>) {
        self.state.lock().failing_urls.insert(url.into());
    }

    pub fn set_idle_state(&self, idle: IdleState) {
        self.events.dispatch(HostEvent::IdleStateChanged(idle));
    }
}

#[async_trait]
impl Host for MemoryHost {
    async fn all_tabs(&self) -> Result<Vec<HostTab>> {
        Ok(self
            .state
            .lock()
            .windows
            .values()
            .flat_map(|tabs| tabs.iter().cloned())
            .collect())
    }

    async fn window_ids(&self) -> Result<Vec<WindowId>> {
        Ok(self.state.lock().windows.keys().copied().collect())
    }

    async fn window_tabs(&self, window_id: WindowId) -> Result<Vec<HostTab>> {
        Ok(self.state.lock().window_mut(window_id)?.clone())
    }

    async fn create_tab(&self, props: CreateTab) -> Result<HostTab> {
        let mut events = Vec::new();
        let tab = {
            let mut state = self.state.lock();
            if let Some(container) = &props.cookie_store_id {
                if !state.containers.contains(container) {
                    return Err(Error::ContainerNotFound(container.clone()));
                }
            }
            let url = props.url.unwrap_or_else(|| NEW_TAB_URL.to_string());
            if state.failing_urls.contains(&url) {
                return Err(Error::host(format!("cannot open {url}")));
            }
            state.window_mut(props.window_id)?;

            let id = state.next_id();
            let tabs = state.window_mut(props.window_id)?;
            let previous_tab_id = if props.active {
                tabs.iter_mut().find(|t| t.active).map(|t| {
                    t.active = false;
                    t.id
                })
            } else {
                None
            };

            let tab = HostTab {
                id,
                window_id: props.window_id,
                index: tabs.len(),
                title: props.title.unwrap_or_else(|| url.clone()),
                url,
                active: props.active,
                pinned: props.pinned,
                discarded: props.discarded && !props.active,
                fav_icon_url: None,
                cookie_store_id: props.cookie_store_id,
            };
            tabs.push(tab.clone());

            events.push(HostEvent::TabCreated(tab.clone()));
            if props.active {
                events.push(HostEvent::TabActivated {
                    tab_id: id,
                    previous_tab_id,
                    window_id: props.window_id,
                });
            }
            tab
        };
        self.emit(events);
        Ok(tab)
    }

    async fn activate_tab(&self, tab_id: TabId) -> Result<()> {
        let event = {
            let mut state = self.state.lock();
            let (window_id, index) = state
                .locate(tab_id)
                .ok_or_else(|| Error::host(format!("no such tab: {tab_id}")))?;
            let tabs = state.window_mut(window_id)?;
            let previous_tab_id = tabs.iter().find(|t| t.active).map(|t| t.id);
            if previous_tab_id == Some(tab_id) {
                return Ok(());
            }
            for tab in tabs.iter_mut() {
                tab.active = false;
            }
            tabs[index].active = true;
            tabs[index].discarded = false;
            HostEvent::TabActivated {
                tab_id,
                previous_tab_id,
                window_id,
            }
        };
        self.events.dispatch(event);
        Ok(())
    }

    async fn remove_tabs(&self, tab_ids: &[TabId]) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            for &tab_id in tab_ids {
                let Some((window_id, index)) = state.locate(tab_id) else {
                    continue;
                };
                let tabs = state.window_mut(window_id)?;
                let removed = tabs.remove(index);
                reindex(tabs);
                events.push(HostEvent::TabRemoved {
                    tab_id,
                    window_id,
                    is_window_closing: false,
                });

                if tabs.is_empty() {
                    state.close_window(window_id, &mut events);
                } else if removed.active {
                    if let Some(next) = tabs.last_mut() {
                        next.active = true;
                        next.discarded = false;
                        events.push(HostEvent::TabActivated {
                            tab_id: next.id,
                            previous_tab_id: None,
                            window_id,
                        });
                    }
                }
            }
        }
        self.emit(events);
        Ok(())
    }

    async fn get_window_value(&self, window_id: WindowId, key: &str) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .session
            .get(&(window_id, key.to_string()))
            .cloned())
    }

    async fn set_window_value(&self, window_id: WindowId, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.window_mut(window_id)?;
        state
            .session
            .insert((window_id, key.to_string()), value.to_string());
        Ok(())
    }

    async fn remove_window_value(&self, window_id: WindowId, key: &str) -> Result<()> {
        self.state
            .lock()
            .session
            .remove(&(window_id, key.to_string()));
        Ok(())
    }

    fn extension_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<HostEvent> {
        self.events.subscribe()
    }
}
