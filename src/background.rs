//! Wiring of host events into the window tracker and the group manager.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::error::Result;
use crate::group::{GroupManager, Stores};
use crate::host::{Host, HostEvent};
use crate::window::WindowManager;

/// A running engine: owns the event loops and stops them when dropped.
///
/// Must be started inside a tokio runtime.
pub struct Background {
    windows: Arc<WindowManager>,
    groups: Arc<GroupManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl Background {
    pub async fn start(host: Arc<dyn Host>, stores: Stores, settings: Settings) -> Result<Self> {
        // Subscribe first so nothing between the query and the loop is lost
        let mut events = host.subscribe();

        let windows = Arc::new(WindowManager::new());
        let mut closed = windows.subscribe();
        windows.populate(host.all_tabs().await?);

        let groups = Arc::new(GroupManager::new(
            stores,
            host.clone(),
            windows.clone(),
            settings,
        ));

        let event_loop = {
            let windows = windows.clone();
            let groups = groups.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    windows.handle(&event);
                    match event {
                        HostEvent::WindowCreated(window_id) => {
                            drop(groups.window_created(window_id));
                        }
                        HostEvent::IdleStateChanged(state) => {
                            let groups = groups.clone();
                            tokio::spawn(async move { groups.idle_state_changed(state).await });
                        }
                        _ => {}
                    }
                }
                tracing::debug!("host event stream ended");
            })
        };

        let closed_loop = {
            let groups = groups.clone();
            tokio::spawn(async move {
                while let Some(window) = closed.recv().await {
                    let window_id = window.window_id;
                    // Queued right away so it runs before later operations
                    let saved = groups.window_closed(window);
                    tokio::spawn(async move {
                        if let Err(e) = saved.await {
                            tracing::warn!("failed to save closed window {}: {}", window_id, e);
                        }
                    });
                }
            })
        };

        tracing::info!("tab group engine started");
        Ok(Self {
            windows,
            groups,
            tasks: vec![event_loop, closed_loop],
        })
    }

    pub fn windows(&self) -> &Arc<WindowManager> {
        &self.windows
    }

    pub fn groups(&self) -> &Arc<GroupManager> {
        &self.groups
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
