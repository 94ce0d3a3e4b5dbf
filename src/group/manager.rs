use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::color::{format_name, parse_name, Color};
use super::convert::Converter;
use super::prune::{collect_ids, prune_namespace, PruneReport};
use super::{BindingChanged, GroupState, GroupSummary};
use crate::config::Settings;
use crate::critical::{CriticalSection, TaskHandle};
use crate::error::{Error, Result};
use crate::event::Subscribers;
use crate::host::{CreateTab, Host, HostTab, IdleState, TabId, WindowId};
use crate::store::{
    CreateNode, KeyValueStore, MemoryKvStore, MemoryTreeStore, TreeNode, TreeStore, UpdateNode,
};
use crate::window::{TabSnapshot, WindowClosed, WindowManager};

/// Session-storage key holding a window's group id
const KEY_GROUP: &str = "group";

const ROOT_TITLE: &str = "Tab Groups";
const MARKER_TITLE: &str = "Tab Groups (do not remove)";
const TRANSACTION_TITLE: &str = "Transaction";
const COMMITTED_TITLE: &str = "Transaction (committed)";
const UNSAVED_NAME: &str = "Current Window";
const COVER_URL: &str = "about:blank";

/// The persistence collaborators of a [`GroupManager`]
#[derive(Clone)]
pub struct Stores {
    pub tree: Arc<dyn TreeStore>,
    pub favicons: Arc<dyn KeyValueStore>,
    pub tab_info: Arc<dyn KeyValueStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            tree: Arc::new(MemoryTreeStore::new()),
            favicons: Arc::new(MemoryKvStore::new()),
            tab_info: Arc::new(MemoryKvStore::new()),
        }
    }
}

/// Value stored in the tab-info namespace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TabInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    container: Option<String>,
}

struct Inner {
    stores: Stores,
    host: Arc<dyn Host>,
    windows: Arc<WindowManager>,
    settings: RwLock<Settings>,

    marker_url: String,
    transaction_url: String,
    committed_url: String,
    redirect_url: String,

    root_id: Mutex<Option<String>>,
    bindings: Mutex<HashMap<WindowId, String>>,
    binding_events: Subscribers<BindingChanged>,
    prune_pending: AtomicBool,
}

/// Owns the window-to-group binding and every group mutation.
///
/// Each operation is queued on a [`CriticalSection`] when called and
/// returns a [`TaskHandle`] to await its result. Must be created inside a
/// tokio runtime.
pub struct GroupManager {
    inner: Arc<Inner>,
    section: CriticalSection,
}

impl GroupManager {
    pub fn new(
        stores: Stores,
        host: Arc<dyn Host>,
        windows: Arc<WindowManager>,
        settings: Settings,
    ) -> Self {
        let inner = Arc::new(Inner {
            marker_url: host.extension_url("pages/marker.html"),
            transaction_url: host.extension_url("pages/transaction.html?committed=0"),
            committed_url: host.extension_url("pages/transaction.html?committed=1"),
            redirect_url: host.extension_url(Converter::redirect_page()),
            stores,
            host,
            windows,
            settings: RwLock::new(settings),
            root_id: Mutex::new(None),
            bindings: Mutex::new(HashMap::new()),
            binding_events: Subscribers::new(),
            prune_pending: AtomicBool::new(false),
        });

        let section = CriticalSection::new();
        let init = inner.clone();
        drop(section.sync(async move {
            if let Err(e) = init.initialize().await {
                tracing::error!("failed to restore window bindings: {}", e);
            }
            Ok(())
        }));

        Self { inner, section }
    }

    pub fn list_groups(&self, window_id: Option<WindowId>) -> TaskHandle<Vec<GroupSummary>> {
        let inner = self.inner.clone();
        self.section
            .sync(async move { inner.list_groups(window_id).await })
    }

    pub fn create_group(&self, name: impl Into<String>) -> TaskHandle<GroupSummary> {
        let inner = self.inner.clone();
        let name = name.into();
        self.section.sync(async move {
            let node = inner.create_group(&name).await?;
            let (color, name) = parse_name(&node.title);
            Ok(GroupSummary {
                id: Some(node.id.clone()),
                name: name.to_string(),
                color,
                size: Some(0),
                state: GroupState::Closed,
            })
        })
    }

    /// Save the window into its group, then load `group_id` into it.
    ///
    /// Without a target this only saves. An unbound window with tabs is
    /// saved into a new group named `unsaved_group_name` when one is given.
    pub fn switch_group(
        &self,
        window_id: WindowId,
        group_id: Option<String>,
        unsaved_group_name: Option<String>,
    ) -> TaskHandle<()> {
        let inner = self.inner.clone();
        self.section.sync(async move {
            inner
                .switch_group(window_id, group_id, unsaved_group_name)
                .await
        })
    }

    pub fn delete_group(&self, group_id: impl Into<String>) -> TaskHandle<()> {
        let inner = self.inner.clone();
        let group_id = group_id.into();
        self.section
            .sync(async move { inner.delete_group(&group_id).await })
    }

    /// Add records for `tabs` to a group without touching its contents
    pub fn append_group(
        &self,
        group_id: impl Into<String>,
        tabs: Vec<TabSnapshot>,
    ) -> TaskHandle<()> {
        let inner = self.inner.clone();
        let group_id = group_id.into();
        self.section.sync(async move {
            inner.ensure_group(&group_id).await?;
            inner.write_records(&group_id, &tabs).await
        })
    }

    pub fn set_group_color(
        &self,
        group_id: impl Into<String>,
        color: Option<Color>,
    ) -> TaskHandle<()> {
        let inner = self.inner.clone();
        let group_id = group_id.into();
        self.section
            .sync(async move { inner.set_group_color(&group_id, color).await })
    }

    /// Pick up a new window's binding from session storage
    pub fn window_created(&self, window_id: WindowId) -> TaskHandle<()> {
        let inner = self.inner.clone();
        self.section
            .sync(async move { inner.load_binding(window_id).await })
    }

    /// Save a closed window's final tabs into its group and drop the binding
    pub fn window_closed(&self, closed: WindowClosed) -> TaskHandle<()> {
        let inner = self.inner.clone();
        self.section
            .sync(async move { inner.window_closed(closed).await })
    }

    pub fn bound_group(&self, window_id: WindowId) -> Option<String> {
        self.inner.bindings.lock().get(&window_id).cloned()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BindingChanged> {
        self.inner.binding_events.subscribe()
    }

    pub fn settings(&self) -> Settings {
        self.inner.settings.read().clone()
    }

    pub fn set_settings(&self, settings: Settings) {
        *self.inner.settings.write() = settings;
    }

    pub fn prune_pending(&self) -> bool {
        self.inner.prune_pending.load(Ordering::Acquire)
    }

    /// Run a scheduled prune once the user goes idle
    pub async fn idle_state_changed(&self, state: IdleState) {
        if state != IdleState::Idle || !self.inner.prune_pending.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.inner.prune().await {
            tracing::warn!("pruning secondary stores failed: {}", e);
            self.inner.prune_pending.store(true, Ordering::Release);
        }
    }

    /// Prune immediately, whether or not a prune was scheduled
    pub async fn prune_now(&self) -> Result<PruneReport> {
        let inner = self.inner.clone();
        self.section
            .sync(async move { inner.resolve_root().await })
            .await?;
        self.inner.prune_pending.store(false, Ordering::Release);
        self.inner.prune().await
    }
}

impl Inner {
    fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    fn converter(&self) -> Converter {
        Converter::new(
            self.redirect_url.clone(),
            self.settings.read().new_tab_url.clone(),
        )
    }

    fn is_marker(&self, node: &TreeNode) -> bool {
        matches!(node.url.as_deref(), Some(u) if u == self.transaction_url || u == self.committed_url)
    }

    fn is_record(&self, node: &TreeNode) -> bool {
        !node.is_folder() && !self.is_marker(node)
    }

    fn warn_interrupted_save(&self, group_id: &str, children: &[TreeNode]) {
        if children
            .iter()
            .any(|c| c.url.as_deref() == Some(self.committed_url.as_str()))
        {
            tracing::warn!(
                "group {} holds a committed transaction marker; an earlier save was interrupted and may have left stale tabs",
                group_id
            );
        }
    }

    async fn initialize(&self) -> Result<()> {
        for window_id in self.host.window_ids().await? {
            self.load_binding(window_id).await?;
        }
        Ok(())
    }

    async fn load_binding(&self, window_id: WindowId) -> Result<()> {
        if let Some(group_id) = self.host.get_window_value(window_id, KEY_GROUP).await? {
            tracing::debug!("window {} restored binding to group {}", window_id, group_id);
            self.bindings.lock().insert(window_id, group_id);
        }
        Ok(())
    }

    /// Locate the root folder through its marker entry, creating both if needed
    async fn resolve_root(&self) -> Result<String> {
        let cached = self.root_id.lock().clone();
        if let Some(id) = cached {
            match self.stores.tree.get(&id).await {
                Ok(node) if node.is_folder() => return Ok(id),
                _ => tracing::debug!("cached root {} is gone, rediscovering", id),
            }
        }

        let markers = self.stores.tree.search_url(&self.marker_url).await?;
        let id = match markers.into_iter().find_map(|m| m.parent_id) {
            Some(parent) => parent,
            None => {
                let root = self
                    .stores
                    .tree
                    .create(CreateNode::folder(None, ROOT_TITLE).at(0))
                    .await?;
                self.stores
                    .tree
                    .create(CreateNode::bookmark(&root.id, MARKER_TITLE, &self.marker_url))
                    .await?;
                tracing::info!("created root folder {}", root.id);
                root.id
            }
        };

        *self.root_id.lock() = Some(id.clone());
        Ok(id)
    }

    async fn is_group(&self, id: &str) -> Result<bool> {
        let root = self.resolve_root().await?;
        Ok(match self.stores.tree.get(id).await {
            Ok(node) => node.is_folder() && node.parent_id.as_deref() == Some(root.as_str()),
            Err(_) => false,
        })
    }

    async fn ensure_group(&self, id: &str) -> Result<()> {
        if self.is_group(id).await? {
            Ok(())
        } else {
            Err(Error::invalid_group(id))
        }
    }

    async fn list_groups(&self, window_id: Option<WindowId>) -> Result<Vec<GroupSummary>> {
        let root = self.resolve_root().await?;
        let subtree = self.stores.tree.get_subtree(&root).await?;

        let (current, locked) = {
            let bindings = self.bindings.lock();
            let current = window_id.and_then(|w| bindings.get(&w).cloned());
            let locked: HashSet<String> = bindings
                .iter()
                .filter(|(w, _)| Some(**w) != window_id)
                .map(|(_, g)| g.clone())
                .collect();
            (current, locked)
        };

        let mut has_open = false;
        let mut groups = Vec::new();
        for node in subtree.children.unwrap_or_default() {
            if !node.is_folder() {
                continue;
            }
            let children = node.children.as_deref().unwrap_or_default();
            self.warn_interrupted_save(&node.id, children);

            let state = if current.as_deref() == Some(node.id.as_str()) {
                has_open = true;
                GroupState::Open
            } else if locked.contains(&node.id) {
                GroupState::Locked
            } else {
                GroupState::Closed
            };
            let (color, name) = parse_name(&node.title);
            groups.push(GroupSummary {
                id: Some(node.id.clone()),
                name: name.to_string(),
                color,
                size: Some(children.iter().filter(|c| self.is_record(c)).count()),
                state,
            });
        }

        if let Some(window_id) = window_id {
            if !has_open {
                groups.insert(
                    0,
                    GroupSummary {
                        id: None,
                        name: UNSAVED_NAME.to_string(),
                        color: None,
                        size: Some(self.windows.window_tabs(window_id).len()),
                        state: GroupState::Unsaved,
                    },
                );
            }
        }
        Ok(groups)
    }

    async fn create_group(&self, name: &str) -> Result<TreeNode> {
        let root = self.resolve_root().await?;
        let title = if self.settings.read().auto_set_color && parse_name(name).0.is_none() {
            format_name(Some(Color::random()), name)
        } else {
            name.to_string()
        };
        let node = self
            .stores
            .tree
            .create(CreateNode::folder(Some(root), title))
            .await?;
        tracing::info!("created group {} ({})", node.id, node.title);
        Ok(node)
    }

    /// The tabs a save should persist
    fn tabs_to_save(&self, mut tabs: Vec<TabSnapshot>, direct_save: bool) -> Vec<TabSnapshot> {
        if self.settings.read().exclude_pinned_tabs {
            tabs.retain(|t| !t.pinned);
        }
        // A lone blank tab is not worth a group
        if !direct_save && tabs.len() == 1 && self.converter().is_placeholder(&tabs[0].url) {
            tabs.clear();
        }
        tabs
    }

    async fn switch_group(
        &self,
        window_id: WindowId,
        target: Option<String>,
        unsaved_name: Option<String>,
    ) -> Result<()> {
        if let Some(target) = &target {
            self.ensure_group(target).await?;
        }

        let mut old = self.bindings.lock().get(&window_id).cloned();
        if let Some(id) = &old {
            if !self.is_group(id).await? {
                tracing::debug!("window {} was bound to vanished group {}", window_id, id);
                old = None;
            }
        }

        let direct_save = target.is_none() && unsaved_name.is_some();
        // The event-fed cache may still lag behind an earlier load in this queue
        let live: Vec<TabSnapshot> = self
            .host
            .window_tabs(window_id)
            .await?
            .iter()
            .map(TabSnapshot::from)
            .collect();
        let tabs = self.tabs_to_save(live, direct_save);

        if old.is_none() && !tabs.is_empty() {
            if let Some(name) = &unsaved_name {
                old = Some(self.create_group(name).await?.id);
            }
        }

        if let Some(id) = &old {
            self.save_group(id, &tabs).await?;
        }

        let Some(target) = target.or_else(|| old.clone()) else {
            return Ok(());
        };

        if old.as_deref() == Some(target.as_str()) {
            if self.bindings.lock().get(&window_id) != Some(&target) {
                self.bind(window_id, Some(&target)).await?;
            }
            return Ok(());
        }

        self.load_group(window_id, &target).await?;
        self.bind(window_id, Some(&target)).await
    }

    /// Replace a group's contents with `tabs`.
    ///
    /// A marker entry is written first and flipped to committed once every
    /// new record exists; only then are the old entries and the marker removed.
    async fn save_group(&self, group_id: &str, tabs: &[TabSnapshot]) -> Result<()> {
        let tree = &self.stores.tree;
        let previous = tree.get_children(group_id).await?;
        self.warn_interrupted_save(group_id, &previous);

        let marker = tree
            .create(CreateNode::bookmark(
                group_id,
                TRANSACTION_TITLE,
                &self.transaction_url,
            ))
            .await?;

        self.write_records(group_id, tabs).await?;

        tree.update(
            &marker.id,
            UpdateNode {
                title: Some(COMMITTED_TITLE.to_string()),
                url: Some(self.committed_url.clone()),
            },
        )
        .await?;

        for node in &previous {
            if node.is_folder() {
                tree.remove_tree(&node.id).await?;
            } else {
                tree.remove(&node.id).await?;
            }
        }
        tree.remove(&marker.id).await?;

        tracing::debug!("saved {} tabs into group {}", tabs.len(), group_id);
        self.prune_pending.store(true, Ordering::Release);
        Ok(())
    }

    async fn write_records(&self, group_id: &str, tabs: &[TabSnapshot]) -> Result<()> {
        let converter = self.converter();
        for tab in tabs {
            let draft = converter.to_record(tab);
            let node = self
                .stores
                .tree
                .create(CreateNode::bookmark(group_id, draft.title, draft.url))
                .await?;
            self.write_extras(&node.id, tab).await;
        }
        Ok(())
    }

    /// Secondary data is best-effort
    async fn write_extras(&self, record_id: &str, tab: &TabSnapshot) {
        if let Some(favicon) = &tab.favicon {
            if let Err(e) = self
                .stores
                .favicons
                .set(record_id, serde_json::Value::String(favicon.clone()))
                .await
            {
                tracing::warn!("failed to store favicon of record {}: {}", record_id, e);
            }
        }

        if tab.container.is_some() {
            let info = TabInfo {
                container: tab.container.clone(),
            };
            let stored = match serde_json::to_value(&info) {
                Ok(value) => self.stores.tab_info.set(record_id, value).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = stored {
                tracing::warn!("failed to store tab info of record {}: {}", record_id, e);
            }
        }
    }

    async fn tab_container(&self, record_id: &str) -> Option<String> {
        match self.stores.tab_info.get(record_id).await {
            Ok(Some(value)) => serde_json::from_value::<TabInfo>(value)
                .ok()
                .and_then(|info| info.container),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("failed to read tab info of record {}: {}", record_id, e);
                None
            }
        }
    }

    /// Open a tab, retrying once without its container if that is gone
    async fn create_tab(&self, props: CreateTab) -> Result<HostTab> {
        match self.host.create_tab(props.clone()).await {
            Err(Error::ContainerNotFound(container)) => {
                tracing::warn!("container {} not found, opening tab without it", container);
                self.host
                    .create_tab(CreateTab {
                        cookie_store_id: None,
                        ..props
                    })
                    .await
            }
            other => other,
        }
    }

    /// Replace the window's tabs with the group's records
    async fn load_group(&self, window_id: WindowId, group_id: &str) -> Result<()> {
        self.bind(window_id, None).await?;

        let settings = self.settings();
        let converter = self.converter();
        let children = self.stores.tree.get_children(group_id).await?;
        self.warn_interrupted_save(group_id, &children);
        let records: Vec<TreeNode> = children
            .into_iter()
            .filter(|c| self.is_record(c))
            .collect();

        // Keeps the window open while its other tabs are closed
        let cover = self
            .host
            .create_tab(CreateTab {
                window_id,
                url: (!records.is_empty()).then(|| COVER_URL.to_string()),
                active: true,
                ..Default::default()
            })
            .await?;

        loop {
            let live = self.host.window_tabs(window_id).await?;
            if !live.iter().any(|t| t.id == cover.id) {
                return Err(Error::host(format!(
                    "cover tab {} disappeared from window {}",
                    cover.id, window_id
                )));
            }
            let others: Vec<TabId> = live
                .iter()
                .filter(|t| t.id != cover.id && !(settings.exclude_pinned_tabs && t.pinned))
                .map(|t| t.id)
                .collect();
            if others.is_empty() {
                break;
            }
            self.host.remove_tabs(&others).await?;
        }

        // An empty group keeps the cover tab as its only tab
        if records.is_empty() {
            return Ok(());
        }

        let mut first = None;
        let mut selected = None;
        for record in &records {
            let mut spec = converter.to_tab(record, false);
            let discard = settings.discard_inactive_tabs && !spec.active;
            if discard && settings.defer_favicons() {
                spec = converter.to_tab(record, true);
            }
            let discarded = discard && spec.url.is_some();

            let props = CreateTab {
                window_id,
                url: spec.url.clone(),
                title: discarded.then(|| spec.title.clone()),
                active: false,
                pinned: spec.pinned,
                discarded,
                cookie_store_id: self.tab_container(&record.id).await,
            };
            match self.create_tab(props).await {
                Ok(tab) => {
                    if first.is_none() {
                        first = Some(tab.id);
                    }
                    if spec.active {
                        selected = Some(tab.id);
                    }
                }
                Err(e) => tracing::warn!(
                    "failed to restore {} into window {}: {}",
                    record.url.as_deref().unwrap_or_default(),
                    window_id,
                    e
                ),
            }
        }

        let Some(selected) = selected.or(first) else {
            tracing::warn!("no tab of group {} could be restored", group_id);
            return Ok(());
        };
        if let Err(e) = self.host.activate_tab(selected).await {
            tracing::warn!("failed to activate tab {}: {}", selected, e);
        }
        self.host.remove_tabs(&[cover.id]).await
    }

    async fn bind(&self, window_id: WindowId, group_id: Option<&str>) -> Result<()> {
        match group_id {
            Some(id) => {
                self.bindings.lock().insert(window_id, id.to_string());
                self.host.set_window_value(window_id, KEY_GROUP, id).await?;
            }
            None => {
                self.bindings.lock().remove(&window_id);
                self.host.remove_window_value(window_id, KEY_GROUP).await?;
            }
        }
        self.notify(window_id, group_id).await;
        Ok(())
    }

    async fn notify(&self, window_id: WindowId, group_id: Option<&str>) {
        let (name, color) = match group_id {
            Some(id) => match self.stores.tree.get(id).await {
                Ok(node) => {
                    let (color, name) = parse_name(&node.title);
                    (Some(name.to_string()), color)
                }
                Err(_) => (None, None),
            },
            None => (None, None),
        };
        self.binding_events.dispatch(BindingChanged {
            window_id,
            group_id: group_id.map(str::to_string),
            name,
            color,
        });
    }

    fn windows_bound_to(&self, group_id: &str) -> Vec<WindowId> {
        self.bindings
            .lock()
            .iter()
            .filter(|(_, g)| g.as_str() == group_id)
            .map(|(w, _)| *w)
            .collect()
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.ensure_group(group_id).await?;
        self.stores.tree.remove_tree(group_id).await?;
        for window_id in self.windows_bound_to(group_id) {
            self.bind(window_id, None).await?;
        }
        tracing::info!("deleted group {}", group_id);
        self.prune_pending.store(true, Ordering::Release);
        Ok(())
    }

    async fn set_group_color(&self, group_id: &str, color: Option<Color>) -> Result<()> {
        self.ensure_group(group_id).await?;
        let node = self.stores.tree.get(group_id).await?;
        let title = format_name(color, parse_name(&node.title).1);
        if title != node.title {
            self.stores
                .tree
                .update(
                    group_id,
                    UpdateNode {
                        title: Some(title),
                        url: None,
                    },
                )
                .await?;
        }
        for window_id in self.windows_bound_to(group_id) {
            self.notify(window_id, Some(group_id)).await;
        }
        Ok(())
    }

    async fn window_closed(&self, closed: WindowClosed) -> Result<()> {
        let bound = self.bindings.lock().remove(&closed.window_id);
        let Some(group_id) = bound else {
            tracing::debug!("closed window {} was not bound to a group", closed.window_id);
            return Ok(());
        };
        // Nothing was tracked for it; an empty save would wipe the group
        if closed.tabs.is_empty() {
            tracing::debug!(
                "closed window {} had no tracked tabs, group {} left as is",
                closed.window_id,
                group_id
            );
            return Ok(());
        }
        if !self.is_group(&group_id).await? {
            tracing::debug!(
                "closed window {} was bound to vanished group {}",
                closed.window_id,
                group_id
            );
            return Ok(());
        }

        let tabs = self.tabs_to_save(closed.tabs, false);
        self.save_group(&group_id, &tabs).await?;
        tracing::info!(
            "saved {} tabs of closed window {} into group {}",
            tabs.len(),
            closed.window_id,
            group_id
        );
        Ok(())
    }

    /// Delete secondary entries whose record no longer exists
    async fn prune(&self) -> Result<PruneReport> {
        let favicon_keys = self.stores.favicons.keys().await;
        let tab_info_keys = self.stores.tab_info.keys().await;

        let cached = self.root_id.lock().clone();
        let Some(root) = cached else {
            tracing::debug!("root not resolved yet, nothing to prune");
            return Ok(PruneReport::default());
        };
        let mut live = HashSet::new();
        collect_ids(&self.stores.tree.get_subtree(&root).await?, &mut live);

        let report = PruneReport {
            favicons_removed: prune_namespace(
                crate::store::FAVICON_NAMESPACE,
                &*self.stores.favicons,
                favicon_keys,
                &live,
            )
            .await,
            tab_info_removed: prune_namespace(
                crate::store::TAB_INFO_NAMESPACE,
                &*self.stores.tab_info,
                tab_info_keys,
                &live,
            )
            .await,
        };
        tracing::info!(
            "pruned {} favicons and {} tab infos",
            report.favicons_removed,
            report.tab_info_removed
        );
        Ok(report)
    }
}
