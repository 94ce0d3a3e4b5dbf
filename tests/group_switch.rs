use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tab_groups::background::Background;
use tab_groups::config::Settings;
use tab_groups::group::{BindingChanged, Color, GroupState, Stores, ACTIVE_MARK};
use tab_groups::host::{CreateTab, Host, HostTab, IdleState, MemoryHost, TabChanges, WindowId};
use tab_groups::store::{
    KeyValueStore, KvOp, MemoryKvStore, MemoryTreeStore, TreeNode, TreeStore, TxMode,
};
use tab_groups::window::TabSnapshot;
use tab_groups::{Error, Result};

const BASE: &str = "ext://test";

struct Fixture {
    host: Arc<MemoryHost>,
    stores: Stores,
    engine: Background,
}

async fn start(settings: Settings, stores: Stores) -> Fixture {
    let host = Arc::new(MemoryHost::new(BASE));
    let engine = Background::start(host.clone(), stores.clone(), settings)
        .await
        .unwrap();
    Fixture {
        host,
        stores,
        engine,
    }
}

/// Restored tabs load eagerly so URLs can be compared directly
fn eager() -> Settings {
    Settings {
        discard_inactive_tabs: false,
        ..Settings::default()
    }
}

async fn fixture() -> Fixture {
    start(eager(), Stores::in_memory()).await
}

/// Let the event loops catch up with the host
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

impl Fixture {
    async fn open(&self, urls: &[&str]) -> WindowId {
        let window = self.host.open_window(urls);
        settle().await;
        window
    }

    async fn tabs(&self, window: WindowId) -> Vec<HostTab> {
        self.host.window_tabs(window).await.unwrap()
    }

    async fn urls(&self, window: WindowId) -> Vec<String> {
        self.tabs(window).await.into_iter().map(|t| t.url).collect()
    }

    async fn records(&self, group: &str) -> Vec<TreeNode> {
        self.stores.tree.get_children(group).await.unwrap()
    }

    async fn create(&self, name: &str) -> String {
        let group = self.engine.groups().create_group(name).await.unwrap();
        group.id.unwrap()
    }

    async fn switch(&self, window: WindowId, group: &str) {
        self.engine
            .groups()
            .switch_group(window, Some(group.to_string()), None)
            .await
            .unwrap();
        settle().await;
    }

    async fn save_as(&self, window: WindowId, name: &str) -> String {
        let groups = self.engine.groups();
        groups
            .switch_group(window, None, Some(name.to_string()))
            .await
            .unwrap();
        groups.bound_group(window).unwrap()
    }

    async fn markers(&self) -> usize {
        let mut count = 0;
        for committed in [0, 1] {
            let url = self
                .host
                .extension_url(&format!("pages/transaction.html?committed={committed}"));
            count += self.stores.tree.search_url(&url).await.unwrap().len();
        }
        count
    }
}

fn snapshot(title: &str, url: &str) -> TabSnapshot {
    TabSnapshot {
        title: title.into(),
        url: url.into(),
        ..Default::default()
    }
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<BindingChanged>) -> Vec<BindingChanged> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_unsaved_window_is_saved_as_new_group() {
    let f = fixture().await;
    let window = f.open(&["https://a", "https://b"]).await;

    let work = f.save_as(window, "Work").await;

    let list = f.engine.groups().list_groups(Some(window)).await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id.as_deref(), Some(work.as_str()));
    assert_eq!(list[0].name, "Work");
    assert_eq!(list[0].state, GroupState::Open);
    assert_eq!(list[0].size, Some(2));

    let titles: Vec<String> = f.records(&work).await.into_iter().map(|r| r.title).collect();
    assert_eq!(titles, vec![format!("{ACTIVE_MARK}https://a"), "https://b".to_string()]);
    assert_eq!(f.urls(window).await, vec!["https://a", "https://b"]);
}

#[tokio::test]
async fn test_switching_between_groups() {
    let f = fixture().await;
    let window = f.open(&["https://a", "https://b"]).await;
    let work = f.save_as(window, "Work").await;
    let other = f.create("Other").await;

    f.switch(window, &other).await;
    assert_eq!(f.urls(window).await, vec!["about:newtab"]);
    assert_eq!(f.engine.groups().bound_group(window), Some(other.clone()));

    f.switch(window, &work).await;
    assert_eq!(f.urls(window).await, vec!["https://a", "https://b"]);
    let active: Vec<String> = f
        .tabs(window)
        .await
        .into_iter()
        .filter(|t| t.active)
        .map(|t| t.url)
        .collect();
    assert_eq!(active, vec!["https://a"]);

    // A lone new-tab page is not worth saving
    assert!(f.records(&other).await.is_empty());
    assert_eq!(f.records(&work).await.len(), 2);
    assert_eq!(f.markers().await, 0);
}

#[tokio::test]
async fn test_lone_blank_tab_does_not_create_group() {
    let f = fixture().await;
    let target = f.create("Target").await;
    let window = f.open(&["about:newtab"]).await;

    f.engine
        .groups()
        .switch_group(window, Some(target.clone()), Some("Unsaved".into()))
        .await
        .unwrap();

    let list = f.engine.groups().list_groups(None).await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, "Target");
}

#[tokio::test]
async fn test_invalid_target_changes_nothing() {
    let f = fixture().await;
    let window = f.open(&["https://a"]).await;

    let err = f
        .engine
        .groups()
        .switch_group(window, Some("missing".into()), Some("New".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidGroup(id) if id == "missing"));

    assert_eq!(f.urls(window).await, vec!["https://a"]);
    assert_eq!(f.engine.groups().bound_group(window), None);
    assert!(f.engine.groups().list_groups(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deleting_bound_group_unbinds_window() {
    let f = fixture().await;
    let mut events = f.engine.groups().subscribe();
    let window = f.open(&["https://a", "https://b"]).await;
    let work = f.save_as(window, "Work").await;

    f.engine.groups().delete_group(work.clone()).await.unwrap();

    assert_eq!(f.engine.groups().bound_group(window), None);
    let last = drain(&mut events).pop().unwrap();
    assert_eq!(last.window_id, window);
    assert_eq!(last.group_id, None);

    let list = f.engine.groups().list_groups(Some(window)).await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].state, GroupState::Unsaved);
    assert_eq!(list[0].id, None);
    assert_eq!(list[0].size, Some(2));

    let err = f.engine.groups().delete_group(work).await.unwrap_err();
    assert!(matches!(err, Error::InvalidGroup(_)));
}

#[tokio::test]
async fn test_restricted_url_goes_through_redirector() {
    let f = fixture().await;
    let system = f.create("System").await;
    f.engine
        .groups()
        .append_group(system.clone(), vec![snapshot("Config", "about:config")])
        .await
        .unwrap();
    let window = f.open(&["https://a"]).await;

    f.switch(window, &system).await;
    let urls = f.urls(window).await;
    assert_eq!(urls.len(), 1);
    assert!(urls[0].starts_with("ext://test/pages/url.html?"));
    assert!(urls[0].contains("url=about%3Aconfig"));

    // Saving it again persists the real target
    let other = f.create("Other").await;
    f.switch(window, &other).await;
    let records = f.records(&system).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].url.as_deref(), Some("about:config"));
    assert_eq!(records[0].title, format!("{ACTIVE_MARK}Config"));
}

#[tokio::test]
async fn test_missing_container_falls_back_to_default() {
    let f = fixture().await;
    f.host.add_container("firefox-container-1");
    let group = f.create("Containers").await;
    f.engine
        .groups()
        .append_group(
            group.clone(),
            vec![
                TabSnapshot {
                    container: Some("firefox-container-1".into()),
                    ..snapshot("A", "https://a")
                },
                TabSnapshot {
                    container: Some("firefox-container-9".into()),
                    ..snapshot("B", "https://b")
                },
            ],
        )
        .await
        .unwrap();
    let window = f.open(&["https://x"]).await;

    f.switch(window, &group).await;

    let containers: Vec<Option<String>> = f
        .tabs(window)
        .await
        .into_iter()
        .map(|t| t.cookie_store_id)
        .collect();
    assert_eq!(containers, vec![Some("firefox-container-1".to_string()), None]);
}

#[tokio::test]
async fn test_failed_tab_is_skipped() {
    let f = fixture().await;
    f.host.fail_url("https://bad");
    let group = f.create("Mixed").await;
    f.engine
        .groups()
        .append_group(
            group.clone(),
            vec![snapshot("Bad", "https://bad"), snapshot("Good", "https://good")],
        )
        .await
        .unwrap();
    let window = f.open(&["https://x"]).await;

    f.switch(window, &group).await;

    assert_eq!(f.urls(window).await, vec!["https://good"]);
    assert!(f.tabs(window).await[0].active);
}

#[tokio::test]
async fn test_inactive_tabs_are_deferred_by_default() {
    let f = start(Settings::default(), Stores::in_memory()).await;
    let group = f.create("Lazy").await;
    f.engine
        .groups()
        .append_group(
            group.clone(),
            vec![
                TabSnapshot {
                    active: true,
                    ..snapshot("A", "https://a")
                },
                snapshot("B", "https://b"),
            ],
        )
        .await
        .unwrap();
    let window = f.open(&["https://x"]).await;

    f.switch(window, &group).await;

    let tabs = f.tabs(window).await;
    assert_eq!(tabs.len(), 2);
    assert_eq!(tabs[0].url, "https://a");
    assert!(tabs[0].active);
    assert!(tabs[1].url.contains("deferred=1"));
    assert!(tabs[1].discarded);
    assert_eq!(tabs[1].title, "B");
}

#[tokio::test]
async fn test_recolor_notifies_bound_window() {
    let f = fixture().await;
    let mut events = f.engine.groups().subscribe();
    let window = f.open(&["https://a"]).await;
    let work = f.save_as(window, "Work").await;
    drain(&mut events);

    f.engine
        .groups()
        .set_group_color(work.clone(), Some(Color::Blue))
        .await
        .unwrap();

    assert_eq!(
        drain(&mut events),
        vec![BindingChanged {
            window_id: window,
            group_id: Some(work.clone()),
            name: Some("Work".into()),
            color: Some(Color::Blue),
        }]
    );
    let list = f.engine.groups().list_groups(None).await.unwrap();
    assert_eq!(list[0].name, "Work");
    assert_eq!(list[0].color, Some(Color::Blue));
}

#[tokio::test]
async fn test_closing_window_saves_its_tabs() {
    let f = fixture().await;
    let window = f.open(&["https://a", "https://b"]).await;
    let work = f.save_as(window, "Work").await;

    f.host
        .create_tab(CreateTab {
            window_id: window,
            url: Some("https://c".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    settle().await;
    f.host.close_window(window);
    settle().await;

    let list = f.engine.groups().list_groups(None).await.unwrap();
    assert_eq!(list[0].state, GroupState::Closed);
    let urls: Vec<String> = f
        .records(&work)
        .await
        .into_iter()
        .filter_map(|r| r.url)
        .collect();
    assert_eq!(urls, vec!["https://a", "https://b", "https://c"]);
}

#[tokio::test]
async fn test_closing_unbound_window_saves_nothing() {
    let f = fixture().await;
    let window = f.open(&["https://a"]).await;
    f.host.close_window(window);
    settle().await;

    assert!(f.engine.groups().list_groups(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_switches_in_two_windows() {
    let f = fixture().await;
    let first = f.open(&["https://a"]).await;
    let second = f.open(&["https://b"]).await;
    let one = f.create("One").await;
    let two = f.create("Two").await;

    let groups = f.engine.groups();
    let a = groups.switch_group(first, Some(one.clone()), None);
    let b = groups.switch_group(second, Some(two.clone()), None);
    b.await.unwrap();
    a.await.unwrap();

    assert_eq!(groups.bound_group(first), Some(one.clone()));
    assert_eq!(groups.bound_group(second), Some(two.clone()));

    let list = groups.list_groups(Some(first)).await.unwrap();
    let state = |id: &str| list.iter().find(|g| g.id.as_deref() == Some(id)).unwrap().state;
    assert_eq!(state(&one), GroupState::Open);
    assert_eq!(state(&two), GroupState::Locked);
}

#[tokio::test]
async fn test_pinned_tabs_stay_when_excluded() {
    let settings = Settings {
        exclude_pinned_tabs: true,
        ..eager()
    };
    let f = start(settings, Stores::in_memory()).await;
    let window = f.open(&["https://pinned", "https://a"]).await;
    let pinned = f.tabs(window).await[0].id;
    f.host
        .update_tab(
            pinned,
            TabChanges {
                pinned: Some(true),
                ..Default::default()
            },
            None,
        )
        .unwrap();
    settle().await;

    let work = f.save_as(window, "Work").await;
    let urls: Vec<String> = f
        .records(&work)
        .await
        .into_iter()
        .filter_map(|r| r.url)
        .collect();
    assert_eq!(urls, vec!["https://a"]);

    let other = f.create("Other").await;
    f.switch(window, &other).await;
    assert_eq!(f.urls(window).await, vec!["https://pinned", "about:newtab"]);
}

#[tokio::test]
async fn test_idle_prunes_stale_favicons() {
    let f = fixture().await;
    let window = f.open(&["https://a"]).await;
    let tab = f.tabs(window).await[0].id;
    f.host
        .update_tab(tab, TabChanges::default(), Some("https://a/favicon.ico".into()))
        .unwrap();
    settle().await;

    let work = f.save_as(window, "Work").await;
    // Saving again replaces the record, orphaning the first favicon
    f.engine
        .groups()
        .switch_group(window, None, None)
        .await
        .unwrap();
    assert_eq!(f.stores.favicons.keys().await.unwrap().len(), 2);
    assert!(f.engine.groups().prune_pending());

    f.host.set_idle_state(IdleState::Idle);
    settle().await;

    let record = f.records(&work).await.remove(0);
    assert_eq!(f.stores.favicons.keys().await.unwrap(), vec![record.id]);
    assert!(!f.engine.groups().prune_pending());
}

#[tokio::test]
async fn test_root_is_recreated_when_removed() {
    let f = fixture().await;
    f.create("A").await;

    let marker = f.host.extension_url("pages/marker.html");
    let found = f.stores.tree.search_url(&marker).await.unwrap();
    assert_eq!(found.len(), 1);
    let root = found[0].parent_id.clone().unwrap();
    f.stores.tree.remove_tree(&root).await.unwrap();

    assert!(f.engine.groups().list_groups(None).await.unwrap().is_empty());
    f.create("B").await;
    let list = f.engine.groups().list_groups(None).await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, "B");
    assert_eq!(f.stores.tree.search_url(&marker).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_binding_survives_restart() {
    let f = fixture().await;
    let window = f.open(&["https://a"]).await;
    let work = f.save_as(window, "Work").await;

    let restarted = Background::start(f.host.clone(), f.stores.clone(), eager())
        .await
        .unwrap();
    let list = restarted.groups().list_groups(Some(window)).await.unwrap();

    assert_eq!(restarted.groups().bound_group(window), Some(work));
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].state, GroupState::Open);
}

struct OfflineKv;

#[async_trait]
impl KeyValueStore for OfflineKv {
    async fn get(&self, _key: &str) -> Result<Option<serde_json::Value>> {
        Err(Error::store("offline"))
    }

    async fn set(&self, _key: &str, _value: serde_json::Value) -> Result<()> {
        Err(Error::store("offline"))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(Error::store("offline"))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Err(Error::store("offline"))
    }

    async fn transaction(&self, _mode: TxMode, _ops: Vec<KvOp>) -> Result<()> {
        Err(Error::store("offline"))
    }
}

#[tokio::test]
async fn test_secondary_store_failures_are_not_fatal() {
    let stores = Stores {
        tree: Arc::new(MemoryTreeStore::new()),
        favicons: Arc::new(OfflineKv),
        tab_info: Arc::new(MemoryKvStore::new()),
    };
    let f = start(eager(), stores).await;
    let window = f.open(&["https://a", "https://b"]).await;
    let tab = f.tabs(window).await[0].id;
    f.host
        .update_tab(tab, TabChanges::default(), Some("https://a/icon.png".into()))
        .unwrap();
    settle().await;

    let work = f.save_as(window, "Work").await;
    assert_eq!(f.records(&work).await.len(), 2);

    let report = f.engine.groups().prune_now().await.unwrap();
    assert_eq!(report.favicons_removed, 0);

    let other = f.create("Other").await;
    f.switch(window, &other).await;
    f.switch(window, &work).await;
    assert_eq!(f.urls(window).await, vec!["https://a", "https://b"]);
}

#[tokio::test]
async fn test_back_to_back_switches_save_loaded_tabs() {
    let f = fixture().await;
    let window = f.open(&["https://a", "https://b"]).await;
    let work = f.save_as(window, "Work").await;
    let x = f.create("X").await;
    f.engine
        .groups()
        .append_group(x.clone(), vec![snapshot("x", "https://x")])
        .await
        .unwrap();
    let y = f.create("Y").await;

    // Queued together: the second save must see what the first load opened
    let groups = f.engine.groups();
    let into_x = groups.switch_group(window, Some(x.clone()), None);
    let into_y = groups.switch_group(window, Some(y.clone()), None);
    into_x.await.unwrap();
    into_y.await.unwrap();

    assert_eq!(groups.bound_group(window), Some(y));
    assert_eq!(f.urls(window).await, vec!["about:newtab"]);

    let saved = |records: Vec<TreeNode>| -> Vec<String> {
        records.into_iter().filter_map(|r| r.url).collect()
    };
    assert_eq!(saved(f.records(&x).await), vec!["https://x"]);
    assert_eq!(saved(f.records(&work).await), vec!["https://a", "https://b"]);
}
