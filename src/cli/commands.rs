use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cli::{Args, Command};
use crate::config::ConfigFile;
use crate::error::Result;
use crate::group::{Color, GroupManager, GroupState, GroupSummary, Stores};
use crate::host::MemoryHost;
use crate::store::{JsonKvStore, JsonTreeStore, FAVICON_NAMESPACE, TAB_INFO_NAMESPACE};
use crate::window::WindowManager;

/// Base URL of the headless host's bundled pages
const EXTENSION_BASE: &str = "ext://tab-groups";

pub async fn run_cli(args: Args) -> Result<()> {
    if let Command::Version = args.command {
        println!("tab-groups v{}", crate::VERSION);
        return Ok(());
    }

    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => ConfigFile::data_dir()?,
    };
    let groups = open_manager(&data_dir).await?;

    match args.command {
        Command::List { json } => handle_list(&groups, json).await,
        Command::Create { name } => handle_create(&groups, &name).await,
        Command::Delete { id } => handle_delete(&groups, &id).await,
        Command::Color { id, color } => handle_color(&groups, &id, color.as_deref()).await,
        Command::Prune => handle_prune(&groups).await,
        Command::Version => Ok(()),
    }
}

/// Group engine over the file stores in `dir`, without any live windows
async fn open_manager(dir: &Path) -> Result<GroupManager> {
    tokio::fs::create_dir_all(dir).await?;
    let settings = ConfigFile::load_settings(dir).await?;

    let stores = Stores {
        tree: Arc::new(JsonTreeStore::open(bookmarks_path(dir)).await?),
        favicons: Arc::new(JsonKvStore::open(dir, FAVICON_NAMESPACE).await?),
        tab_info: Arc::new(JsonKvStore::open(dir, TAB_INFO_NAMESPACE).await?),
    };
    let host = Arc::new(MemoryHost::new(EXTENSION_BASE));
    let windows = Arc::new(WindowManager::new());

    tracing::debug!("opened tab groups in {}", dir.display());
    Ok(GroupManager::new(stores, host, windows, settings))
}

fn bookmarks_path(dir: &Path) -> PathBuf {
    dir.join("bookmarks.json")
}

async fn handle_list(groups: &GroupManager, json: bool) -> Result<()> {
    let list = groups.list_groups(None).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if list.is_empty() {
        println!("No groups found.");
        return Ok(());
    }

    println!("{:<24} {:<8} {:>5} {:<8} {}", "NAME", "COLOR", "TABS", "STATE", "ID");
    println!("{}", "-".repeat(64));
    for group in &list {
        println!(
            "{:<24} {:<8} {:>5} {:<8} {}",
            truncate(&group.name, 24),
            group.color.map(|c| c.as_str()).unwrap_or("-"),
            group.size.map(|n| n.to_string()).unwrap_or_default(),
            state_label(group),
            group.id.as_deref().unwrap_or("-"),
        );
    }
    println!("\nTotal: {} groups", list.len());
    Ok(())
}

async fn handle_create(groups: &GroupManager, name: &str) -> Result<()> {
    let group = groups.create_group(name).await?;
    let id = group.id.unwrap_or_default();
    eprintln!("✓ Created group: {}", group.name);
    println!("{}", id);
    Ok(())
}

async fn handle_delete(groups: &GroupManager, id: &str) -> Result<()> {
    groups.delete_group(id).await?;
    println!("✓ Deleted group: {}", id);
    Ok(())
}

async fn handle_color(groups: &GroupManager, id: &str, color: Option<&str>) -> Result<()> {
    let color = color.map(str::parse::<Color>).transpose()?;
    groups.set_group_color(id, color).await?;
    match color {
        Some(c) => println!("✓ Set color of {} to {}", id, c),
        None => println!("✓ Cleared color of {}", id),
    }
    Ok(())
}

async fn handle_prune(groups: &GroupManager) -> Result<()> {
    let report = groups.prune_now().await?;
    println!(
        "✓ Pruned {} favicons and {} tab infos",
        report.favicons_removed, report.tab_info_removed
    );
    Ok(())
}

fn state_label(group: &GroupSummary) -> &'static str {
    match group.state {
        GroupState::Open => "open",
        GroupState::Locked => "locked",
        GroupState::Closed => "closed",
        GroupState::Unsaved => "unsaved",
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}
