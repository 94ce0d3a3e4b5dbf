//! Persistence collaborators.
//!
//! Groups live in a hierarchical [`TreeStore`] (a bookmark tree) that only
//! offers single-entry operations. Auxiliary per-record data (favicons,
//! containers) lives in [`KeyValueStore`] namespaces keyed by record id.

mod file;
mod memory;
mod tree;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use file::{JsonKvStore, JsonTreeStore};
pub use memory::{MemoryKvStore, MemoryTreeStore};
pub use tree::TreeData;

/// Namespace holding favicon URLs keyed by record id
pub const FAVICON_NAMESPACE: &str = "favicon";
/// Namespace holding per-tab extra info keyed by record id
pub const TAB_INFO_NAMESPACE: &str = "tab-info";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    Bookmark,
}

/// One entry of the tree as returned by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub index: usize,
    pub title: String,
    pub url: Option<String>,
    pub kind: NodeKind,
    /// Populated by `get_subtree` only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

impl TreeNode {
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

/// Creation request. A node without a URL is a folder.
#[derive(Debug, Clone, Default)]
pub struct CreateNode {
    pub parent_id: Option<String>,
    pub index: Option<usize>,
    pub title: String,
    pub url: Option<String>,
}

impl CreateNode {
    pub fn folder(parent_id: Option<String>, title: impl Into<String>) -> Self {
        Self {
            parent_id,
            index: None,
            title: title.into(),
            url: None,
        }
    }

    pub fn bookmark(parent_id: &str, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            parent_id: Some(parent_id.to_string()),
            index: None,
            title: title.into(),
            url: Some(url.into()),
        }
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateNode {
    pub title: Option<String>,
    pub url: Option<String>,
}

/// Bookmark-like tree. Every call is individually atomic; nothing composes
/// several calls into one transaction.
#[async_trait]
pub trait TreeStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<TreeNode>;
    async fn create(&self, node: CreateNode) -> Result<TreeNode>;
    async fn update(&self, id: &str, changes: UpdateNode) -> Result<TreeNode>;
    /// Removes a bookmark or an empty folder
    async fn remove(&self, id: &str) -> Result<()>;
    async fn remove_tree(&self, id: &str) -> Result<()>;
    async fn get_children(&self, id: &str) -> Result<Vec<TreeNode>>;
    async fn get_subtree(&self, id: &str) -> Result<TreeNode>;
    async fn search_url(&self, url: &str) -> Result<Vec<TreeNode>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    Set(String, serde_json::Value),
    Delete(String),
}

/// Asynchronous key-value namespace
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
    /// Applies `ops` as one unit. Writes inside a read-only scope are rejected.
    async fn transaction(&self, mode: TxMode, ops: Vec<KvOp>) -> Result<()>;
}
