use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{CreateNode, KeyValueStore, KvOp, TreeData, TreeNode, TreeStore, TxMode, UpdateNode};
use crate::error::{Error, Result};

/// Generate a short node id
pub(super) fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Volatile tree store
#[derive(Debug, Default)]
pub struct MemoryTreeStore {
    data: Mutex<TreeData>,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TreeStore for MemoryTreeStore {
    async fn get(&self, id: &str) -> Result<TreeNode> {
        self.data.lock().get(id)
    }

    async fn create(&self, node: CreateNode) -> Result<TreeNode> {
        self.data.lock().create(generate_id(), node)
    }

    async fn update(&self, id: &str, changes: UpdateNode) -> Result<TreeNode> {
        self.data.lock().update(id, changes)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.data.lock().remove(id)
    }

    async fn remove_tree(&self, id: &str) -> Result<()> {
        self.data.lock().remove_tree(id)
    }

    async fn get_children(&self, id: &str) -> Result<Vec<TreeNode>> {
        self.data.lock().children(id)
    }

    async fn get_subtree(&self, id: &str) -> Result<TreeNode> {
        self.data.lock().subtree(id)
    }

    async fn search_url(&self, url: &str) -> Result<Vec<TreeNode>> {
        Ok(self.data.lock().search_url(url))
    }
}

pub(super) fn apply_ops(
    map: &mut BTreeMap<String, serde_json::Value>,
    mode: TxMode,
    ops: Vec<KvOp>,
) -> Result<()> {
    if mode == TxMode::ReadOnly && !ops.is_empty() {
        return Err(Error::store("write attempted in a read-only transaction"));
    }
    for op in ops {
        match op {
            KvOp::Set(key, value) => {
                map.insert(key, value);
            }
            KvOp::Delete(key) => {
                map.remove(&key);
            }
        }
    }
    Ok(())
}

/// Volatile key-value namespace
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    data: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.data.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.data.lock().keys().cloned().collect())
    }

    async fn transaction(&self, mode: TxMode, ops: Vec<KvOp>) -> Result<()> {
        apply_ops(&mut self.data.lock(), mode, ops)
    }
}
