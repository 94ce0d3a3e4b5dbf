use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::memory::{apply_ops, generate_id};
use super::{CreateNode, KeyValueStore, KvOp, TreeData, TreeNode, TreeStore, TxMode, UpdateNode};
use crate::error::{Error, Result};

const MAX_BACKUP_GENERATIONS: usize = 3;

/// On-disk document format
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document<T> {
    data: T,
    updated_at: DateTime<Utc>,
}

/// A JSON document on disk, exclusively owned by this process while open
#[derive(Debug)]
struct JsonFile {
    path: PathBuf,
    _lock: File,
}

impl JsonFile {
    async fn open<T: DeserializeOwned + Default>(path: &Path) -> Result<(Self, T)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let lock = File::create(path.with_extension("lock"))?;
        lock.try_lock_exclusive()
            .map_err(|_| Error::store(format!("{} is in use by another process", path.display())))?;

        let data = if path.exists() {
            let content = fs::read_to_string(path).await?;
            serde_json::from_str::<Document<T>>(&content)?.data
        } else {
            T::default()
        };

        let file = Self {
            path: path.to_path_buf(),
            _lock: lock,
        };
        file.create_backup().await?;
        Ok((file, data))
    }

    /// Replace the document on disk. Readers never see a partial file.
    async fn save<T: Serialize>(&self, data: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(&Document {
            data,
            updated_at: Utc::now(),
        })?;

        let staged = self.path.with_extension("tmp");
        {
            let mut out = fs::File::create(&staged).await?;
            out.write_all(json.as_bytes()).await?;
            out.sync_all().await?;
        }
        fs::rename(&staged, &self.path).await?;
        Ok(())
    }

    /// `.bak` is the newest copy, `.bak.N` the older generations
    fn backup_path(&self, generation: usize) -> PathBuf {
        match generation {
            1 => self.path.with_extension("bak"),
            n => self.path.with_extension(format!("bak.{n}")),
        }
    }

    /// Shift existing backups one generation back and copy the current file
    /// into the newest slot. The oldest generation falls off.
    async fn create_backup(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        for generation in (1..MAX_BACKUP_GENERATIONS).rev() {
            let older = self.backup_path(generation);
            if !older.exists() {
                continue;
            }
            let oldest = self.backup_path(generation + 1);
            if oldest.exists() {
                fs::remove_file(&oldest).await?;
            }
            fs::rename(&older, &oldest).await?;
        }

        fs::copy(&self.path, self.backup_path(1)).await?;
        Ok(())
    }
}

/// Tree store persisted as a single JSON file
#[derive(Debug)]
pub struct JsonTreeStore {
    file: JsonFile,
    data: Mutex<TreeData>,
}

impl JsonTreeStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, data) = JsonFile::open::<TreeData>(path.as_ref()).await?;
        Ok(Self {
            file,
            data: Mutex::new(data),
        })
    }

    /// Apply `f` to a copy and keep it only once it is on disk
    async fn mutate<T>(&self, f: impl FnOnce(&mut TreeData) -> Result<T> + Send) -> Result<T> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        let out = f(&mut next)?;
        self.file.save(&next).await?;
        *data = next;
        Ok(out)
    }
}

#[async_trait]
impl TreeStore for JsonTreeStore {
    async fn get(&self, id: &str) -> Result<TreeNode> {
        self.data.lock().await.get(id)
    }

    async fn create(&self, node: CreateNode) -> Result<TreeNode> {
        self.mutate(|d| d.create(generate_id(), node)).await
    }

    async fn update(&self, id: &str, changes: UpdateNode) -> Result<TreeNode> {
        self.mutate(|d| d.update(id, changes)).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.mutate(|d| d.remove(id)).await
    }

    async fn remove_tree(&self, id: &str) -> Result<()> {
        self.mutate(|d| d.remove_tree(id)).await
    }

    async fn get_children(&self, id: &str) -> Result<Vec<TreeNode>> {
        self.data.lock().await.children(id)
    }

    async fn get_subtree(&self, id: &str) -> Result<TreeNode> {
        self.data.lock().await.subtree(id)
    }

    async fn search_url(&self, url: &str) -> Result<Vec<TreeNode>> {
        Ok(self.data.lock().await.search_url(url))
    }
}

/// Key-value namespace persisted as `<dir>/<namespace>.json`
#[derive(Debug)]
pub struct JsonKvStore {
    file: JsonFile,
    data: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl JsonKvStore {
    pub async fn open(dir: impl AsRef<Path>, namespace: &str) -> Result<Self> {
        let path = dir.as_ref().join(format!("{namespace}.json"));
        let (file, data) = JsonFile::open(&path).await?;
        Ok(Self {
            file,
            data: Mutex::new(data),
        })
    }
}

#[async_trait]
impl KeyValueStore for JsonKvStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.data.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.transaction(TxMode::ReadWrite, vec![KvOp::Set(key.to_string(), value)])
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if !self.data.lock().await.contains_key(key) {
            return Ok(());
        }
        self.transaction(TxMode::ReadWrite, vec![KvOp::Delete(key.to_string())])
            .await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.data.lock().await.keys().cloned().collect())
    }

    async fn transaction(&self, mode: TxMode, ops: Vec<KvOp>) -> Result<()> {
        let mut data = self.data.lock().await;
        if ops.is_empty() {
            return apply_ops(&mut data, mode, ops);
        }
        let mut next = data.clone();
        apply_ops(&mut next, mode, ops)?;
        self.file.save(&next).await?;
        *data = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_tree_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bookmarks.json");

        let id = {
            let store = JsonTreeStore::open(&path).await.unwrap();
            let root = store.create(CreateNode::folder(None, "root")).await.unwrap();
            store
                .create(CreateNode::bookmark(&root.id, "x", "https://x"))
                .await
                .unwrap();
            root.id
        };

        let store = JsonTreeStore::open(&path).await.unwrap();
        let children = store.get_children(&id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].url.as_deref(), Some("https://x"));
        assert!(path.with_extension("bak").exists());
    }

    #[tokio::test]
    async fn test_second_open_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bookmarks.json");
        let _first = JsonTreeStore::open(&path).await.unwrap();
        assert!(JsonTreeStore::open(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_kv_namespace_roundtrip() {
        let dir = tempdir().unwrap();
        {
            let kv = JsonKvStore::open(dir.path(), "favicon").await.unwrap();
            kv.set("a", json!("data:image/png;base64,AA")).await.unwrap();
            kv.set("b", json!("x")).await.unwrap();
            kv.transaction(TxMode::ReadWrite, vec![KvOp::Delete("b".into())])
                .await
                .unwrap();
        }
        let kv = JsonKvStore::open(dir.path(), "favicon").await.unwrap();
        assert_eq!(kv.keys().await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_tree_unchanged() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let store = JsonTreeStore::open(data_dir.join("bookmarks.json"))
            .await
            .unwrap();
        let root = store.create(CreateNode::folder(None, "root")).await.unwrap();

        // Nowhere left to stage the next write
        std::fs::remove_dir_all(&data_dir).unwrap();

        let created = store
            .create(CreateNode::bookmark(&root.id, "x", "https://x"))
            .await;
        assert!(created.is_err());
        assert!(store.get_children(&root.id).await.unwrap().is_empty());
        assert!(store.search_url("https://x").await.unwrap().is_empty());

        assert!(store.remove(&root.id).await.is_err());
        assert!(store.get(&root.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_save_leaves_keys_unchanged() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let kv = JsonKvStore::open(&data_dir, "tab-info").await.unwrap();
        kv.set("kept", json!({ "container": "c1" })).await.unwrap();

        std::fs::remove_dir_all(&data_dir).unwrap();

        assert!(kv.set("new", json!({})).await.is_err());
        assert!(kv.delete("kept").await.is_err());
        assert!(kv
            .transaction(TxMode::ReadWrite, vec![KvOp::Delete("kept".into())])
            .await
            .is_err());

        assert_eq!(kv.get("new").await.unwrap(), None);
        assert_eq!(kv.keys().await.unwrap(), vec!["kept".to_string()]);
    }
}
