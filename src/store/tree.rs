use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{CreateNode, NodeKind, TreeNode, UpdateNode};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredNode {
    parent_id: Option<String>,
    title: String,
    url: Option<String>,
    #[serde(default)]
    children: Vec<String>,
}

impl StoredNode {
    fn kind(&self) -> NodeKind {
        if self.url.is_some() {
            NodeKind::Bookmark
        } else {
            NodeKind::Folder
        }
    }
}

/// In-memory tree shared by the memory and JSON stores
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeData {
    #[serde(default)]
    nodes: HashMap<String, StoredNode>,
    /// Ids of the top-level entries, in order
    #[serde(default)]
    top: Vec<String>,
}

impl TreeData {
    pub fn new() -> Self {
        Self::default()
    }

    fn stored(&self, id: &str) -> Result<&StoredNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::store(format!("node not found: {id}")))
    }

    fn siblings(&self, parent: Option<&str>) -> &[String] {
        match parent {
            Some(p) => self.nodes.get(p).map(|n| n.children.as_slice()).unwrap_or(&[]),
            None => &self.top,
        }
    }

    fn siblings_mut(&mut self, parent: Option<&str>) -> Result<&mut Vec<String>> {
        match parent {
            Some(p) => self
                .nodes
                .get_mut(p)
                .map(|n| &mut n.children)
                .ok_or_else(|| Error::store(format!("parent not found: {p}"))),
            None => Ok(&mut self.top),
        }
    }

    fn node(&self, id: &str) -> Result<TreeNode> {
        let stored = self.stored(id)?;
        let index = self
            .siblings(stored.parent_id.as_deref())
            .iter()
            .position(|c| c == id)
            .unwrap_or(0);
        Ok(TreeNode {
            id: id.to_string(),
            parent_id: stored.parent_id.clone(),
            index,
            title: stored.title.clone(),
            url: stored.url.clone(),
            kind: stored.kind(),
            children: None,
        })
    }

    pub fn get(&self, id: &str) -> Result<TreeNode> {
        self.node(id)
    }

    pub fn create(&mut self, id: String, req: CreateNode) -> Result<TreeNode> {
        if let Some(parent) = req.parent_id.as_deref() {
            if self.stored(parent)?.kind() != NodeKind::Folder {
                return Err(Error::store(format!("parent is not a folder: {parent}")));
            }
        }
        let siblings = self.siblings_mut(req.parent_id.as_deref())?;
        let index = req.index.unwrap_or(siblings.len()).min(siblings.len());
        siblings.insert(index, id.clone());
        self.nodes.insert(
            id.clone(),
            StoredNode {
                parent_id: req.parent_id,
                title: req.title,
                url: req.url,
                children: Vec::new(),
            },
        );
        self.node(&id)
    }

    pub fn update(&mut self, id: &str, changes: UpdateNode) -> Result<TreeNode> {
        let stored = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::store(format!("node not found: {id}")))?;
        if changes.url.is_some() && stored.url.is_none() {
            return Err(Error::store(format!("cannot set a URL on folder {id}")));
        }
        if let Some(title) = changes.title {
            stored.title = title;
        }
        if let Some(url) = changes.url {
            stored.url = Some(url);
        }
        self.node(id)
    }

    pub fn remove(&mut self, id: &str) -> Result<()> {
        if !self.stored(id)?.children.is_empty() {
            return Err(Error::store(format!("folder is not empty: {id}")));
        }
        self.remove_tree(id)
    }

    pub fn remove_tree(&mut self, id: &str) -> Result<()> {
        let parent = self.stored(id)?.parent_id.clone();
        self.siblings_mut(parent.as_deref())?.retain(|c| c != id);

        let mut pending = vec![id.to_string()];
        while let Some(next) = pending.pop() {
            if let Some(node) = self.nodes.remove(&next) {
                pending.extend(node.children);
            }
        }
        Ok(())
    }

    pub fn children(&self, id: &str) -> Result<Vec<TreeNode>> {
        self.stored(id)?
            .children
            .iter()
            .map(|c| self.node(c))
            .collect()
    }

    pub fn subtree(&self, id: &str) -> Result<TreeNode> {
        let mut node = self.node(id)?;
        if node.is_folder() {
            let children = self
                .stored(id)?
                .children
                .iter()
                .map(|c| self.subtree(c))
                .collect::<Result<Vec<_>>>()?;
            node.children = Some(children);
        }
        Ok(node)
    }

    pub fn search_url(&self, url: &str) -> Vec<TreeNode> {
        let mut found: Vec<TreeNode> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.url.as_deref() == Some(url))
            .filter_map(|(id, _)| self.node(id).ok())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }
}
