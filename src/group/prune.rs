//! Garbage collection of secondary per-record data.
//!
//! Keys are listed before the tree is scanned: a record and its secondary
//! data are written in that order, so any key seen here whose record exists
//! at all will also be present in the later tree scan.

use std::collections::HashSet;

use serde::Serialize;

use crate::error::Result;
use crate::store::{KeyValueStore, KvOp, TreeNode, TxMode};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub favicons_removed: usize,
    pub tab_info_removed: usize,
}

pub(crate) fn collect_ids(node: &TreeNode, out: &mut HashSet<String>) {
    out.insert(node.id.clone());
    for child in node.children.iter().flatten() {
        collect_ids(child, out);
    }
}

/// Delete every key of `store` from `keys` that is not a live record id
pub(crate) async fn prune_keys(
    store: &dyn KeyValueStore,
    keys: Vec<String>,
    live: &HashSet<String>,
) -> Result<usize> {
    let stale: Vec<KvOp> = keys
        .into_iter()
        .filter(|k| !live.contains(k))
        .map(KvOp::Delete)
        .collect();
    let count = stale.len();
    if count > 0 {
        store.transaction(TxMode::ReadWrite, stale).await?;
    }
    Ok(count)
}

/// Best-effort [`prune_keys`]; failures are logged and count as nothing removed
pub(crate) async fn prune_namespace(
    namespace: &str,
    store: &dyn KeyValueStore,
    keys: Result<Vec<String>>,
    live: &HashSet<String>,
) -> usize {
    let keys = match keys {
        Ok(keys) => keys,
        Err(e) => {
            tracing::warn!("cannot list {} keys: {}", namespace, e);
            return 0;
        }
    };
    match prune_keys(store, keys, live).await {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!("failed to prune {}: {}", namespace, e);
            0
        }
    }
}
