// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Node → receive-server routing table.
//
// Several receive-server threads may each hold live connections that
// authenticated as the same node, so a node maps to a list of
// `{server, count}` entries. Lookups pick among them uniformly.

use std::collections::BTreeMap;

use rand::Rng;

use crate::rw_lock::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvrRef {
    pub svr_idx: usize,
    pub count: u32,
}

/// Ordered map from node id to the servers carrying it.
#[derive(Default)]
pub struct NodeToSvrMap {
    map: RwLock<BTreeMap<i32, Vec<SvrRef>>>,
}

impl NodeToSvrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more connection for `node_id` on `svr_idx`.
    pub fn add(&self, node_id: i32, svr_idx: usize) {
        let mut map = self.map.write();
        let list = map.entry(node_id).or_default();
        match list.iter_mut().find(|r| r.svr_idx == svr_idx) {
            Some(r) => r.count += 1,
            None => list.push(SvrRef { svr_idx, count: 1 }),
        }
    }

    /// Forget one connection. Returns `false` if there was nothing to
    /// forget. A node whose list becomes empty is pruned.
    pub fn remove(&self, node_id: i32, svr_idx: usize) -> bool {
        let mut map = self.map.write();
        let Some(list) = map.get_mut(&node_id) else {
            return false;
        };
        let Some(pos) = list.iter().position(|r| r.svr_idx == svr_idx) else {
            return false;
        };
        list[pos].count -= 1;
        if list[pos].count == 0 {
            list.swap_remove(pos);
        }
        if list.is_empty() {
            map.remove(&node_id);
        }
        true
    }

    /// A uniformly chosen server carrying `node_id`.
    pub fn pick_random(&self, node_id: i32) -> Option<usize> {
        let map = self.map.read();
        let list = map.get(&node_id)?;
        if list.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..list.len());
        Some(list[i].svr_idx)
    }

    /// Entries for `node_id` (snapshot).
    pub fn entries(&self, node_id: i32) -> Vec<SvrRef> {
        self.map.read().get(&node_id).cloned().unwrap_or_default()
    }

    /// Number of nodes with at least one entry.
    pub fn node_count(&self) -> usize {
        self.map.read().len()
    }
}

impl std::fmt::Debug for NodeToSvrMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.map.read().iter()).finish()
    }
}
