//! Last-known `ToolStatus` per tool.
//!
//! Records are held behind `Arc` so readers copy pointers under the read
//! lock and never hold it while encoding or publishing. Writes come from the
//! single ingest task and are last-write-wins on `observed_at`.

use crate::models::{ToolIdentity, ToolStatus};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// Older than the stored record; the store is unchanged.
    Stale,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, UpsertOutcome::Stale)
    }
}

#[derive(Debug, Default)]
pub struct StatusStore {
    tools: RwLock<BTreeMap<String, Arc<ToolStatus>>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// An equal `observed_at` replaces, so a replayed event republishes.
    /// When either side only has a receipt time, arrival order wins.
    pub fn upsert(&self, status: ToolStatus) -> UpsertOutcome {
        let mut tools = self.tools.write();
        match tools.get(&status.backend_id) {
            Some(current)
                if current.source_timed
                    && status.source_timed
                    && current.observed_at > status.observed_at =>
            {
                UpsertOutcome::Stale
            }
            Some(_) => {
                tools.insert(status.backend_id.clone(), Arc::new(status));
                UpsertOutcome::Replaced
            }
            None => {
                tools.insert(status.backend_id.clone(), Arc::new(status));
                UpsertOutcome::Inserted
            }
        }
    }

    pub fn get(&self, backend_id: &str) -> Option<Arc<ToolStatus>> {
        self.tools.read().get(backend_id).cloned()
    }

    /// Point-in-time copy, ordered by backend id.
    pub fn snapshot_all(&self) -> Vec<Arc<ToolStatus>> {
        self.tools.read().values().cloned().collect()
    }

    /// Applies a new identity to every stored tool. An empty mapped category
    /// keeps the one the event carried. Returns the previous display name and
    /// the updated record for each tool whose identity moved.
    pub fn reidentify<F>(&self, identity_for: F) -> Vec<(String, Arc<ToolStatus>)>
    where
        F: Fn(&str) -> ToolIdentity,
    {
        let mut tools = self.tools.write();
        let mut moved = Vec::new();
        for (backend_id, current) in tools.iter_mut() {
            let identity = identity_for(backend_id);
            let category_moved = !identity.category.is_empty() && identity.category != current.category;
            if identity.display_name == current.display_name && !category_moved {
                continue;
            }
            let previous = current.display_name.clone();
            let mut updated = (**current).clone();
            updated.display_name = identity.display_name;
            if category_moved {
                updated.category = identity.category;
            }
            *current = Arc::new(updated);
            moved.push((previous, current.clone()));
        }
        moved
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
