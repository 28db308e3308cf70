//! Node output cache
//!
//! Maps a producing node's identity to its most recent committed output
//! tables, one per output slot, so editor-triggered re-runs can reuse
//! upstream results. Reads and writes are internally synchronized because UI
//! and pipeline threads access the cache concurrently.
//!
//! Observers are held weakly: the cache never keeps a listener alive, so an
//! observer cleans itself up by simply dropping its subscription handle.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, Weak},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{progress::Progress, table::DataTable};

/// Identity of a producing node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// A slot's table was stored or replaced.
    Stored { node: NodeId, slot: String },
    /// All entries of a node were removed.
    Invalidated { node: NodeId },
    /// The whole cache was emptied.
    Cleared,
}

pub trait CacheObserver: Send + Sync {
    fn cache_changed(&self, event: &CacheEvent);
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<NodeId, IndexMap<String, Arc<DataTable>>>,
    observers: Vec<Weak<dyn CacheObserver>>,
}

#[derive(Default)]
pub struct OutputCache {
    state: Mutex<CacheState>,
}

impl OutputCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent committed output per slot for a node, or an empty map
    /// when nothing is cached. Tables are shared; mutate a duplicate, never
    /// a cached table.
    pub fn query(&self, node: &NodeId, progress: &Progress) -> IndexMap<String, Arc<DataTable>> {
        let state = self.state.lock().unwrap();
        let entries = state.entries.get(node).cloned().unwrap_or_default();
        progress.log(format!("cache query for {node}: {} slots", entries.len()));
        entries
    }

    /// Replace the entry for one output slot atomically and notify
    /// observers.
    pub fn store(&self, node: NodeId, slot: impl Into<String>, table: Arc<DataTable>) {
        let slot = slot.into();
        {
            let mut state = self.state.lock().unwrap();
            state
                .entries
                .entry(node.clone())
                .or_default()
                .insert(slot.clone(), table);
        }
        self.notify(&CacheEvent::Stored { node, slot });
    }

    /// Remove all entries of a node, for example after an upstream parameter
    /// change, and notify observers.
    pub fn invalidate(&self, node: &NodeId) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.entries.remove(node).is_some()
        };
        if removed {
            self.notify(&CacheEvent::Invalidated { node: node.clone() });
        }
    }

    pub fn clear(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.entries.clear();
        }
        self.notify(&CacheEvent::Cleared);
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().entries.is_empty()
    }

    /// Register an observer. Only a weak reference is kept; the observer
    /// unsubscribes by dropping its own `Arc`.
    pub fn subscribe(&self, observer: Weak<dyn CacheObserver>) {
        self.state.lock().unwrap().observers.push(observer);
    }

    fn notify(&self, event: &CacheEvent) {
        // Upgrade under the lock, call outside of it, so observers may query
        // the cache from their callback.
        let observers: Vec<Arc<dyn CacheObserver>> = {
            let mut state = self.state.lock().unwrap();
            state.observers.retain(|observer| observer.strong_count() > 0);
            state
                .observers
                .iter()
                .filter_map(Weak::upgrade)
                .collect()
        };
        for observer in observers {
            observer.cache_changed(event);
        }
    }
}

impl fmt::Debug for OutputCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("OutputCache")
            .field("nodes", &state.entries.len())
            .field("observers", &state.observers.len())
            .finish()
    }
}
