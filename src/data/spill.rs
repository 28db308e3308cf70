//! Backing storage for virtualized data items
//!
//! The store spills encoded payloads through this trait so that the policy
//! (filesystem directory, in-memory for tests, anything else) stays a
//! deployment decision.

use std::{
    collections::HashMap,
    fmt, fs, io,
    path::PathBuf,
    sync::Mutex,
};

use tracing::{debug, trace};

/// Client interface for one spill area.
pub trait SpillBackend: Send + Sync + fmt::Debug {
    fn write(&self, key: &str, bytes: &[u8]) -> io::Result<()>;
    fn read(&self, key: &str) -> io::Result<Vec<u8>>;
    fn remove(&self, key: &str) -> io::Result<()>;
}

/// Spill area backed by one filesystem directory, one file per item.
#[derive(Debug)]
pub struct FsSpillBackend {
    root: PathBuf,
}

impl FsSpillBackend {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl SpillBackend for FsSpillBackend {
    fn write(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        debug!(key, size = bytes.len(), "spilling data item to disk");
        fs::write(self.entry_path(key), bytes)
    }

    fn read(&self, key: &str) -> io::Result<Vec<u8>> {
        trace!(key, "reloading spilled data item");
        fs::read(self.entry_path(key))
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        fs::remove_file(self.entry_path(key))
    }
}

/// Spill area kept in process memory. Bounds nothing, but makes the
/// virtualization state machine observable in tests.
#[derive(Debug, Default)]
pub struct MemorySpillBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySpillBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Drop one entry behind the store's back, simulating externally deleted
    /// backing storage.
    pub fn evict(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }
}

impl SpillBackend for MemorySpillBackend {
    fn write(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> io::Result<Vec<u8>> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no spill entry '{key}'")))
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}
