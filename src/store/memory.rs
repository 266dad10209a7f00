use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{FetchedTree, TreeStore, validate_key};
use crate::archive::FileMap;

/// In-memory store, for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryStore {
    trees: Mutex<HashMap<String, FetchedTree>>,
    publishes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of trees actually published (first writer per key).
    pub fn publish_count(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }
}

impl TreeStore for MemoryStore {
    fn get(&self, commit: &str) -> Result<Option<FetchedTree>> {
        let trees = self
            .trees
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(trees.get(commit).cloned())
    }

    fn publish(&self, commit: &str, files: FileMap) -> Result<FetchedTree> {
        validate_key(commit)?;
        let mut trees = self
            .trees
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        let tree = trees.entry(commit.to_string()).or_insert_with(|| {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            FetchedTree {
                commit: commit.to_string(),
                root: PathBuf::from("memory").join(commit),
                files,
            }
        });
        Ok(tree.clone())
    }
}
