//! Content-addressed tree store.
//!
//! Trees are keyed by full commit id. Once a key is published its content
//! never changes, so readers need no coordination. Writers stage and publish
//! by rename, which keeps half-written trees out of sight.

mod disk;
mod memory;

use anyhow::{Result, anyhow};
use std::path::PathBuf;

use crate::archive::FileMap;
use crate::specifier::{FULL_COMMIT_LEN, is_commit_id};

pub use disk::DiskStore;
pub use memory::MemoryStore;

/// A materialized tree for one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedTree {
    pub commit: String,
    pub root: PathBuf,
    pub files: FileMap,
}

impl FetchedTree {
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }
}

/// Storage for fetched trees, shared by every fetch in the process.
pub trait TreeStore: Send + Sync {
    /// Returns the published tree for `commit`, if any.
    fn get(&self, commit: &str) -> Result<Option<FetchedTree>>;

    /// Publishes `files` under `commit`. When another writer published the
    /// same key first, its tree is returned and `files` is discarded.
    fn publish(&self, commit: &str, files: FileMap) -> Result<FetchedTree>;
}

/// Store keys double as directory names, so only full ids are accepted.
pub fn validate_key(commit: &str) -> Result<()> {
    if commit.len() == FULL_COMMIT_LEN && is_commit_id(commit) {
        Ok(())
    } else {
        Err(anyhow!("Invalid store key '{}': expected a full commit id", commit))
    }
}
