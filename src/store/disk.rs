use anyhow::{Context, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{FetchedTree, TreeStore, validate_key};
use crate::archive::FileMap;
use crate::cleanup::StagingGuard;
use crate::runtime::Runtime;

/// Trees on disk under `<root>/<commit>/`.
///
/// Safe to share between concurrent installs on one machine: a tree becomes
/// visible only through the final rename, and a writer that loses the race
/// drops its staging copy and reads the winner's.
pub struct DiskStore<R: Runtime> {
    runtime: R,
    root: PathBuf,
}

impl<R: Runtime> DiskStore<R> {
    pub fn new(runtime: R, root: PathBuf) -> Self {
        Self { runtime, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collect_files(&self, dir: &Path, prefix: &str, files: &mut FileMap) -> Result<()> {
        for entry in self.runtime.read_dir(dir)? {
            let Some(name) = entry.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            if self.runtime.is_dir(&entry) {
                self.collect_files(&entry, &relative, files)?;
            } else {
                files.insert(relative, self.runtime.read(&entry)?);
            }
        }
        Ok(())
    }

    fn stage(&self, staging: &Path, files: &FileMap) -> Result<()> {
        self.runtime.create_dir_all(staging)?;
        for (relative, contents) in files {
            let target = staging.join(relative);
            if let Some(parent) = target.parent() {
                self.runtime.create_dir_all(parent)?;
            }
            self.runtime.write(&target, contents)?;
        }
        Ok(())
    }
}

impl<R: Runtime> TreeStore for DiskStore<R> {
    #[tracing::instrument(skip(self))]
    fn get(&self, commit: &str) -> Result<Option<FetchedTree>> {
        validate_key(commit)?;
        let dir = self.root.join(commit);
        if !self.runtime.is_dir(&dir) {
            return Ok(None);
        }

        let mut files = FileMap::new();
        self.collect_files(&dir, "", &mut files)
            .with_context(|| format!("Failed to read stored tree {:?}", dir))?;
        debug!("Store hit for {} ({} files)", commit, files.len());

        Ok(Some(FetchedTree {
            commit: commit.to_string(),
            root: dir,
            files,
        }))
    }

    #[tracing::instrument(skip(self, files))]
    fn publish(&self, commit: &str, files: FileMap) -> Result<FetchedTree> {
        validate_key(commit)?;
        let target = self.root.join(commit);
        if let Some(existing) = self.get(commit)? {
            return Ok(existing);
        }

        let guard = StagingGuard::new(
            &self.runtime,
            self.root.join(format!(".staging-{}", Uuid::new_v4())),
        );
        self.stage(guard.path(), &files)
            .with_context(|| format!("Failed to stage tree for {}", commit))?;

        match self.runtime.rename(guard.path(), &target) {
            Ok(()) => {
                guard.success();
                info!("Stored {} ({} files)", commit, files.len());
                Ok(FetchedTree {
                    commit: commit.to_string(),
                    root: target,
                    files,
                })
            }
            Err(e) => {
                drop(guard);
                // another process published between our check and rename
                match self.get(commit)? {
                    Some(existing) => {
                        debug!("Lost publish race for {}, reusing stored tree", commit);
                        Ok(existing)
                    }
                    None => Err(e.context(format!("Failed to publish tree for {}", commit))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, RealRuntime};
    use tempfile::tempdir;

    const COMMIT: &str = "0b8f43f77361ff7739bcb42de7787b09208bcece";

    fn files() -> FileMap {
        let mut files = FileMap::new();
        files.insert(
            "package.json".into(),
            br#"{"name":"example-yarn-package","version":"1.0.0"}"#.to_vec(),
        );
        files.insert("lib/index.js".into(), b"module.exports = 1;".to_vec());
        files
    }

    fn is_staging(path: &Path) -> bool {
        path.file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with(".staging-"))
    }

    #[test]
    fn test_publish_then_get() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(RealRuntime, dir.path().join("store"));

        assert!(store.get(COMMIT).unwrap().is_none());

        let published = store.publish(COMMIT, files()).unwrap();
        assert_eq!(published.root, dir.path().join("store").join(COMMIT));
        assert!(published.root.join("lib/index.js").exists());

        let loaded = store.get(COMMIT).unwrap().unwrap();
        assert_eq!(loaded, published);
    }

    #[test]
    fn test_publish_leaves_no_staging_dirs() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("store");
        let store = DiskStore::new(RealRuntime, root.clone());

        store.publish(COMMIT, files()).unwrap();

        let names: Vec<_> = std::fs::read_dir(&root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![COMMIT.to_string()]);
    }

    #[test]
    fn test_publish_existing_key_keeps_first_tree() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(RealRuntime, dir.path().to_path_buf());

        store.publish(COMMIT, files()).unwrap();
        let mut other = FileMap::new();
        other.insert("package.json".into(), b"{}".to_vec());
        let tree = store.publish(COMMIT, other).unwrap();

        assert_eq!(tree.files, files());
    }

    #[test]
    fn test_rename_failure_without_winner_is_an_error() {
        let mut runtime = MockRuntime::new();
        runtime.expect_is_dir().returning(|path| is_staging(path));
        runtime.expect_create_dir_all().returning(|_| Ok(()));
        runtime.expect_write().returning(|_, _| Ok(()));
        runtime
            .expect_rename()
            .returning(|_, _| Err(anyhow::anyhow!("disk full")));
        runtime
            .expect_remove_dir_all()
            .withf(|path| is_staging(path))
            .times(1)
            .returning(|_| Ok(()));

        let store = DiskStore::new(runtime, PathBuf::from("/store"));
        let err = store.publish(COMMIT, files()).unwrap_err();
        assert!(format!("{:#}", err).contains("disk full"));
    }

    #[test]
    fn test_rejects_short_keys() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(RealRuntime, dir.path().to_path_buf());
        assert!(store.get("0b8f43").is_err());
        assert!(store.publish("0b8f43", files()).is_err());
    }
}
