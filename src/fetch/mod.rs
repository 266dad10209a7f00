//! Source fetcher: materializes resolved revisions into the tree store.

use anyhow::{Result, anyhow};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

use crate::archive::unpack_tar_gz;
use crate::error::InstallError;
use crate::http::{RetryPolicy, with_retry};
use crate::remote::RemoteRepository;
use crate::resolve::ResolvedRevision;
use crate::store::{FetchedTree, TreeStore};

/// Fetches trees for resolved revisions.
///
/// At most one fetch per commit is in flight in this process; later callers
/// wait on it and share the result. A revision already in the store costs no
/// network I/O.
pub struct SourceFetcher<R: RemoteRepository + ?Sized, S: TreeStore + ?Sized> {
    remotes: Arc<R>,
    store: Arc<S>,
    policy: RetryPolicy,
    trees: Mutex<HashMap<String, Arc<OnceCell<Arc<FetchedTree>>>>>,
}

impl<R: RemoteRepository + ?Sized, S: TreeStore + ?Sized> SourceFetcher<R, S> {
    pub fn new(remotes: Arc<R>, store: Arc<S>, policy: RetryPolicy) -> Self {
        Self {
            remotes,
            store,
            policy,
            trees: Mutex::new(HashMap::new()),
        }
    }

    #[tracing::instrument(skip(self), fields(commit = %revision.commit))]
    pub async fn fetch(&self, revision: &ResolvedRevision) -> Result<Arc<FetchedTree>> {
        let cell = {
            let mut trees = self
                .trees
                .lock()
                .map_err(|_| anyhow!("fetch table poisoned"))?;
            Arc::clone(trees.entry(revision.commit.clone()).or_default())
        };

        let tree = cell.get_or_try_init(|| self.fetch_uncached(revision)).await?;
        Ok(Arc::clone(tree))
    }

    async fn fetch_uncached(&self, revision: &ResolvedRevision) -> Result<Arc<FetchedTree>> {
        if let Some(tree) = self.store.get(&revision.commit)? {
            debug!("Using stored tree for {}", revision.commit);
            return Ok(Arc::new(tree));
        }

        info!("Fetching {} at {}...", revision.specifier, revision.commit);
        let operation = format!("fetch {}", revision.remote);
        let files = with_retry(&operation, &self.policy, || async {
            let bytes = self
                .remotes
                .fetch_tree(&revision.remote, &revision.commit)
                .await?;
            unpack_tar_gz(&bytes)
        })
        .await
        .map_err(|e| InstallError::Fetch {
            specifier: revision.specifier.to_string(),
            attempts: e.attempts,
            message: format!("{:#}", e.error),
        })?;

        let tree = self.store.publish(&revision.commit, files)?;
        Ok(Arc::new(tree))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{FileMap, pack_tar_gz};
    use crate::remote::{MockRemoteRepository, Remote};
    use crate::specifier::parse;
    use crate::store::{DiskStore, MemoryStore};
    use crate::runtime::RealRuntime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    const COMMIT: &str = "0b8f43f77361ff7739bcb42de7787b09208bcece";

    fn revision() -> ResolvedRevision {
        ResolvedRevision {
            specifier: parse("yarnpkg/example-yarn-package").unwrap(),
            remote: Remote::GitHub {
                owner: "yarnpkg".into(),
                repo: "example-yarn-package".into(),
            },
            commit: COMMIT.into(),
        }
    }

    fn tarball() -> Vec<u8> {
        let mut files = FileMap::new();
        files.insert(
            "package.json".into(),
            br#"{"name":"example-yarn-package","version":"1.0.0"}"#.to_vec(),
        );
        pack_tar_gz("yarnpkg-example-yarn-package-0b8f43f", &files).unwrap()
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_second_fetch_does_no_io() {
        let mut remote = MockRemoteRepository::new();
        remote
            .expect_fetch_tree()
            .times(1)
            .returning(|_, _| Ok(tarball()));
        let store = Arc::new(MemoryStore::new());
        let fetcher = SourceFetcher::new(Arc::new(remote), Arc::clone(&store), fast());

        let first = fetcher.fetch(&revision()).await.unwrap();
        let second = fetcher.fetch(&revision()).await.unwrap();

        assert_eq!(first, second);
        assert!(first.file("package.json").is_some());
        assert_eq!(store.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_download() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut remote = MockRemoteRepository::new();
        remote.expect_fetch_tree().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(tarball())
        });
        let fetcher = Arc::new(SourceFetcher::new(
            Arc::new(remote),
            Arc::new(MemoryStore::new()),
            fast(),
        ));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let fetcher = Arc::clone(&fetcher);
                tokio::spawn(async move { fetcher.fetch(&revision()).await.map(|_| ()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stored_tree_skips_network() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DiskStore::new(RealRuntime, dir.path().to_path_buf()));
        store
            .publish(COMMIT, unpack_tar_gz(&tarball()).unwrap())
            .unwrap();

        // no expectations: any network call panics
        let fetcher = SourceFetcher::new(Arc::new(MockRemoteRepository::new()), store, fast());
        let tree = fetcher.fetch(&revision()).await.unwrap();
        assert_eq!(tree.root, dir.path().join(COMMIT));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut remote = MockRemoteRepository::new();
        remote.expect_fetch_tree().returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow!("connection reset"))
            } else {
                Ok(tarball())
            }
        });
        let fetcher = SourceFetcher::new(Arc::new(remote), Arc::new(MemoryStore::new()), fast());

        fetcher.fetch(&revision()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_exhausted_retries_surface_fetch_error() {
        let mut remote = MockRemoteRepository::new();
        remote
            .expect_fetch_tree()
            .times(3)
            .returning(|_, _| Err(anyhow!("operation timed out")));
        let store = Arc::new(MemoryStore::new());
        let fetcher = SourceFetcher::new(Arc::new(remote), Arc::clone(&store), fast());

        let err = fetcher.fetch(&revision()).await.unwrap_err();
        match err.downcast_ref::<InstallError>() {
            Some(InstallError::Fetch {
                specifier,
                attempts,
                message,
            }) => {
                assert_eq!(specifier, "yarnpkg/example-yarn-package");
                assert_eq!(*attempts, 3);
                assert!(message.contains("timed out"));
            }
            other => panic!("expected Fetch, got {:?}", other),
        }
        assert_eq!(store.publish_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_corrupt_archive_is_not_published() {
        let mut remote = MockRemoteRepository::new();
        remote
            .expect_fetch_tree()
            .returning(|_, _| Ok(b"not a tarball".to_vec()));
        let store = Arc::new(MemoryStore::new());
        let fetcher = SourceFetcher::new(Arc::new(remote), Arc::clone(&store), fast());

        assert!(fetcher.fetch(&revision()).await.is_err());
        assert!(store.get(COMMIT).unwrap().is_none());
    }
}
