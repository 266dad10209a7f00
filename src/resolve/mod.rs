//! Ref resolution: turns a git specifier's ref token into one full commit id.

use anyhow::{Context, Result, anyhow};
use log::debug;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

use crate::error::InstallError;
use crate::remote::{RefCatalogue, Remote, RemoteRepository};
use crate::specifier::{RefToken, Specifier};

/// A git specifier bound to exactly one commit on its remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedRevision {
    pub specifier: Specifier,
    pub remote: Remote,
    /// Full 40 character commit id.
    pub commit: String,
}

impl ResolvedRevision {
    /// Identity of the revision independent of how it was spelled.
    pub fn source_id(&self) -> String {
        format!("git:{}#{}", self.remote, self.commit)
    }
}

type CellMap<K, V> = Mutex<HashMap<K, Arc<OnceCell<V>>>>;

/// Returns the cell for `key`, creating it on first use.
fn cell_for<K: Eq + Hash + Clone, V>(map: &CellMap<K, V>, key: &K) -> Result<Arc<OnceCell<V>>> {
    let mut map = map.lock().map_err(|_| anyhow!("resolver cache poisoned"))?;
    Ok(Arc::clone(map.entry(key.clone()).or_default()))
}

/// Resolves ref tokens against remotes.
///
/// Results are memoized per `(remote, ref)` for the life of the resolver.
/// Concurrent callers asking the same question wait on one query.
pub struct RefResolver<R: RemoteRepository + ?Sized> {
    remotes: Arc<R>,
    resolved: CellMap<(Remote, RefToken), String>,
    catalogues: CellMap<Remote, RefCatalogue>,
    commits: CellMap<Remote, Vec<String>>,
}

impl<R: RemoteRepository + ?Sized> RefResolver<R> {
    pub fn new(remotes: Arc<R>) -> Self {
        Self {
            remotes,
            resolved: Mutex::new(HashMap::new()),
            catalogues: Mutex::new(HashMap::new()),
            commits: Mutex::new(HashMap::new()),
        }
    }

    #[tracing::instrument(skip(self), fields(specifier = %specifier))]
    pub async fn resolve(&self, specifier: &Specifier) -> Result<ResolvedRevision> {
        let remote = Remote::from_specifier(specifier)
            .ok_or_else(|| anyhow!("'{}' is not a git specifier", specifier))?;
        let reference = specifier
            .reference()
            .cloned()
            .unwrap_or(RefToken::Unspecified);

        let cell = cell_for(&self.resolved, &(remote.clone(), reference.clone()))?;
        let commit = cell
            .get_or_try_init(|| self.lookup(specifier, &remote, &reference))
            .await?
            .clone();

        debug!("Resolved {} to {}", specifier, commit);
        Ok(ResolvedRevision {
            specifier: specifier.clone(),
            remote,
            commit,
        })
    }

    async fn lookup(
        &self,
        specifier: &Specifier,
        remote: &Remote,
        reference: &RefToken,
    ) -> Result<String> {
        let not_found = || InstallError::RefNotFound {
            specifier: specifier.to_string(),
            reference: reference.to_string(),
        };

        match reference {
            RefToken::Unspecified => {
                let catalogue = self.catalogue(remote).await?;
                catalogue.head().map(str::to_string).ok_or_else(|| not_found().into())
            }
            RefToken::Branch(name) => {
                let catalogue = self.catalogue(remote).await?;
                catalogue
                    .branches
                    .get(name)
                    .or_else(|| catalogue.tags.get(name))
                    .cloned()
                    .ok_or_else(|| not_found().into())
            }
            RefToken::CommitId(id) if reference.is_full_commit() => {
                let exists = self
                    .remotes
                    .commit_exists(remote, id)
                    .await
                    .with_context(|| format!("Failed to look up {} on {}", id, remote))?;
                if exists {
                    Ok(id.clone())
                } else {
                    Err(not_found().into())
                }
            }
            RefToken::CommitId(prefix) => {
                let commits = self.commits(remote).await?;
                let mut candidates: Vec<String> = commits
                    .iter()
                    .filter(|c| c.starts_with(prefix.as_str()))
                    .cloned()
                    .collect();
                candidates.sort();
                match candidates.len() {
                    0 => Err(not_found().into()),
                    1 => Ok(candidates.remove(0)),
                    _ => Err(InstallError::AmbiguousRef {
                        specifier: specifier.to_string(),
                        prefix: prefix.clone(),
                        candidates,
                    }
                    .into()),
                }
            }
        }
    }

    async fn catalogue(&self, remote: &Remote) -> Result<RefCatalogue> {
        let cell = cell_for(&self.catalogues, remote)?;
        let catalogue = cell
            .get_or_try_init(|| async {
                self.remotes
                    .list_refs(remote)
                    .await
                    .with_context(|| format!("Failed to list refs of {}", remote))
            })
            .await?;
        Ok(catalogue.clone())
    }

    async fn commits(&self, remote: &Remote) -> Result<Vec<String>> {
        let cell = cell_for(&self.commits, remote)?;
        let commits = cell
            .get_or_try_init(|| async {
                self.remotes
                    .list_commits(remote)
                    .await
                    .with_context(|| format!("Failed to list commits of {}", remote))
            })
            .await?;
        Ok(commits.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemoteRepository;
    use crate::specifier::parse;

    const HEAD: &str = "0b8f43f77361ff7739bcb42de7787b09208bcece";
    const TAGGED: &str = "5f7a1d0e3e2b4c1a9d8e7f6a5b4c3d2e1f0a9b8c";
    const TWIN_A: &str = "abcdef0000000000000000000000000000000001";
    const TWIN_B: &str = "abcdef1111111111111111111111111111111112";

    fn catalogue() -> RefCatalogue {
        let mut catalogue = RefCatalogue {
            default_branch: Some("master".into()),
            ..Default::default()
        };
        catalogue.branches.insert("master".into(), HEAD.into());
        catalogue.tags.insert("v1.0.0".into(), TAGGED.into());
        catalogue
    }

    fn remote_with_history() -> MockRemoteRepository {
        let mut remote = MockRemoteRepository::new();
        remote.expect_list_refs().returning(|_| Ok(catalogue()));
        remote.expect_list_commits().returning(|_| {
            Ok(vec![
                HEAD.to_string(),
                TAGGED.to_string(),
                TWIN_A.to_string(),
                TWIN_B.to_string(),
            ])
        });
        remote
            .expect_commit_exists()
            .returning(|_, commit| Ok(commit == HEAD || commit == TAGGED));
        remote
    }

    async fn resolve(resolver: &RefResolver<MockRemoteRepository>, raw: &str) -> Result<String> {
        Ok(resolver.resolve(&parse(raw)?).await?.commit)
    }

    #[tokio::test]
    async fn test_unspecified_uses_default_branch() {
        let resolver = RefResolver::new(Arc::new(remote_with_history()));
        let revision = resolver
            .resolve(&parse("yarnpkg/example-yarn-package").unwrap())
            .await
            .unwrap();
        assert_eq!(revision.commit, HEAD);
        assert_eq!(revision.commit.len(), 40);
        assert_eq!(
            revision.source_id(),
            format!("git:github:yarnpkg/example-yarn-package#{}", HEAD)
        );
    }

    #[tokio::test]
    async fn test_prefixes_match_full_id() {
        let resolver = RefResolver::new(Arc::new(remote_with_history()));
        for raw in [
            "yarnpkg/example-yarn-package#master",
            "yarnpkg/example-yarn-package#0b8f43",
            "yarnpkg/example-yarn-package#0b8f43f77",
            "yarnpkg/example-yarn-package#0b8f43f77361ff7739bcb42de7787b09208bcece",
            "git+https://github.com/yarnpkg/example-yarn-package.git#master",
        ] {
            assert_eq!(resolve(&resolver, raw).await.unwrap(), HEAD, "{}", raw);
        }
    }

    #[tokio::test]
    async fn test_branch_falls_back_to_tag() {
        let resolver = RefResolver::new(Arc::new(remote_with_history()));
        assert_eq!(resolve(&resolver, "o/r#v1.0.0").await.unwrap(), TAGGED);
    }

    #[tokio::test]
    async fn test_ambiguous_prefix_lists_candidates() {
        let resolver = RefResolver::new(Arc::new(remote_with_history()));
        let err = resolve(&resolver, "o/r#abcdef").await.unwrap_err();
        match err.downcast_ref::<InstallError>() {
            Some(InstallError::AmbiguousRef {
                prefix, candidates, ..
            }) => {
                assert_eq!(prefix, "abcdef");
                assert_eq!(candidates, &vec![TWIN_A.to_string(), TWIN_B.to_string()]);
            }
            other => panic!("expected AmbiguousRef, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_refs_are_not_found() {
        let resolver = RefResolver::new(Arc::new(remote_with_history()));
        for raw in [
            "o/r#no-such-branch",
            "o/r#fedcba",
            "o/r#ffffffffffffffffffffffffffffffffffffffff",
        ] {
            let err = resolve(&resolver, raw).await.unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<InstallError>(),
                    Some(InstallError::RefNotFound { .. })
                ),
                "{}: {:?}",
                raw,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_missing_default_branch_is_not_found() {
        let mut remote = MockRemoteRepository::new();
        remote
            .expect_list_refs()
            .returning(|_| Ok(RefCatalogue::default()));
        let resolver = RefResolver::new(Arc::new(remote));

        let err = resolve(&resolver, "o/r").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InstallError>(),
            Some(InstallError::RefNotFound { reference, .. }) if reference == "HEAD"
        ));
    }

    #[tokio::test]
    async fn test_resolution_is_memoized() {
        let mut remote = MockRemoteRepository::new();
        remote
            .expect_list_refs()
            .times(1)
            .returning(|_| Ok(catalogue()));
        let resolver = Arc::new(RefResolver::new(Arc::new(remote)));

        let spec = parse("o/r#master").unwrap();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                let spec = spec.clone();
                tokio::spawn(async move { resolver.resolve(&spec).await.map(|r| r.commit) })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), HEAD);
        }
        // same remote, different ref: catalogue is reused
        assert_eq!(resolve(&resolver, "o/r").await.unwrap(), HEAD);
    }

    #[tokio::test]
    async fn test_registry_specifier_is_rejected() {
        let resolver = RefResolver::new(Arc::new(MockRemoteRepository::new()));
        assert!(resolve(&resolver, "^1.0.0").await.is_err());
    }
}
