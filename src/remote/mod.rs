//! Remote repository abstraction.
//!
//! The resolver and fetcher only see [`RemoteRepository`]; whether refs come
//! from the GitHub REST API or from the `git` CLI is decided by
//! [`RemoteRouter`] based on the [`Remote`] variant.

mod git;
mod github;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

use crate::runtime::Runtime;
use crate::specifier::{GitScheme, Specifier};

pub use git::GitCliRemote;
pub use github::{DEFAULT_API_URL, GitHubRemote};

/// Where a git specifier's repository lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Remote {
    GitHub { owner: String, repo: String },
    Git { url: String },
}

impl Remote {
    /// Maps a git specifier to its remote. Registry specifiers have none.
    ///
    /// Git URLs on `github.com` go through the GitHub API, so
    /// `git+https://github.com/o/r.git` and `o/r` name the same remote.
    pub fn from_specifier(specifier: &Specifier) -> Option<Remote> {
        match specifier {
            Specifier::Registry { .. } => None,
            Specifier::GitHub { owner, repo, .. } => Some(Remote::GitHub {
                owner: owner.clone(),
                repo: repo.clone(),
            }),
            Specifier::GitUrl {
                scheme, host, path, ..
            } => {
                let bare_host = host.rsplit('@').next().unwrap_or(host);
                if bare_host.eq_ignore_ascii_case("github.com") {
                    if let Some((owner, repo)) = path.split_once('/') {
                        if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') {
                            return Some(Remote::GitHub {
                                owner: owner.to_string(),
                                repo: repo.to_string(),
                            });
                        }
                    }
                }
                Some(Remote::Git {
                    url: transport_url(*scheme, host, path),
                })
            }
        }
    }
}

fn transport_url(scheme: GitScheme, host: &str, path: &str) -> String {
    format!("{}://{}/{}.git", scheme.transport(), host, path)
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remote::GitHub { owner, repo } => write!(f, "github:{}/{}", owner, repo),
            Remote::Git { url } => write!(f, "{}", url),
        }
    }
}

/// Named refs advertised by a remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefCatalogue {
    pub default_branch: Option<String>,
    /// Branch name to tip commit id.
    pub branches: BTreeMap<String, String>,
    /// Tag name to (peeled) commit id.
    pub tags: BTreeMap<String, String>,
}

impl RefCatalogue {
    /// Tip of the default branch.
    pub fn head(&self) -> Option<&str> {
        let branch = self.default_branch.as_ref()?;
        self.branches.get(branch).map(String::as_str)
    }

    /// Unique tips of all branches and tags, sorted.
    pub fn tips(&self) -> Vec<&str> {
        let mut tips: Vec<&str> = self
            .branches
            .values()
            .chain(self.tags.values())
            .map(String::as_str)
            .collect();
        tips.sort_unstable();
        tips.dedup();
        tips
    }
}

/// Network access to a repository.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// Default branch plus branch and tag tips.
    async fn list_refs(&self, remote: &Remote) -> Result<RefCatalogue>;

    /// Every commit id reachable from the remote's branches and tags.
    async fn list_commits(&self, remote: &Remote) -> Result<Vec<String>>;

    /// Whether the remote knows a full commit id.
    async fn commit_exists(&self, remote: &Remote, commit: &str) -> Result<bool>;

    /// Gzip tarball of the tree at `commit`, wrapped in one top-level directory.
    async fn fetch_tree(&self, remote: &Remote, commit: &str) -> Result<Vec<u8>>;
}

/// Dispatches each call on the [`Remote`] variant.
pub struct RemoteRouter<R: Runtime> {
    github: GitHubRemote,
    git: GitCliRemote<R>,
}

impl<R: Runtime> RemoteRouter<R> {
    pub fn new(github: GitHubRemote, git: GitCliRemote<R>) -> Self {
        Self { github, git }
    }
}

#[async_trait]
impl<R: Runtime> RemoteRepository for RemoteRouter<R> {
    async fn list_refs(&self, remote: &Remote) -> Result<RefCatalogue> {
        match remote {
            Remote::GitHub { .. } => self.github.list_refs(remote).await,
            Remote::Git { .. } => self.git.list_refs(remote).await,
        }
    }

    async fn list_commits(&self, remote: &Remote) -> Result<Vec<String>> {
        match remote {
            Remote::GitHub { .. } => self.github.list_commits(remote).await,
            Remote::Git { .. } => self.git.list_commits(remote).await,
        }
    }

    async fn commit_exists(&self, remote: &Remote, commit: &str) -> Result<bool> {
        match remote {
            Remote::GitHub { .. } => self.github.commit_exists(remote, commit).await,
            Remote::Git { .. } => self.git.commit_exists(remote, commit).await,
        }
    }

    async fn fetch_tree(&self, remote: &Remote, commit: &str) -> Result<Vec<u8>> {
        match remote {
            Remote::GitHub { .. } => self.github.fetch_tree(remote, commit).await,
            Remote::Git { .. } => self.git.fetch_tree(remote, commit).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specifier::parse;

    #[test]
    fn test_shorthand_and_github_urls_share_a_remote() {
        let expected = Remote::GitHub {
            owner: "yarnpkg".into(),
            repo: "example-yarn-package".into(),
        };
        for raw in [
            "yarnpkg/example-yarn-package",
            "git+https://github.com/yarnpkg/example-yarn-package.git#master",
            "git://github.com/yarnpkg/example-yarn-package.git",
            "git+ssh://git@github.com/yarnpkg/example-yarn-package.git",
        ] {
            assert_eq!(
                Remote::from_specifier(&parse(raw).unwrap()),
                Some(expected.clone()),
                "{}",
                raw
            );
        }
    }

    #[test]
    fn test_other_hosts_use_transport_url() {
        let remote = Remote::from_specifier(&parse("git+https://git.example.com/team/lib.git").unwrap());
        assert_eq!(
            remote,
            Some(Remote::Git {
                url: "https://git.example.com/team/lib.git".into()
            })
        );

        let remote = Remote::from_specifier(&parse("git+ssh://git@example.com/team/lib.git").unwrap());
        assert_eq!(
            remote,
            Some(Remote::Git {
                url: "ssh://git@example.com/team/lib.git".into()
            })
        );
    }

    #[test]
    fn test_registry_has_no_remote() {
        assert_eq!(Remote::from_specifier(&parse("^4.24.0").unwrap()), None);
    }

    #[test]
    fn test_catalogue_head_and_tips() {
        let mut catalogue = RefCatalogue {
            default_branch: Some("master".into()),
            ..Default::default()
        };
        catalogue.branches.insert("master".into(), "bbb".into());
        catalogue.branches.insert("dev".into(), "aaa".into());
        catalogue.tags.insert("v1".into(), "bbb".into());

        assert_eq!(catalogue.head(), Some("bbb"));
        assert_eq!(catalogue.tips(), vec!["aaa", "bbb"]);

        catalogue.default_branch = Some("gone".into());
        assert_eq!(catalogue.head(), None);
    }
}
