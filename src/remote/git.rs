//! Generic git remote driven through the `git` CLI.
//!
//! Refs come straight from `git ls-remote`. Commit enumeration and tree
//! export need the objects, so each URL gets a bare mirror under the mirror
//! root, refreshed at most once per process.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use uuid::Uuid;

use super::{RefCatalogue, Remote, RemoteRepository};
use crate::cleanup::StagingGuard;
use crate::http::NonRetryableError;
use crate::runtime::Runtime;

pub struct GitCliRemote<R: Runtime> {
    runtime: R,
    mirror_root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    refreshed: Mutex<HashSet<String>>,
}

impl<R: Runtime> GitCliRemote<R> {
    pub fn new(runtime: R, mirror_root: PathBuf) -> Self {
        Self {
            runtime,
            mirror_root,
            locks: Mutex::new(HashMap::new()),
            refreshed: Mutex::new(HashSet::new()),
        }
    }

    fn url(remote: &Remote) -> Result<&str> {
        match remote {
            Remote::Git { url } => Ok(url),
            Remote::GitHub { .. } => bail!("{} must be fetched through the GitHub API", remote),
        }
    }

    fn lock_for(&self, url: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| anyhow!("mirror lock table poisoned"))?;
        Ok(Arc::clone(locks.entry(url.to_string()).or_default()))
    }

    /// Clones or refreshes the bare mirror for `url`. Serialized per URL.
    async fn mirror(&self, url: &str) -> Result<PathBuf> {
        let lock = self.lock_for(url)?;
        let _held = lock.lock().await;

        let mirror = self.mirror_root.join(mirror_dir_name(url));
        let already_fresh = self
            .refreshed
            .lock()
            .map_err(|_| anyhow!("mirror state poisoned"))?
            .contains(url);
        if already_fresh {
            return Ok(mirror);
        }

        if self.runtime.is_dir(&mirror) {
            info!("Updating mirror of {}...", url);
            run_git(&[
                "--git-dir",
                &path_arg(&mirror),
                "remote",
                "update",
                "--prune",
            ])
            .await?;
        } else {
            info!("Cloning {}...", url);
            self.runtime.create_dir_all(&self.mirror_root)?;
            let staging = StagingGuard::new(
                &self.runtime,
                self.mirror_root
                    .join(format!(".staging-{}", Uuid::new_v4())),
            );
            run_git(&[
                "clone",
                "--mirror",
                "--quiet",
                url,
                &path_arg(staging.path()),
            ])
            .await?;
            self.publish_mirror(staging, &mirror)?;
        }

        self.refreshed
            .lock()
            .map_err(|_| anyhow!("mirror state poisoned"))?
            .insert(url.to_string());
        Ok(mirror)
    }

    /// Moves a fresh clone into place. When another install published the
    /// same mirror first, its copy is kept and ours is dropped.
    fn publish_mirror(&self, staging: StagingGuard<'_, R>, mirror: &Path) -> Result<()> {
        match self.runtime.rename(staging.path(), mirror) {
            Ok(()) => {
                staging.success();
                Ok(())
            }
            Err(e) => {
                drop(staging);
                if self.runtime.is_dir(mirror) {
                    debug!("Lost publish race for {:?}, reusing it", mirror);
                    Ok(())
                } else {
                    Err(e.context(format!("Failed to publish mirror {:?}", mirror)))
                }
            }
        }
    }
}

#[async_trait]
impl<R: Runtime> RemoteRepository for GitCliRemote<R> {
    #[tracing::instrument(skip(self))]
    async fn list_refs(&self, remote: &Remote) -> Result<RefCatalogue> {
        let url = Self::url(remote)?;
        let output = run_git(&["ls-remote", "--symref", url]).await?;
        Ok(parse_ls_remote(&String::from_utf8_lossy(&output)))
    }

    #[tracing::instrument(skip(self))]
    async fn list_commits(&self, remote: &Remote) -> Result<Vec<String>> {
        let mirror = self.mirror(Self::url(remote)?).await?;
        let output = run_git(&["--git-dir", &path_arg(&mirror), "rev-list", "--all"]).await?;
        let mut commits: Vec<String> = String::from_utf8_lossy(&output)
            .lines()
            .map(|l| l.trim().to_ascii_lowercase())
            .filter(|l| !l.is_empty())
            .collect();
        commits.sort();
        commits.dedup();
        Ok(commits)
    }

    #[tracing::instrument(skip(self))]
    async fn commit_exists(&self, remote: &Remote, commit: &str) -> Result<bool> {
        let mirror = self.mirror(Self::url(remote)?).await?;
        let status = Command::new("git")
            .args(["--git-dir", &path_arg(&mirror), "cat-file", "-e"])
            .arg(format!("{}^{{commit}}", commit))
            .env("GIT_TERMINAL_PROMPT", "0")
            .status()
            .await
            .context("Failed to run git")?;
        Ok(status.success())
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_tree(&self, remote: &Remote, commit: &str) -> Result<Vec<u8>> {
        let mirror = self.mirror(Self::url(remote)?).await?;
        run_git(&[
            "--git-dir",
            &path_arg(&mirror),
            "archive",
            "--format=tar.gz",
            "--prefix=package/",
            commit,
        ])
        .await
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn mirror_dir_name(url: &str) -> String {
    let mut name: String = url
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    name.push_str(".mirror");
    name
}

/// Runs git non-interactively and returns stdout.
async fn run_git(args: &[&str]) -> Result<Vec<u8>> {
    debug!("git {}", args.join(" "));
    let output = Command::new("git")
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .context("Failed to run git; is it installed?")?;

    if output.status.success() {
        return Ok(output.stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(classify_git_failure(&args.join(" "), &stderr))
}

fn classify_git_failure(command: &str, stderr: &str) -> anyhow::Error {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("not found")
        || lower.contains("does not exist")
        || lower.contains("not a valid object name")
        || lower.contains("not a tree object")
    {
        return NonRetryableError::NotFound(stderr.to_string()).into();
    }
    if lower.contains("authentication failed") || lower.contains("permission denied") {
        return NonRetryableError::AuthenticationFailed(stderr.to_string()).into();
    }
    anyhow!("git {} failed: {}", command, stderr)
}

/// Parses `git ls-remote --symref` output.
pub fn parse_ls_remote(output: &str) -> RefCatalogue {
    let mut catalogue = RefCatalogue::default();
    let mut head_commit = None;

    for line in output.lines() {
        let Some((left, name)) = line.split_once('\t') else {
            continue;
        };
        let name = name.trim();

        if let Some(target) = left.strip_prefix("ref: ") {
            if name == "HEAD" {
                catalogue.default_branch = target
                    .trim()
                    .strip_prefix("refs/heads/")
                    .map(str::to_string);
            }
            continue;
        }

        let commit = left.trim().to_ascii_lowercase();
        if name == "HEAD" {
            head_commit = Some(commit);
        } else if let Some(branch) = name.strip_prefix("refs/heads/") {
            catalogue.branches.insert(branch.to_string(), commit);
        } else if let Some(tag) = name.strip_prefix("refs/tags/") {
            // the peeled `^{}` line follows the tag object and names the commit
            let tag = tag.strip_suffix("^{}").unwrap_or(tag);
            catalogue.tags.insert(tag.to_string(), commit);
        }
    }

    if catalogue.default_branch.is_none() {
        if let Some(head) = head_commit {
            catalogue.default_branch = catalogue
                .branches
                .iter()
                .find(|(_, commit)| **commit == head)
                .map(|(name, _)| name.clone());
        }
    }

    catalogue
}
