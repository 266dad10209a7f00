//! GitHub remote over the REST API.

use anyhow::{Result, bail};
use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;

use super::{RefCatalogue, Remote, RemoteRepository};
use crate::http::{HttpClient, NonRetryableError};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const PER_PAGE: usize = 100;
// a listing longer than this is an error rather than a silently partial answer
const MAX_PAGES: usize = 10;

/// GitHub API response types (internal).
mod api {
    use serde::Deserialize;

    #[derive(Deserialize, Debug)]
    pub struct RepoInfo {
        pub default_branch: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    pub struct NamedRef {
        pub name: String,
        pub commit: CommitRef,
    }

    #[derive(Deserialize, Debug)]
    pub struct CommitRef {
        pub sha: String,
    }
}

pub struct GitHubRemote {
    http_client: HttpClient,
    api_url: String,
}

impl GitHubRemote {
    pub fn new(http_client: HttpClient, api_url: &str) -> Self {
        Self {
            http_client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn repo_url(&self, remote: &Remote) -> Result<String> {
        match remote {
            Remote::GitHub { owner, repo } => {
                Ok(format!("{}/repos/{}/{}", self.api_url, owner, repo))
            }
            Remote::Git { url } => bail!("{} is not a GitHub repository", url),
        }
    }

    async fn get_paged<T: DeserializeOwned>(
        &self,
        url: &str,
        extra: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut exhausted = false;

        for page in 1..=MAX_PAGES {
            let page = page.to_string();
            let per_page = PER_PAGE.to_string();
            let mut query = extra.to_vec();
            query.push(("per_page", &per_page));
            query.push(("page", &page));

            debug!("Fetching page {} from {}...", page, url);
            let parsed: Vec<T> = self.http_client.get_json_with_query(url, &query).await?;

            let len = parsed.len();
            items.extend(parsed);
            if len < PER_PAGE {
                exhausted = true;
                break;
            }
        }

        if !exhausted {
            bail!(
                "{} lists more than {} entries; refusing to use a truncated listing",
                url,
                MAX_PAGES * PER_PAGE
            );
        }
        Ok(items)
    }
}

#[async_trait]
impl RemoteRepository for GitHubRemote {
    #[tracing::instrument(skip(self))]
    async fn list_refs(&self, remote: &Remote) -> Result<RefCatalogue> {
        let repo_url = self.repo_url(remote)?;

        let info: api::RepoInfo = self.http_client.get_json(&repo_url).await?;
        let branches: Vec<api::NamedRef> =
            self.get_paged(&format!("{}/branches", repo_url), &[]).await?;
        let tags: Vec<api::NamedRef> = self.get_paged(&format!("{}/tags", repo_url), &[]).await?;

        Ok(RefCatalogue {
            default_branch: info.default_branch,
            branches: branches
                .into_iter()
                .map(|b| (b.name, b.commit.sha.to_ascii_lowercase()))
                .collect(),
            tags: tags
                .into_iter()
                .map(|t| (t.name, t.commit.sha.to_ascii_lowercase()))
                .collect(),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn list_commits(&self, remote: &Remote) -> Result<Vec<String>> {
        let repo_url = self.repo_url(remote)?;
        let catalogue = self.list_refs(remote).await?;
        let commits_url = format!("{}/commits", repo_url);

        let mut commits = BTreeSet::new();
        for tip in catalogue.tips() {
            let history: Vec<api::CommitRef> =
                self.get_paged(&commits_url, &[("sha", tip)]).await?;
            commits.extend(history.into_iter().map(|c| c.sha.to_ascii_lowercase()));
        }

        debug!("{} has {} reachable commits", remote, commits.len());
        Ok(commits.into_iter().collect())
    }

    #[tracing::instrument(skip(self))]
    async fn commit_exists(&self, remote: &Remote, commit: &str) -> Result<bool> {
        let url = format!("{}/commits/{}", self.repo_url(remote)?, commit);
        match self.http_client.get_json::<api::CommitRef>(&url).await {
            Ok(found) => Ok(found.sha.eq_ignore_ascii_case(commit)),
            Err(e) => match e.downcast_ref::<NonRetryableError>() {
                // GitHub answers 422 for ids it cannot parse or resolve
                Some(NonRetryableError::NotFound(_)) | Some(NonRetryableError::ClientError(_)) => {
                    Ok(false)
                }
                _ => Err(e),
            },
        }
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_tree(&self, remote: &Remote, commit: &str) -> Result<Vec<u8>> {
        let url = format!("{}/tarball/{}", self.repo_url(remote)?, commit);
        self.http_client.get_bytes(&url).await
    }
}
