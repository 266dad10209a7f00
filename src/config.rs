use anyhow::{Context, Result, anyhow};
use log::debug;
use reqwest::{
    Client,
    header::{AUTHORIZATION, HeaderMap, HeaderValue},
};
use std::path::PathBuf;
use std::time::Duration;

use crate::graph::PlacementPolicy;
use crate::http::{HttpClient, RetryPolicy};
use crate::registry::DEFAULT_REGISTRY_URL;
use crate::remote::DEFAULT_API_URL;
use crate::runtime::Runtime;

pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

const USER_AGENT: &str = "gitdeps-cli";
const STORE_DIR_NAME: &str = "gitdeps";

/// Settings for one install run.
#[derive(Debug, Clone)]
pub struct InstallConfig {
    /// Root of the shared cache; trees and git mirrors live below it.
    pub store_dir: PathBuf,
    pub api_url: String,
    pub registry_url: String,
    pub placement: PlacementPolicy,
    /// Dependencies resolved in parallel per graph level.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Per-request network timeout.
    pub timeout: Duration,
    pub github_token: Option<String>,
}

impl InstallConfig {
    pub fn new<R: Runtime>(
        runtime: &R,
        store_dir: Option<PathBuf>,
        api_url: Option<String>,
        registry_url: Option<String>,
    ) -> Result<Self> {
        let store_dir = match store_dir {
            Some(dir) => dir,
            None => default_store_dir(runtime)?,
        };
        let github_token = runtime
            .env_var("GITHUB_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        Ok(Self {
            store_dir,
            api_url: api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            registry_url: registry_url.unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string()),
            placement: PlacementPolicy::default(),
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            github_token,
        })
    }

    /// Where fetched trees are stored, one directory per commit.
    pub fn trees_dir(&self) -> PathBuf {
        self.store_dir.join("trees")
    }

    /// Where bare mirrors of non-GitHub remotes are kept.
    pub fn mirrors_dir(&self) -> PathBuf {
        self.store_dir.join("mirrors")
    }

    /// Client for GitHub API calls, authenticated when a token is set.
    pub fn github_client(&self) -> Result<HttpClient> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.github_token {
            let mut auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("GITHUB_TOKEN is not a valid header value")?;
            auth_value.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth_value);
            debug!("Using GITHUB_TOKEN for authentication: {}", mask_token(token));
        }
        self.build_client(headers)
    }

    /// Client for the package registry; never carries the GitHub token.
    pub fn registry_client(&self) -> Result<HttpClient> {
        self.build_client(HeaderMap::new())
    }

    fn build_client(&self, headers: HeaderMap) -> Result<HttpClient> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(self.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpClient::with_policy(client, self.retry))
    }
}

fn default_store_dir<R: Runtime>(runtime: &R) -> Result<PathBuf> {
    runtime
        .cache_dir()
        .or_else(|| runtime.home_dir().map(|home| home.join(".cache")))
        .map(|dir| dir.join(STORE_DIR_NAME))
        .ok_or_else(|| anyhow!("Cannot determine a cache directory; pass --store"))
}

/// Shows only the ends of a secret.
fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 12 {
        return "*********".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}*********{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use mockito::{Matcher, Server};

    fn runtime(token: Option<&str>) -> MockRuntime {
        let mut runtime = MockRuntime::new();
        let token = token.map(str::to_string);
        runtime
            .expect_env_var()
            .with(mockall::predicate::eq("GITHUB_TOKEN"))
            .returning(move |_| token.clone().ok_or(std::env::VarError::NotPresent));
        runtime
            .expect_cache_dir()
            .returning(|| Some(PathBuf::from("/home/user/.cache")));
        runtime
    }

    async fn verify_authorization_header(token: Option<&str>) {
        let config = InstallConfig::new(&runtime(token), None, None, None).unwrap();

        let mut server = Server::new_async().await;
        let expected = match token {
            Some(t) => Matcher::Exact(format!("Bearer {}", t)),
            None => Matcher::Missing,
        };
        let mock = server
            .mock("GET", "/")
            .match_header("Authorization", expected)
            .create_async()
            .await;

        let client = config.github_client().unwrap();
        let _ = client.inner().get(server.url()).send().await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_github_client_with_token() {
        verify_authorization_header(Some("ghp_1234567890abcdef")).await;
    }

    #[tokio::test]
    async fn test_github_client_without_token() {
        verify_authorization_header(None).await;
    }

    #[tokio::test]
    async fn test_registry_client_never_sends_token() {
        let config = InstallConfig::new(&runtime(Some("ghp_1234567890abcdef")), None, None, None).unwrap();

        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .match_header("Authorization", Matcher::Missing)
            .create_async()
            .await;

        let _ = config.registry_client().unwrap().inner().get(server.url()).send().await;
        mock.assert_async().await;
    }

    #[test]
    fn test_defaults() {
        let config = InstallConfig::new(&runtime(None), None, None, None).unwrap();
        assert_eq!(config.store_dir, PathBuf::from("/home/user/.cache/gitdeps"));
        assert_eq!(config.trees_dir(), PathBuf::from("/home/user/.cache/gitdeps/trees"));
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.registry_url, DEFAULT_REGISTRY_URL);
        assert_eq!(config.placement, PlacementPolicy::Nest);
        assert_eq!(config.github_token, None);
    }

    #[test]
    fn test_overrides() {
        let config = InstallConfig::new(
            &runtime(None),
            Some(PathBuf::from("/tmp/store")),
            Some("http://localhost:1234".into()),
            Some("http://localhost:5678".into()),
        )
        .unwrap();
        assert_eq!(config.mirrors_dir(), PathBuf::from("/tmp/store/mirrors"));
        assert_eq!(config.api_url, "http://localhost:1234");
        assert_eq!(config.registry_url, "http://localhost:5678");
    }

    #[test]
    fn test_no_cache_dir_falls_back_to_home() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_env_var()
            .returning(|_| Err(std::env::VarError::NotPresent));
        runtime.expect_cache_dir().returning(|| None);
        runtime
            .expect_home_dir()
            .returning(|| Some(PathBuf::from("/home/user")));

        let config = InstallConfig::new(&runtime, None, None, None).unwrap();
        assert_eq!(config.store_dir, PathBuf::from("/home/user/.cache/gitdeps"));
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("ghp_1234567890abcdef"), "ghp_*********cdef");
        assert_eq!(mask_token("short"), "*********");
    }
}
