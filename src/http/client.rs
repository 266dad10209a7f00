//! HTTP client with built-in retry logic and error handling.

use anyhow::{Context, Result};
use log::debug;
use reqwest::Client;
use serde::de::DeserializeOwned;

use super::retry::{RetryPolicy, check_retryable, with_retry};

/// HTTP client with built-in retry logic for metadata requests.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    policy: RetryPolicy,
}

impl HttpClient {
    /// Creates a new HTTP client wrapping the given reqwest Client.
    pub fn new(client: Client) -> Self {
        Self::with_policy(client, RetryPolicy::default())
    }

    pub fn with_policy(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Returns a reference to the underlying reqwest Client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Performs a GET request and deserializes the JSON response.
    /// Automatically retries on transient errors.
    #[tracing::instrument(skip(self))]
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.get_json_with_query(url, &[]).await
    }

    /// Performs a GET request with query parameters and deserializes the JSON response.
    /// Automatically retries on transient errors.
    #[tracing::instrument(skip(self, query))]
    pub async fn get_json_with_query<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        debug!("GET JSON from {} with query {:?}...", url, query);

        with_retry("GET JSON", &self.policy, || async {
            let mut request = self.client.get(url);
            if !query.is_empty() {
                request = request.query(query);
            }
            let response = request.send().await.context("Failed to send request")?;

            let response = response.error_for_status().map_err(check_retryable)?;

            let result = response
                .json::<T>()
                .await
                .context("Failed to parse JSON response")?;

            Ok(result)
        })
        .await
        .map_err(|e| e.into_inner())
    }

    /// Single GET attempt returning the whole body.
    /// Callers that download trees own their retry budget, so this does not retry.
    #[tracing::instrument(skip(self))]
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        debug!("GET bytes from {}...", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to start download request")?;

        let response = response.error_for_status().map_err(check_retryable)?;

        let bytes = response
            .bytes()
            .await
            .context("Failed to read download stream")?;

        debug!(
            "Downloaded {:.2} MB",
            bytes.len() as f64 / (1024.0 * 1024.0)
        );

        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::NonRetryableError;
    use std::time::Duration;

    #[derive(serde::Deserialize, Debug, PartialEq)]
    struct TestResponse {
        name: String,
        value: i32,
    }

    #[tokio::test]
    async fn test_get_json_success() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let mock = server
            .mock("GET", "/test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"name": "test", "value": 42}"#)
            .create_async()
            .await;

        let client = HttpClient::new(Client::new());
        let result: TestResponse = client.get_json(&format!("{}/test", url)).await.unwrap();

        mock.assert_async().await;
        assert_eq!(result.name, "test");
        assert_eq!(result.value, 42);
    }

    #[tokio::test]
    async fn test_get_json_not_found_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let mock = server
            .mock("GET", "/test")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let client = HttpClient::new(Client::new());
        let result: Result<serde_json::Value> = client.get_json(&format!("{}/test", url)).await;

        mock.assert_async().await;
        assert!(result.unwrap_err().downcast_ref::<NonRetryableError>().is_some());
    }

    #[tokio::test]
    async fn test_get_json_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let client = HttpClient::with_policy(
            Client::new(),
            RetryPolicy::new(2, Duration::from_millis(1)),
        );
        let result: Result<serde_json::Value> = client.get_json(&format!("{}/flaky", url)).await;

        mock.assert_async().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_get_json_with_query_success() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let mock = server
            .mock("GET", "/test?page=1&per_page=10")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"["item1", "item2"]"#)
            .create_async()
            .await;

        let client = HttpClient::new(Client::new());
        let result: Vec<String> = client
            .get_json_with_query(
                &format!("{}/test", url),
                &[("page", "1"), ("per_page", "10")],
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result, vec!["item1", "item2"]);
    }

    #[tokio::test]
    async fn test_get_bytes() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let mock = server
            .mock("GET", "/file.tgz")
            .with_status(200)
            .with_body("test content")
            .create_async()
            .await;

        let client = HttpClient::new(Client::new());
        let bytes = client
            .get_bytes(&format!("{}/file.tgz", url))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(bytes, b"test content");
    }
}
