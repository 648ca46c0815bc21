//! HTTP client for the local runtime's catalog and health endpoints.

use std::time::Duration;

use serde::Deserialize;

use crate::config::{RuntimeConfig, DEFAULT_RUNTIME_PORT};
use crate::error::{Result, RuntimeError};

/// Client for communicating with the runtime over HTTP.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

/// Response from the tags API (list models).
#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

impl OllamaClient {
    /// Create a new client with default URL (127.0.0.1:11434).
    pub fn new() -> Self {
        Self::with_port(DEFAULT_RUNTIME_PORT)
    }

    /// Create a new client with a custom URL.
    pub fn with_url(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Create a new client with a custom port on localhost.
    pub fn with_port(port: u16) -> Self {
        Self::with_url(format!("http://{}", RuntimeConfig::runtime_host(port)))
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check if the runtime answers HTTP requests.
    pub async fn check_health(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.base_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(RuntimeError::Api(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }

    /// Names of every model in the runtime's catalog.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Api(format!("{}: {}", status, text)));
        }

        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_url() {
        let client = OllamaClient::new();
        assert_eq!(client.base_url(), "http://127.0.0.1:11434");
    }

    #[test]
    fn test_custom_url() {
        let client = OllamaClient::with_url("http://192.168.1.100:8080/");
        assert_eq!(client.base_url(), "http://192.168.1.100:8080");
    }

    #[tokio::test]
    async fn test_list_models() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"models":[{"name":"llama3:8b","size":4661224676},{"name":"nomic-embed-text:latest"}]}"#)
            .create_async()
            .await;

        let client = OllamaClient::with_url(server.url());
        let models = client.list_models().await.unwrap();
        assert_eq!(models, vec!["llama3:8b", "nomic-embed-text:latest"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_models_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/tags")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = OllamaClient::with_url(server.url());
        let err = client.list_models().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Api(ref msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_check_health() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .with_status(200)
            .with_body("Ollama is running")
            .create_async()
            .await;

        OllamaClient::with_url(server.url()).check_health().await.unwrap();
    }
}
