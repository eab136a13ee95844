//! Live vulnerability data providers

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::client::RateLimitedClient;
use crate::error::Result;

/// Upstream that can answer a single-record lookup.
#[async_trait]
pub trait LiveSource: Send + Sync {
    /// Tag stored with records fetched from this source
    fn name(&self) -> &str;

    async fn fetch(&self, vuln_id: &str, cancel: &CancellationToken) -> Result<Value>;
}

/// Advisory lookups through a [`RateLimitedClient`].
pub struct AdvisorySource {
    client: Arc<RateLimitedClient>,
    path_template: String,
}

impl AdvisorySource {
    /// `{id}` in the path template is replaced by the percent-encoded
    /// identifier.
    pub const DEFAULT_PATH: &'static str = "/advisories/{id}";

    pub fn new(client: Arc<RateLimitedClient>) -> Self {
        Self {
            client,
            path_template: Self::DEFAULT_PATH.to_string(),
        }
    }

    pub fn with_path_template(mut self, template: impl Into<String>) -> Self {
        self.path_template = template.into();
        self
    }

    fn path_for(&self, vuln_id: &str) -> String {
        self.path_template
            .replace("{id}", &urlencoding::encode(vuln_id))
    }
}

#[async_trait]
impl LiveSource for AdvisorySource {
    fn name(&self) -> &str {
        self.client.breaker().name()
    }

    async fn fetch(&self, vuln_id: &str, cancel: &CancellationToken) -> Result<Value> {
        self.client.get_json(&self.path_for(vuln_id), cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{BreakerConfig, CircuitBreaker};
    use crate::client::ClientConfig;
    use crate::error::{ApiError, Error};
    use serde_json::json;

    fn source(server: &mockito::Server) -> AdvisorySource {
        let breaker = Arc::new(CircuitBreaker::new("github", BreakerConfig::default()));
        let client = RateLimitedClient::new(ClientConfig::new(server.url()), breaker).unwrap();
        AdvisorySource::new(Arc::new(client))
    }

    #[tokio::test]
    async fn test_fetch_uses_path_template() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/advisories/CVE-2024-1")
            .with_status(200)
            .with_body(r#"{"cve_id":"CVE-2024-1","severity":"high"}"#)
            .create_async()
            .await;

        let source = source(&server);
        let value = source
            .fetch("CVE-2024-1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(value, json!({"cve_id": "CVE-2024-1", "severity": "high"}));
        assert_eq!(source.name(), "github");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_custom_template() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/vulns/CVE-9")
            .with_status(404)
            .create_async()
            .await;

        let source = source(&server).with_path_template("/v2/vulns/{id}");
        let err = source
            .fetch("CVE-9", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Api(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_identifier_is_encoded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/advisories/GHSA%2F..%2Fadmin%3Fx%3D1")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let source = source(&server);
        source
            .fetch("GHSA/../admin?x=1", &CancellationToken::new())
            .await
            .unwrap();
        mock.assert_async().await;
    }
}
