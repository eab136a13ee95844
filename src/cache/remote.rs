//! Remote cache tier
//!
//! The hierarchical cache only needs get/set/delete from its slowest tier,
//! so any shared key/value service can sit behind [`RemoteCache`].

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;

use crate::error::{CacheError, Result};

/// Capability interface of the remote tier. A miss is `Ok(None)`.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, data: &[u8], ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Remote tier over a plain HTTP key/value service.
///
/// `GET|PUT|DELETE {base}/{key}` with the key percent-encoded as one path
/// segment; 404 is a miss and the TTL travels in the `x-cache-ttl` header as
/// whole seconds.
pub struct HttpRemoteCache {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemoteCache {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CacheError::Remote(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(key))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| CacheError::Remote(e.to_string()).into())
    }
}

fn unexpected(op: &str, status: StatusCode) -> crate::error::Error {
    CacheError::Remote(format!("{} returned {}", op, status)).into()
}

#[async_trait]
impl RemoteCache for HttpRemoteCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self.send(self.http.get(self.url(key))).await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!("Remote cache miss: {}", key);
                Ok(None)
            }
            status if status.is_success() => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| CacheError::Remote(e.to_string()))?;
                Ok(Some(body.to_vec()))
            }
            status => Err(unexpected("GET", status)),
        }
    }

    async fn set(&self, key: &str, data: &[u8], ttl: Duration) -> Result<()> {
        let request = self
            .http
            .put(self.url(key))
            .header("x-cache-ttl", ttl.as_secs().to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(data.to_vec());

        let response = self.send(request).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(unexpected("PUT", response.status()))
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self.send(self.http.delete(self.url(key))).await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(unexpected("DELETE", status))
        }
    }
}
