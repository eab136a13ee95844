//! Upstream HTTP client with quota tracking and breaker protection

use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::debug;
use reqwest::header::{ACCEPT, HeaderMap};
use reqwest::{Client as HttpClient, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::{ClientConfig, ClientStats, QuotaSnapshot, QuotaStatusResponse, RequestPacer};
use crate::circuit::CircuitBreaker;
use crate::error::{ApiError, Error, Result};
use crate::task::sleep_or_cancel;

/// Response that made it through the breaker without counting as a failure
struct RawResponse {
    status: StatusCode,
    body: String,
}

/// HTTP client for one upstream destination.
///
/// Every request runs through the destination's shared [`CircuitBreaker`].
/// Before sending, the client backs off proactively when the last observed
/// quota is under the configured threshold; after a rate-limit rejection it
/// honours the provider's retry-after hint and switches on local pacing.
pub struct RateLimitedClient {
    http: HttpClient,
    config: ClientConfig,
    breaker: Arc<CircuitBreaker>,
    quota: Arc<RwLock<Option<QuotaSnapshot>>>,
    pacer: RequestPacer,
}

impl RateLimitedClient {
    /// Create a client calling through `breaker`.
    pub fn new(config: ClientConfig, breaker: Arc<CircuitBreaker>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.http_timeout)
            .user_agent(concat!("keystone-resilience/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let pacer = RequestPacer::new(breaker.name(), config.requests_per_second);

        Ok(Self {
            http,
            config,
            breaker,
            quota: Arc::new(RwLock::new(None)),
            pacer,
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Last quota reported by the provider, if any.
    pub fn quota(&self) -> Option<QuotaSnapshot> {
        self.quota.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Delay the next request would wait before being sent.
    pub fn backoff_delay(&self) -> Option<Duration> {
        self.quota().and_then(|q| self.config.backoff_for(&q))
    }

    /// GET `path` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let response = self.execute(path, cancel).await?;

        match response.status {
            status if status.is_success() => serde_json::from_str(&response.body).map_err(|e| {
                ApiError::InvalidResponse(format!("Failed to parse response: {}", e)).into()
            }),
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized.into()),
            StatusCode::FORBIDDEN => Err(ApiError::Forbidden.into()),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound(path.to_string()).into()),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(ApiError::BadRequest(response.body).into())
            }
            status => Err(ApiError::InvalidResponse(format!(
                "Unexpected status code: {}",
                status
            ))
            .into()),
        }
    }

    /// Query the provider's quota-status endpoint and replace the snapshot.
    pub async fn fetch_quota(&self, cancel: &CancellationToken) -> Result<QuotaSnapshot> {
        let path = self.config.quota_path.clone();
        let response: QuotaStatusResponse = self.get_json(&path, cancel).await?;
        let snapshot = response.resources.core.into_snapshot().ok_or_else(|| {
            ApiError::InvalidResponse("Invalid quota reset timestamp".to_string())
        })?;

        *self.quota.write().unwrap_or_else(|p| p.into_inner()) = Some(snapshot.clone());
        Ok(snapshot)
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            breaker: self.breaker.stats(),
            quota: self.quota(),
            pacing_active: self.pacer.is_active(),
        }
    }

    async fn execute(&self, path: &str, cancel: &CancellationToken) -> Result<RawResponse> {
        // An open breaker rejects at once; waiting on quota first is wasted
        if !self.breaker.is_rejecting() {
            self.pacer.wait_if_active(cancel).await?;

            if let Some(delay) = self.backoff_delay() {
                debug!(
                    "Quota below threshold for {}, backing off {:?}",
                    self.breaker.name(),
                    delay
                );
                sleep_or_cancel(delay, cancel).await?;
            }
        }

        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let http = self.http.clone();
        let token = self.config.token.clone();
        let quota = self.quota.clone();

        let result = self
            .breaker
            .call(cancel, move || async move {
                let mut request = http.get(&url).header(ACCEPT, "application/json");
                if let Some(token) = token {
                    request = request.bearer_auth(token);
                }

                let response = request.send().await.map_err(ApiError::from)?;
                let status = response.status();

                if let Some(snapshot) = QuotaSnapshot::from_headers(response.headers()) {
                    *quota.write().unwrap_or_else(|p| p.into_inner()) = Some(snapshot);
                }

                if is_rate_limited(status, response.headers()) {
                    return Err(ApiError::RateLimit(retry_after(response.headers())).into());
                }

                let body = response.text().await.map_err(ApiError::from)?;
                if status.is_server_error() {
                    return Err(ApiError::ServerError {
                        status: status.as_u16(),
                        message: body,
                    }
                    .into());
                }

                Ok(RawResponse { status, body })
            })
            .await;

        match result {
            Err(Error::Api(ApiError::RateLimit(wait))) => {
                self.pacer.activate();
                if !wait.is_zero() {
                    debug!(
                        "Rate limited by {}, waiting {:?} before reporting",
                        self.breaker.name(),
                        wait
                    );
                    sleep_or_cancel(wait, cancel).await?;
                }
                Err(ApiError::RateLimit(wait).into())
            }
            other => other,
        }
    }
}

/// 429, or a 403 that carries throttling metadata
fn is_rate_limited(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }

    status == StatusCode::FORBIDDEN
        && (headers.contains_key("retry-after")
            || headers
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.trim() == "0"))
}

/// `retry-after` in whole seconds; zero when absent or unparsable
fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{BreakerConfig, CircuitState};
    use crate::error::BreakerError;
    use serde_json::Value;
    use std::time::Instant;

    fn client_for(url: &str, breaker_config: BreakerConfig) -> RateLimitedClient {
        let config = ClientConfig::new(url).with_token("test-token");
        let breaker = Arc::new(CircuitBreaker::new("github", breaker_config));
        RateLimitedClient::new(config, breaker).unwrap()
    }

    #[tokio::test]
    async fn test_success_records_quota_and_sends_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/advisories/GHSA-1")
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .with_header("x-ratelimit-limit", "5000")
            .with_header("x-ratelimit-remaining", "4999")
            .with_header("x-ratelimit-reset", "1700000000")
            .with_header("x-ratelimit-used", "1")
            .with_body(r#"{"id":"GHSA-1"}"#)
            .create_async()
            .await;

        let client = client_for(&server.url(), BreakerConfig::default());
        let token = CancellationToken::new();

        let value: Value = client.get_json("/advisories/GHSA-1", &token).await.unwrap();
        assert_eq!(value["id"], "GHSA-1");

        let quota = client.quota().unwrap();
        assert_eq!(quota.remaining, 4999);
        assert_eq!(quota.used, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_counts_as_breaker_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/advisories")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let client = client_for(&server.url(), BreakerConfig::default());
        let token = CancellationToken::new();

        let result: Result<Value> = client.get_json("/advisories", &token).await;
        match result {
            Err(Error::Api(ApiError::ServerError { status, .. })) => assert_eq!(status, 502),
            other => panic!("Expected server error, got {:?}", other),
        }
        assert_eq!(client.stats().breaker.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_a_breaker_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/repos/acme/missing")
            .with_status(404)
            .create_async()
            .await;

        let client = client_for(&server.url(), BreakerConfig::default());
        let token = CancellationToken::new();

        let result: Result<Value> = client.get_json("/repos/acme/missing", &token).await;
        assert!(matches!(result, Err(Error::Api(ApiError::NotFound(_)))));
        assert_eq!(client.stats().breaker.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_waits_for_retry_after() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/advisories")
            .with_status(429)
            .with_header("retry-after", "1")
            .create_async()
            .await;

        let client = client_for(&server.url(), BreakerConfig::default());
        let token = CancellationToken::new();

        let started = Instant::now();
        let result: Result<Value> = client.get_json("/advisories", &token).await;

        assert!(started.elapsed() >= Duration::from_secs(1));
        match result {
            Err(Error::Api(ApiError::RateLimit(wait))) => assert_eq!(wait, Duration::from_secs(1)),
            other => panic!("Expected rate limit error, got {:?}", other),
        }

        let stats = client.stats();
        assert!(stats.pacing_active);
        assert_eq!(stats.breaker.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_forbidden_with_exhausted_quota_is_rate_limit() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/advisories")
            .with_status(403)
            .with_header("x-ratelimit-limit", "5000")
            .with_header("x-ratelimit-remaining", "0")
            .with_header("x-ratelimit-reset", "1700000000")
            .create_async()
            .await;

        let client = client_for(&server.url(), BreakerConfig::default());
        let token = CancellationToken::new();

        let result: Result<Value> = client.get_json("/advisories", &token).await;
        assert!(matches!(result, Err(Error::Api(ApiError::RateLimit(_)))));
        assert_eq!(client.quota().unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn test_plain_forbidden_is_not_rate_limit() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/advisories")
            .with_status(403)
            .create_async()
            .await;

        let client = client_for(&server.url(), BreakerConfig::default());
        let token = CancellationToken::new();

        let result: Result<Value> = client.get_json("/advisories", &token).await;
        assert!(matches!(result, Err(Error::Api(ApiError::Forbidden))));
    }

    #[tokio::test]
    async fn test_proactive_backoff_below_threshold() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/advisories")
            .with_status(200)
            .with_header("x-ratelimit-limit", "5000")
            .with_header("x-ratelimit-remaining", "1000")
            .with_header("x-ratelimit-reset", "1700000000")
            .with_body("[]")
            .expect(2)
            .create_async()
            .await;

        let config = ClientConfig::new(server.url())
            .with_backoff(Duration::from_millis(150), Duration::from_secs(1));
        let breaker = Arc::new(CircuitBreaker::new("github", BreakerConfig::default()));
        let client = RateLimitedClient::new(config, breaker).unwrap();
        let token = CancellationToken::new();

        let _: Value = client.get_json("/advisories", &token).await.unwrap();
        assert_eq!(client.backoff_delay(), Some(Duration::from_millis(150)));

        let started = Instant::now();
        let _: Value = client.get_json("/advisories", &token).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    fn cancel_after(token: &CancellationToken, delay: Duration) {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            token.cancel();
        });
    }

    #[tokio::test]
    async fn test_backoff_is_cancellable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/advisories")
            .with_status(200)
            .with_header("x-ratelimit-limit", "5000")
            .with_header("x-ratelimit-remaining", "10")
            .with_header("x-ratelimit-reset", "1700000000")
            .with_body("[]")
            .expect(1)
            .create_async()
            .await;

        let config = ClientConfig::new(server.url())
            .with_backoff(Duration::from_secs(10), Duration::from_secs(60));
        let breaker = Arc::new(CircuitBreaker::new("github", BreakerConfig::default()));
        let client = RateLimitedClient::new(config, breaker).unwrap();

        let token = CancellationToken::new();
        let _: Value = client.get_json("/advisories", &token).await.unwrap();

        // Cancelled while already sleeping out the backoff
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(20));
        let result: Result<Value> = tokio::time::timeout(
            Duration::from_secs(2),
            client.get_json("/advisories", &cancel),
        )
        .await
        .expect("backoff ignored cancellation");
        assert!(matches!(result, Err(Error::Cancelled)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_retry_after_wait_is_cancellable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/advisories")
            .with_status(429)
            .with_header("retry-after", "30")
            .create_async()
            .await;

        let client = client_for(&server.url(), BreakerConfig::default());
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(200));

        let started = Instant::now();
        let result: Result<Value> = tokio::time::timeout(
            Duration::from_secs(5),
            client.get_json("/advisories", &cancel),
        )
        .await
        .expect("retry-after wait ignored cancellation");

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(client.stats().pacing_active);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_backoff() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/advisories")
            .with_status(500)
            .with_header("x-ratelimit-limit", "5000")
            .with_header("x-ratelimit-remaining", "10")
            .with_header("x-ratelimit-reset", "1700000000")
            .expect(1)
            .create_async()
            .await;

        let config = ClientConfig::new(server.url())
            .with_backoff(Duration::from_secs(10), Duration::from_secs(60));
        let breaker = Arc::new(CircuitBreaker::new(
            "github",
            BreakerConfig::default().with_failure_threshold(1),
        ));
        let client = RateLimitedClient::new(config, breaker).unwrap();
        let token = CancellationToken::new();

        let _: Result<Value> = client.get_json("/advisories", &token).await;
        assert_eq!(client.breaker().state(), CircuitState::Open);
        assert!(client.backoff_delay().is_some());

        let result: Result<Value> = tokio::time::timeout(
            Duration::from_secs(1),
            client.get_json("/advisories", &token),
        )
        .await
        .expect("open breaker waited out the backoff");
        assert!(matches!(result, Err(Error::Breaker(BreakerError::Open))));
        assert_eq!(client.stats().breaker.rejected_calls, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/advisories")
            .with_status(500)
            .expect(2)
            .create_async()
            .await;

        let client = client_for(
            &server.url(),
            BreakerConfig::default().with_failure_threshold(2),
        );
        let token = CancellationToken::new();

        for _ in 0..2 {
            let _: Result<Value> = client.get_json("/advisories", &token).await;
        }
        assert_eq!(client.breaker().state(), CircuitState::Open);

        let result: Result<Value> = client.get_json("/advisories", &token).await;
        assert!(matches!(result, Err(Error::Breaker(BreakerError::Open))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_quota_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/rate_limit")
            .with_status(200)
            .with_body(
                r#"{"resources":{"core":{"limit":5000,"remaining":1234,"reset":1700000000,"used":3766}}}"#,
            )
            .create_async()
            .await;

        let client = client_for(&server.url(), BreakerConfig::default());
        let token = CancellationToken::new();

        let snapshot = client.fetch_quota(&token).await.unwrap();
        assert_eq!(snapshot.remaining, 1234);
        assert_eq!(client.quota(), Some(snapshot));
    }
}
