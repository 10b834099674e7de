//! Rate-limited HTTP client with retry, backoff and pagination.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::error::ApiError;
use super::rate_limiter::RateLimiter;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry budget and backoff shape.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    /// Cooldown applied on a 429 without a Retry-After header
    pub default_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            default_cooldown: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.0)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(default)]
    is_last_page: bool,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    pagination: Option<PageInfo>,
}

/// JSON-over-POST client bound to one base URL.
///
/// Each request path is routed to the limiter with the longest matching
/// prefix, falling back to the default limiter.
pub struct RetryingClient {
    client: Client,
    base_url: String,
    headers: HeaderMap,
    default_limiter: Arc<RateLimiter>,
    bindings: Vec<(String, Arc<RateLimiter>)>,
    policy: RetryPolicy,
    max_pages: u32,
}

impl RetryingClient {
    pub fn new(base_url: impl Into<String>, default_limiter: Arc<RateLimiter>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers: HeaderMap::new(),
            default_limiter,
            bindings: Vec::new(),
            policy: RetryPolicy::default(),
            max_pages: 50,
        })
    }

    /// Attach a header sent with every request.
    pub fn with_header(mut self, name: &'static str, value: &str) -> Result<Self, ApiError> {
        let value = HeaderValue::from_str(value)
            .map_err(|_| ApiError::Decode(format!("invalid header value for {}", name)))?;
        self.headers.insert(HeaderName::from_static(name), value);
        Ok(self)
    }

    /// Route requests whose path starts with `prefix` to `limiter`.
    pub fn bind_limiter(mut self, prefix: impl Into<String>, limiter: Arc<RateLimiter>) -> Self {
        self.bindings.push((prefix.into(), limiter));
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn limiter_for(&self, path: &str) -> &Arc<RateLimiter> {
        self.bindings
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, limiter)| limiter)
            .unwrap_or(&self.default_limiter)
    }

    /// POST `body` to `path` and decode the JSON response into `T`.
    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, ApiError> {
        let value = self.post_value(path, body).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// POST with admission control and retry.
    ///
    /// Network errors, 5xx and 429 are retried with exponential backoff up to
    /// the attempt budget; a 429 also pushes out the limiter's cooldown. Any
    /// other failure is returned at once.
    pub async fn post_value(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let policy = &self.policy;
        let limiter = self.limiter_for(path);

        backoff::future::retry(policy.backoff(), || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.send_once(limiter, path, body).await {
                Ok(value) => Ok(value),
                Err(err) => {
                    if let ApiError::RateLimited { retry_after, .. } = &err {
                        limiter
                            .notify_rate_limited(retry_after.unwrap_or(policy.default_cooldown))
                            .await;
                    }
                    if err.is_retryable() && attempt < policy.max_attempts {
                        warn!(path, attempt, error = %err, "Request failed, retrying");
                        Err(backoff::Error::transient(err))
                    } else {
                        Err(backoff::Error::permanent(err))
                    }
                }
            }
        })
        .await
    }

    /// Walk pages until the server reports the last one, accumulating `data`.
    ///
    /// `body` gets a `pagination: {page, per_page}` object merged in on each
    /// request. A response without pagination info ends the walk when it
    /// returns fewer than `per_page` items.
    pub async fn post_paginated<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
        per_page: u32,
    ) -> Result<Vec<T>, ApiError> {
        let mut body = match body {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let mut items = Vec::new();

        for page in 1..=self.max_pages {
            body.insert("pagination".to_string(), json!({ "page": page, "per_page": per_page }));
            let value = self.post_value(path, &Value::Object(body.clone())).await?;
            let page_data: Page<T> = serde_json::from_value(value)?;
            let count = page_data.data.len();
            items.extend(page_data.data);

            let last = match page_data.pagination {
                Some(info) => info.is_last_page,
                None => count < per_page as usize,
            };
            debug!(path, page, count, last, "Fetched page");
            if last || count == 0 {
                return Ok(items);
            }
        }

        warn!(path, max_pages = self.max_pages, "Pagination stopped at page limit");
        Ok(items)
    }

    async fn send_once(&self, limiter: &RateLimiter, path: &str, body: &Value) -> Result<Value, ApiError> {
        limiter.acquire().await;

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<Value>().await?);
        }

        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status.as_u16(), text, retry_after))
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = raw.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::rate_limiter::RateLimitConfig;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(50),
            default_cooldown: Duration::from_millis(20),
        }
    }

    fn limiter(name: &str) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(name, RateLimitConfig::new(0, 0, 0)))
    }

    fn client(server: &MockServer) -> RetryingClient {
        RetryingClient::new(server.uri(), limiter("default"))
            .unwrap()
            .with_policy(fast_policy())
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/thing"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/thing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let value = client(&server).post_value("/api/v1/thing", &json!({})).await.unwrap();
        assert_eq!(value["ok"], json!(true));
    }

    #[tokio::test]
    async fn test_auth_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).post_value("/x", &json!({})).await.unwrap_err();
        assert!(matches!(err, ApiError::Auth { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).post_value("/x", &json!({})).await.unwrap_err();
        assert!(matches!(err, ApiError::Client { status: 422, .. }));
    }

    #[tokio::test]
    async fn test_exhausted_server_errors_carry_last_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("gateway"))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server).post_value("/x", &json!({})).await.unwrap_err();
        match err {
            ApiError::Server { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body, "gateway");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion_is_distinguishable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .expect(3)
            .mount(&server)
            .await;

        let default = limiter("default");
        let client = RetryingClient::new(server.uri(), default.clone())
            .unwrap()
            .with_policy(fast_policy());

        let err = client.post_value("/x", &json!({})).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.status(), Some(429));
        assert!(default.snapshot().await.cooldown_until.is_some());
    }

    #[tokio::test]
    async fn test_retry_after_hint_sets_cooldown_on_bound_limiter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/profiler/perp-trades"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/profiler/perp-trades"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        let default = limiter("default");
        let profiler = limiter("profiler");
        let client = RetryingClient::new(server.uri(), default.clone())
            .unwrap()
            .with_policy(fast_policy())
            .bind_limiter("/api/v1/profiler", profiler.clone());

        let before = chrono::Utc::now();
        client
            .post_value("/api/v1/profiler/perp-trades", &json!({}))
            .await
            .unwrap();

        let cooldown = profiler.snapshot().await.cooldown_until;
        assert!(cooldown.is_some_and(|until| until >= before + chrono::Duration::milliseconds(900)));
        assert!(default.snapshot().await.cooldown_until.is_none());
        assert!(chrono::Utc::now() >= before + chrono::Duration::milliseconds(900));
    }

    #[tokio::test]
    async fn test_limiter_routing_prefers_longest_prefix() {
        let server = MockServer::start().await;
        let client = RetryingClient::new(server.uri(), limiter("default"))
            .unwrap()
            .bind_limiter("/api", limiter("api"))
            .bind_limiter("/api/v1/profiler", limiter("profiler"));

        assert_eq!(client.limiter_for("/api/v1/profiler/perp-positions").name(), "profiler");
        assert_eq!(client.limiter_for("/api/v1/perp-leaderboard").name(), "api");
        assert_eq!(client.limiter_for("/info").name(), "default");
    }

    #[tokio::test]
    async fn test_pagination_accumulates_until_last_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"pagination": {"page": 1}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [1, 2],
                "pagination": {"page": 1, "per_page": 2, "is_last_page": false}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"pagination": {"page": 2}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [3],
                "pagination": {"page": 2, "per_page": 2, "is_last_page": true}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let items: Vec<u32> = client(&server)
            .post_paginated("/list", json!({"address": "0xabc"}), 2)
            .await
            .unwrap();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2.5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(2500)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);
    }
}
