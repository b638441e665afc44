//! HTTP session with retry/backoff, pagination protocols and warehouse sinks for idgov.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub mod auth;
pub mod pagination;
pub mod postgres;
#[cfg(any(test, feature = "scripted"))]
pub mod scripted;
pub mod warehouse;

pub use auth::{client_credentials_token, Auth, AuthError, OAuth1Credentials, OAuth1Signer};
pub use pagination::PageProtocol;
pub use postgres::PgWarehouse;
pub use warehouse::{
    batch_size, MemoryWarehouse, Warehouse, WarehouseError, WarehouseSink, WriteSummary,
    DEFAULT_PARAMETER_LIMIT,
};

pub const CRATE_NAME: &str = "idgov-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        }
    }
}

impl BackoffPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(value: Method) -> Self {
        match value {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Json(JsonValue),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn query(mut self, pairs: &[(&str, &str)]) -> Self {
        self.query
            .extend(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    /// Replaces any existing value for `key`.
    pub fn set_query(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.query.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value,
            None => self.query.push((key.to_string(), value)),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn json(mut self, body: JsonValue) -> Self {
        self.body = Body::Json(body);
        self
    }

    pub fn form(mut self, pairs: &[(&str, &str)]) -> Self {
        self.body = Body::Form(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub url: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Decodes the body; an empty body decodes to `null`.
    pub fn json(&self) -> Result<JsonValue, FetchError> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(JsonValue::Null);
        }
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct TransportError {
    pub disposition: RetryDisposition,
    pub message: String,
}

impl TransportError {
    pub fn new(disposition: RetryDisposition, message: impl Into<String>) -> Self {
        Self {
            disposition,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(classify_reqwest_error(&err), err.to_string())
    }
}

/// Failure of a remote call. An `Err` is always distinct from an empty result.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("response from {url} has no `{field}` field")]
    MissingField { url: String, field: String },
    #[error("next-page link {url} was already fetched")]
    RepeatedLink { url: String },
    #[error("page {page} failed: {source}")]
    Page {
        page: usize,
        #[source]
        source: Box<FetchError>,
    },
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// The network seam. Production uses [`ReqwestTransport`]; tests script responses.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.into(), &request.url)
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = match request.body {
            Body::Empty => builder,
            Body::Json(body) => builder.json(&body),
            Body::Form(pairs) => builder.form(&pairs),
        };

        let resp = builder.send().await?;
        let status = resp.status();
        let url = resp.url().to_string();
        let body = resp.bytes().await?.to_vec();
        Ok(HttpResponse { status, url, body })
    }
}

/// Authenticated, retrying session against one upstream API.
#[derive(Clone)]
pub struct ApiSession {
    transport: Arc<dyn HttpTransport>,
    auth: Auth,
    backoff: BackoffPolicy,
    base_url: String,
    source: String,
    run_id: Uuid,
}

impl fmt::Debug for ApiSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiSession")
            .field("source", &self.source)
            .field("base_url", &self.base_url)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl ApiSession {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        source: impl Into<String>,
        base_url: impl Into<String>,
        auth: Auth,
    ) -> Self {
        Self {
            transport,
            auth,
            backoff: BackoffPolicy::default(),
            base_url: base_url.into(),
            source: source.into(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn transport(&self) -> Arc<dyn HttpTransport> {
        Arc::clone(&self.transport)
    }

    /// Absolute URLs pass through; paths are joined onto the base URL.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn request(&self, method: Method, path: &str) -> HttpRequest {
        HttpRequest::new(method, self.url(path))
    }

    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        self.execute(request, false).await
    }

    /// Like [`send`](Self::send) but hands back non-retryable error statuses instead of
    /// failing, for lookups where "not found" or "forbidden" is an expected answer.
    pub async fn send_allow_status(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        self.execute(request, true).await
    }

    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<JsonValue, FetchError> {
        let request = self.request(Method::Get, path).query(query);
        self.send(request).await?.json()
    }

    pub async fn post(&self, path: &str, body: JsonValue) -> Result<JsonValue, FetchError> {
        let request = self.request(Method::Post, path).json(body);
        self.send(request).await?.json()
    }

    pub async fn put(&self, path: &str, body: JsonValue) -> Result<JsonValue, FetchError> {
        let request = self.request(Method::Put, path).json(body);
        self.send(request).await?.json()
    }

    pub async fn patch(&self, path: &str, query: &[(&str, &str)]) -> Result<JsonValue, FetchError> {
        let request = self.request(Method::Patch, path).query(query);
        self.send(request).await?.json()
    }

    async fn execute(
        &self,
        request: HttpRequest,
        allow_status: bool,
    ) -> Result<HttpResponse, FetchError> {
        let span = info_span!(
            "http_call",
            run_id = %self.run_id,
            source = %self.source,
            method = request.method.as_str(),
            url = %request.url
        );

        async move {
            for attempt in 0..=self.backoff.max_retries {
                let mut outgoing = request.clone();
                self.auth.apply(&mut outgoing)?;
                let can_retry = attempt < self.backoff.max_retries;

                match self.transport.execute(outgoing).await {
                    Ok(resp) if resp.status.is_success() => return Ok(resp),
                    Ok(resp) => {
                        if classify_status(resp.status) == RetryDisposition::Retryable && can_retry {
                            warn!(status = resp.status.as_u16(), attempt, "retrying after status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        if allow_status {
                            return Ok(resp);
                        }
                        return Err(FetchError::HttpStatus {
                            status: resp.status.as_u16(),
                            url: resp.url,
                        });
                    }
                    Err(err) => {
                        if err.disposition == RetryDisposition::Retryable && can_retry {
                            warn!(error = %err, attempt, "retrying after transport error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::Transport {
                            url: request.url.clone(),
                            source: err,
                        });
                    }
                }
            }

            Err(FetchError::Transport {
                url: request.url.clone(),
                source: TransportError::new(
                    RetryDisposition::NonRetryable,
                    "retry budget exhausted",
                ),
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedTransport;
    use serde_json::json;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    fn session(transport: &Arc<ScriptedTransport>, retries: usize) -> ApiSession {
        ApiSession::new(
            transport.clone(),
            "test",
            "https://api.test/v1/",
            Auth::Bearer("tkn".into()),
        )
        .with_backoff(BackoffPolicy::immediate(retries))
    }

    #[tokio::test]
    async fn transient_statuses_are_retried_until_success() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_status("GET", "/v1/things", 503, json!({}));
        transport.respond_status("GET", "/v1/things", 429, json!({}));
        transport.respond("GET", "/v1/things", json!({"ok": true}));

        let value = session(&transport, 3).get("things", &[]).await.expect("get");
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(transport.request_count(), 3);

        let seen = transport.requests();
        assert!(seen
            .iter()
            .all(|r| r.headers.contains(&("Authorization".into(), "Bearer tkn".into()))));
    }

    #[tokio::test]
    async fn retries_are_bounded_and_fatal_statuses_fail_fast() {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..5 {
            transport.respond_status("GET", "/v1/flaky", 500, json!({}));
        }
        transport.respond_status("GET", "/v1/missing", 404, json!({}));

        let err = session(&transport, 2).get("flaky", &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
        assert_eq!(transport.request_count(), 3);

        let err = session(&transport, 2).get("missing", &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(transport.request_count(), 4);
    }

    #[tokio::test]
    async fn allow_status_returns_the_response() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_status("GET", "/v1/settings", 403, json!({"error": "denied"}));

        let s = session(&transport, 1);
        let resp = s
            .send_allow_status(s.request(Method::Get, "settings"))
            .await
            .expect("response");
        assert_eq!(resp.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn url_joining_respects_absolute_links() {
        let transport = Arc::new(ScriptedTransport::new());
        let s = session(&transport, 0);
        assert_eq!(s.url("/users"), "https://api.test/v1/users");
        assert_eq!(s.url("https://other/next"), "https://other/next");
    }
}
