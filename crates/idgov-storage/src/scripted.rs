//! In-process HTTP transport that replays scripted responses and records every request.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{Body, HttpRequest, HttpResponse, HttpTransport, RetryDisposition, TransportError};

#[derive(Debug, Deserialize)]
struct FixtureRoute {
    method: String,
    url: String,
    #[serde(default)]
    query: BTreeMap<String, String>,
    #[serde(default)]
    body_fields: BTreeMap<String, JsonValue>,
    #[serde(default)]
    body_contains: BTreeMap<String, String>,
    #[serde(default = "default_status")]
    status: u16,
    body: JsonValue,
    #[serde(default)]
    always: bool,
}

fn default_status() -> u16 {
    200
}

/// Selects which requests a scripted response answers.
#[derive(Debug, Clone)]
pub struct RequestMatcher {
    method: String,
    url_contains: String,
    query: Vec<(String, String)>,
    body_fields: Vec<(String, JsonValue)>,
    body_contains: Vec<(String, String)>,
}

impl RequestMatcher {
    pub fn new(method: &str, url_contains: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url_contains: url_contains.to_string(),
            query: Vec::new(),
            body_fields: Vec::new(),
            body_contains: Vec::new(),
        }
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Requires a JSON body whose top-level `key` equals `value`.
    pub fn body_field(mut self, key: &str, value: JsonValue) -> Self {
        self.body_fields.push((key.to_string(), value));
        self
    }

    /// Requires a JSON body whose top-level string `key` contains `fragment`.
    pub fn body_contains(mut self, key: &str, fragment: &str) -> Self {
        self.body_contains.push((key.to_string(), fragment.to_string()));
        self
    }

    fn matches(&self, request: &HttpRequest) -> bool {
        if request.method.as_str() != self.method || !request.url.contains(&self.url_contains) {
            return false;
        }
        if !self.query.iter().all(|pair| request.query.contains(pair)) {
            return false;
        }
        if self.body_fields.is_empty() && self.body_contains.is_empty() {
            return true;
        }
        match &request.body {
            Body::Json(body) => {
                self.body_fields.iter().all(|(k, v)| body.get(k) == Some(v))
                    && self.body_contains.iter().all(|(k, fragment)| {
                        body.get(k)
                            .and_then(JsonValue::as_str)
                            .is_some_and(|text| text.contains(fragment.as_str()))
                    })
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Route {
    matcher: RequestMatcher,
    status: u16,
    body: JsonValue,
    sticky: bool,
    used: bool,
}

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    log: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a one-shot 200 response. Identical matchers answer in queue order.
    pub fn respond(&self, method: &str, url_contains: &str, body: JsonValue) {
        self.respond_matching(RequestMatcher::new(method, url_contains), 200, body);
    }

    pub fn respond_status(&self, method: &str, url_contains: &str, status: u16, body: JsonValue) {
        self.respond_matching(RequestMatcher::new(method, url_contains), status, body);
    }

    pub fn respond_matching(&self, matcher: RequestMatcher, status: u16, body: JsonValue) {
        self.push(matcher, status, body, false);
    }

    /// A 200 response that answers every matching request.
    pub fn respond_always(&self, method: &str, url_contains: &str, body: JsonValue) {
        self.push(RequestMatcher::new(method, url_contains), 200, body, true);
    }

    fn push(&self, matcher: RequestMatcher, status: u16, body: JsonValue, sticky: bool) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.push(Route {
            matcher,
            status,
            body,
            sticky,
            used: false,
        });
    }

    /// Loads a JSON array of routes, e.g.
    /// `[{"method": "GET", "url": "/users", "query": {"$top": "5"}, "body": {..}, "always": true}]`.
    pub fn load_routes(&self, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let routes: Vec<FixtureRoute> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let count = routes.len();
        for route in routes {
            let mut matcher = RequestMatcher::new(&route.method, &route.url);
            for (k, v) in &route.query {
                matcher = matcher.query(k, v);
            }
            for (k, v) in route.body_fields {
                matcher = matcher.body_field(&k, v);
            }
            for (k, fragment) in &route.body_contains {
                matcher = matcher.body_contains(k, fragment);
            }
            self.push(matcher, route.status, route.body, route.always);
        }
        Ok(count)
    }

    pub fn from_routes_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let transport = Self::new();
        transport.load_routes(path)?;
        Ok(transport)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn request_count(&self) -> usize {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Requests whose URL contains `fragment`.
    pub fn count_matching(&self, fragment: &str) -> usize {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.url.contains(fragment))
            .count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let route = routes
            .iter_mut()
            .find(|r| (r.sticky || !r.used) && r.matcher.matches(&request))
            .ok_or_else(|| {
                TransportError::new(
                    RetryDisposition::NonRetryable,
                    format!(
                        "no scripted response for {} {} {:?}",
                        request.method.as_str(),
                        request.url,
                        request.query
                    ),
                )
            })?;
        route.used = true;

        Ok(HttpResponse {
            status: StatusCode::from_u16(route.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            url: request.url.clone(),
            body: serde_json::to_vec(&route.body).unwrap_or_default(),
        })
    }
}
