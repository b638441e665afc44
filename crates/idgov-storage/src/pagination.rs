//! Paging protocols spoken by the upstream APIs.

use std::collections::HashSet;

use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{ApiSession, Body, FetchError, HttpRequest};

#[derive(Debug, Clone, PartialEq)]
pub enum PageProtocol {
    /// Follow an absolute next-page link until the response carries none. Query parameters
    /// go on the first request only; the link already embeds them. A link seen before
    /// fails the fetch.
    ContinuationLink {
        items_field: String,
        next_field: String,
    },
    /// Increment a page-index query parameter until a page is shorter than `page_size`.
    PageNumber {
        page_param: String,
        size_param: String,
        page_size: usize,
        first_page: usize,
        items_field: String,
        extra: Vec<(String, String)>,
    },
    /// Write the page index into the JSON body, starting from 0, until the response's
    /// total page count is reached.
    TotalPages {
        page_field: String,
        items_field: String,
        total_field: String,
    },
}

impl PageProtocol {
    /// `value` / `@odata.nextLink`.
    pub fn next_link() -> Self {
        PageProtocol::ContinuationLink {
            items_field: "value".into(),
            next_field: "@odata.nextLink".into(),
        }
    }

    /// `Page` / `PerPage=100` / `RequiresCounts=true`, items under `result`.
    pub fn helpdesk() -> Self {
        PageProtocol::PageNumber {
            page_param: "Page".into(),
            size_param: "PerPage".into(),
            page_size: 100,
            first_page: 1,
            items_field: "result".into(),
            extra: vec![("RequiresCounts".into(), "true".into())],
        }
    }

    /// `page` / `limit=100`, items under `data`.
    pub fn page_limit() -> Self {
        PageProtocol::PageNumber {
            page_param: "page".into(),
            size_param: "limit".into(),
            page_size: 100,
            first_page: 1,
            items_field: "data".into(),
            extra: Vec::new(),
        }
    }

    /// Body `page` from 0, items under `data`, stop at `totalPages`.
    pub fn restlet() -> Self {
        PageProtocol::TotalPages {
            page_field: "page".into(),
            items_field: "data".into(),
            total_field: "totalPages".into(),
        }
    }
}

fn items_of(body: &JsonValue, field: &str, url: &str) -> Result<Vec<JsonValue>, FetchError> {
    match body.get(field) {
        Some(JsonValue::Array(items)) => Ok(items.clone()),
        Some(JsonValue::Null) => Ok(Vec::new()),
        _ => Err(FetchError::MissingField {
            url: url.to_string(),
            field: field.to_string(),
        }),
    }
}

fn page_failed(page: usize) -> impl FnOnce(FetchError) -> FetchError {
    move |err| FetchError::Page {
        page,
        source: Box::new(err),
    }
}

impl ApiSession {
    /// Fetches every page of `request` and concatenates the items in page order.
    ///
    /// `Ok(vec![])` means the source has no rows. Any page failure aborts the whole fetch;
    /// partial results are never returned.
    pub async fn fetch_all(
        &self,
        request: HttpRequest,
        protocol: &PageProtocol,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let url = request.url.clone();
        let records = match protocol {
            PageProtocol::ContinuationLink {
                items_field,
                next_field,
            } => {
                let mut records = Vec::new();
                let mut next = Some(request);
                let mut visited: HashSet<String> = HashSet::new();
                let mut page = 0;
                while let Some(req) = next.take() {
                    let page_url = req.url.clone();
                    let body = self
                        .send(req)
                        .await
                        .and_then(|r| r.json())
                        .map_err(page_failed(page))?;
                    records.extend(items_of(&body, items_field, &page_url).map_err(page_failed(page))?);
                    debug!(page, rows = records.len(), "page fetched");
                    page += 1;
                    let link = body
                        .get(next_field.as_str())
                        .and_then(JsonValue::as_str)
                        .filter(|link| !link.is_empty());
                    if let Some(link) = link {
                        if !visited.insert(link.to_string()) {
                            return Err(FetchError::Page {
                                page,
                                source: Box::new(FetchError::RepeatedLink {
                                    url: link.to_string(),
                                }),
                            });
                        }
                        next = Some(HttpRequest::get(link));
                    }
                }
                records
            }
            PageProtocol::PageNumber {
                page_param,
                size_param,
                page_size,
                first_page,
                items_field,
                extra,
            } => {
                let mut records = Vec::new();
                let mut page = *first_page;
                loop {
                    let mut req = request.clone();
                    for (k, v) in extra {
                        req.set_query(k, v.clone());
                    }
                    req.set_query(size_param, page_size.to_string());
                    req.set_query(page_param, page.to_string());

                    let body = self
                        .send(req)
                        .await
                        .and_then(|r| r.json())
                        .map_err(page_failed(page))?;
                    let items = items_of(&body, items_field, &url).map_err(page_failed(page))?;
                    let short = items.len() < *page_size;
                    records.extend(items);
                    debug!(page, rows = records.len(), "page fetched");
                    if short {
                        break;
                    }
                    page += 1;
                }
                records
            }
            PageProtocol::TotalPages {
                page_field,
                items_field,
                total_field,
            } => {
                let mut records = Vec::new();
                let mut page = 0usize;
                loop {
                    let mut req = request.clone();
                    let mut body = match req.body {
                        Body::Json(JsonValue::Object(map)) => map,
                        _ => serde_json::Map::new(),
                    };
                    body.insert(page_field.clone(), JsonValue::from(page));
                    req.body = Body::Json(JsonValue::Object(body));

                    let resp = self
                        .send(req)
                        .await
                        .and_then(|r| r.json())
                        .map_err(page_failed(page))?;
                    records.extend(items_of(&resp, items_field, &url).map_err(page_failed(page))?);
                    let total = resp
                        .get(total_field.as_str())
                        .and_then(JsonValue::as_u64)
                        .ok_or_else(|| FetchError::MissingField {
                            url: url.clone(),
                            field: total_field.clone(),
                        })
                        .map_err(page_failed(page))?;
                    debug!(page, total, rows = records.len(), "page fetched");
                    if (page as u64) + 1 >= total {
                        break;
                    }
                    page += 1;
                }
                records
            }
        };

        info!(source = %self.source(), url = %url, rows = records.len(), "fetch_all complete");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::scripted::{RequestMatcher, ScriptedTransport};
    use crate::{Auth, BackoffPolicy, Method};

    fn session(transport: &Arc<ScriptedTransport>) -> ApiSession {
        ApiSession::new(transport.clone(), "test", "https://api.test", Auth::None)
            .with_backoff(BackoffPolicy::immediate(0))
    }

    fn rows(range: std::ops::Range<usize>) -> Vec<JsonValue> {
        range.map(|i| json!({ "id": i })).collect()
    }

    #[tokio::test]
    async fn page_number_fetch_is_complete_and_ordered() {
        let transport = Arc::new(ScriptedTransport::new());
        let protocol = PageProtocol::PageNumber {
            page_param: "Page".into(),
            size_param: "PerPage".into(),
            page_size: 3,
            first_page: 1,
            items_field: "result".into(),
            extra: vec![("RequiresCounts".into(), "true".into())],
        };
        transport.respond_matching(RequestMatcher::new("GET", "/agents").query("Page", "1"), 200, json!({"result": rows(0..3)}));
        transport.respond_matching(RequestMatcher::new("GET", "/agents").query("Page", "2"), 200, json!({"result": rows(3..6)}));
        transport.respond_matching(RequestMatcher::new("GET", "/agents").query("Page", "3"), 200, json!({"result": rows(6..7)}));

        let s = session(&transport);
        let all = s.fetch_all(s.request(Method::Get, "agents"), &protocol).await.expect("fetch");
        assert_eq!(all, rows(0..7));
        assert_eq!(transport.request_count(), 3);
        assert!(transport.requests()[0]
            .query
            .contains(&("RequiresCounts".into(), "true".into())));
    }

    #[tokio::test]
    async fn continuation_links_are_followed_without_repeating_query() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("GET", "/users?$skiptoken=2", json!({"value": rows(2..3)}));
        transport.respond(
            "GET",
            "/users",
            json!({"value": rows(0..2), "@odata.nextLink": "https://api.test/users?$skiptoken=2"}),
        );

        let s = session(&transport);
        let req = s.request(Method::Get, "users").query(&[("$select", "id")]);
        let all = s.fetch_all(req, &PageProtocol::next_link()).await.expect("fetch");
        assert_eq!(all, rows(0..3));
        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].query.is_empty());
    }

    #[tokio::test]
    async fn a_continuation_link_seen_twice_fails_the_fetch() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_always(
            "GET",
            "/devices?$skiptoken=A",
            json!({"value": rows(1..2), "@odata.nextLink": "https://api.test/devices?$skiptoken=A"}),
        );
        transport.respond(
            "GET",
            "/devices",
            json!({"value": rows(0..1), "@odata.nextLink": "https://api.test/devices?$skiptoken=A"}),
        );

        let s = session(&transport);
        let err = s
            .fetch_all(s.request(Method::Get, "devices"), &PageProtocol::next_link())
            .await
            .unwrap_err();
        match err {
            FetchError::Page { page, source } => {
                assert_eq!(page, 2);
                assert!(matches!(*source, FetchError::RepeatedLink { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn total_pages_walks_body_page_index() {
        let transport = Arc::new(ScriptedTransport::new());
        for page in 0..3usize {
            transport.respond_matching(
                RequestMatcher::new("POST", "/restlet").body_field("page", json!(page)),
                200,
                json!({"data": rows(page * 2..page * 2 + 2), "totalPages": 3}),
            );
        }

        let s = session(&transport);
        let req = s
            .request(Method::Post, "restlet")
            .json(json!({"action": "queryRun", "pageSize": 2}));
        let all = s.fetch_all(req, &PageProtocol::restlet()).await.expect("fetch");
        assert_eq!(all.len(), 6);
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test]
    async fn a_failed_page_fails_the_whole_fetch() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("GET", "/tickets", json!({"result": rows(0..100)}));
        transport.respond_status("GET", "/tickets", 401, json!({}));

        let s = session(&transport);
        let err = s
            .fetch_all(s.request(Method::Get, "tickets"), &PageProtocol::helpdesk())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Page { page: 2, .. }));
    }

    #[tokio::test]
    async fn empty_source_is_ok_and_missing_items_field_is_not() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("GET", "/learners", json!({"data": []}));
        transport.respond("GET", "/campaigns", json!({"message": "maintenance"}));

        let s = session(&transport);
        let empty = s
            .fetch_all(s.request(Method::Get, "learners"), &PageProtocol::page_limit())
            .await
            .expect("empty");
        assert!(empty.is_empty());

        let err = s
            .fetch_all(s.request(Method::Get, "campaigns"), &PageProtocol::page_limit())
            .await
            .unwrap_err();
        match err {
            FetchError::Page { source, .. } => {
                assert!(matches!(*source, FetchError::MissingField { .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
