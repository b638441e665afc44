//! Request authentication: bearer tokens, API-key headers and OAuth1 (HMAC-SHA256).

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::{ApiSession, FetchError, HttpRequest, Method};

type HmacSha256 = Hmac<Sha256>;

/// RFC 3986 unreserved characters pass through; everything else is encoded.
const OAUTH_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("signing key rejected")]
    InvalidKey,
    #[error("cannot sign request for `{0}`: not an absolute URL")]
    InvalidUrl(String),
    #[error("token endpoint response has no access_token")]
    MissingToken,
}

#[derive(Debug, Clone)]
pub enum Auth {
    None,
    Bearer(String),
    ApiKey { header: String, key: String },
    OAuth1(Arc<OAuth1Signer>),
}

impl Auth {
    /// Attaches credentials. OAuth1 is re-signed on every call so retries get a fresh nonce.
    pub fn apply(&self, request: &mut HttpRequest) -> Result<(), AuthError> {
        match self {
            Auth::None => {}
            Auth::Bearer(token) => request
                .headers
                .push(("Authorization".into(), format!("Bearer {token}"))),
            Auth::ApiKey { header, key } => request.headers.push((header.clone(), key.clone())),
            Auth::OAuth1(signer) => {
                let value = signer.authorization_header(request.method, &request.url, &request.query)?;
                request.headers.push(("Authorization".into(), value));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OAuth1Credentials {
    /// Account id; sent as the `realm` attribute.
    pub realm: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub token_id: String,
    pub token_secret: String,
}

#[derive(Debug, Clone)]
pub struct OAuth1Signer {
    credentials: OAuth1Credentials,
}

pub fn percent_encode(input: &str) -> String {
    utf8_percent_encode(input, OAUTH_ENCODE).to_string()
}

/// Base string URI: lowercase scheme and host, port only when not the scheme default,
/// no query or fragment.
fn base_string_uri(url: &Url) -> String {
    let mut base = format!(
        "{}://{}",
        url.scheme().to_ascii_lowercase(),
        url.host_str().unwrap_or_default().to_ascii_lowercase()
    );
    if let Some(port) = url.port() {
        base.push_str(&format!(":{port}"));
    }
    base.push_str(url.path());
    base
}

impl OAuth1Signer {
    pub fn new(credentials: OAuth1Credentials) -> Self {
        Self { credentials }
    }

    pub fn authorization_header(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
    ) -> Result<String, AuthError> {
        let nonce = Uuid::new_v4().simple().to_string();
        let timestamp = Utc::now().timestamp();
        self.authorization_header_at(method, url, query, &nonce, timestamp)
    }

    /// Deterministic variant with caller-supplied nonce and timestamp.
    pub fn authorization_header_at(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        nonce: &str,
        timestamp: i64,
    ) -> Result<String, AuthError> {
        let creds = &self.credentials;
        let timestamp = timestamp.to_string();
        let oauth_params: Vec<(&str, &str)> = vec![
            ("oauth_consumer_key", creds.consumer_key.as_str()),
            ("oauth_nonce", nonce),
            ("oauth_signature_method", "HMAC-SHA256"),
            ("oauth_timestamp", timestamp.as_str()),
            ("oauth_token", creds.token_id.as_str()),
            ("oauth_version", "1.0"),
        ];

        let parsed = Url::parse(url).map_err(|_| AuthError::InvalidUrl(url.to_string()))?;
        let embedded: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();

        let mut params: Vec<(String, String)> = oauth_params
            .iter()
            .map(|(k, v)| (percent_encode(k), percent_encode(v)))
            .collect();
        params.extend(
            query
                .iter()
                .chain(embedded.iter())
                .map(|(k, v)| (percent_encode(k), percent_encode(v))),
        );
        params.sort();

        let param_string = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let base_string = format!(
            "{}&{}&{}",
            method.as_str(),
            percent_encode(&base_string_uri(&parsed)),
            percent_encode(&param_string)
        );
        let signing_key = format!(
            "{}&{}",
            percent_encode(&creds.consumer_secret),
            percent_encode(&creds.token_secret)
        );

        let mut mac =
            HmacSha256::new_from_slice(signing_key.as_bytes()).map_err(|_| AuthError::InvalidKey)?;
        mac.update(base_string.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let mut header = format!("OAuth realm=\"{}\"", creds.realm);
        for (k, v) in &oauth_params {
            header.push_str(&format!(", {k}=\"{}\"", percent_encode(v)));
        }
        header.push_str(&format!(", oauth_signature=\"{}\"", percent_encode(&signature)));
        Ok(header)
    }
}

/// OAuth2 client-credentials exchange; returns the bearer token.
pub async fn client_credentials_token(
    session: &ApiSession,
    token_url: &str,
    client_id: &str,
    client_secret: &str,
    scope: &str,
) -> Result<String, FetchError> {
    let request = HttpRequest::post(token_url).form(&[
        ("grant_type", "client_credentials"),
        ("client_id", client_id),
        ("client_secret", client_secret),
        ("scope", scope),
    ]);
    let body = session.send(request).await?.json()?;
    body.get("access_token")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or(FetchError::Auth(AuthError::MissingToken))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedTransport;
    use crate::BackoffPolicy;
    use serde_json::json;

    fn signer() -> OAuth1Signer {
        OAuth1Signer::new(OAuth1Credentials {
            realm: "1234567_SB1".into(),
            consumer_key: "ck".into(),
            consumer_secret: "cs".into(),
            token_id: "tk".into(),
            token_secret: "ts".into(),
        })
    }

    #[test]
    fn percent_encoding_keeps_only_unreserved() {
        assert_eq!(percent_encode("a b+c~d/e"), "a%20b%2Bc~d%2Fe");
        assert_eq!(percent_encode("é"), "%C3%A9");
    }

    #[test]
    fn oauth1_signature_is_deterministic_for_fixed_nonce() {
        let query = vec![("script".to_string(), "12".to_string()), ("deploy".to_string(), "1".to_string())];
        let url = "https://acct.restlets.api.netsuite.com/app/site/hosting/restlet.nl";
        let a = signer()
            .authorization_header_at(Method::Post, url, &query, "n0nce", 1_700_000_000)
            .expect("sign");
        let b = signer()
            .authorization_header_at(Method::Post, url, &query, "n0nce", 1_700_000_000)
            .expect("sign");
        let c = signer()
            .authorization_header_at(Method::Post, url, &query, "other", 1_700_000_000)
            .expect("sign");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("OAuth realm=\"1234567_SB1\", oauth_consumer_key=\"ck\""));
        assert!(a.contains("oauth_signature_method=\"HMAC-SHA256\""));
        assert!(a.contains("oauth_signature=\""));
    }

    #[test]
    fn base_uri_ignores_host_case_and_default_port() {
        let query = vec![("script".to_string(), "12".to_string())];
        let sign = |url: &str| {
            signer()
                .authorization_header_at(Method::Post, url, &query, "n0nce", 1_700_000_000)
                .expect("sign")
        };
        let plain = sign("https://acct.restlets.api.netsuite.com/app/site/hosting/restlet.nl");
        assert_eq!(
            plain,
            sign("https://ACCT.restlets.api.netsuite.com:443/app/site/hosting/restlet.nl")
        );
        assert_ne!(
            plain,
            sign("https://acct.restlets.api.netsuite.com:8443/app/site/hosting/restlet.nl")
        );
    }

    #[test]
    fn embedded_query_signs_like_separate_pairs() {
        let base = "https://acct.restlets.api.netsuite.com/app/site/hosting/restlet.nl";
        let separate = signer()
            .authorization_header_at(
                Method::Post,
                base,
                &[("script".to_string(), "a b".to_string())],
                "n0nce",
                1_700_000_000,
            )
            .expect("sign");
        let embedded = signer()
            .authorization_header_at(
                Method::Post,
                &format!("{base}?script=a%20b"),
                &[],
                "n0nce",
                1_700_000_000,
            )
            .expect("sign");
        assert_eq!(separate, embedded);
    }

    #[test]
    fn relative_urls_are_rejected() {
        let err = signer()
            .authorization_header_at(Method::Get, "/restlet.nl", &[], "n0nce", 1)
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn client_credentials_exchange_reads_access_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("POST", "/oauth2/v2.0/token", json!({"access_token": "abc", "expires_in": 3599}));
        let session = ApiSession::new(transport.clone(), "directory", "https://graph.test", Auth::None)
            .with_backoff(BackoffPolicy::immediate(0));

        let token = client_credentials_token(
            &session,
            "https://login.test/tenant/oauth2/v2.0/token",
            "id",
            "secret",
            "https://graph.microsoft.com/.default",
        )
        .await
        .expect("token");
        assert_eq!(token, "abc");

        let sent = transport.requests();
        assert!(matches!(&sent[0].body, crate::Body::Form(pairs) if pairs.contains(&("grant_type".into(), "client_credentials".into()))));
    }
}
