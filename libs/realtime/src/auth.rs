use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;
use widget_resilience::ResponseStatus;

/// Capability token handed to the realtime transport.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub token: String,
    pub client_id: Option<String>,
    pub expires_at_ms: Option<u64>,
}

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client_id: None,
            expires_at_ms: None,
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("token", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint returned an empty token")]
    EmptyToken,
    #[error("failed to decode token response: {0}")]
    Decode(String),
    #[error("invalid auth url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ResponseStatus for AuthError {
    fn response_status(&self) -> Option<u16> {
        match self {
            AuthError::Http(err) => err.response_status(),
            _ => None,
        }
    }
}

#[async_trait]
pub trait AuthTokenSource: Send + Sync {
    async fn fetch(&self, auth_url: &str) -> Result<AuthToken, AuthError>;
}

pub type SharedTokenSource = Arc<dyn AuthTokenSource>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBody {
    token: String,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    expires: Option<u64>,
}

/// Accepts either a JSON object carrying `token` or a bare token string.
pub fn parse_token_body(body: &str) -> Result<AuthToken, AuthError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(AuthError::EmptyToken);
    }
    if trimmed.starts_with('{') {
        let parsed: TokenBody =
            serde_json::from_str(trimmed).map_err(|err| AuthError::Decode(err.to_string()))?;
        if parsed.token.trim().is_empty() {
            return Err(AuthError::EmptyToken);
        }
        return Ok(AuthToken {
            token: parsed.token,
            client_id: parsed.client_id,
            expires_at_ms: parsed.expires,
        });
    }
    Ok(AuthToken::new(trimmed.trim_matches('"')))
}

/// Fetches tokens from the widget backend over HTTP.
#[derive(Clone)]
pub struct HttpTokenSource {
    http: Client,
}

impl HttpTokenSource {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

impl Default for HttpTokenSource {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

#[async_trait]
impl AuthTokenSource for HttpTokenSource {
    async fn fetch(&self, auth_url: &str) -> Result<AuthToken, AuthError> {
        let url = Url::parse(auth_url)?;
        debug!(host = url.host_str().unwrap_or_default(), "requesting realtime token");
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_token_body(&body)
    }
}

/// Hands out a fixed token and counts fetches.
#[derive(Debug, Default)]
pub struct StaticTokenSource {
    token: String,
    fetches: AtomicUsize,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthTokenSource for StaticTokenSource {
    async fn fetch(&self, _auth_url: &str) -> Result<AuthToken, AuthError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.token.is_empty() {
            return Err(AuthError::EmptyToken);
        }
        Ok(AuthToken::new(self.token.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_token_body() {
        let token =
            parse_token_body(r#"{"token":"abc","clientId":"widget-1","expires":1700}"#).unwrap();
        assert_eq!(token.token, "abc");
        assert_eq!(token.client_id.as_deref(), Some("widget-1"));
        assert_eq!(token.expires_at_ms, Some(1700));
    }

    #[test]
    fn parses_plain_text_token() {
        assert_eq!(parse_token_body(" \"xyz\"\n").unwrap().token, "xyz");
    }

    #[test]
    fn rejects_empty_tokens() {
        assert!(matches!(parse_token_body("  "), Err(AuthError::EmptyToken)));
        assert!(matches!(
            parse_token_body(r#"{"token":""}"#),
            Err(AuthError::EmptyToken)
        ));
        assert!(matches!(
            parse_token_body("{not json"),
            Err(AuthError::Decode(_))
        ));
    }

    #[test]
    fn debug_output_redacts_token() {
        let rendered = format!("{:?}", AuthToken::new("secret-value"));
        assert!(!rendered.contains("secret-value"));
    }

    #[tokio::test]
    async fn static_source_counts_fetches() {
        let source = StaticTokenSource::new("tok");
        source.fetch("https://example.test/token").await.unwrap();
        source.fetch("https://example.test/token").await.unwrap();
        assert_eq!(source.fetch_count(), 2);
        assert!(
            StaticTokenSource::new("")
                .fetch("https://example.test/token")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn http_source_rejects_invalid_url() {
        let err = HttpTokenSource::default()
            .fetch("not a url")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidUrl(_)));
        assert_eq!(err.response_status(), None);
    }
}
