// sync/transport.rs - Transport seam for the hosted sync API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;

use crate::protocol::{codec, PullRequest, PushRequest, SyncApiErrorCode};
use crate::{Error, Result};

/// Default per-call deadline for hosted connectors.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(15);

/// Pluggable transport for push/pull frames.
///
/// Implementations return the raw response body; the runner parses it
/// through the codec so every transport shares the same strictness.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Ship a push frame. `deadline` bounds the whole call.
    async fn push(&self, request: &PushRequest, deadline: Duration) -> Result<Value>;

    /// Fetch one pull page.
    async fn pull(&self, request: &PullRequest, deadline: Duration) -> Result<Value>;
}

/// HTTP transport speaking JSON to a sync server.
#[derive(Clone)]
pub struct HttpTransport {
    base_url: String,
    bearer_token: Option<String>,
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a new HTTP transport for the given server.
    pub fn new(base_url: String) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token: None,
            http_client,
        })
    }

    /// Set the bearer token for authenticated requests.
    pub fn set_bearer_token(&mut self, token: String) {
        self.bearer_token = Some(token);
    }

    /// Clear the bearer token (sign-out).
    pub fn clear_bearer_token(&mut self) {
        self.bearer_token = None;
    }

    async fn post_json(&self, endpoint: &str, body: &Value, deadline: Duration) -> Result<Value> {
        let url = format!("{}{}", self.base_url, endpoint);
        let headers = self.build_headers()?;

        let response = self
            .http_client
            .post(&url)
            .headers(headers)
            .timeout(deadline)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    Error::Network(format!("Sync request failed: {}", e))
                } else {
                    Error::Sync(format!("Sync request failed: {}", e))
                }
            })?;

        handle_response(response).await
    }

    fn build_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = &self.bearer_token {
            let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| Error::Auth(format!("Invalid bearer token: {}", e)))?;
            headers.insert(AUTHORIZATION, auth_value);
        }

        Ok(headers)
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, request: &PushRequest, deadline: Duration) -> Result<Value> {
        let body = serde_json::to_value(request)?;
        self.post_json("/sync/push", &body, deadline).await
    }

    async fn pull(&self, request: &PullRequest, deadline: Duration) -> Result<Value> {
        let body = serde_json::to_value(request)?;
        self.post_json("/sync/pull", &body, deadline).await
    }
}

/// Map an HTTP response to a frame body or an error from the API taxonomy.
pub(crate) async fn handle_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status();

    if status.is_success() {
        return response
            .json::<Value>()
            .await
            .map_err(|e| Error::Sync(format!("Failed to parse sync response: {}", e)));
    }

    let body = response.json::<Value>().await.unwrap_or(Value::Null);
    let api_error = codec::parse_api_error(&body);

    Err(match api_error.code {
        SyncApiErrorCode::Unauthorized | SyncApiErrorCode::Forbidden => Error::Auth(format!(
            "{}: {}",
            api_error.code.as_str(),
            api_error.message
        )),
        SyncApiErrorCode::RateLimited | SyncApiErrorCode::Unavailable => Error::Network(format!(
            "{}: {}",
            api_error.code.as_str(),
            api_error.message
        )),
        _ => Error::Sync(format!(
            "{}: {}",
            api_error.code.as_str(),
            api_error.message
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_creation_normalizes_base_url() {
        let transport = HttpTransport::new("https://sync.example.com/".to_string()).unwrap();
        assert_eq!(transport.base_url, "https://sync.example.com");
        assert!(transport.bearer_token.is_none());
    }

    #[test]
    fn test_bearer_token_management() {
        let mut transport = HttpTransport::new("https://sync.example.com".to_string()).unwrap();

        transport.set_bearer_token("tok".to_string());
        assert!(transport.bearer_token.is_some());

        let headers = transport.build_headers().unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok");

        transport.clear_bearer_token();
        assert!(transport.bearer_token.is_none());
    }
}
