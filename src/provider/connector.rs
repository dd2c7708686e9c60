// provider/connector.rs - Managed connector auth for hosted sync providers
//
// Wraps the HTTP transport with provider-managed credentials: proactive
// refresh of expired tokens, a single refresh+retry on 401, and the HTTP
// status -> connector error code mapping.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sqlx::SqlitePool;

use crate::protocol::{PullRequest, PushRequest};
use crate::provider::config::load_provider_config;
use crate::provider::session::SessionAuthStore;
use crate::sync::transport::SyncTransport;
use crate::{Error, Result};

/// Refresh tokens this close to expiry instead of racing it.
const EXPIRY_BUFFER_SECS: i64 = 60;

/// Connector-level error taxonomy mapped from HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorErrorCode {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    Unavailable,
    Unknown,
}

impl ConnectorErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => ConnectorErrorCode::InvalidRequest,
            401 => ConnectorErrorCode::Unauthorized,
            403 => ConnectorErrorCode::Forbidden,
            404 => ConnectorErrorCode::NotFound,
            409 => ConnectorErrorCode::Conflict,
            429 => ConnectorErrorCode::RateLimited,
            500..=599 => ConnectorErrorCode::Unavailable,
            _ => ConnectorErrorCode::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorErrorCode::InvalidRequest => "invalid_request",
            ConnectorErrorCode::Unauthorized => "unauthorized",
            ConnectorErrorCode::Forbidden => "forbidden",
            ConnectorErrorCode::NotFound => "not_found",
            ConnectorErrorCode::Conflict => "conflict",
            ConnectorErrorCode::RateLimited => "rate_limited",
            ConnectorErrorCode::Unavailable => "unavailable",
            ConnectorErrorCode::Unknown => "unknown",
        }
    }
}

/// Hydrated managed auth view of the provider config.
#[derive(Debug, Clone, Default)]
pub struct ManagedAuth {
    pub token_type: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_refresh_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ManagedAuth {
    /// Read the managed_auth block of a hydrated provider config.
    pub fn from_config(config: &Value) -> Self {
        let auth = config.get("managed_auth").cloned().unwrap_or(Value::Null);
        let get = |key: &str| auth.get(key).and_then(Value::as_str).map(|s| s.to_string());

        Self {
            token_type: get("token_type").unwrap_or_else(|| "Bearer".to_string()),
            access_token: get("access_token"),
            refresh_token: get("refresh_token"),
            token_refresh_url: get("token_refresh_url"),
            client_id: get("client_id"),
            client_secret: get("client_secret"),
            expires_at: get("expires_at")
                .map(|raw| crate::protocol::codec::coerce_timestamp(&raw)),
        }
    }

    /// Expired, or expiring within the buffer.
    pub fn needs_refresh(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                expires_at <= Utc::now() + chrono::Duration::seconds(EXPIRY_BUFFER_SECS)
            }
            None => false,
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some() && self.token_refresh_url.is_some()
    }

    /// `Authorization` header value: `<token_type> <access_token>`.
    pub fn authorization_value(&self) -> Result<String> {
        let access_token = self
            .access_token
            .as_deref()
            .ok_or_else(|| Error::Auth("unauthorized: no access token for provider".to_string()))?;
        Ok(format!("{} {}", self.token_type, access_token))
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    token_type: Option<String>,
}

/// Transport over the hosted sync API using provider-managed credentials.
pub struct ManagedConnector {
    base_url: String,
    pool: SqlitePool,
    session: SessionAuthStore,
    http_client: reqwest::Client,
}

impl ManagedConnector {
    pub fn new(pool: SqlitePool, session: SessionAuthStore, base_url: String) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            pool,
            session,
            http_client,
        })
    }

    async fn current_auth(&self) -> Result<(String, ManagedAuth)> {
        let (provider, config) = load_provider_config(&self.pool, &self.session).await?;
        Ok((provider, ManagedAuth::from_config(&config)))
    }

    /// Exchange the refresh token for a new access token and stash the
    /// result in the session store.
    async fn refresh(&self, provider: &str, auth: &ManagedAuth) -> Result<ManagedAuth> {
        let refresh_url = auth
            .token_refresh_url
            .as_deref()
            .ok_or_else(|| Error::Auth("unauthorized: no token refresh URL".to_string()))?;
        let refresh_token = auth
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::Auth("unauthorized: no refresh token".to_string()))?;

        let mut body = json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        });
        if let Some(client_id) = &auth.client_id {
            body["client_id"] = json!(client_id);
        }
        if let Some(client_secret) = &auth.client_secret {
            body["client_secret"] = json!(client_secret);
        }

        let response = self
            .http_client
            .post(refresh_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Token refresh request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Auth(format!(
                "unauthorized: token refresh failed with status {}",
                response.status()
            )));
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("Failed to parse refresh response: {}", e)))?;

        let expires_at = Utc::now() + chrono::Duration::seconds(refreshed.expires_in);

        let mut fields = Map::new();
        fields.insert("access_token".to_string(), json!(refreshed.access_token));
        if let Some(new_refresh) = &refreshed.refresh_token {
            fields.insert("refresh_token".to_string(), json!(new_refresh));
        }
        fields.insert("expires_at".to_string(), json!(expires_at));
        self.session.merge(provider, fields).await;

        tracing::info!("Refreshed access token for provider {}", provider);

        let mut updated = auth.clone();
        updated.access_token = Some(refreshed.access_token);
        if let Some(new_refresh) = refreshed.refresh_token {
            updated.refresh_token = Some(new_refresh);
        }
        if let Some(token_type) = refreshed.token_type {
            updated.token_type = token_type;
        }
        updated.expires_at = Some(expires_at);

        Ok(updated)
    }

    async fn send_authorized(
        &self,
        endpoint: &str,
        body: &Value,
        deadline: Duration,
    ) -> Result<Value> {
        let (provider, mut auth) = self.current_auth().await?;

        if auth.access_token.is_none() {
            return Err(Error::Auth(
                "unauthorized: provider has no session credentials".to_string(),
            ));
        }

        // Proactive refresh for tokens at or past expiry
        if auth.needs_refresh() {
            if auth.can_refresh() {
                auth = self.refresh(&provider, &auth).await?;
            } else {
                return Err(Error::Auth(
                    "unauthorized: token expired and provider cannot refresh".to_string(),
                ));
            }
        }

        let response = self.attempt(endpoint, body, &auth, deadline).await?;

        if response.status().as_u16() == 401 && auth.can_refresh() {
            // One refresh, one retry
            let auth = self.refresh(&provider, &auth).await?;
            let retried = self.attempt(endpoint, body, &auth, deadline).await?;
            return Self::into_frame(retried).await;
        }

        Self::into_frame(response).await
    }

    async fn attempt(
        &self,
        endpoint: &str,
        body: &Value,
        auth: &ManagedAuth,
        deadline: Duration,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, endpoint);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&auth.authorization_value()?)
            .map_err(|e| Error::Auth(format!("Invalid authorization header: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);

        self.http_client
            .post(&url)
            .headers(headers)
            .timeout(deadline)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    Error::Network(format!("Connector request failed: {}", e))
                } else {
                    Error::Sync(format!("Connector request failed: {}", e))
                }
            })
    }

    async fn into_frame(response: reqwest::Response) -> Result<Value> {
        let status = response.status();

        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| Error::Sync(format!("Failed to parse connector response: {}", e)));
        }

        let code = ConnectorErrorCode::from_status(status.as_u16());
        let message = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| status.to_string());

        Err(match code {
            ConnectorErrorCode::Unauthorized | ConnectorErrorCode::Forbidden => {
                Error::Auth(format!("{}: {}", code.as_str(), message))
            }
            ConnectorErrorCode::RateLimited | ConnectorErrorCode::Unavailable => {
                Error::Network(format!("{}: {}", code.as_str(), message))
            }
            _ => Error::Sync(format!("{}: {}", code.as_str(), message)),
        })
    }
}

#[async_trait]
impl SyncTransport for ManagedConnector {
    async fn push(&self, request: &PushRequest, deadline: Duration) -> Result<Value> {
        let body = serde_json::to_value(request)?;
        self.send_authorized("/sync/push", &body, deadline).await
    }

    async fn pull(&self, request: &PullRequest, deadline: Duration) -> Result<Value> {
        let body = serde_json::to_value(request)?;
        self.send_authorized("/sync/pull", &body, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        let cases = [
            (400, ConnectorErrorCode::InvalidRequest),
            (401, ConnectorErrorCode::Unauthorized),
            (403, ConnectorErrorCode::Forbidden),
            (404, ConnectorErrorCode::NotFound),
            (409, ConnectorErrorCode::Conflict),
            (429, ConnectorErrorCode::RateLimited),
            (500, ConnectorErrorCode::Unavailable),
            (503, ConnectorErrorCode::Unavailable),
            (418, ConnectorErrorCode::Unknown),
        ];
        for (status, expected) in cases {
            assert_eq!(ConnectorErrorCode::from_status(status), expected, "{}", status);
        }
    }

    #[test]
    fn test_managed_auth_from_config() {
        let config = json!({
            "managed_auth": {
                "token_type": "Bearer",
                "access_token": "tok",
                "refresh_token": "ref",
                "token_refresh_url": "https://auth.example.com/token",
                "client_id": "app-1",
                "expires_at": "2020-01-01T00:00:00Z"
            }
        });

        let auth = ManagedAuth::from_config(&config);
        assert_eq!(auth.authorization_value().unwrap(), "Bearer tok");
        assert!(auth.can_refresh());
        // expires_at is long past
        assert!(auth.needs_refresh());
    }

    #[test]
    fn test_managed_auth_without_credentials() {
        let auth = ManagedAuth::from_config(&json!({}));
        assert!(auth.authorization_value().is_err());
        assert!(!auth.can_refresh());
        assert!(!auth.needs_refresh());
    }
}
