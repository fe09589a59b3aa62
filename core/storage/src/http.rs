//! HTTP remote endpoint.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::remote::{ChangeOutcome, PushRequest, RemoteEndpoint, RemoteSnapshot};
use lexisync_common::{Domain, Error, Result};

/// Source of the bearer credential and stable user id.
///
/// Token refresh and login live in the host's session layer; the sync
/// engine only reads whatever is current.
#[async_trait]
pub trait Credentials: Send + Sync {
    /// Current bearer token, `None` while signed out.
    async fn bearer_token(&self) -> Result<Option<String>>;

    /// Stable identifier of the signed-in user.
    fn user_id(&self) -> Option<String>;
}

/// Fixed credentials, for tools and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    token: Option<String>,
    user_id: Option<String>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>, user_id: Option<String>) -> Self {
        Self { token, user_id }
    }
}

#[async_trait]
impl Credentials for StaticCredentials {
    async fn bearer_token(&self) -> Result<Option<String>> {
        Ok(self.token.clone())
    }

    fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}

/// Configuration for [`HttpRemote`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRemoteConfig {
    /// Base URL of the sync API, e.g. `https://api.example.com/v1/`.
    pub base_url: String,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Per-request timeout.
    #[serde(with = "lexisync_common::types::duration_ms")]
    pub request_timeout: Duration,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/".to_string(),
            user_agent: "lexisync/0.1".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Server envelope for push responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushResponse {
    outcomes: Vec<ChangeOutcome>,
}

/// Sync API client.
///
/// - `POST {base}/sync/push` with a [`PushRequest`] body
/// - `GET {base}/sync/domains/{domain}` returning a [`RemoteSnapshot`]
pub struct HttpRemote {
    http: Client,
    base_url: Url,
    credentials: Arc<dyn Credentials>,
}

impl HttpRemote {
    /// Create a new HTTP remote.
    ///
    /// # Errors
    /// - Base URL does not parse
    /// - HTTP client cannot be built (TLS backend unavailable)
    pub fn new(config: HttpRemoteConfig, credentials: Arc<dyn Credentials>) -> Result<Self> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL {}: {}", base, e)))?;

        let http = Client::builder()
            .user_agent(config.user_agent)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", path, e)))
    }

    /// Build the authorization and user headers.
    async fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();

        if let Some(token) = self.credentials.bearer_token().await? {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| Error::Authentication(format!("Malformed token: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        if let Some(user_id) = self.credentials.user_id() {
            let value = header::HeaderValue::from_str(&user_id)
                .map_err(|e| Error::InvalidInput(format!("Malformed user id: {}", e)))?;
            headers.insert("x-user-id", value);
        }

        Ok(headers)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))
        } else if status == StatusCode::UNAUTHORIZED {
            Err(Error::Authentication(
                "Invalid or expired token".to_string(),
            ))
        } else if status == StatusCode::NOT_FOUND {
            Err(Error::NotFound("Resource not found".to_string()))
        } else if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Network(format!("API error: {} - {}", status, body)))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Remote(format!("API error: {} - {}", status, body)))
        }
    }
}

/// Map a reqwest send error to the engine's taxonomy.
fn transport_error(context: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{}: {}", context, err))
    } else {
        Error::Network(format!("{}: {}", context, err))
    }
}

#[async_trait]
impl RemoteEndpoint for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn push(&self, request: PushRequest) -> Result<Vec<ChangeOutcome>> {
        let url = self.endpoint("sync/push")?;
        let headers = self.auth_headers().await?;
        debug!(changes = request.changes.len(), %url, "Pushing change batch");

        let response = self
            .http
            .post(url)
            .headers(headers)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("Failed to push changes", e))?;

        let body: PushResponse = self.handle_response(response).await?;
        Ok(body.outcomes)
    }

    async fn fetch(&self, domain: &Domain) -> Result<RemoteSnapshot> {
        let url = self.endpoint(&format!("sync/domains/{}", domain))?;
        let headers = self.auth_headers().await?;

        let response = self
            .http
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| transport_error("Failed to fetch domain", e))?;

        self.handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(base: &str) -> Result<HttpRemote> {
        let config = HttpRemoteConfig {
            base_url: base.to_string(),
            ..HttpRemoteConfig::default()
        };
        HttpRemote::new(config, Arc::new(StaticCredentials::default()))
    }

    #[test]
    fn test_endpoint_join_keeps_base_path() {
        let remote = remote("https://api.example.com/v1").unwrap();
        assert_eq!(
            remote.endpoint("sync/push").unwrap().as_str(),
            "https://api.example.com/v1/sync/push"
        );
        assert_eq!(
            remote
                .endpoint(&format!("sync/domains/{}", Domain::UserStats))
                .unwrap()
                .as_str(),
            "https://api.example.com/v1/sync/domains/user_stats"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(remote("not a url"), Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_auth_headers() {
        let credentials = StaticCredentials::new(Some("tok".into()), Some("user-42".into()));
        let remote = HttpRemote::new(HttpRemoteConfig::default(), Arc::new(credentials)).unwrap();

        let headers = remote.auth_headers().await.unwrap();
        assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer tok");
        assert_eq!(headers.get("x-user-id").unwrap(), "user-42");
    }

    #[test]
    fn test_config_duration_serialization() {
        let config = HttpRemoteConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["request_timeout"], 30_000);
        let restored: HttpRemoteConfig = serde_json::from_value(json).unwrap();
        assert_eq!(restored.request_timeout, Duration::from_secs(30));
    }
}
