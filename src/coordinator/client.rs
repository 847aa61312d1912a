//! HTTP client for the puller manager
//!
//! All calls are JSON `POST`s under the manager base URL:
//!
//! | Path          | Request                 | Response               |
//! |---------------|-------------------------|------------------------|
//! | `/login`      | `{puller, version}`     | `{session}`            |
//! | `/logout`     | `{session}`             | `{}`                   |
//! | `/ping`       | `{session}`             | `{logout?}`            |
//! | `/feed-state` | `{session, pack}`       | `{accepted, logout?}`  |
//! | `/feed-stat`  | `{session, stats}`      | `{logout?}`            |
//!
//! `401` or a `logout: true` body ends the session, `503` means not ready.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use super::{PullerManager, UpstreamError};
use crate::config::ManagerConfig;
use crate::models::{FeedStateUpdatePack, SessionId};
use crate::stats::FeedsStatistics;
use crate::utils::retry::{with_retry_if, RetryConfig};

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    puller: &'a str,
    version: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    session: SessionId,
}

#[derive(Debug, Serialize)]
struct SessionRequest<'a> {
    session: &'a SessionId,
}

#[derive(Debug, Serialize)]
struct FeedStateRequest<'a> {
    session: &'a SessionId,
    pack: &'a FeedStateUpdatePack,
}

#[derive(Debug, Serialize)]
struct FeedStatRequest<'a> {
    session: &'a SessionId,
    stats: &'a FeedsStatistics,
}

#[derive(Debug, Deserialize)]
struct Ack {
    #[serde(default)]
    logout: bool,
    #[serde(default = "default_accepted")]
    accepted: bool,
}

// An empty body acknowledges the call
impl Default for Ack {
    fn default() -> Self {
        Self {
            logout: false,
            accepted: true,
        }
    }
}

fn default_accepted() -> bool {
    true
}

/// reqwest implementation of [`PullerManager`]
pub struct HttpManagerClient {
    base_url: String,
    puller_name: String,
    http_client: Client,
    retry: RetryConfig,
}

impl HttpManagerClient {
    pub fn new(config: &ManagerConfig, puller_name: impl Into<String>) -> Result<Self, UpstreamError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            puller_name: puller_name.into(),
            http_client,
            retry: RetryConfig::default(),
        })
    }

    /// Override the login retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, UpstreamError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned + Default,
    {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(url = %url, "Calling manager");

        let response = self.http_client.post(&url).json(body).send().await?;
        let status = response.status();

        match status {
            StatusCode::UNAUTHORIZED => return Err(UpstreamError::Logout),
            StatusCode::SERVICE_UNAVAILABLE => {
                let text = response.text().await.unwrap_or_default();
                return Err(UpstreamError::NotReady(text));
            }
            s if !s.is_success() => {
                let text = response.text().await.unwrap_or_default();
                return Err(UpstreamError::Rejected(format!("{status}: {text}")));
            }
            _ => {}
        }

        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(R::default());
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| UpstreamError::Rejected(format!("invalid response from {path}: {e}")))
    }

    async fn post_ack<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Ack, UpstreamError> {
        let ack: Ack = self.post(path, body).await?;
        if ack.logout {
            return Err(UpstreamError::Logout);
        }
        Ok(ack)
    }
}

#[async_trait]
impl PullerManager for HttpManagerClient {
    async fn login(&self) -> Result<SessionId, UpstreamError> {
        let request = LoginRequest {
            puller: &self.puller_name,
            version: env!("CARGO_PKG_VERSION"),
        };

        let response: Option<LoginResponse> = with_retry_if(
            &self.retry,
            || async { self.post::<_, Option<LoginResponse>>("/login", &request).await },
            UpstreamError::is_recoverable,
        )
        .await?;

        response
            .map(|r| r.session)
            .filter(|s| !s.0.is_empty())
            .ok_or_else(|| UpstreamError::Rejected("login returned no session".into()))
    }

    async fn logout(&self, session: &SessionId) -> Result<(), UpstreamError> {
        match self.post_ack("/logout", &SessionRequest { session }).await {
            Ok(_) | Err(UpstreamError::Logout) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ping(&self, session: &SessionId) -> Result<(), UpstreamError> {
        self.post_ack("/ping", &SessionRequest { session }).await.map(|_| ())
    }

    async fn feed_state(
        &self,
        session: &SessionId,
        pack: &FeedStateUpdatePack,
    ) -> Result<bool, UpstreamError> {
        let ack = self
            .post_ack("/feed-state", &FeedStateRequest { session, pack })
            .await?;
        Ok(ack.accepted)
    }

    async fn feed_stat(
        &self,
        session: &SessionId,
        stats: &FeedsStatistics,
    ) -> Result<(), UpstreamError> {
        self.post_ack("/feed-stat", &FeedStatRequest { session, stats })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_defaults() {
        let ack: Ack = serde_json::from_str("{}").unwrap();
        assert!(ack.accepted);
        assert!(!ack.logout);

        let ack: Ack = serde_json::from_str(r#"{"accepted": false}"#).unwrap();
        assert!(!ack.accepted);
    }

    #[test]
    fn test_base_url_trimmed() {
        let config = ManagerConfig {
            url: "http://manager:8080/".to_string(),
            ..ManagerConfig::default()
        };
        let client = HttpManagerClient::new(&config, "puller-1").unwrap();
        assert_eq!(client.base_url, "http://manager:8080");
    }
}
