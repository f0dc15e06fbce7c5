//! HTTP client for talking to a running daemon
//!
//! Used by the front-end process. `add` may block for as long as the daemon
//! waits on torrent metadata, so only the health check carries a timeout.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::protocol::{
    stream_url, AddResponse, HealthResponse, ListResponse, MessageResponse, ADD_PATH, DEL_PATH,
    DOWNLOAD_PATH, LIST_PATH, PLAY_PATH, STOP_PATH,
};
use crate::handshake::{Handshake, HEALTH_PATH, HEALTH_TIMEOUT};
use crate::registry::ContentId;

/// Errors that can occur when communicating with the daemon
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to reach daemon: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Daemon answered {status}: {message}")]
    Rejected { status: StatusCode, message: String },
}

impl ClientError {
    /// The daemon refused the request as bad input (4xx)
    pub fn is_client_error(&self) -> bool {
        matches!(self, ClientError::Rejected { status, .. } if status.is_client_error())
    }
}

/// Client for one daemon
#[derive(Debug, Clone)]
pub struct DaemonClient {
    base_url: String,
    http: reqwest::Client,
}

impl DaemonClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn from_handshake(handshake: &Handshake) -> Self {
        Self::new(&handshake.url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stream URL of a registered file
    pub fn stream_url(&self, id: &ContentId) -> String {
        stream_url(&self.base_url, id)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {} {:?}", url, query);

        let mut request = self.http.get(&url).query(query);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<MessageResponse>(&body)
            .map(|m| m.message)
            .unwrap_or(body);
        Err(ClientError::Rejected { status, message })
    }

    /// Check the daemon is alive and learn its pid
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.get(HEALTH_PATH, &[], Some(HEALTH_TIMEOUT)).await
    }

    /// Add content by URI, returning the ids of its streamable files
    pub async fn add(&self, uri: &str) -> Result<AddResponse, ClientError> {
        self.get(ADD_PATH, &[("uri", uri)], None).await
    }

    /// Request daemon shutdown, optionally followed by a restart
    pub async fn stop(&self, restart: bool) -> Result<MessageResponse, ClientError> {
        let restart = if restart { "true" } else { "" };
        self.get(STOP_PATH, &[("restart", restart)], Some(HEALTH_TIMEOUT))
            .await
    }

    pub async fn remove(&self, id: &ContentId) -> Result<MessageResponse, ClientError> {
        self.get(DEL_PATH, &[("id", id.as_str())], None).await
    }

    pub async fn play(&self, id: &ContentId) -> Result<MessageResponse, ClientError> {
        self.get(PLAY_PATH, &[("f", id.as_str())], None).await
    }

    pub async fn download(&self, id: &ContentId) -> Result<MessageResponse, ClientError> {
        self.get(DOWNLOAD_PATH, &[("f", id.as_str())], None).await
    }

    pub async fn list(&self) -> Result<ListResponse, ClientError> {
        self.get(LIST_PATH, &[], None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let client = DaemonClient::new("http://127.0.0.1:8000/");
        assert_eq!(client.base_url(), "http://127.0.0.1:8000");
        assert_eq!(
            client.stream_url(&ContentId::from_param("abc")),
            "http://127.0.0.1:8000/stream?f=abc"
        );
    }

    #[test]
    fn test_client_error_classification() {
        let rejected = ClientError::Rejected {
            status: StatusCode::BAD_REQUEST,
            message: "Unsupported URI format".to_string(),
        };
        assert!(rejected.is_client_error());

        let failed = ClientError::Rejected {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "boom".to_string(),
        };
        assert!(!failed.is_client_error());
    }

    #[tokio::test]
    async fn test_health_unreachable_daemon() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = DaemonClient::new(format!("http://127.0.0.1:{}", port));
        let result = client.health().await;
        assert!(matches!(result, Err(ClientError::Http(_))));
    }
}
