//! HTTP transport for the remote API.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use limeaura_common::{Error, Result};

use crate::config::SyncConfig;
use crate::remote::{Method, RemoteApi, RemoteRequest, RemoteResponse};

/// Source of the bearer token attached to remote requests.
pub trait CredentialProvider: Send + Sync {
    /// Current token, or `None` to send requests unauthenticated.
    fn bearer_token(&self) -> Option<String>;
}

/// Sends requests without an `Authorization` header.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn bearer_token(&self) -> Option<String> {
        None
    }
}

/// A fixed token, e.g. from the command line or environment.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(***)")
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// JSON-over-HTTP client for the entity collections.
pub struct HttpRemote {
    http: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpRemote {
    /// Create a client rooted at `base_url`.
    ///
    /// # Errors
    /// - `base_url` is not an absolute URL
    /// - The HTTP client cannot be built
    pub fn new(
        base_url: &str,
        timeout: Duration,
        user_agent: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        url::Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL '{}': {}", base_url, e)))?;

        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn from_config(config: &SyncConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        Self::new(
            &config.api_base_url,
            config.request_timeout(),
            &config.user_agent,
            credentials,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn handle_response(
        &self,
        request: &RemoteRequest,
        response: reqwest::Response,
    ) -> Result<RemoteResponse> {
        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                debug!("Could not read {} response body: {}", request, e);
                String::new()
            }
        };

        if status.is_success() {
            let body = if text.trim().is_empty() {
                None
            } else {
                match serde_json::from_str(&text) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        debug!("{} returned a non-JSON body: {}", request, e);
                        None
                    }
                }
            };
            Ok(RemoteResponse {
                status: status.as_u16(),
                body,
            })
        } else if status == StatusCode::CONFLICT {
            Err(Error::RemoteConflict(format!("{}: {}", request, text)))
        } else {
            Err(Error::Transport(format!("{}: HTTP {} - {}", request, status, text)))
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, request: &RemoteRequest) -> Result<RemoteResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let method = match request.method {
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.http.request(method, &url);
        if let Some(token) = self.credentials.bearer_token() {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Transport(format!("{}: request timed out", request))
            } else {
                Error::Transport(format!("{}: {}", request, e))
            }
        })?;

        self.handle_response(request, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn remote(base_url: &str, credentials: Arc<dyn CredentialProvider>) -> HttpRemote {
        HttpRemote::new(base_url, Duration::from_secs(5), "limeaura-test", credentials).unwrap()
    }

    fn post_tasks() -> RemoteRequest {
        RemoteRequest {
            method: Method::Post,
            path: "/tasks".to_string(),
            body: Some(json!({ "project_id": "p-1", "title": "Write docs" })),
        }
    }

    #[tokio::test]
    async fn test_success_with_bearer_token_and_json_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/tasks")
            .match_header("authorization", "Bearer secret-token")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({ "project_id": "p-1", "title": "Write docs" })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"t-1","version":1}"#)
            .create_async()
            .await;

        let base = format!("{}/api/v1", server.url());
        let remote = remote(&base, Arc::new(StaticToken::new("secret-token")));
        let response = remote.execute(&post_tasks()).await.unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.body, Some(json!({ "id": "t-1", "version": 1 })));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_no_credentials_sends_no_authorization() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/tasks/t-1")
            .match_header("authorization", Matcher::Missing)
            .with_status(204)
            .create_async()
            .await;

        let remote = remote(&server.url(), Arc::new(NoCredentials));
        let request = RemoteRequest {
            method: Method::Delete,
            path: "/tasks/t-1".to_string(),
            body: None,
        };
        let response = remote.execute(&request).await.unwrap();

        assert_eq!(response.status, 204);
        assert!(response.body.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_conflict_maps_to_remote_conflict() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PATCH", "/tasks/t-2")
            .with_status(409)
            .with_body(r#"{"error":"version mismatch"}"#)
            .create_async()
            .await;

        let remote = remote(&server.url(), Arc::new(NoCredentials));
        let request = RemoteRequest {
            method: Method::Patch,
            path: "/tasks/t-2".to_string(),
            body: Some(json!({ "title": "x" })),
        };
        let err = remote.execute(&request).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_server_error_maps_to_transport() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/tasks")
            .with_status(500)
            .create_async()
            .await;

        let remote = remote(&server.url(), Arc::new(NoCredentials));
        let err = remote.execute(&post_tasks()).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_transport() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _accept = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let remote = HttpRemote::new(
            &format!("http://{}", addr),
            Duration::from_millis(200),
            "limeaura-test",
            Arc::new(NoCredentials),
        )
        .unwrap();
        let err = remote.execute(&post_tasks()).await.unwrap_err();
        assert!(matches!(err, Error::Transport(ref msg) if msg.contains("timed out")));
    }

    /// Serve one canned response per connection, then hang up.
    async fn serve_raw(response: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_truncated_error_body_keeps_status_mapping() {
        let remote = HttpRemote::new(
            &serve_raw("HTTP/1.1 503 Service Unavailable\r\nContent-Length: 100\r\n\r\npartial").await,
            Duration::from_secs(2),
            "limeaura-test",
            Arc::new(NoCredentials),
        )
        .unwrap();
        let err = remote.execute(&post_tasks()).await.unwrap_err();
        assert!(matches!(err, Error::Transport(ref msg) if msg.contains("503")));

        let remote = HttpRemote::new(
            &serve_raw("HTTP/1.1 409 Conflict\r\nContent-Length: 100\r\n\r\nstale").await,
            Duration::from_secs(2),
            "limeaura-test",
            Arc::new(NoCredentials),
        )
        .unwrap();
        let err = remote.execute(&post_tasks()).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let result = HttpRemote::new(
            "localhost without scheme",
            Duration::from_secs(1),
            "limeaura-test",
            Arc::new(NoCredentials),
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
