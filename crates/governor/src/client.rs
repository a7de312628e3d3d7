//! Fetch client: the narrow interface to the external data source.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use tipoff_core::{ErrorKind, FetchConfig, SourceConfig, SourceId};

/// One outbound request for a source unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub source_id: SourceId,
    pub source_type: String,
    /// Path relative to the client's base URL.
    pub path: String,
    pub query: BTreeMap<String, String>,
}

impl FetchRequest {
    pub fn new(
        source_id: impl Into<SourceId>,
        source_type: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            source_type: source_type.into(),
            path: path.into(),
            query: BTreeMap::new(),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
}

impl From<&SourceConfig> for FetchRequest {
    fn from(source: &SourceConfig) -> Self {
        Self {
            source_id: source.id.clone(),
            source_type: source.source_type.clone(),
            path: source.path.clone(),
            query: source.query.clone(),
        }
    }
}

/// Classified fetch failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error: HTTP {status}")]
    ServerError { status: u16 },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("client error: HTTP {status}: {message}")]
    Client { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    /// 429, 5xx and timeouts: signals that the resource is overloaded.
    pub fn is_rate_limit_like(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited { .. } | FetchError::ServerError { .. } | FetchError::Timeout(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.is_rate_limit_like()
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_rate_limit_like() {
            ErrorKind::Transient
        } else {
            ErrorKind::Terminal
        }
    }
}

/// Retrieves raw payload bytes for a request.
#[async_trait]
pub trait FetchClient: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<Bytes, FetchError>;

    fn client_name(&self) -> &str {
        "fetch"
    }
}

/// HTTP implementation over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpFetchClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpFetchClient {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| FetchError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url_for(&self, request: &FetchRequest) -> String {
        let path = request.path.trim_start_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(err.to_string())
    } else if err.is_decode() || err.is_body() {
        FetchError::Malformed(err.to_string())
    } else {
        FetchError::Transport(err.to_string())
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl FetchClient for HttpFetchClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<Bytes, FetchError> {
        let url = self.url_for(request);
        debug!(source_id = %request.source_id, url = %url, "fetching");

        let response = self
            .client
            .get(&url)
            .query(&request.query)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after(response.headers());
            warn!(source_id = %request.source_id, ?retry_after, "rate limited");
            return Err(FetchError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(FetchError::ServerError {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(FetchError::Client {
                status: status.as_u16(),
                message: body_text,
            });
        }

        let body = response.bytes().await.map_err(classify)?;
        if body.is_empty() {
            return Err(FetchError::Malformed(format!("empty body from {url}")));
        }
        Ok(body)
    }

    fn client_name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(FetchError::RateLimited { retry_after: None }.is_rate_limit_like());
        assert!(FetchError::ServerError { status: 503 }.is_rate_limit_like());
        assert!(FetchError::Timeout("slow".into()).is_rate_limit_like());
        assert!(!FetchError::Client { status: 404, message: String::new() }.is_rate_limit_like());
        assert!(!FetchError::Malformed("x".into()).is_retryable());
        assert_eq!(FetchError::Transport("refused".into()).kind(), ErrorKind::Terminal);
        assert_eq!(FetchError::Timeout("slow".into()).kind(), ErrorKind::Transient);
    }

    #[test]
    fn url_joins_base_and_path() {
        let config = FetchConfig {
            base_url: "https://example.test/api/".into(),
            ..FetchConfig::default()
        };
        let client = HttpFetchClient::new(&config).unwrap();
        let req = FetchRequest::new("teams", "teams", "/teams").with_query("limit", "500");
        assert_eq!(client.url_for(&req), "https://example.test/api/teams");
        assert_eq!(req.query.get("limit").map(String::as_str), Some("500"));
    }

    #[test]
    fn request_from_source_config() {
        let source = SourceConfig {
            id: "scoreboard/20240301".into(),
            source_type: "scoreboard".into(),
            path: "scoreboard".into(),
            query: BTreeMap::from([("dates".to_string(), "20240301".to_string())]),
        };
        let req = FetchRequest::from(&source);
        assert_eq!(req.source_id, "scoreboard/20240301");
        assert_eq!(req.query.len(), 1);
    }
}
