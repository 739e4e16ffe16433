use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::ImageJob;
use crate::models::stage::Stage;

const MAX_ERROR_BODY_CHARS: usize = 512;

/// External analysis collaborator: one request per `(image, stage)`, returning
/// the stage's raw structured response.
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    async fn analyze(&self, stage: Stage, job: &ImageJob)
        -> Result<serde_json::Value, AnalysisError>;
}

/// HTTP client for the per-stage inference endpoints served at `{base_url}/{stage}`.
pub struct HttpAnalysisClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
    timeout: Duration,
}

#[derive(Serialize)]
struct AnalysisRequest<'a> {
    stage: Stage,
    post_id: &'a str,
    image_id: &'a str,
    image_url: &'a str,
    correlation_id: Uuid,
}

impl HttpAnalysisClient {
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AnalysisError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("post-enrichment/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            timeout,
        })
    }

    pub fn endpoint(&self, stage: Stage) -> String {
        format!("{}/{}", self.base_url, stage)
    }
}

#[async_trait]
impl AnalysisClient for HttpAnalysisClient {
    async fn analyze(
        &self,
        stage: Stage,
        job: &ImageJob,
    ) -> Result<serde_json::Value, AnalysisError> {
        let body = AnalysisRequest {
            stage,
            post_id: &job.post_id,
            image_id: &job.image_id,
            image_url: &job.image_url,
            correlation_id: job.correlation_id,
        };

        let mut request = self.http.post(self.endpoint(stage)).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| AnalysisError::from_send(e, self.timeout))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AnalysisError::from_status(status, &text));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AnalysisError::Malformed(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Analysis call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection to analysis endpoint failed: {0}")]
    Connect(String),

    #[error("Analysis endpoint returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Analysis endpoint rejected the request with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Analysis response could not be used: {0}")]
    Malformed(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl AnalysisError {
    /// Timeouts, connection failures, 5xx and throttling are worth retrying;
    /// rejected input and unusable responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AnalysisError::Timeout(_)
            | AnalysisError::Connect(_)
            | AnalysisError::Server { .. }
            | AnalysisError::Http(_) => true,
            AnalysisError::Rejected { .. } | AnalysisError::Malformed(_) => false,
        }
    }

    /// Metric label for the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::Timeout(_) => "timeout",
            AnalysisError::Connect(_) => "connect",
            AnalysisError::Server { .. } => "server",
            AnalysisError::Rejected { .. } => "rejected",
            AnalysisError::Malformed(_) => "malformed",
            AnalysisError::Http(_) => "http",
        }
    }

    fn from_send(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            AnalysisError::Timeout(timeout)
        } else if e.is_connect() {
            AnalysisError::Connect(e.to_string())
        } else {
            AnalysisError::Http(e)
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        let code = status.as_u16();
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            AnalysisError::Server { status: code, body }
        } else {
            AnalysisError::Rejected { status: code, body }
        }
    }
}
