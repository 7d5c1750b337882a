//! Network seam for the upload pipeline.
//!
//! Every byte the pipeline sends or receives goes through [`Transport`].
//! The production implementation is [`HttpTransport`] (reqwest); hosts with
//! their own session handling, and the test-suite, inject their own.
//!
//! ## Retry Strategy
//!
//! [`send_with_retry`] retries a single request on timeouts, connection
//! failures and 5xx answers with exponential backoff
//! (`retry_backoff_ms * 2^attempt`, capped at [`MAX_BACKOFF_MS`]). 4xx answers are never retried: the
//! destination has made up its mind.

use crate::error::DocpressError;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on a single retry delay.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Delay before retry number `attempt` (1-based).
pub fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    2u64.checked_pow(attempt.saturating_sub(1))
        .map_or(u64::MAX, |factor| base_ms.saturating_mul(factor))
        .min(MAX_BACKOFF_MS)
}

/// Request body variants the pipeline produces.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Multipart {
        file_field: String,
        file_name: String,
        mime_type: String,
        bytes: Vec<u8>,
        fields: Vec<(String, String)>,
    },
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRequest {
    /// Upper-case HTTP method.
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl OutgoingRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn new(method: &str, url: impl Into<String>, body: RequestBody) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
            headers: Vec::new(),
            body,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    /// `Content-Type` without parameters.
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First bytes of the body as text, for error messages.
    pub fn body_snippet(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        let snippet: String = text.chars().take(200).collect();
        snippet.trim().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Network(String),
    #[error("cancelled")]
    Cancelled,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: OutgoingRequest,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;
}

/// Retry and cancellation policy for one logical request.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub cancel: Option<CancellationToken>,
}

/// Send `request`, retrying transient failures.
///
/// A 5xx answer that survives every retry is returned as a response, not
/// an error, so callers can report the status.
pub async fn send_with_retry(
    transport: &dyn Transport,
    request: &OutgoingRequest,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<TransportResponse, TransportError> {
    let mut last: Result<TransportResponse, TransportError> =
        Err(TransportError::Network("no attempt made".to_string()));

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let backoff = backoff_delay_ms(policy.backoff_ms, attempt);
            warn!(
                "{} {}: retry {}/{} after {}ms",
                request.method, request.url, attempt, policy.max_retries, backoff
            );
            cancellable(policy.cancel.as_ref(), async {
                sleep(Duration::from_millis(backoff)).await;
                Ok(())
            })
            .await?;
        }

        let result = cancellable(
            policy.cancel.as_ref(),
            transport.send(request.clone(), timeout),
        )
        .await;

        match result {
            Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
            Ok(response) if response.status < 500 => return Ok(response),
            Ok(response) => {
                debug!("{} {}: HTTP {}", request.method, request.url, response.status);
                last = Ok(response);
            }
            Err(e) => {
                debug!("{} {}: {}", request.method, request.url, e);
                last = Err(e);
            }
        }
    }
    last
}

/// Race `fut` against the cancellation token.
pub async fn cancellable<T>(
    cancel: Option<&CancellationToken>,
    fut: impl std::future::Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransportError::Cancelled),
            out = fut => out,
        },
        None => fut.await,
    }
}

// ── reqwest implementation ───────────────────────────────────────────────

/// [`Transport`] over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, DocpressError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("docpress/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DocpressError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: OutgoingRequest,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::Network(format!("invalid method: {e}")))?;
        let mut builder = self.client.request(method, &request.url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Multipart {
                file_field,
                file_name,
                mime_type,
                bytes,
                fields,
            } => {
                let part = reqwest::multipart::Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str(&mime_type)
                    .map_err(|e| TransportError::Network(format!("invalid MIME type: {e}")))?;
                let form = fields
                    .into_iter()
                    .fold(reqwest::multipart::Form::new(), |form, (k, v)| form.text(k, v))
                    .part(file_field, part);
                builder.multipart(form)
            }
            RequestBody::Form(fields) => builder.form(&fields),
            RequestBody::Json(value) => builder.json(&value),
        };

        let response = builder.send().await.map_err(|e| map_reqwest_error(e, timeout))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase());
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?
            .to_vec();
        Ok(TransportResponse {
            status,
            content_type,
            body,
        })
    }
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Network(e.to_string())
    }
}
