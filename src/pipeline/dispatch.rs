//! Strategy dispatch: hand a normalised asset to the destination.
//!
//! One function per executable mode. `domPasteUpload` and `proxy` need an
//! execution context this pipeline does not have and fail per asset with
//! [`AssetError::UnsupportedMode`]. `externalUrlOnly` never reaches this
//! module: the orchestrator resolves it without any I/O.

use crate::error::AssetError;
use crate::manifest::LOCAL_SCHEME;
use crate::pipeline::codec::extension_for;
use crate::pipeline::normalize::Normalized;
use crate::pipeline::transport::{
    send_with_retry, OutgoingRequest, RequestBody, RetryPolicy, Transport, TransportError,
    TransportResponse,
};
use crate::strategy::{BodyFormat, CsrfSource, Strategy, UploadMode};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

// ── CSRF tokens ──────────────────────────────────────────────────────────

/// Reads CSRF tokens from wherever the host keeps them.
///
/// The pipeline runs outside any page, so cookies, meta tags and local
/// storage belong to the caller; this trait is how it asks for them.
pub trait CsrfTokenSource: Send + Sync {
    fn token(&self, source: &CsrfSource) -> Option<String>;
}

/// Token source backed by fixed maps.
#[derive(Debug, Clone, Default)]
pub struct StaticCsrfTokens {
    pub cookies: HashMap<String, String>,
    pub meta: HashMap<String, String>,
    pub local_store: HashMap<String, String>,
}

impl StaticCsrfTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn meta(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(name.into(), value.into());
        self
    }

    pub fn local_store(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.local_store.insert(key.into(), value.into());
        self
    }
}

impl CsrfTokenSource for StaticCsrfTokens {
    fn token(&self, source: &CsrfSource) -> Option<String> {
        match source {
            CsrfSource::Cookie { name } => self.cookies.get(name),
            CsrfSource::Meta { name } => self.meta.get(name),
            CsrfSource::LocalStore { key } => self.local_store.get(key),
        }
        .cloned()
    }
}

/// Source that knows no tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCsrfTokens;

impl CsrfTokenSource for NoCsrfTokens {
    fn token(&self, _source: &CsrfSource) -> Option<String> {
        None
    }
}

// ── Modes ────────────────────────────────────────────────────────────────

/// Multipart upload of the normalised bytes.
pub async fn binary_upload(
    asset: &Normalized,
    original_url: &str,
    strategy: &Strategy,
    transport: &dyn Transport,
    csrf: &dyn CsrfTokenSource,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<String, AssetError> {
    let upload_url = strategy.upload_url.as_deref().ok_or_else(|| AssetError::Upload {
        detail: "strategy has no uploadUrl".to_string(),
    })?;

    let body = RequestBody::Multipart {
        file_field: strategy.file_field().to_string(),
        file_name: asset_file_name(original_url, &asset.mime_type),
        mime_type: asset.mime_type.clone(),
        bytes: asset.bytes.clone(),
        fields: strategy
            .extra_fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    let mut request = with_headers(OutgoingRequest::new(strategy.method(), upload_url, body), strategy);

    if let Some(cfg) = &strategy.csrf {
        let token = csrf.token(&cfg.source).ok_or_else(|| AssetError::Upload {
            detail: format!("CSRF token not available from {:?}", cfg.source),
        })?;
        request = request.header(cfg.header.clone(), token);
    }

    let response = send(transport, &request, timeout, policy).await?;
    parse_response_url(&response, strategy.response_url_path.as_deref(), upload_url)
}

/// Ask the destination to fetch `source_url` itself.
pub async fn url_fetch(
    source_url: &str,
    strategy: &Strategy,
    transport: &dyn Transport,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<String, AssetError> {
    let fetch_url = strategy.fetch_url.as_deref().ok_or_else(|| AssetError::Upload {
        detail: "strategy has no fetchUrl".to_string(),
    })?;

    let mut fields: Vec<(String, String)> = strategy
        .extra_fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    fields.push((strategy.url_field().to_string(), source_url.to_string()));

    let body = match strategy.body_format {
        BodyFormat::Form => RequestBody::Form(fields),
        BodyFormat::Json => RequestBody::Json(Value::Object(
            fields.into_iter().map(|(k, v)| (k, Value::String(v))).collect(),
        )),
    };
    let method = strategy.method.as_deref().unwrap_or("POST");
    let request = with_headers(OutgoingRequest::new(method, fetch_url, body), strategy);

    let response = send(transport, &request, timeout, policy).await?;
    parse_response_url(&response, strategy.response_url_path.as_deref(), fetch_url)
}

/// Failure for modes that cannot run here.
pub fn unsupported(mode: UploadMode) -> AssetError {
    let reason = match mode {
        UploadMode::DomPasteUpload => "paste simulation requires a live page context",
        UploadMode::Proxy => "proxy uploads are not implemented",
        UploadMode::UrlFetch => "the destination cannot fetch an in-memory asset",
        _ => "mode cannot be executed by this pipeline",
    };
    AssetError::UnsupportedMode {
        mode: mode.as_str().to_string(),
        reason: reason.to_string(),
    }
}

fn with_headers(mut request: OutgoingRequest, strategy: &Strategy) -> OutgoingRequest {
    for (name, value) in &strategy.headers {
        request = request.header(name.clone(), value.clone());
    }
    request
}

async fn send(
    transport: &dyn Transport,
    request: &OutgoingRequest,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<TransportResponse, AssetError> {
    let response = send_with_retry(transport, request, timeout, policy)
        .await
        .map_err(|e| match e {
            TransportError::Cancelled => AssetError::Cancelled,
            other => AssetError::Upload {
                detail: format!("{} {}: {}", request.method, request.url, other),
            },
        })?;
    if !response.is_success() {
        return Err(AssetError::Upload {
            detail: format!("HTTP {}: {}", response.status, response.body_snippet()),
        });
    }
    debug!("{} {} -> HTTP {}", request.method, request.url, response.status);
    Ok(response)
}

// ── Response parsing ─────────────────────────────────────────────────────

/// Where uploaded URLs usually hide in JSON answers.
const URL_GUESSES: &[&str] = &[
    "/url",
    "/data/url",
    "/data/link",
    "/link",
    "/src",
    "/location",
    "/data/src",
    "/result/url",
    "/data",
];

static RE_URL: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"^(https?:)?//\S+$|^/\S+$").unwrap());

/// Extract the uploaded URL from a destination's answer.
///
/// `path` is a JSON pointer (`/data/url`) or dotted path (`data.url`). When
/// unset, common field names are tried, then a bare JSON string, then a
/// plain-text body that looks like a URL. Relative results are resolved
/// against `request_url`.
pub fn parse_response_url(
    response: &TransportResponse,
    path: Option<&str>,
    request_url: &str,
) -> Result<String, AssetError> {
    let text = String::from_utf8_lossy(&response.body);
    let text = text.trim();
    let unparsable = || AssetError::UnparsableResponse {
        body: response.body_snippet(),
    };

    let found = match serde_json::from_str::<Value>(text) {
        Ok(json) => match path {
            Some(p) => json
                .pointer(&to_pointer(p))
                .and_then(Value::as_str)
                .map(str::to_string),
            None => URL_GUESSES
                .iter()
                .filter_map(|p| json.pointer(p).and_then(Value::as_str))
                .chain(json.as_str())
                .find(|s| RE_URL.is_match(s.trim()))
                .map(str::to_string),
        },
        Err(_) if path.is_none() && RE_URL.is_match(text) => Some(text.to_string()),
        Err(_) => None,
    };

    let found = found.ok_or_else(unparsable)?;
    let found = found.trim();
    match reqwest::Url::parse(request_url).and_then(|base| base.join(found)) {
        Ok(url) => Ok(url.to_string()),
        Err(_) if RE_URL.is_match(found) => Ok(found.to_string()),
        Err(_) => Err(unparsable()),
    }
}

/// `data.url` → `/data/url`; pointers pass through.
pub fn to_pointer(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path.replace('.', "/"))
    }
}

/// File name for the multipart part: the URL's last path segment with an
/// extension matching the (possibly re-encoded) type.
pub fn asset_file_name(original_url: &str, mime_type: &str) -> String {
    let segment = match reqwest::Url::parse(original_url) {
        Ok(url) if !original_url.starts_with(LOCAL_SCHEME) => url
            .path_segments()
            .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
            .unwrap_or("")
            .to_string(),
        _ => original_url
            .strip_prefix(LOCAL_SCHEME)
            .unwrap_or(original_url)
            .to_string(),
    };
    let stem = segment.split('.').next().unwrap_or("").trim();
    let stem = if stem.is_empty() || stem.contains(':') {
        "image"
    } else {
        stem
    };
    format!("{}.{}", stem, extension_for(mime_type))
}
