//! Destination strategies: how a publishing target accepts an asset.
//!
//! A strategy is plain data. Adding a destination means adding an entry to
//! the strategy table, never touching pipeline code. The table is a JSON
//! object keyed by destination id:
//!
//! ```json
//! {
//!   "blog": {
//!     "mode": "binaryUpload",
//!     "uploadUrl": "https://blog.example.com/api/upload",
//!     "fileField": "image",
//!     "csrf": { "source": { "kind": "cookie", "name": "csrftoken" }, "header": "X-CSRFToken" },
//!     "responseUrlPath": "data.url",
//!     "constraints": { "acceptedMimeTypes": ["image/jpeg", "image/png"], "maxSizeMB": 5 }
//!   },
//!   "mirror": { "mode": "externalUrlOnly" }
//! }
//! ```
//!
//! Mode-specific fields are optional at parse time and checked by
//! [`Strategy::validate`], so a table with a missing upload URL loads fine
//! and fails as [`DocpressError::MissingStrategyField`] when used.

use crate::error::DocpressError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// How assets reach the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadMode {
    /// Multipart upload of the asset bytes.
    BinaryUpload,
    /// Send the asset URL; the destination fetches it server-side.
    UrlFetch,
    /// Paste simulation inside a page context. Recognised, not executed here.
    DomPasteUpload,
    /// Keep the original URL. No I/O.
    ExternalUrlOnly,
    /// Reserved.
    Proxy,
}

impl UploadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadMode::BinaryUpload => "binaryUpload",
            UploadMode::UrlFetch => "urlFetch",
            UploadMode::DomPasteUpload => "domPasteUpload",
            UploadMode::ExternalUrlOnly => "externalUrlOnly",
            UploadMode::Proxy => "proxy",
        }
    }
}

/// What a destination accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    /// Empty means any type is accepted.
    #[serde(default)]
    pub accepted_mime_types: Vec<String>,
    #[serde(default, rename = "maxSizeMB")]
    pub max_size_mb: Option<f64>,
    #[serde(default)]
    pub max_width: Option<u32>,
    #[serde(default)]
    pub max_height: Option<u32>,
}

impl Constraints {
    /// Whether `mime` is acceptable. `image/jpg` counts as `image/jpeg` and
    /// `image/*` accepts every image type.
    pub fn accepts(&self, mime: &str) -> bool {
        if self.accepted_mime_types.is_empty() {
            return true;
        }
        let mime = canonical_mime(mime);
        self.accepted_mime_types.iter().any(|accepted| {
            let accepted = canonical_mime(accepted);
            accepted == mime
                || accepted
                    .strip_suffix("/*")
                    .is_some_and(|family| mime.split('/').next() == Some(family))
        })
    }

    /// Size ceiling in bytes.
    pub fn max_bytes(&self) -> Option<u64> {
        self.max_size_mb
            .filter(|mb| *mb > 0.0)
            .map(|mb| (mb * 1024.0 * 1024.0) as u64)
    }

    pub fn exceeds_dimensions(&self, width: u32, height: u32) -> bool {
        self.max_width.is_some_and(|w| width > w) || self.max_height.is_some_and(|h| height > h)
    }
}

/// Lower-cased MIME type without parameters, with common aliases folded.
pub fn canonical_mime(mime: &str) -> String {
    let base = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match base.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "image/x-png" => "image/png".to_string(),
        _ => base,
    }
}

/// Where a CSRF token is read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CsrfSource {
    Cookie { name: String },
    Meta { name: String },
    LocalStore { key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrfConfig {
    pub source: CsrfSource,
    /// Request header the token is sent in.
    pub header: String,
}

/// Body encoding for `urlFetch` requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BodyFormat {
    #[default]
    Json,
    Form,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    pub mode: UploadMode,
    #[serde(default)]
    pub constraints: Constraints,

    // ── binaryUpload ─────────────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    /// HTTP method for the upload. Default: POST.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Multipart field carrying the file. Default: `file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csrf: Option<CsrfConfig>,

    // ── urlFetch ─────────────────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_url: Option<String>,
    /// Body field carrying the asset URL. Default: `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_field: Option<String>,
    #[serde(default)]
    pub body_format: BodyFormat,

    // ── shared ───────────────────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Dotted path (`data.url`) or JSON pointer (`/data/url`) to the new URL
    /// in the response. Unset: a list of common field names is tried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_url_path: Option<String>,
}

impl Strategy {
    pub fn new(mode: UploadMode) -> Self {
        Self {
            mode,
            constraints: Constraints::default(),
            upload_url: None,
            method: None,
            file_field: None,
            csrf: None,
            fetch_url: None,
            url_field: None,
            body_format: BodyFormat::default(),
            extra_fields: BTreeMap::new(),
            headers: BTreeMap::new(),
            response_url_path: None,
        }
    }

    pub fn binary_upload(upload_url: impl Into<String>) -> Self {
        Self {
            upload_url: Some(upload_url.into()),
            ..Self::new(UploadMode::BinaryUpload)
        }
    }

    pub fn url_fetch(fetch_url: impl Into<String>) -> Self {
        Self {
            fetch_url: Some(fetch_url.into()),
            ..Self::new(UploadMode::UrlFetch)
        }
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or("POST")
    }

    pub fn file_field(&self) -> &str {
        self.file_field.as_deref().unwrap_or("file")
    }

    pub fn url_field(&self) -> &str {
        self.url_field.as_deref().unwrap_or("url")
    }

    /// Check that every field the mode needs is present.
    pub fn validate(&self, destination: &str) -> Result<(), DocpressError> {
        let missing = |field: &str| DocpressError::MissingStrategyField {
            destination: destination.to_string(),
            field: field.to_string(),
        };
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        match self.mode {
            UploadMode::BinaryUpload => {
                if blank(&self.upload_url) {
                    return Err(missing("uploadUrl"));
                }
                if let Some(csrf) = &self.csrf {
                    if csrf.header.trim().is_empty() {
                        return Err(missing("csrf.header"));
                    }
                }
                reqwest::Method::from_bytes(self.method().as_bytes()).map_err(|_| {
                    DocpressError::InvalidConfig(format!(
                        "destination '{destination}': invalid HTTP method '{}'",
                        self.method()
                    ))
                })?;
            }
            UploadMode::UrlFetch => {
                if blank(&self.fetch_url) {
                    return Err(missing("fetchUrl"));
                }
            }
            UploadMode::DomPasteUpload | UploadMode::ExternalUrlOnly | UploadMode::Proxy => {}
        }
        if self.constraints.max_size_mb.is_some_and(|mb| !mb.is_finite() || mb <= 0.0) {
            return Err(DocpressError::InvalidConfig(format!(
                "destination '{destination}': maxSizeMB must be a positive number"
            )));
        }
        Ok(())
    }
}

/// Destination-keyed strategy table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyTable {
    destinations: BTreeMap<String, Strategy>,
}

impl StrategyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, DocpressError> {
        serde_json::from_str(json).map_err(DocpressError::StrategyParse)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DocpressError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| DocpressError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn insert(&mut self, destination: impl Into<String>, strategy: Strategy) {
        self.destinations.insert(destination.into(), strategy);
    }

    pub fn get(&self, destination: &str) -> Result<&Strategy, DocpressError> {
        self.destinations
            .get(destination)
            .ok_or_else(|| DocpressError::UnknownDestination(destination.to_string()))
    }

    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.destinations.keys().map(String::as_str)
    }

    /// Validate every entry, reporting the first problem.
    pub fn validate(&self) -> Result<(), DocpressError> {
        self.destinations
            .iter()
            .try_for_each(|(id, strategy)| strategy.validate(id))
    }
}
