//! Configuration types for conversion and upload runs.
//!
//! Both stages are configured through plain structs built via builders,
//! mirroring each other: [`ConvertOptions`] for the conversion engine and
//! [`UploadOptions`] for the upload pipeline. Defaults are chosen so that
//! `Default::default()` is a sensible production setting.

use crate::convert::ElementHandler;
use crate::error::DocpressError;
use crate::progress::ProgressCallback;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound for [`UploadOptions::max_retries`].
pub const MAX_RETRIES: u32 = 10;

// ── Conversion ───────────────────────────────────────────────────────────

/// Options for [`crate::convert::convert`].
#[derive(Clone, Default)]
pub struct ConvertOptions {
    /// Base URL for resolving relative links and image sources.
    pub base_url: Option<String>,

    /// Keep unrecognised elements as opaque `htmlBlock`/`htmlInline` nodes
    /// instead of passing their children through. Default: false.
    pub preserve_unknown_html: bool,

    /// Caller-supplied handlers keyed by lower-cased tag name. Consulted
    /// before any built-in heuristic or handler.
    pub custom_handlers: HashMap<String, Arc<dyn ElementHandler>>,
}

impl fmt::Debug for ConvertOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&String> = self.custom_handlers.keys().collect();
        tags.sort();
        f.debug_struct("ConvertOptions")
            .field("base_url", &self.base_url)
            .field("preserve_unknown_html", &self.preserve_unknown_html)
            .field("custom_handlers", &tags)
            .finish()
    }
}

impl ConvertOptions {
    pub fn builder() -> ConvertOptionsBuilder {
        ConvertOptionsBuilder {
            options: Self::default(),
        }
    }
}

/// Builder for [`ConvertOptions`].
#[derive(Debug)]
pub struct ConvertOptionsBuilder {
    options: ConvertOptions,
}

impl ConvertOptionsBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.options.base_url = Some(url.into());
        self
    }

    pub fn preserve_unknown_html(mut self, v: bool) -> Self {
        self.options.preserve_unknown_html = v;
        self
    }

    pub fn handler(mut self, tag: impl Into<String>, handler: Arc<dyn ElementHandler>) -> Self {
        self.options
            .custom_handlers
            .insert(tag.into().to_ascii_lowercase(), handler);
        self
    }

    /// Build the options, rejecting a base URL that is not absolute.
    pub fn build(self) -> Result<ConvertOptions, DocpressError> {
        if let Some(ref base) = self.options.base_url {
            reqwest::Url::parse(base).map_err(|e| {
                DocpressError::InvalidConfig(format!("base URL '{base}' is not absolute: {e}"))
            })?;
        }
        Ok(self.options)
    }
}

// ── Upload ───────────────────────────────────────────────────────────────

/// Options for an upload run.
#[derive(Clone)]
pub struct UploadOptions {
    /// Number of assets processed at once. Default: 3.
    ///
    /// Destinations are usually rate-limited consumer sites, not bulk APIs.
    /// Three in flight keeps a long article moving without tripping abuse
    /// detection.
    pub concurrency: usize,

    /// Per-request timeout in seconds for downloads and uploads. Default: 30.
    pub timeout_secs: u64,

    /// Retries of a single HTTP request on timeouts and 5xx. Default: 0,
    /// at most [`MAX_RETRIES`].
    ///
    /// This never re-runs a whole asset: a failed asset stays failed for the
    /// run and is retried by calling `process` again with `skip_uploaded`.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled after each attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Skip entries already uploaded to the destination. Default: true.
    pub skip_uploaded: bool,

    /// Cooperative cancellation, checked at every suspension point.
    pub cancel: Option<CancellationToken>,

    /// Optional per-asset progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            timeout_secs: 30,
            max_retries: 0,
            retry_backoff_ms: 500,
            skip_uploaded: true,
            cancel: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("concurrency", &self.concurrency)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("skip_uploaded", &self.skip_uploaded)
            .field("cancel", &self.cancel.is_some())
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn UploadProgressCallback>"),
            )
            .finish()
    }
}

impl UploadOptions {
    pub fn builder() -> UploadOptionsBuilder {
        UploadOptionsBuilder {
            options: Self::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Builder for [`UploadOptions`].
#[derive(Debug)]
pub struct UploadOptionsBuilder {
    options: UploadOptions,
}

impl UploadOptionsBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.options.concurrency = n.max(1);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.options.timeout_secs = secs;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.options.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.options.retry_backoff_ms = ms;
        self
    }

    pub fn skip_uploaded(mut self, v: bool) -> Self {
        self.options.skip_uploaded = v;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.options.cancel = Some(token);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.options.progress_callback = Some(cb);
        self
    }

    /// Build the options, validating constraints.
    pub fn build(self) -> Result<UploadOptions, DocpressError> {
        let o = &self.options;
        if o.concurrency == 0 {
            return Err(DocpressError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if o.timeout_secs == 0 {
            return Err(DocpressError::InvalidConfig(
                "Timeout must be ≥ 1 second".into(),
            ));
        }
        if o.max_retries > MAX_RETRIES {
            return Err(DocpressError::InvalidConfig(format!(
                "max_retries must be ≤ {MAX_RETRIES}, got {}",
                o.max_retries
            )));
        }
        Ok(self.options)
    }
}
