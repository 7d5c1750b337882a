//! Upload orchestration.
//!
//! [`UploadPipeline::process`] drives every selected manifest entry through
//! download → normalise → dispatch for one destination and returns the
//! `originalUrl → newUrl` rewrite table.
//!
//! ## Failure isolation
//!
//! Per-asset failures never escape as `Err`: the entry ends `failed` with
//! its [`AssetError`] recorded, the outcome list carries `success: false`,
//! and the mapping simply lacks that URL so downstream link rewriting
//! leaves it untouched. Only strategy/config problems are fatal.
//!
//! ## Concurrency
//!
//! Entries are processed through `futures::stream::buffer_unordered`, at
//! most `concurrency` at a time. Each future owns a `&mut` to exactly one
//! entry, so workers never contend on manifest data; the only shared
//! counter is an atomic.
//!
//! ## Incremental retries
//!
//! Each entry is attempted once per call. With `skip_uploaded` (default)
//! calling `process` again on the same manifest only retries what failed,
//! while previously uploaded entries still appear in the mapping through
//! their remembered remote URL.

use crate::ast::Root;
use crate::config::UploadOptions;
use crate::error::{AssetError, DocpressError};
use crate::manifest::{normalize_url, AssetManifest, AssetStatus, ImageEntry};
use crate::pipeline::codec::{self, Codec};
use crate::pipeline::dispatch::{self, CsrfTokenSource, NoCsrfTokens};
use crate::pipeline::download;
use crate::pipeline::normalize;
use crate::pipeline::transport::{HttpTransport, RetryPolicy, Transport};
use crate::strategy::{Strategy, UploadMode};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result record for one attempted asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetOutcome {
    pub asset_id: String,
    pub original_url: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AssetError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStats {
    /// Image entries in the manifest.
    pub total: usize,
    pub uploaded: usize,
    pub failed: usize,
    /// Entries already uploaded to this destination.
    pub skipped: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    /// `originalUrl → newUrl` for every entry available at the destination.
    pub mapping: BTreeMap<String, String>,
    /// One record per entry attempted in this run.
    pub outcomes: Vec<AssetOutcome>,
    pub stats: UploadStats,
}

impl UploadReport {
    pub fn failures(&self) -> impl Iterator<Item = &AssetOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }

    /// Point image nodes at their uploaded URLs. Returns how many changed.
    pub fn rewrite(&self, root: &mut Root) -> usize {
        let mut changed = 0;
        root.for_each_image_mut(&mut |image| {
            if let Some(new_url) = self.mapping.get(&normalize_url(&image.src)) {
                if *new_url != image.src {
                    image.src = new_url.clone();
                    changed += 1;
                }
            }
        });
        changed
    }
}

/// Download → normalise → upload driver, generic over its collaborators.
pub struct UploadPipeline {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    csrf: Arc<dyn CsrfTokenSource>,
}

impl UploadPipeline {
    /// Pipeline over `reqwest` with the best available codec.
    pub fn new() -> Result<Self, DocpressError> {
        Ok(Self::with_transport(Arc::new(HttpTransport::new()?)))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            codec: codec::probe(),
            csrf: Arc::new(NoCsrfTokens),
        }
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn csrf(mut self, csrf: Arc<dyn CsrfTokenSource>) -> Self {
        self.csrf = csrf;
        self
    }

    /// Upload every pending image entry of `manifest` to `destination`.
    ///
    /// # Errors
    /// Only when `strategy` is unusable (missing mode-specific fields).
    pub async fn process(
        &self,
        manifest: &mut AssetManifest,
        strategy: &Strategy,
        destination: &str,
        options: &UploadOptions,
    ) -> Result<UploadReport, DocpressError> {
        strategy.validate(destination)?;
        let start = Instant::now();

        let mut mapping = BTreeMap::new();
        let mut skipped = 0;
        if options.skip_uploaded {
            for entry in manifest.images.iter().filter(|e| e.is_uploaded_to(destination)) {
                skipped += 1;
                if let Some(url) = entry.remote_urls.get(destination) {
                    mapping.insert(entry.original_url.clone(), url.clone());
                }
            }
        }

        let total = manifest.images.len();
        let selected = total - skipped;
        info!(
            "Uploading {} assets to '{}' ({}, {} skipped, concurrency {})",
            selected,
            destination,
            strategy.mode.as_str(),
            skipped,
            options.concurrency
        );
        if let Some(ref cb) = options.progress_callback {
            cb.on_run_start(selected);
        }

        let policy = RetryPolicy {
            max_retries: options.max_retries,
            backoff_ms: options.retry_backoff_ms,
            cancel: options.cancel.clone(),
        };
        let completed = AtomicUsize::new(0);
        let (policy, completed) = (&policy, &completed);

        let outcomes: Vec<AssetOutcome> = stream::iter(
            manifest
                .images
                .iter_mut()
                .filter(|e| !(options.skip_uploaded && e.is_uploaded_to(destination))),
        )
        .map(|entry| async move {
            let outcome = self
                .process_entry(entry, strategy, destination, options, policy)
                .await;
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("[{}/{}] {} done", done, selected, outcome.asset_id);
            outcome
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

        let uploaded = outcomes.iter().filter(|o| o.success).count();
        for outcome in &outcomes {
            if let Some(ref new_url) = outcome.new_url {
                mapping.insert(outcome.original_url.clone(), new_url.clone());
            }
        }

        let stats = UploadStats {
            total,
            uploaded,
            failed: outcomes.len() - uploaded,
            skipped,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Upload to '{}' complete: {}/{} assets, {} failed, {}ms",
            destination, uploaded, selected, stats.failed, stats.duration_ms
        );
        if let Some(ref cb) = options.progress_callback {
            cb.on_run_complete(selected, uploaded);
        }

        Ok(UploadReport {
            mapping,
            outcomes,
            stats,
        })
    }

    async fn process_entry(
        &self,
        entry: &mut ImageEntry,
        strategy: &Strategy,
        destination: &str,
        options: &UploadOptions,
        policy: &RetryPolicy,
    ) -> AssetOutcome {
        if let Some(ref cb) = options.progress_callback {
            cb.on_asset_start(&entry.id, &entry.original_url);
        }

        let cancelled = options.cancel.as_ref().is_some_and(|t| t.is_cancelled());
        let result = if cancelled {
            Err(AssetError::Cancelled)
        } else {
            self.upload_entry(entry, strategy, options, policy).await
        };

        match result {
            Ok(new_url) => {
                debug!("{} -> {}", entry.id, new_url);
                entry.status = AssetStatus::Uploaded;
                entry.error = None;
                entry.uploaded_to.insert(destination.to_string());
                entry
                    .remote_urls
                    .insert(destination.to_string(), new_url.clone());
                if let Some(ref cb) = options.progress_callback {
                    cb.on_asset_complete(&entry.id, &new_url);
                }
                AssetOutcome {
                    asset_id: entry.id.clone(),
                    original_url: entry.original_url.clone(),
                    success: true,
                    new_url: Some(new_url),
                    error: None,
                }
            }
            Err(e) => {
                warn!("{} ({}) failed: {}", entry.id, entry.original_url, e);
                entry.status = AssetStatus::Failed;
                entry.error = Some(e.clone());
                if let Some(ref cb) = options.progress_callback {
                    cb.on_asset_error(&entry.id, &e.to_string());
                }
                AssetOutcome {
                    asset_id: entry.id.clone(),
                    original_url: entry.original_url.clone(),
                    success: false,
                    new_url: None,
                    error: Some(e),
                }
            }
        }
    }

    /// The per-mode steps for one entry; returns the new URL.
    async fn upload_entry(
        &self,
        entry: &mut ImageEntry,
        strategy: &Strategy,
        options: &UploadOptions,
        policy: &RetryPolicy,
    ) -> Result<String, AssetError> {
        let timeout = options.timeout();
        match strategy.mode {
            UploadMode::ExternalUrlOnly => Ok(entry.original_url.clone()),
            UploadMode::DomPasteUpload | UploadMode::Proxy => Err(dispatch::unsupported(strategy.mode)),
            UploadMode::UrlFetch => {
                if entry.is_local() {
                    return Err(dispatch::unsupported(UploadMode::UrlFetch));
                }
                entry.status = AssetStatus::Ready;
                dispatch::url_fetch(
                    &entry.original_url,
                    strategy,
                    self.transport.as_ref(),
                    timeout,
                    policy,
                )
                .await
            }
            UploadMode::BinaryUpload => {
                entry.status = AssetStatus::Downloading;
                let downloaded = download::download(
                    entry,
                    self.transport.as_ref(),
                    self.codec.as_ref(),
                    timeout,
                    policy,
                )
                .await?;

                let normalized = normalize::normalize(
                    downloaded,
                    &strategy.constraints,
                    Arc::clone(&self.codec),
                    options.cancel.as_ref(),
                )
                .await?;
                entry.status = AssetStatus::Ready;
                entry.mime_type = Some(normalized.mime_type.clone());
                entry.size = Some(normalized.bytes.len() as u64);
                if normalized.width.is_some() {
                    entry.width = normalized.width;
                    entry.height = normalized.height;
                }

                dispatch::binary_upload(
                    &normalized,
                    &entry.original_url,
                    strategy,
                    self.transport.as_ref(),
                    self.csrf.as_ref(),
                    timeout,
                    policy,
                )
                .await
            }
        }
    }
}

/// Upload `manifest` with a default [`UploadPipeline`].
///
/// ```rust,no_run
/// use docpress::{convert_html, process, ConvertOptions, Strategy, UploadOptions};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let out = convert_html(r#"<p><img src="https://x/a.png"></p>"#, &ConvertOptions::default());
///     let mut manifest = out.manifest;
///     let strategy = Strategy::binary_upload("https://cms.example.com/upload");
///     let report = process(&mut manifest, &strategy, "cms", &UploadOptions::default()).await?;
///     for (from, to) in &report.mapping {
///         println!("{from} -> {to}");
///     }
///     Ok(())
/// }
/// ```
pub async fn process(
    manifest: &mut AssetManifest,
    strategy: &Strategy,
    destination: &str,
    options: &UploadOptions,
) -> Result<UploadReport, DocpressError> {
    UploadPipeline::new()?
        .process(manifest, strategy, destination, options)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Block, Image};
    use crate::pipeline::transport::{OutgoingRequest, TransportError, TransportResponse};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn send(
            &self,
            request: OutgoingRequest,
            _timeout: Duration,
        ) -> Result<TransportResponse, TransportError> {
            panic!("unexpected request to {}", request.url)
        }
    }

    fn manifest(urls: &[&str]) -> AssetManifest {
        AssetManifest {
            images: urls
                .iter()
                .enumerate()
                .map(|(i, u)| ImageEntry {
                    id: format!("img_{}", i + 1),
                    original_url: u.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn invalid_strategy_is_fatal() {
        let p = UploadPipeline::with_transport(Arc::new(Unreachable));
        let mut m = manifest(&["https://x/a.png"]);
        let err = p
            .process(
                &mut m,
                &Strategy::new(UploadMode::BinaryUpload),
                "blog",
                &UploadOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DocpressError::MissingStrategyField { .. }));
        assert_eq!(m.images[0].status, AssetStatus::Pending);
    }

    #[tokio::test]
    async fn proxy_mode_fails_per_asset() {
        let p = UploadPipeline::with_transport(Arc::new(Unreachable));
        let mut m = manifest(&["https://x/a.png", "https://x/b.png"]);
        let report = p
            .process(
                &mut m,
                &Strategy::new(UploadMode::Proxy),
                "p",
                &UploadOptions::default(),
            )
            .await
            .unwrap();
        assert!(report.mapping.is_empty());
        assert_eq!(report.stats.failed, 2);
        assert!(m.images.iter().all(|e| e.status == AssetStatus::Failed));
    }

    #[tokio::test]
    async fn cancelled_run_touches_no_network() {
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let options = UploadOptions::builder().cancel(token).build().unwrap();
        let p = UploadPipeline::with_transport(Arc::new(Unreachable));
        let mut m = manifest(&["https://x/a.png"]);
        let report = p
            .process(
                &mut m,
                &Strategy::binary_upload("https://cms/up"),
                "cms",
                &options,
            )
            .await
            .unwrap();
        assert_eq!(report.outcomes[0].error, Some(AssetError::Cancelled));
    }

    #[test]
    fn rewrite_points_images_at_new_urls() {
        let mut root = Root::new(vec![Block::ImageBlock(Image {
            src: "https://x/a.png".into(),
            ..Default::default()
        })]);
        let mut report = UploadReport::default();
        report
            .mapping
            .insert("https://x/a.png".into(), "https://cdn/a.jpg".into());
        assert_eq!(report.rewrite(&mut root), 1);
        match &root.children[0] {
            Block::ImageBlock(i) => assert_eq!(i.src, "https://cdn/a.jpg"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
