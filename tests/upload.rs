//! Integration tests for the upload pipeline.
//!
//! A scripted in-memory [`Transport`] stands in for both the image hosts
//! and the destination, so every scenario runs offline and records exactly
//! which requests were made.

use async_trait::async_trait;
use docpress::pipeline::transport::{
    OutgoingRequest, RequestBody, Transport, TransportError, TransportResponse,
};
use docpress::{
    convert_html, AssetErrorKind, AssetManifest, AssetStatus, Constraints, ConvertOptions,
    NoopCodec, Strategy, StrategyTable, UploadMode, UploadOptions, UploadPipeline,
    UploadProgressCallback,
};
use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const UPLOAD_URL: &str = "https://dest.example.com/api/upload";
const FETCH_URL: &str = "https://dest.example.com/api/fetch";

// ── Scripted transport ───────────────────────────────────────────────────

/// Serves `image` for every GET not listed in `missing` (404 otherwise) and
/// answers uploads with `{"url": ".../files/<file name>"}`.
struct MockCdn {
    image: Vec<u8>,
    missing: Mutex<HashSet<String>>,
    requests: Mutex<Vec<OutgoingRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockCdn {
    fn new(image: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            image,
            missing: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn set_missing(&self, url: &str, missing: bool) {
        let mut set = self.missing.lock().unwrap();
        if missing {
            set.insert(url.to_string());
        } else {
            set.remove(url);
        }
    }

    fn requests(&self) -> Vec<OutgoingRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn uploads(&self) -> Vec<OutgoingRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method != "GET")
            .collect()
    }

    fn answer(&self, request: &OutgoingRequest) -> TransportResponse {
        let json = |value: serde_json::Value| TransportResponse {
            status: 200,
            content_type: Some("application/json".into()),
            body: value.to_string().into_bytes(),
        };
        match (&request.method[..], &request.body) {
            ("GET", _) if self.missing.lock().unwrap().contains(&request.url) => {
                TransportResponse {
                    status: 404,
                    content_type: Some("text/html".into()),
                    body: b"not found".to_vec(),
                }
            }
            ("GET", _) => TransportResponse {
                status: 200,
                content_type: Some("application/octet-stream".into()),
                body: self.image.clone(),
            },
            (_, RequestBody::Multipart { file_name, .. }) => json(serde_json::json!({
                "url": format!("https://dest.example.com/files/{file_name}")
            })),
            (_, RequestBody::Json(body)) => json(serde_json::json!({
                "data": { "link": format!("https://dest.example.com/mirror?src={}", body["url"].as_str().unwrap_or("")) }
            })),
            _ => TransportResponse {
                status: 400,
                content_type: None,
                body: Vec::new(),
            },
        }
    }
}

#[async_trait]
impl Transport for MockCdn {
    async fn send(
        &self,
        request: OutgoingRequest,
        _timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let response = self.answer(&request);
        self.requests.lock().unwrap().push(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(response)
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────

/// PNG signature followed by filler. Enough for sniffing, not decodable.
fn fake_png() -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend(std::iter::repeat(0u8).take(64));
    bytes
}

fn image_url(i: usize) -> String {
    format!("https://img.example.com/pics/a{i}.png")
}

fn manifest_with(n: usize) -> AssetManifest {
    let html: String = (1..=n)
        .map(|i| format!(r#"<p><img src="{}"></p>"#, image_url(i)))
        .collect();
    convert_html(&html, &ConvertOptions::default()).manifest
}

fn pipeline(cdn: &Arc<MockCdn>) -> UploadPipeline {
    UploadPipeline::with_transport(cdn.clone() as Arc<dyn Transport>).codec(Arc::new(NoopCodec))
}

fn options(concurrency: usize) -> UploadOptions {
    UploadOptions::builder()
        .concurrency(concurrency)
        .timeout_secs(5)
        .build()
        .unwrap()
}

// ── Modes ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn external_url_only_makes_no_requests() {
    let cdn = MockCdn::new(fake_png());
    let mut manifest = manifest_with(2);
    let report = pipeline(&cdn)
        .process(
            &mut manifest,
            &Strategy::new(UploadMode::ExternalUrlOnly),
            "mirror",
            &options(3),
        )
        .await
        .unwrap();

    assert!(cdn.requests().is_empty());
    assert_eq!(report.mapping.len(), 2);
    for (from, to) in &report.mapping {
        assert_eq!(from, to);
    }
    assert!(manifest.images.iter().all(|e| e.status == AssetStatus::Uploaded));
}

#[tokio::test]
async fn binary_upload_isolates_failures_and_bounds_concurrency() {
    let cdn = MockCdn::new(fake_png());
    cdn.set_missing(&image_url(4), true);
    let mut manifest = manifest_with(10);

    let report = pipeline(&cdn)
        .process(
            &mut manifest,
            &Strategy::binary_upload(UPLOAD_URL),
            "cms",
            &options(3),
        )
        .await
        .unwrap();

    assert_eq!(report.stats.total, 10);
    assert_eq!(report.stats.uploaded, 9);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.mapping.len(), 9);
    assert_eq!(
        report.mapping.get(&image_url(1)).map(String::as_str),
        Some("https://dest.example.com/files/a1.png")
    );
    assert!(!report.mapping.contains_key(&image_url(4)));

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].original_url, image_url(4));
    let error = failures[0].error.as_ref().unwrap();
    assert_eq!(error.kind(), AssetErrorKind::DownloadError);
    assert!(error.to_string().contains("HTTP 404"));

    let failed = manifest.image_by_url(&image_url(4)).unwrap();
    assert_eq!(failed.status, AssetStatus::Failed);
    assert!(failed.uploaded_to.is_empty());

    assert_eq!(cdn.uploads().len(), 9);
    assert!(cdn.max_in_flight.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn rerun_only_retries_what_failed() {
    let cdn = MockCdn::new(fake_png());
    cdn.set_missing(&image_url(2), true);
    let mut manifest = manifest_with(3);
    let strategy = Strategy::binary_upload(UPLOAD_URL);
    let uploader = pipeline(&cdn);

    let first = uploader
        .process(&mut manifest, &strategy, "cms", &options(2))
        .await
        .unwrap();
    assert_eq!(first.stats.failed, 1);

    cdn.set_missing(&image_url(2), false);
    let before = cdn.requests().len();
    let second = uploader
        .process(&mut manifest, &strategy, "cms", &options(2))
        .await
        .unwrap();

    assert_eq!(second.stats.skipped, 2);
    assert_eq!(second.stats.uploaded, 1);
    assert_eq!(second.outcomes.len(), 1);
    assert_eq!(second.outcomes[0].original_url, image_url(2));
    // Skipped entries still report where they live.
    assert_eq!(second.mapping.len(), 3);
    // One download and one upload for the retried entry.
    assert_eq!(cdn.requests().len() - before, 2);

    let everything = uploader
        .process(
            &mut manifest,
            &strategy,
            "cms",
            &UploadOptions::builder().skip_uploaded(false).build().unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(everything.stats.skipped, 0);
    assert_eq!(everything.outcomes.len(), 3);
}

#[tokio::test]
async fn url_fetch_sends_source_url() {
    let cdn = MockCdn::new(fake_png());
    let mut manifest = manifest_with(1);
    let mut strategy = Strategy::url_fetch(FETCH_URL);
    strategy.response_url_path = Some("data.link".into());
    strategy
        .headers
        .insert("Authorization".into(), "Bearer t".into());

    let report = pipeline(&cdn)
        .process(&mut manifest, &strategy, "wiki", &options(3))
        .await
        .unwrap();

    let requests = cdn.requests();
    assert_eq!(requests.len(), 1, "no download for urlFetch");
    assert_eq!(requests[0].url, FETCH_URL);
    assert!(requests[0]
        .headers
        .contains(&("Authorization".to_string(), "Bearer t".to_string())));
    match &requests[0].body {
        RequestBody::Json(body) => assert_eq!(body["url"], image_url(1)),
        other => panic!("unexpected body {other:?}"),
    }
    assert_eq!(
        report.mapping[&image_url(1)],
        format!("https://dest.example.com/mirror?src={}", image_url(1))
    );
}

#[tokio::test]
async fn paste_mode_fails_each_asset_without_io() {
    let cdn = MockCdn::new(fake_png());
    let mut manifest = manifest_with(2);
    let report = pipeline(&cdn)
        .process(
            &mut manifest,
            &Strategy::new(UploadMode::DomPasteUpload),
            "editor",
            &options(3),
        )
        .await
        .unwrap();

    assert!(cdn.requests().is_empty());
    assert!(report.mapping.is_empty());
    assert_eq!(report.stats.failed, 2);
    assert!(report
        .failures()
        .all(|o| o.error.as_ref().map(|e| e.kind()) == Some(AssetErrorKind::UnsupportedModeError)));
}

#[tokio::test]
async fn incomplete_strategy_is_fatal_and_touches_nothing() {
    let cdn = MockCdn::new(fake_png());
    let mut manifest = manifest_with(1);
    let untouched = manifest.clone();
    let err = pipeline(&cdn)
        .process(
            &mut manifest,
            &Strategy::new(UploadMode::BinaryUpload),
            "cms",
            &options(3),
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains("uploadUrl"));
    assert_eq!(manifest, untouched);
    assert!(cdn.requests().is_empty());
}

#[tokio::test]
async fn cancelled_run_stops_before_io() {
    let cdn = MockCdn::new(fake_png());
    let mut manifest = manifest_with(3);
    let token = CancellationToken::new();
    token.cancel();
    let report = pipeline(&cdn)
        .process(
            &mut manifest,
            &Strategy::binary_upload(UPLOAD_URL),
            "cms",
            &UploadOptions::builder().cancel(token).build().unwrap(),
        )
        .await
        .unwrap();

    assert!(cdn.requests().is_empty());
    assert_eq!(report.stats.failed, 3);
    assert!(report
        .failures()
        .all(|o| o.error.as_ref().map(|e| e.kind()) == Some(AssetErrorKind::Cancelled)));
}

// ── Progress + rewrite ───────────────────────────────────────────────────

#[derive(Default)]
struct Events {
    started: AtomicUsize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    finished: Mutex<Option<(usize, usize)>>,
}

impl UploadProgressCallback for Events {
    fn on_asset_start(&self, _asset_id: &str, _original_url: &str) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_asset_complete(&self, _asset_id: &str, _new_url: &str) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_asset_error(&self, _asset_id: &str, _error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_run_complete(&self, total_assets: usize, success_count: usize) {
        *self.finished.lock().unwrap() = Some((total_assets, success_count));
    }
}

#[tokio::test]
async fn progress_events_and_tree_rewrite() {
    let cdn = MockCdn::new(fake_png());
    cdn.set_missing("https://blog.example.com/img/gone.png", true);
    let out = convert_html(
        r#"<p><img src="img/one.png"></p><p>text <img src="img/gone.png"> <img src="img/one.png"></p>"#,
        &ConvertOptions::builder()
            .base_url("https://blog.example.com/post")
            .build()
            .unwrap(),
    );
    let mut root = out.root;
    let mut manifest = out.manifest;
    assert_eq!(manifest.images.len(), 2);

    let events = Arc::new(Events::default());
    let report = pipeline(&cdn)
        .process(
            &mut manifest,
            &Strategy::binary_upload(UPLOAD_URL),
            "cms",
            &UploadOptions::builder()
                .progress_callback(events.clone() as Arc<dyn UploadProgressCallback>)
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(events.started.load(Ordering::SeqCst), 2);
    assert_eq!(events.completed.load(Ordering::SeqCst), 1);
    assert_eq!(events.errors.load(Ordering::SeqCst), 1);
    assert_eq!(*events.finished.lock().unwrap(), Some((2, 1)));

    assert_eq!(report.rewrite(&mut root), 2);
    let mut srcs = Vec::new();
    root.for_each_image_mut(&mut |img| srcs.push(img.src.clone()));
    assert_eq!(
        srcs,
        vec![
            "https://dest.example.com/files/one.png",
            "https://blog.example.com/img/gone.png",
            "https://dest.example.com/files/one.png",
        ]
    );
}

// ── Strategy table ───────────────────────────────────────────────────────

#[test]
fn strategy_table_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "cms": {{
                "mode": "binaryUpload",
                "uploadUrl": "{UPLOAD_URL}",
                "csrf": {{ "source": {{ "kind": "cookie", "name": "csrftoken" }}, "header": "X-CSRFToken" }},
                "constraints": {{ "acceptedMimeTypes": ["image/jpeg"], "maxSizeMB": 1.5, "maxWidth": 1200 }}
            }},
            "mirror": {{ "mode": "externalUrlOnly" }}
        }}"#
    )
    .unwrap();

    let table = StrategyTable::from_path(file.path()).unwrap();
    let cms = table.get("cms").unwrap();
    assert_eq!(cms.mode, UploadMode::BinaryUpload);
    assert_eq!(cms.constraints.max_width, Some(1200));
    assert_eq!(cms.constraints.max_bytes(), Some(1_572_864));
    assert!(cms.constraints.accepts("image/jpg"));
    assert!(!cms.constraints.accepts("image/png"));
    assert_eq!(table.get("mirror").unwrap().mode, UploadMode::ExternalUrlOnly);
    assert!(table.get("unknown").is_err());
}

#[test]
fn blocking_callers_can_drive_the_pipeline() {
    let cdn = MockCdn::new(fake_png());
    let mut manifest = manifest_with(1);
    let report = tokio_test::block_on(pipeline(&cdn).process(
        &mut manifest,
        &Strategy::new(UploadMode::ExternalUrlOnly),
        "mirror",
        &UploadOptions::default(),
    ))
    .unwrap();
    assert_eq!(report.stats.uploaded, 1);
}

// ── Raster normalisation ─────────────────────────────────────────────────

#[cfg(feature = "raster")]
mod raster {
    use super::*;
    use docpress::pipeline::codec::RasterCodec;
    use docpress::AssetError;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// Noisy RGB image, so it does not compress to nothing.
    fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let mut state: u32 = 0x1234_5678;
        let img = RgbImage::from_fn(width, height, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let [r, g, b, _] = state.to_le_bytes();
            Rgb([r, g, b])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    /// Smooth gradient, small once JPEG-encoded.
    fn smooth_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 128])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn raster_pipeline(cdn: &Arc<MockCdn>) -> UploadPipeline {
        UploadPipeline::with_transport(cdn.clone() as Arc<dyn Transport>)
            .codec(Arc::new(RasterCodec))
    }

    #[tokio::test]
    async fn png_is_reencoded_when_only_jpeg_is_accepted() {
        let cdn = MockCdn::new(noisy_png(40, 30));
        let mut manifest = manifest_with(1);
        let strategy = Strategy::binary_upload(UPLOAD_URL).with_constraints(Constraints {
            accepted_mime_types: vec!["image/jpeg".into()],
            ..Default::default()
        });

        let report = raster_pipeline(&cdn)
            .process(&mut manifest, &strategy, "cms", &options(1))
            .await
            .unwrap();
        assert_eq!(report.stats.uploaded, 1);

        match &cdn.uploads()[0].body {
            RequestBody::Multipart {
                mime_type,
                bytes,
                file_name,
                ..
            } => {
                assert_eq!(mime_type, "image/jpeg");
                assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
                assert_eq!(file_name, "a1.jpg");
            }
            other => panic!("unexpected body {other:?}"),
        }
        let entry = &manifest.images[0];
        assert_eq!(entry.mime_type.as_deref(), Some("image/jpeg"));
        assert_eq!((entry.width, entry.height), (Some(40), Some(30)));
    }

    #[tokio::test]
    async fn fitting_image_respects_size_and_width() {
        let cdn = MockCdn::new(smooth_png(400, 300));
        let mut manifest = manifest_with(1);
        let limit_mb = 0.05;
        let strategy = Strategy::binary_upload(UPLOAD_URL).with_constraints(Constraints {
            accepted_mime_types: vec!["image/jpeg".into()],
            max_size_mb: Some(limit_mb),
            max_width: Some(200),
            max_height: None,
        });

        let report = raster_pipeline(&cdn)
            .process(&mut manifest, &strategy, "cms", &options(1))
            .await
            .unwrap();
        assert_eq!(report.stats.uploaded, 1);
        assert_eq!(report.stats.failed, 0);

        let limit = (limit_mb * 1024.0 * 1024.0) as u64;
        let entry = &manifest.images[0];
        assert!(entry.size.unwrap() <= limit);
        assert_eq!((entry.width, entry.height), (Some(200), Some(150)));
        match &cdn.uploads()[0].body {
            RequestBody::Multipart { bytes, mime_type, .. } => {
                assert_eq!(mime_type, "image/jpeg");
                assert!(bytes.len() as u64 <= limit);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn image_over_limit_at_quality_floor_is_not_uploaded() {
        let cdn = MockCdn::new(noisy_png(800, 600));
        let mut manifest = manifest_with(1);
        let strategy = Strategy::binary_upload(UPLOAD_URL).with_constraints(Constraints {
            accepted_mime_types: vec!["image/jpeg".into()],
            max_size_mb: Some(0.001),
            ..Default::default()
        });

        let report = raster_pipeline(&cdn)
            .process(&mut manifest, &strategy, "cms", &options(1))
            .await
            .unwrap();
        assert_eq!(report.stats.uploaded, 0);
        assert_eq!(report.stats.failed, 1);

        let entry = &manifest.images[0];
        assert_eq!(entry.status, AssetStatus::Failed);
        let error = entry.error.as_ref().unwrap();
        assert_eq!(error.kind(), AssetErrorKind::NormalizeError);
        assert!(matches!(error, AssetError::OverSizeLimit { limit: 1048, .. }), "{error:?}");
        assert!(cdn.uploads().is_empty());
    }
}
