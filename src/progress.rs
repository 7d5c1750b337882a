//! Progress-callback trait for per-asset upload events.
//!
//! Inject an [`Arc<dyn UploadProgressCallback>`] via
//! [`crate::config::UploadOptionsBuilder::progress_callback`] to receive
//! events as the upload pipeline works through a manifest.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a channel, a job record or a terminal
//! progress bar without the library knowing how the host communicates. The
//! trait is `Send + Sync` because assets are processed concurrently.
//!
//! # Example
//!
//! ```rust
//! use docpress::{UploadOptions, UploadProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     uploaded: AtomicUsize,
//! }
//!
//! impl UploadProgressCallback for CountingCallback {
//!     fn on_asset_complete(&self, asset_id: &str, new_url: &str) {
//!         self.uploaded.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{asset_id} -> {new_url}");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { uploaded: AtomicUsize::new(0) });
//! let options = UploadOptions::builder()
//!     .progress_callback(counter as Arc<dyn UploadProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the upload pipeline as it processes each asset.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// `on_asset_start`, `on_asset_complete` and `on_asset_error` may be called
/// concurrently from different tasks. Protect shared mutable state with
/// `Mutex` or atomics.
pub trait UploadProgressCallback: Send + Sync {
    /// Called once before any asset is processed.
    ///
    /// # Arguments
    /// * `total_assets` — entries selected for this run (skipped ones excluded)
    fn on_run_start(&self, total_assets: usize) {
        let _ = total_assets;
    }

    /// Called just before an asset is downloaded.
    fn on_asset_start(&self, asset_id: &str, original_url: &str) {
        let _ = (asset_id, original_url);
    }

    /// Called when an asset was uploaded and its new URL is known.
    fn on_asset_complete(&self, asset_id: &str, new_url: &str) {
        let _ = (asset_id, new_url);
    }

    /// Called when an asset failed at any step.
    ///
    /// # Arguments
    /// * `error` — human-readable error description
    fn on_asset_error(&self, asset_id: &str, error: &str) {
        let _ = (asset_id, error);
    }

    /// Called once after every selected asset has been attempted.
    fn on_run_complete(&self, total_assets: usize, success_count: usize) {
        let _ = (total_assets, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl UploadProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::UploadOptions`].
pub type ProgressCallback = Arc<dyn UploadProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        total: AtomicUsize,
    }

    impl UploadProgressCallback for TrackingCallback {
        fn on_run_start(&self, total_assets: usize) {
            self.total.store(total_assets, Ordering::SeqCst);
        }

        fn on_asset_start(&self, _asset_id: &str, _original_url: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_asset_complete(&self, _asset_id: &str, _new_url: &str) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_asset_error(&self, _asset_id: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(2);
        cb.on_asset_start("img_1", "https://x/a.png");
        cb.on_asset_complete("img_1", "https://cdn/a.png");
        cb.on_asset_error("img_2", "boom");
        cb.on_run_complete(2, 1);
    }

    #[test]
    fn tracking_callback_through_arc_dyn() {
        let tracker = Arc::new(TrackingCallback::default());
        let cb: ProgressCallback = tracker.clone();
        cb.on_run_start(3);
        cb.on_asset_start("img_1", "a");
        cb.on_asset_complete("img_1", "b");
        cb.on_asset_start("img_2", "c");
        cb.on_asset_error("img_2", "timeout");
        assert_eq!(tracker.total.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }
}
