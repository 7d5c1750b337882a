//! Error types for the docpress library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`DocpressError`] — **Fatal**: the run cannot proceed at all (bad
//!   configuration, a strategy missing a required field, unreadable input).
//!   Returned as `Err(DocpressError)`.
//!
//! * [`AssetError`] — **Non-fatal**: a single asset failed to download,
//!   normalise or upload, but its siblings are fine. Stored in the asset's
//!   manifest entry and in the run's outcome records, never propagated.
//!
//! Conversion itself has no error type: it is total and degrades unknown
//! structure instead of failing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the docpress library.
#[derive(Debug, Error)]
pub enum DocpressError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A strategy lacks a field its mode requires.
    #[error("Strategy for destination '{destination}' is missing required field '{field}'")]
    MissingStrategyField { destination: String, field: String },

    /// No strategy is registered for the destination.
    #[error("No strategy configured for destination '{0}'")]
    UnknownDestination(String),

    /// The strategy table JSON is malformed.
    #[error("Failed to parse strategy table: {0}")]
    StrategyParse(#[source] serde_json::Error),

    /// A manifest or document bundle JSON is malformed.
    #[error("Failed to parse manifest: {0}")]
    ManifestParse(#[source] serde_json::Error),

    // ── I/O errors ────────────────────────────────────────────────────────
    #[error("Failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse class of an [`AssetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetErrorKind {
    DownloadError,
    NormalizeError,
    UploadError,
    UnsupportedModeError,
    Cancelled,
}

/// A non-fatal error for a single asset.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AssetError {
    /// Network failure, non-success status, or an undecodable local payload.
    #[error("Failed to download '{url}': {reason}")]
    Download { url: String, reason: String },

    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// Unsupported or undecodable image format.
    #[error("Normalisation failed: {detail}")]
    Normalize { detail: String },

    /// Lowest encode quality still exceeds the destination's size ceiling.
    #[error("Asset is {size} bytes after compression, limit is {limit} bytes")]
    OverSizeLimit { size: u64, limit: u64 },

    /// Transport failure or error status from the destination.
    #[error("Upload failed: {detail}")]
    Upload { detail: String },

    /// Destination answered but no URL could be found in the response.
    #[error("Could not find an uploaded URL in the response: {body}")]
    UnparsableResponse { body: String },

    /// The strategy needs an execution context this pipeline does not have.
    #[error("Upload mode '{mode}' is not supported here: {reason}")]
    UnsupportedMode { mode: String, reason: String },

    #[error("Cancelled")]
    Cancelled,
}

impl AssetError {
    pub fn kind(&self) -> AssetErrorKind {
        match self {
            AssetError::Download { .. } | AssetError::DownloadTimeout { .. } => {
                AssetErrorKind::DownloadError
            }
            AssetError::Normalize { .. } | AssetError::OverSizeLimit { .. } => {
                AssetErrorKind::NormalizeError
            }
            AssetError::Upload { .. } | AssetError::UnparsableResponse { .. } => {
                AssetErrorKind::UploadError
            }
            AssetError::UnsupportedMode { .. } => AssetErrorKind::UnsupportedModeError,
            AssetError::Cancelled => AssetErrorKind::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_display() {
        let e = DocpressError::MissingStrategyField {
            destination: "blog".into(),
            field: "uploadUrl".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("blog"), "got: {msg}");
        assert!(msg.contains("uploadUrl"), "got: {msg}");
    }

    #[test]
    fn timeout_is_a_download_error() {
        let e = AssetError::DownloadTimeout {
            url: "https://x/a.png".into(),
            secs: 30,
        };
        assert_eq!(e.kind(), AssetErrorKind::DownloadError);
        assert!(e.to_string().contains("30s"));
    }

    #[test]
    fn over_size_is_a_normalize_error() {
        let e = AssetError::OverSizeLimit {
            size: 3_000_000,
            limit: 2_097_152,
        };
        assert_eq!(e.kind(), AssetErrorKind::NormalizeError);
    }

    #[test]
    fn asset_error_round_trips_through_json() {
        let e = AssetError::UnsupportedMode {
            mode: "domPasteUpload".into(),
            reason: "no page context".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"type\":\"unsupportedMode\""));
        let back: AssetError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
