//! Normalisation stage: make downloaded bytes acceptable to a destination.
//!
//! Steps, in order, each skipped when it has nothing to do:
//!
//! 1. **Re-encode** into an accepted MIME type. JPEG is preferred as the
//!    target when accepted (or when nothing raster is listed), else the
//!    first accepted raster type. An accepted lossless raster over the size
//!    ceiling is also moved to JPEG when JPEG is accepted.
//! 2. **Compress**: lower the encode quality from 90 in steps of 10 until
//!    the size fits `maxSizeMB`, stopping at quality 40. Each step encodes
//!    from the same source so artefacts do not compound.
//! 3. **Resize**, keeping the aspect ratio, when a dimension exceeds
//!    `maxWidth`/`maxHeight`. The resized image is encoded at the quality
//!    step 2 settled on. Accepted types the codec cannot decode (SVG, ICO)
//!    are left alone, with unknown dimensions.
//!
//! An asset still over the ceiling after all three is an
//! [`AssetError::OverSizeLimit`]; it is never uploaded anyway.
//!
//! Codec work is CPU-bound and runs in `tokio::task::spawn_blocking`. When
//! the codec is not capable, the bytes pass through untouched.

use crate::error::AssetError;
use crate::pipeline::codec::{is_lossy, Codec, CodecError};
use crate::pipeline::download::Downloaded;
use crate::pipeline::transport::{cancellable, TransportError};
use crate::strategy::{canonical_mime, Constraints};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const START_QUALITY: u8 = 90;
pub const QUALITY_STEP: u8 = 10;
pub const QUALITY_FLOOR: u8 = 40;

const RASTER_TARGETS: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Normalise `input` for `constraints` on the blocking pool.
pub async fn normalize(
    input: Downloaded,
    constraints: &Constraints,
    codec: Arc<dyn Codec>,
    cancel: Option<&CancellationToken>,
) -> Result<Normalized, AssetError> {
    if !codec.is_capable() {
        warn!("No raster codec; uploading {} as downloaded", input.mime_type);
        return Ok(Normalized {
            bytes: input.bytes,
            mime_type: input.mime_type,
            width: None,
            height: None,
        });
    }

    let constraints = constraints.clone();
    let task = tokio::task::spawn_blocking(move || normalize_blocking(input, &constraints, &*codec));
    let joined = cancellable(cancel, async {
        task.await
            .map_err(|e| TransportError::Network(format!("normalise task failed: {e}")))
    })
    .await;

    match joined {
        Ok(result) => result,
        Err(TransportError::Cancelled) => Err(AssetError::Cancelled),
        Err(e) => Err(AssetError::Normalize {
            detail: e.to_string(),
        }),
    }
}

/// The synchronous normalisation pipeline.
pub fn normalize_blocking(
    input: Downloaded,
    constraints: &Constraints,
    codec: &dyn Codec,
) -> Result<Normalized, AssetError> {
    let codec_err = |e: CodecError| AssetError::Normalize {
        detail: e.to_string(),
    };

    let mut mime = input.mime_type;
    let mut bytes = input.bytes;
    let limit = constraints.max_bytes();
    let over_limit = |b: &[u8]| limit.is_some_and(|l| b.len() as u64 > l);

    // 1. Type.
    if !constraints.accepts(&mime) {
        let target = reencode_target(constraints).ok_or_else(|| AssetError::Normalize {
            detail: format!(
                "'{mime}' is not accepted and no accepted type can be produced ({})",
                constraints.accepted_mime_types.join(", ")
            ),
        })?;
        debug!("Re-encoding {} -> {}", mime, target);
        bytes = codec.reencode(&bytes, target, START_QUALITY).map_err(codec_err)?;
        mime = target.to_string();
    } else if over_limit(&bytes) && !is_lossy(&mime) && is_decodable(&mime) {
        // Lossless and too big: switch to an accepted lossy type if there is one.
        if let Some(target) = reencode_target(constraints).filter(|t| is_lossy(t)) {
            match codec.reencode(&bytes, target, START_QUALITY) {
                Ok(encoded) => {
                    debug!("Re-encoding oversized {} -> {}", mime, target);
                    bytes = encoded;
                    mime = target.to_string();
                }
                Err(e) => debug!("Keeping {}: {}", mime, e),
            }
        }
    }

    // 2. Size.
    let mut quality = START_QUALITY;
    if over_limit(&bytes) && is_lossy(&mime) {
        let source = bytes.clone();
        let mut attempt = START_QUALITY;
        loop {
            let candidate = codec.compress(&source, &mime, attempt).map_err(codec_err)?;
            debug!("Quality {} -> {} bytes (limit {:?})", attempt, candidate.len(), limit);
            let fits = !over_limit(&candidate);
            if candidate.len() < bytes.len() {
                bytes = candidate;
                quality = attempt;
            }
            if fits || attempt <= QUALITY_FLOOR {
                break;
            }
            attempt = attempt.saturating_sub(QUALITY_STEP).max(QUALITY_FLOOR);
        }
    }

    // 3. Dimensions. Accepted types the codec cannot decode (SVG, ICO)
    // are left as they are.
    let dimensions = match codec.dimensions(&bytes) {
        Ok((width, height)) if constraints.exceeds_dimensions(width, height) => {
            let quality = if is_lossy(&mime) { quality } else { 100 };
            bytes = codec
                .resize(
                    &bytes,
                    &mime,
                    constraints.max_width,
                    constraints.max_height,
                    quality,
                )
                .map_err(codec_err)?;
            let resized = codec.dimensions(&bytes).map_err(codec_err)?;
            debug!("Resized {}x{} -> {}x{}", width, height, resized.0, resized.1);
            Some(resized)
        }
        Ok(fits) => Some(fits),
        Err(e) => {
            debug!("Cannot measure {}: {}", mime, e);
            None
        }
    };

    if let Some(limit) = limit {
        let size = bytes.len() as u64;
        if size > limit {
            return Err(AssetError::OverSizeLimit { size, limit });
        }
    }

    Ok(Normalized {
        bytes,
        mime_type: mime,
        width: dimensions.map(|(w, _)| w),
        height: dimensions.map(|(_, h)| h),
    })
}

fn reencode_target(constraints: &Constraints) -> Option<&'static str> {
    if constraints.accepts("image/jpeg") {
        return Some("image/jpeg");
    }
    RASTER_TARGETS.iter().copied().find(|t| constraints.accepts(t))
}

fn is_decodable(mime: &str) -> bool {
    matches!(
        canonical_mime(mime).as_str(),
        "image/png" | "image/gif" | "image/webp" | "image/bmp"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::codec::NoopCodec;
    use std::sync::Mutex;

    /// Fake codec: "encoded" size is `quality * 1000` bytes, dimensions are
    /// fixed until a resize happens.
    #[derive(Default)]
    struct Sized {
        qualities: Mutex<Vec<u8>>,
        resize_qualities: Mutex<Vec<u8>>,
    }

    impl Codec for Sized {
        fn is_capable(&self) -> bool {
            true
        }
        fn dimensions(&self, bytes: &[u8]) -> Result<(u32, u32), CodecError> {
            Ok(if bytes.first() == Some(&b'r') { (100, 50) } else { (400, 200) })
        }
        fn reencode(&self, _: &[u8], _: &str, q: u8) -> Result<Vec<u8>, CodecError> {
            Ok(vec![b'j'; q as usize * 1000])
        }
        fn compress(&self, _: &[u8], _: &str, q: u8) -> Result<Vec<u8>, CodecError> {
            self.qualities.lock().unwrap().push(q);
            Ok(vec![b'j'; q as usize * 1000])
        }
        fn resize(
            &self,
            bytes: &[u8],
            _: &str,
            _: Option<u32>,
            _: Option<u32>,
            q: u8,
        ) -> Result<Vec<u8>, CodecError> {
            self.resize_qualities.lock().unwrap().push(q);
            let mut out = vec![b'r'];
            out.extend_from_slice(&bytes[1..bytes.len() / 2]);
            Ok(out)
        }
    }

    fn png(len: usize) -> Downloaded {
        Downloaded {
            bytes: vec![b'p'; len],
            mime_type: "image/png".into(),
            via_proxy: false,
        }
    }

    fn jpeg_only(max_mb: Option<f64>) -> Constraints {
        Constraints {
            accepted_mime_types: vec!["image/jpeg".into()],
            max_size_mb: max_mb,
            ..Default::default()
        }
    }

    #[test]
    fn reencodes_unaccepted_type() {
        let out = normalize_blocking(png(10), &jpeg_only(None), &Sized::default()).unwrap();
        assert_eq!(out.mime_type, "image/jpeg");
        assert_eq!(out.bytes.len(), 90_000);
    }

    #[test]
    fn steps_quality_down_until_it_fits() {
        let codec = Sized::default();
        // 0.06 MiB ≈ 62_914 bytes: quality 60 (60_000 bytes) is the first fit.
        let out = normalize_blocking(png(10), &jpeg_only(Some(0.06)), &codec).unwrap();
        assert_eq!(out.bytes.len(), 60_000);
        assert_eq!(*codec.qualities.lock().unwrap(), vec![90, 80, 70, 60]);
    }

    #[test]
    fn over_limit_at_floor_is_an_error() {
        let codec = Sized::default();
        let err = normalize_blocking(png(10), &jpeg_only(Some(0.01)), &codec).unwrap_err();
        assert!(matches!(err, AssetError::OverSizeLimit { .. }));
        assert_eq!(codec.qualities.lock().unwrap().last(), Some(&QUALITY_FLOOR));
    }

    #[test]
    fn resizes_oversized_dimensions() {
        let c = Constraints {
            max_width: Some(100),
            ..Default::default()
        };
        let out = normalize_blocking(png(10), &c, &Sized::default()).unwrap();
        assert_eq!((out.width, out.height), (Some(100), Some(50)));
        assert_eq!(out.mime_type, "image/png");
    }

    #[test]
    fn resize_keeps_the_compressed_quality() {
        let codec = Sized::default();
        let c = Constraints {
            max_width: Some(100),
            ..jpeg_only(Some(0.06))
        };
        let out = normalize_blocking(png(10), &c, &codec).unwrap();
        assert_eq!(*codec.qualities.lock().unwrap(), vec![90, 80, 70, 60]);
        assert_eq!(*codec.resize_qualities.lock().unwrap(), vec![60]);
        assert_eq!((out.width, out.height), (Some(100), Some(50)));
        assert!(out.bytes.len() < 60_000);
    }

    #[test]
    fn oversized_png_moves_to_accepted_jpeg() {
        let codec = Sized::default();
        let c = Constraints {
            accepted_mime_types: vec!["image/png".into(), "image/jpeg".into()],
            max_size_mb: Some(0.06),
            ..Default::default()
        };
        let out = normalize_blocking(png(100_000), &c, &codec).unwrap();
        assert_eq!(out.mime_type, "image/jpeg");
        assert_eq!(out.bytes.len(), 60_000);

        let small = normalize_blocking(png(10), &c, &codec).unwrap();
        assert_eq!(small.mime_type, "image/png");
        assert_eq!(small.bytes.len(), 10);
    }

    #[test]
    fn dimensions_reported_without_bounds() {
        let codec = Sized::default();
        let out = normalize_blocking(png(10), &Constraints::default(), &codec).unwrap();
        assert_eq!((out.width, out.height), (Some(400), Some(200)));
        assert!(codec.resize_qualities.lock().unwrap().is_empty());
    }

    #[cfg(feature = "raster")]
    #[test]
    fn accepted_svg_passes_through_raster_codec() {
        use crate::pipeline::codec::RasterCodec;

        let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="800" height="600"></svg>"#;
        let input = || Downloaded {
            bytes: svg.to_vec(),
            mime_type: "image/svg+xml".into(),
            via_proxy: false,
        };

        let out = normalize_blocking(input(), &Constraints::default(), &RasterCodec).unwrap();
        assert_eq!(out.mime_type, "image/svg+xml");
        assert_eq!(out.bytes, svg.to_vec());

        let bounded = Constraints {
            accepted_mime_types: vec!["image/svg+xml".into(), "image/png".into()],
            max_width: Some(100),
            max_size_mb: Some(1.0),
            ..Default::default()
        };
        let out = normalize_blocking(input(), &bounded, &RasterCodec).unwrap();
        assert_eq!(out.bytes, svg.to_vec());
        assert_eq!((out.width, out.height), (None, None));
    }

    #[test]
    fn no_producible_type_is_a_normalize_error() {
        let c = Constraints {
            accepted_mime_types: vec!["video/mp4".into()],
            ..Default::default()
        };
        let err = normalize_blocking(png(10), &c, &Sized::default()).unwrap_err();
        assert!(matches!(err, AssetError::Normalize { .. }));
    }

    #[tokio::test]
    async fn incapable_codec_passes_bytes_through() {
        let out = normalize(png(10), &jpeg_only(Some(0.000001)), Arc::new(NoopCodec), None)
            .await
            .unwrap();
        assert_eq!(out.mime_type, "image/png");
        assert_eq!(out.bytes.len(), 10);
    }

    #[tokio::test]
    async fn runs_on_blocking_pool() {
        let codec: Arc<dyn Codec> = Arc::new(Sized::default());
        let out = normalize(png(10), &jpeg_only(None), codec, None).await.unwrap();
        assert_eq!(out.mime_type, "image/jpeg");
    }
}
