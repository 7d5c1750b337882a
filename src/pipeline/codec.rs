//! Raster codec capability.
//!
//! Normalisation needs decode/encode/resize. Builds without the `raster`
//! feature (or hosts where the codec fails its self-test) get [`NoopCodec`],
//! and the normaliser skips those steps instead of failing the asset.
//! [`probe`] picks the implementation once, at pipeline construction.

use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("no raster codec available")]
    Unavailable,
    #[error("unsupported image type '{0}'")]
    Unsupported(String),
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
}

/// Raster operations the upload pipeline consumes.
///
/// All methods are synchronous and CPU-bound; callers run them on the
/// blocking pool.
pub trait Codec: Send + Sync {
    /// Whether the operations below actually work.
    fn is_capable(&self) -> bool;

    fn dimensions(&self, bytes: &[u8]) -> Result<(u32, u32), CodecError>;

    /// Decode and encode into `target_mime`.
    fn reencode(&self, bytes: &[u8], target_mime: &str, quality: u8) -> Result<Vec<u8>, CodecError>;

    /// Encode again in the same type at a given quality (lossy types only
    /// change size).
    fn compress(&self, bytes: &[u8], mime: &str, quality: u8) -> Result<Vec<u8>, CodecError>;

    /// Scale down, keeping the aspect ratio, to fit the bounds.
    fn resize(
        &self,
        bytes: &[u8],
        mime: &str,
        max_width: Option<u32>,
        max_height: Option<u32>,
        quality: u8,
    ) -> Result<Vec<u8>, CodecError>;
}

/// MIME type from magic bytes.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else if bytes.starts_with(b"BM") {
        Some("image/bmp")
    } else {
        let head = String::from_utf8_lossy(&bytes[..bytes.len().min(256)]).to_ascii_lowercase();
        let head = head.trim_start();
        (head.starts_with("<svg") || (head.starts_with("<?xml") && head.contains("<svg")))
            .then_some("image/svg+xml")
    }
}

/// File extension for a MIME type.
pub fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/svg+xml" => "svg",
        _ => "bin",
    }
}

/// Types whose size responds to the quality knob.
pub fn is_lossy(mime: &str) -> bool {
    mime == "image/jpeg"
}

/// Pick the best codec this build and host support.
pub fn probe() -> Arc<dyn Codec> {
    #[cfg(feature = "raster")]
    {
        let codec = RasterCodec;
        if codec.self_test() {
            return Arc::new(codec);
        }
        warn!("Raster codec failed its self-test; normalisation disabled");
    }
    #[cfg(not(feature = "raster"))]
    warn!("Built without the `raster` feature; normalisation disabled");
    Arc::new(NoopCodec)
}

/// Codec for contexts without raster support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCodec;

impl Codec for NoopCodec {
    fn is_capable(&self) -> bool {
        false
    }

    fn dimensions(&self, _bytes: &[u8]) -> Result<(u32, u32), CodecError> {
        Err(CodecError::Unavailable)
    }

    fn reencode(&self, _: &[u8], _: &str, _: u8) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::Unavailable)
    }

    fn compress(&self, _: &[u8], _: &str, _: u8) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::Unavailable)
    }

    fn resize(
        &self,
        _: &[u8],
        _: &str,
        _: Option<u32>,
        _: Option<u32>,
        _: u8,
    ) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::Unavailable)
    }
}

#[cfg(feature = "raster")]
pub use raster::RasterCodec;

#[cfg(feature = "raster")]
mod raster {
    use super::{Codec, CodecError};
    use image::codecs::jpeg::JpegEncoder;
    use image::imageops::FilterType;
    use image::{DynamicImage, GenericImageView, ImageFormat, RgbaImage};
    use std::io::Cursor;

    /// [`Codec`] backed by the `image` crate.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct RasterCodec;

    impl RasterCodec {
        /// Encode and decode a 1×1 image.
        pub fn self_test(&self) -> bool {
            let img = DynamicImage::ImageRgba8(RgbaImage::new(1, 1));
            encode(&img, ImageFormat::Png, 90)
                .and_then(|png| decode(&png))
                .is_ok()
        }
    }

    fn format_for(mime: &str) -> Result<ImageFormat, CodecError> {
        match ImageFormat::from_mime_type(mime) {
            Some(
                f @ (ImageFormat::Jpeg
                | ImageFormat::Png
                | ImageFormat::Gif
                | ImageFormat::WebP
                | ImageFormat::Bmp),
            ) => Ok(f),
            _ => Err(CodecError::Unsupported(mime.to_string())),
        }
    }

    fn decode(bytes: &[u8]) -> Result<DynamicImage, CodecError> {
        image::load_from_memory(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode(img: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        let result = if format == ImageFormat::Jpeg {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
            rgb.write_with_encoder(encoder)
        } else {
            img.write_to(&mut Cursor::new(&mut buf), format)
        };
        result.map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(buf)
    }

    impl Codec for RasterCodec {
        fn is_capable(&self) -> bool {
            true
        }

        fn dimensions(&self, bytes: &[u8]) -> Result<(u32, u32), CodecError> {
            Ok(decode(bytes)?.dimensions())
        }

        fn reencode(
            &self,
            bytes: &[u8],
            target_mime: &str,
            quality: u8,
        ) -> Result<Vec<u8>, CodecError> {
            let format = format_for(target_mime)?;
            encode(&decode(bytes)?, format, quality)
        }

        fn compress(&self, bytes: &[u8], mime: &str, quality: u8) -> Result<Vec<u8>, CodecError> {
            self.reencode(bytes, mime, quality)
        }

        fn resize(
            &self,
            bytes: &[u8],
            mime: &str,
            max_width: Option<u32>,
            max_height: Option<u32>,
            quality: u8,
        ) -> Result<Vec<u8>, CodecError> {
            let format = format_for(mime)?;
            let img = decode(bytes)?;
            let (w, h) = img.dimensions();
            let scale_w = max_width.map_or(1.0, |m| m as f64 / w.max(1) as f64);
            let scale_h = max_height.map_or(1.0, |m| m as f64 / h.max(1) as f64);
            let scale = scale_w.min(scale_h);
            if scale >= 1.0 {
                return encode(&img, format, quality);
            }
            let nw = ((w as f64 * scale).round() as u32).max(1);
            let nh = ((h as f64 * scale).round() as u32).max(1);
            encode(&img.resize_exact(nw, nh, FilterType::Triangle), format, quality)
        }
    }
}
