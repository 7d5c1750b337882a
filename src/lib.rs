//! # docpress
//!
//! Turn rendered web documents into a canonical AST and move their assets
//! to a publishing destination.
//!
//! ## Why this crate?
//!
//! Content copied out of a rendered page is a mess of editor-specific
//! markup: KaTeX spans instead of TeX, SVG instead of Mermaid source,
//! lazy-loaded images behind `data-src`, tables with spans. Publishing
//! platforms each want something different on the other end, and most of
//! them refuse hot-linked images. This crate lowers the markup into one
//! typed tree, collects every asset into a side-table, and re-hosts the
//! assets according to a declarative per-destination strategy.
//!
//! ## Pipeline Overview
//!
//! ```text
//! HTML / DOM tree
//!  │
//!  ├─ 1. Convert    heuristics + tag handlers → Root AST + AssetManifest
//!  ├─ 2. Transform  pure passes (remove_toc → remove_ads → clean, ...)
//!  ├─ 3. Upload     per asset: download → normalise → dispatch (concurrent)
//!  └─ 4. Rewrite    originalUrl → newUrl mapping applied to image nodes
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docpress::{convert_html, transform, ConvertOptions, StrategyTable, UploadOptions, UploadPipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ConvertOptions::builder()
//!         .base_url("https://blog.example.com/posts/1")
//!         .build()?;
//!     let out = convert_html(r#"<h1>Hi</h1><p><img src="/a.png"></p>"#, &options);
//!     let mut root = transform::standard()(out.root);
//!     let mut manifest = out.manifest;
//!
//!     let table = StrategyTable::from_path("strategies.json")?;
//!     let report = UploadPipeline::new()?
//!         .process(&mut manifest, table.get("cms")?, "cms", &UploadOptions::default())
//!         .await?;
//!     report.rewrite(&mut root);
//!     eprintln!("{} uploaded, {} failed", report.stats.uploaded, report.stats.failed);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `cli`    | on      | Enables the `docpress` binary (clap + anyhow + indicatif + tracing-subscriber) |
//! | `raster` | on      | Image re-encode/compress/resize via the `image` crate; without it normalisation is skipped |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod ast;
pub mod config;
pub mod convert;
pub mod dom;
pub mod error;
pub mod manifest;
pub mod pipeline;
pub mod progress;
pub mod strategy;
pub mod transform;
pub mod upload;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use ast::{AssetId, Block, Image, Inline, NodeKind, Root};
pub use config::{ConvertOptions, ConvertOptionsBuilder, UploadOptions, UploadOptionsBuilder};
pub use convert::{convert, convert_html, ConversionOutput, ConvertContext, ElementHandler, Fragment};
pub use dom::{parse_html, DomNode, Element};
pub use error::{AssetError, AssetErrorKind, DocpressError};
pub use manifest::{build_manifest, AssetManifest, AssetStatus, ExternalRef, ImageEntry, InlinePayload, PayloadLookup};
pub use pipeline::codec::{Codec, NoopCodec};
pub use pipeline::dispatch::{CsrfTokenSource, StaticCsrfTokens};
pub use pipeline::transport::{HttpTransport, Transport};
pub use progress::{NoopProgressCallback, ProgressCallback, UploadProgressCallback};
pub use strategy::{Constraints, Strategy, StrategyTable, UploadMode};
pub use upload::{process, AssetOutcome, UploadPipeline, UploadReport, UploadStats};
