//! The asset manifest: a side-table of every binary/media reference the
//! document needs, keyed by manifest-local ids.
//!
//! ## Why keep assets out of the tree?
//!
//! Image payloads can be megabytes. The AST only carries an id and the
//! source reference, so it can be cloned, diffed and serialised cheaply,
//! while the upload stage works against the manifest alone.
//!
//! ## Deduplication
//!
//! Images are content-addressed by their *resolved absolute URL* (scheme and
//! host normalised, path case-sensitive): two references to the same URL
//! share one entry. Formulas are deliberately **not** deduplicated by their
//! TeX source; each occurrence keeps its own entry because the same
//! expression may be rendered differently in display and inline context.

use crate::ast::{AssetId, Block, EmbedKind, Inline, MathEngine, Root};
use crate::error::AssetError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Scheme of synthetic references to assets that only exist in memory.
pub const LOCAL_SCHEME: &str = "local://";

/// Upload lifecycle of an image entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    #[default]
    Pending,
    Downloading,
    Ready,
    Uploaded,
    Failed,
}

/// Bytes of a local asset, base64-encoded so the manifest stays plain JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlinePayload {
    pub mime_type: String,
    pub data: String,
}

impl InlinePayload {
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: STANDARD.encode(bytes),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.data.trim())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageEntry {
    pub id: AssetId,
    pub original_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<InlinePayload>,
    pub mime_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub size: Option<u64>,
    pub alt: Option<String>,
    pub title: Option<String>,
    pub status: AssetStatus,
    #[serde(default)]
    pub uploaded_to: BTreeSet<String>,
    /// Uploaded URL per destination, so reruns can report skipped entries.
    #[serde(default)]
    pub remote_urls: BTreeMap<String, String>,
    pub error: Option<AssetError>,
}

impl ImageEntry {
    pub fn is_local(&self) -> bool {
        self.original_url.starts_with(LOCAL_SCHEME)
    }

    pub fn is_uploaded_to(&self, destination: &str) -> bool {
        self.uploaded_to.contains(destination)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormulaEntry {
    pub id: AssetId,
    pub tex: String,
    pub display: bool,
    pub engine: Option<MathEngine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedEntry {
    pub id: AssetId,
    pub kind: EmbedKind,
    pub url: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetManifest {
    #[serde(default)]
    pub images: Vec<ImageEntry>,
    #[serde(default)]
    pub formulas: Vec<FormulaEntry>,
    #[serde(default)]
    pub embeds: Vec<EmbedEntry>,
}

/// A reference supplied from outside the document, e.g. an image pasted
/// into the editor before conversion ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRef {
    pub url: String,
    #[serde(default)]
    pub alt: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
}

/// Resolves the id part of a `local://<id>` reference to its bytes.
pub trait PayloadLookup {
    fn lookup(&self, local_id: &str) -> Option<InlinePayload>;
}

impl PayloadLookup for HashMap<String, InlinePayload> {
    fn lookup(&self, local_id: &str) -> Option<InlinePayload> {
        self.get(local_id).cloned()
    }
}

/// Lookup that knows no local payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPayloads;

impl PayloadLookup for NoPayloads {
    fn lookup(&self, _local_id: &str) -> Option<InlinePayload> {
        None
    }
}

impl AssetManifest {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.formulas.is_empty() && self.embeds.is_empty()
    }

    pub fn image(&self, id: &str) -> Option<&ImageEntry> {
        self.images.iter().find(|e| e.id == id)
    }

    pub fn image_by_url(&self, url: &str) -> Option<&ImageEntry> {
        let key = normalize_url(url);
        self.images.iter().find(|e| e.original_url == key)
    }

    /// Register image nodes that have no manifest entry yet (for example
    /// those produced by `math_to_image`). Existing ids are kept.
    pub fn sync(&mut self, root: &mut Root) {
        let mut builder = ManifestBuilder::from_manifest(std::mem::take(self));
        builder.register_tree_images(root);
        *self = builder.finish();
    }

    /// Merge externally supplied references, resolving `local://` ones
    /// through `lookup`. Returns the id assigned to each reference, `None`
    /// for `data:` URIs.
    pub fn merge_external(
        &mut self,
        refs: &[ExternalRef],
        lookup: &dyn PayloadLookup,
    ) -> Vec<Option<AssetId>> {
        let mut builder = ManifestBuilder::from_manifest(std::mem::take(self));
        let ids = refs
            .iter()
            .map(|r| builder.register_external(r, lookup))
            .collect();
        *self = builder.finish();
        ids
    }
}

/// Rebuild a manifest from scratch: every image, formula and embed in the
/// tree plus the external references. Image nodes get their `asset_id`
/// (re)assigned so the tree and the manifest agree.
pub fn build_manifest(
    root: &mut Root,
    external_refs: &[ExternalRef],
    lookup: &dyn PayloadLookup,
) -> AssetManifest {
    let mut builder = ManifestBuilder::new();
    root.for_each_image_mut(&mut |image| {
        image.asset_id = None;
    });
    builder.register_tree_images(root);

    root.for_each_block(&mut |block| match block {
        Block::MathBlock { tex, engine } => {
            builder.register_formula(tex, true, *engine);
        }
        Block::EmbedBlock {
            kind, url, provider, ..
        } => {
            builder.register_embed(*kind, url.clone(), provider.clone());
        }
        _ => {}
    });
    root.for_each_inline(&mut |inline| {
        if let Inline::MathInline { tex, engine } = inline {
            builder.register_formula(tex, false, *engine);
        }
    });

    for r in external_refs {
        builder.register_external(r, lookup);
    }
    // Local references found in the tree get their payload too.
    for entry in builder.manifest.images.iter_mut() {
        if entry.payload.is_none() {
            attach_payload(entry, lookup);
        }
    }
    builder.finish()
}

/// Normalise a URL into its dedup key. Parseable URLs are re-serialised
/// (lower-cased scheme and host, default port dropped); anything else is
/// kept verbatim.
pub fn normalize_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with(LOCAL_SCHEME) || is_data_uri(raw) {
        return raw.to_string();
    }
    match reqwest::Url::parse(raw) {
        Ok(url) => url.to_string(),
        Err(_) => raw.to_string(),
    }
}

pub fn is_data_uri(url: &str) -> bool {
    url.len() >= 5 && url[..5].eq_ignore_ascii_case("data:")
}

fn attach_payload(entry: &mut ImageEntry, lookup: &dyn PayloadLookup) {
    if let Some(local_id) = entry.original_url.strip_prefix(LOCAL_SCHEME) {
        if let Some(payload) = lookup.lookup(local_id) {
            entry.mime_type = Some(payload.mime_type.clone());
            entry.payload = Some(payload);
        }
    }
}

// ── Builder ──────────────────────────────────────────────────────────────

/// Accumulates a manifest while a tree is being built or scanned.
///
/// Owned by a single conversion call; ids are only unique within the
/// manifest it produces.
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    manifest: AssetManifest,
    by_url: HashMap<String, AssetId>,
    next_image: usize,
    next_formula: usize,
    next_embed: usize,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue numbering from an existing manifest.
    pub fn from_manifest(manifest: AssetManifest) -> Self {
        let by_url = manifest
            .images
            .iter()
            .map(|e| (e.original_url.clone(), e.id.clone()))
            .collect();
        let next_image = max_suffix(manifest.images.iter().map(|e| e.id.as_str()));
        let next_formula = max_suffix(manifest.formulas.iter().map(|e| e.id.as_str()));
        let next_embed = max_suffix(manifest.embeds.iter().map(|e| e.id.as_str()));
        Self {
            manifest,
            by_url,
            next_image,
            next_formula,
            next_embed,
        }
    }

    pub fn manifest(&self) -> &AssetManifest {
        &self.manifest
    }

    /// Register an image by URL and return its id. Repeated URLs return
    /// the existing id; `data:` URIs are self-contained and return `None`.
    pub fn register_image(
        &mut self,
        url: &str,
        alt: Option<&str>,
        title: Option<&str>,
    ) -> Option<AssetId> {
        if url.trim().is_empty() || is_data_uri(url.trim()) {
            return None;
        }
        let key = normalize_url(url);
        if let Some(id) = self.by_url.get(&key) {
            if let Some(entry) = self.manifest.images.iter_mut().find(|e| &e.id == id) {
                if entry.alt.is_none() {
                    entry.alt = alt.map(str::to_string);
                }
                if entry.title.is_none() {
                    entry.title = title.map(str::to_string);
                }
            }
            return Some(id.clone());
        }
        self.next_image += 1;
        let id = format!("img_{}", self.next_image);
        debug!("Registered image {} -> {}", id, key);
        self.manifest.images.push(ImageEntry {
            id: id.clone(),
            original_url: key.clone(),
            alt: alt.map(str::to_string),
            title: title.map(str::to_string),
            ..Default::default()
        });
        self.by_url.insert(key, id.clone());
        Some(id)
    }

    pub fn register_formula(
        &mut self,
        tex: &str,
        display: bool,
        engine: Option<MathEngine>,
    ) -> AssetId {
        self.next_formula += 1;
        let id = format!("formula_{}", self.next_formula);
        self.manifest.formulas.push(FormulaEntry {
            id: id.clone(),
            tex: tex.to_string(),
            display,
            engine,
        });
        id
    }

    pub fn register_embed(
        &mut self,
        kind: EmbedKind,
        url: Option<String>,
        provider: Option<String>,
    ) -> AssetId {
        self.next_embed += 1;
        let id = format!("embed_{}", self.next_embed);
        self.manifest.embeds.push(EmbedEntry {
            id: id.clone(),
            kind,
            url,
            provider,
        });
        id
    }

    pub fn register_external(
        &mut self,
        r: &ExternalRef,
        lookup: &dyn PayloadLookup,
    ) -> Option<AssetId> {
        let id = self.register_image(&r.url, r.alt.as_deref(), r.title.as_deref())?;
        if let Some(entry) = self.manifest.images.iter_mut().find(|e| e.id == id) {
            if entry.proxy_url.is_none() {
                entry.proxy_url = r.proxy_url.clone();
            }
            if entry.payload.is_none() {
                attach_payload(entry, lookup);
            }
        }
        Some(id)
    }

    /// Give every image node in the tree a valid id, keeping ids that
    /// already point at an entry.
    pub fn register_tree_images(&mut self, root: &mut Root) {
        root.for_each_image_mut(&mut |image| {
            let known = image
                .asset_id
                .as_deref()
                .is_some_and(|id| self.manifest.images.iter().any(|e| e.id == id));
            if !known {
                image.asset_id =
                    self.register_image(&image.src, image.alt.as_deref(), image.title.as_deref());
            }
        });
    }

    pub fn finish(self) -> AssetManifest {
        self.manifest
    }
}

fn max_suffix<'a>(ids: impl Iterator<Item = &'a str>) -> usize {
    ids.filter_map(|id| id.rsplit('_').next()?.parse::<usize>().ok())
        .max()
        .unwrap_or(0)
}
