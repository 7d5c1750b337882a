//! The Conversion Engine: document tree → canonical AST + asset manifest.
//!
//! ## Dispatch
//!
//! Every element goes through the same cascade, first match wins:
//!
//! 1. caller-supplied handler registered for the tag
//! 2. diagram heuristic ([`diagram`])
//! 3. formula heuristic ([`formula`])
//! 4. embed heuristic ([`embed`])
//! 5. built-in tag handler
//! 6. generic container pass-through
//! 7. unknown fallback: opaque `htmlBlock`/`htmlInline` when
//!    `preserve_unknown_html` is set, otherwise the children pass through
//!
//! ## Why fragments?
//!
//! Handlers return [`Fragment`]s, a flat mix of blocks and inlines. The
//! parent decides what to do with them: block containers wrap inline runs
//! into implicit paragraphs ([`into_blocks`]), inline containers flatten
//! blocks into inline content ([`into_inlines`]). This is the single place
//! where the Block/Inline split is enforced, so no handler has to care what
//! its parent accepts.
//!
//! Conversion is total. There is no error type: malformed or unexpected
//! structure degrades instead of failing.

pub mod diagram;
pub mod embed;
pub mod formula;
pub mod media;
pub mod table;

use crate::ast::{AssetId, Block, EmbedKind, Image, Inline, List, ListItem, MathEngine, Root};
use crate::config::ConvertOptions;
use crate::dom::{parse_html, DomNode, Element};
use crate::error::DocpressError;
use crate::manifest::{AssetManifest, ManifestBuilder};
use formula::FormulaMatch;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Nesting depth past which subtrees are flattened to their text.
const MAX_DEPTH: usize = 200;

/// Elements whose content never belongs in the document.
const DROPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "head", "meta", "link", "title", "base", "button",
    "input", "select", "option", "optgroup", "datalist", "textarea", "colgroup", "col", "param",
    "source", "track", "wbr", "area", "map",
];

/// Elements kept as raw markup when preserving unknown HTML, dropped otherwise.
const OPAQUE_TAGS: &[&str] = &["svg", "canvas", "applet", "frameset"];

const BLOCK_CONTAINERS: &[&str] = &[
    "#document", "html", "body", "div", "section", "article", "main", "header", "footer", "aside",
    "nav", "center", "address", "hgroup", "fieldset", "form", "dialog", "figcaption", "caption",
    "li", "dt", "dd", "summary", "thead", "tbody", "tfoot", "tr", "td", "th",
];

const INLINE_CONTAINERS: &[&str] = &[
    "span", "font", "small", "big", "abbr", "acronym", "cite", "q", "u", "ins", "mark", "label",
    "time", "var", "dfn", "bdi", "bdo", "ruby", "rb", "rt", "rp", "data", "sub", "sup", "nobr",
    "picture",
];

/// Tags that make an unknown element's raw markup a block.
const BLOCK_LEVEL_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "details", "dialog", "dd", "div", "dl", "dt",
    "fieldset", "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6",
    "header", "hgroup", "hr", "li", "main", "nav", "ol", "p", "pre", "section", "table", "ul",
];

const TOC_CLASSES: &[&str] = &[
    "toc",
    "table-of-contents",
    "markdownIt-TOC",
    "toc-container",
    "md-toc",
];

/// Line-number gutters that code highlighters put inside `pre`.
const CODE_GUTTER_CLASSES: &[&str] = &[
    "line-numbers-rows",
    "linenos",
    "lineno",
    "hljs-ln-numbers",
    "gutter",
    "code-line-number",
];

static RE_HTML_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\n\r\x0C]+").unwrap());

// ── Public surface ───────────────────────────────────────────────────────

/// A piece of converted content, before its parent decides how to attach it.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Block(Block),
    Inline(Inline),
}

/// Caller-supplied conversion for one tag.
///
/// Returning `None` declines the element and lets the built-in cascade
/// handle it. Handlers can recurse through the context
/// ([`ConvertContext::blocks`], [`ConvertContext::inlines`]) and register
/// assets through it, so ids stay consistent with the rest of the document.
pub trait ElementHandler: Send + Sync {
    fn handle(&self, element: &Element, cx: &mut ConvertContext<'_>) -> Option<Vec<Fragment>>;
}

impl<F> ElementHandler for F
where
    F: Fn(&Element, &mut ConvertContext<'_>) -> Option<Vec<Fragment>> + Send + Sync,
{
    fn handle(&self, element: &Element, cx: &mut ConvertContext<'_>) -> Option<Vec<Fragment>> {
        self(element, cx)
    }
}

/// Result of a conversion call. Serialised as-is, this is the "bundle"
/// the CLI hands from `convert` to `upload`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionOutput {
    pub root: Root,
    #[serde(default)]
    pub manifest: AssetManifest,
}

impl ConversionOutput {
    pub fn from_json(json: &str) -> Result<Self, DocpressError> {
        serde_json::from_str(json).map_err(DocpressError::ManifestParse)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DocpressError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| DocpressError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }
}

/// Convert a document tree into an AST and its asset manifest.
pub fn convert(tree: &DomNode, options: &ConvertOptions) -> ConversionOutput {
    let mut cx = ConvertContext::new(options);
    let fragments = cx.convert_node(tree);
    let root = Root::new(into_blocks(fragments));
    let manifest = cx.finish();
    info!(
        "Converted document: {} top-level blocks, {} images, {} formulas, {} embeds",
        root.children.len(),
        manifest.images.len(),
        manifest.formulas.len(),
        manifest.embeds.len()
    );
    ConversionOutput { root, manifest }
}

/// Parse an HTML string and convert it.
pub fn convert_html(html: &str, options: &ConvertOptions) -> ConversionOutput {
    convert(&parse_html(html), options)
}

// ── Context ──────────────────────────────────────────────────────────────

/// Per-call conversion state, threaded through the whole recursion.
///
/// Owns the manifest under construction; nothing outlives the call.
pub struct ConvertContext<'a> {
    options: &'a ConvertOptions,
    base: Option<Url>,
    manifest: ManifestBuilder,
    depth: usize,
}

impl<'a> ConvertContext<'a> {
    pub fn new(options: &'a ConvertOptions) -> Self {
        let base = options.base_url.as_deref().and_then(|raw| match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("Ignoring unparseable base URL '{}': {}", raw, e);
                None
            }
        });
        Self {
            options,
            base,
            manifest: ManifestBuilder::new(),
            depth: 0,
        }
    }

    pub fn options(&self) -> &ConvertOptions {
        self.options
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base.as_ref()
    }

    pub fn manifest(&self) -> &AssetManifest {
        self.manifest.manifest()
    }

    pub fn finish(self) -> AssetManifest {
        self.manifest.finish()
    }

    pub fn resolve_url(&self, raw: &str) -> Option<String> {
        media::resolve_url(raw, self.base.as_ref())
    }

    /// Build an image node from an `<img>`, registering it in the manifest.
    /// `None` when no usable source exists.
    pub fn image(&mut self, el: &Element) -> Option<Image> {
        let src = self.resolve_url(&media::image_source(el)?)?;
        let alt = el.attr_nonempty("alt").map(str::to_string);
        let title = el.attr_nonempty("title").map(str::to_string);
        let asset_id = self
            .manifest
            .register_image(&src, alt.as_deref(), title.as_deref());
        Some(Image {
            asset_id,
            src,
            alt,
            title,
            caption: None,
        })
    }

    pub fn register_formula(
        &mut self,
        tex: &str,
        display: bool,
        engine: Option<MathEngine>,
    ) -> AssetId {
        self.manifest.register_formula(tex, display, engine)
    }

    pub fn register_embed(
        &mut self,
        kind: EmbedKind,
        url: Option<String>,
        provider: Option<String>,
    ) -> AssetId {
        self.manifest.register_embed(kind, url, provider)
    }

    /// Convert one node.
    pub fn convert_node(&mut self, node: &DomNode) -> Vec<Fragment> {
        match node {
            DomNode::Element(el) => self.convert_element(el),
            DomNode::Text { text } => {
                let text = collapse_whitespace(text);
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![Fragment::Inline(Inline::Text { value: text })]
                }
            }
            DomNode::Comment { .. } => Vec::new(),
        }
    }

    /// Convert every child of `el`, in order.
    pub fn convert_children(&mut self, el: &Element) -> Vec<Fragment> {
        el.children
            .iter()
            .flat_map(|child| self.convert_node(child))
            .collect()
    }

    /// Children of `el` as blocks, inline runs wrapped into paragraphs.
    pub fn blocks(&mut self, el: &Element) -> Vec<Block> {
        let fragments = self.convert_children(el);
        into_blocks(fragments)
    }

    /// Children of `el` as a trimmed inline run, for block-level owners
    /// such as headings and table cells.
    pub fn inlines(&mut self, el: &Element) -> Vec<Inline> {
        let fragments = self.convert_children(el);
        let mut inlines = into_inlines(fragments);
        trim_run(&mut inlines);
        inlines
    }

    fn convert_element(&mut self, el: &Element) -> Vec<Fragment> {
        if self.depth >= MAX_DEPTH {
            warn!("Nesting deeper than {} levels, flattening <{}>", MAX_DEPTH, el.tag);
            return self.convert_node(&DomNode::text(el.text_content()));
        }
        self.depth += 1;
        let out = self.dispatch(el);
        self.depth -= 1;
        out
    }

    fn dispatch(&mut self, el: &Element) -> Vec<Fragment> {
        let options = self.options;
        if let Some(handler) = options.custom_handlers.get(&el.tag) {
            if let Some(out) = handler.handle(el, self) {
                return out;
            }
        }

        if let Some(m) = diagram::detect(el) {
            if m.reconstructed() {
                warn!("Reconstructed diagram source from rendered <{}>; output is lossy", el.tag);
            } else {
                debug!("Diagram source found via {:?} on <{}>", m.source, el.tag);
            }
            let reconstructed = m.reconstructed();
            return vec![Fragment::Block(Block::MermaidBlock {
                code: m.code,
                diagram_type: m.diagram_type,
                reconstructed,
            })];
        }

        match formula::detect(el) {
            Some(FormulaMatch::Formula {
                tex,
                display,
                engine,
            }) => {
                let is_display = display;
                debug!("Formula ({:?}, display={}) on <{}>", engine, is_display, el.tag);
                self.register_formula(&tex, display, Some(engine));
                let engine = Some(engine);
                return vec![if display {
                    Fragment::Block(Block::MathBlock { tex, engine })
                } else {
                    Fragment::Inline(Inline::MathInline { tex, engine })
                }];
            }
            Some(FormulaMatch::Chrome) => return Vec::new(),
            None => {}
        }

        if let Some(m) = embed::detect(el) {
            let url = m.url.as_deref().and_then(|u| self.resolve_url(u));
            debug!("Embed {:?} ({:?}) on <{}>", m.kind, m.provider, el.tag);
            self.register_embed(m.kind, url.clone(), m.provider.clone());
            return vec![Fragment::Block(Block::EmbedBlock {
                kind: m.kind,
                url,
                raw: m.raw,
                provider: m.provider,
            })];
        }

        if let Some(out) = self.builtin(el) {
            return out;
        }

        let tag = el.tag.as_str();
        if BLOCK_CONTAINERS.contains(&tag) {
            return self.blocks(el).into_iter().map(Fragment::Block).collect();
        }
        if INLINE_CONTAINERS.contains(&tag) {
            return self.convert_children(el);
        }
        self.unknown(el)
    }

    fn unknown(&mut self, el: &Element) -> Vec<Fragment> {
        if !self.options.preserve_unknown_html {
            return self.convert_children(el);
        }
        debug!("Preserving unknown <{}> as raw HTML", el.tag);
        vec![raw_html(el)]
    }

    // ── Built-in handlers ────────────────────────────────────────────────

    fn builtin(&mut self, el: &Element) -> Option<Vec<Fragment>> {
        let tag = el.tag.as_str();
        if DROPPED_TAGS.contains(&tag) {
            return Some(Vec::new());
        }
        if OPAQUE_TAGS.contains(&tag) {
            return Some(if self.options.preserve_unknown_html {
                vec![raw_html(el)]
            } else {
                Vec::new()
            });
        }
        if is_toc(el) {
            return Some(vec![Fragment::Block(Block::Toc)]);
        }
        if let Some(frontmatter) = frontmatter(el) {
            return Some(vec![Fragment::Block(frontmatter)]);
        }
        if is_footnote_section(el) {
            return Some(self.footnote_defs(el));
        }

        let out = match tag {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let depth = tag[1..].parse::<u8>().unwrap_or(1);
                let children = self.inlines(el);
                if children.is_empty() {
                    return Some(Vec::new());
                }
                vec![Fragment::Block(Block::Heading { depth, children })]
            }
            "p" => self.blocks(el).into_iter().map(Fragment::Block).collect(),
            "blockquote" => {
                let children = self.blocks(el);
                if children.is_empty() {
                    return Some(Vec::new());
                }
                vec![Fragment::Block(Block::Blockquote { children })]
            }
            "pre" => vec![Fragment::Block(code_block(el))],
            "code" | "kbd" | "samp" | "tt" => {
                let value = el.text_content();
                if value.is_empty() {
                    return Some(Vec::new());
                }
                vec![Fragment::Inline(Inline::InlineCode { value })]
            }
            "strong" | "b" => self.wrap_inline(el, |children| Inline::Strong { children }),
            "em" | "i" => self.wrap_inline(el, |children| Inline::Emphasis { children }),
            "del" | "s" | "strike" => self.wrap_inline(el, |children| Inline::Delete { children }),
            "a" => self.link(el),
            "img" => match self.image(el) {
                Some(image) => vec![Fragment::Inline(Inline::ImageInline(image))],
                None => Vec::new(),
            },
            "br" => vec![Fragment::Inline(Inline::Break)],
            "hr" => vec![Fragment::Block(Block::ThematicBreak)],
            "ul" | "ol" => self.list(el),
            "table" => table::convert_table(el, self)
                .into_iter()
                .map(Fragment::Block)
                .collect(),
            "figure" => self.figure(el),
            "dl" => self.definition_list(el),
            "details" => self.details(el),
            _ => return None,
        };
        Some(out)
    }

    /// Wrap an inline container, dropping it when it has no content.
    fn wrap_inline(
        &mut self,
        el: &Element,
        wrap: impl FnOnce(Vec<Inline>) -> Inline,
    ) -> Vec<Fragment> {
        let fragments = self.convert_children(el);
        let children = into_inlines(fragments);
        if children.is_empty() {
            return Vec::new();
        }
        let blank = children
            .iter()
            .all(|c| matches!(c, Inline::Text { value } if value.trim().is_empty()));
        if blank {
            return children.into_iter().map(Fragment::Inline).collect();
        }
        vec![Fragment::Inline(wrap(children))]
    }

    fn link(&mut self, el: &Element) -> Vec<Fragment> {
        if is_footnote_backref(el) {
            return Vec::new();
        }
        if let Some(label) = footnote_ref_label(el) {
            return vec![Fragment::Inline(Inline::FootnoteRef { label })];
        }
        let fragments = self.convert_children(el);
        let children = into_inlines(fragments);
        let href = match el.attr_nonempty("href") {
            Some(href) if !href.to_ascii_lowercase().starts_with("javascript:") => href,
            _ => return children.into_iter().map(Fragment::Inline).collect(),
        };
        let url = if href.starts_with('#') {
            Some(href.to_string())
        } else {
            self.resolve_url(href)
        };
        let Some(url) = url else {
            return children.into_iter().map(Fragment::Inline).collect();
        };
        let mut trimmed = children.clone();
        trim_run(&mut trimmed);
        if trimmed.is_empty() {
            return Vec::new();
        }
        vec![Fragment::Inline(Inline::Link {
            url,
            title: el.attr_nonempty("title").map(str::to_string),
            children,
        })]
    }

    fn list(&mut self, el: &Element) -> Vec<Fragment> {
        let ordered = el.is("ol");
        let start = if ordered {
            el.attr("start").and_then(|s| s.trim().parse::<u32>().ok())
        } else {
            None
        };

        let mut items: Vec<ListItem> = Vec::new();
        for child in &el.children {
            match child {
                DomNode::Element(li) if li.is("li") => items.push(self.list_item(li)),
                DomNode::Text { text } if text.trim().is_empty() => {}
                DomNode::Comment { .. } => {}
                other => {
                    // Stray content (often a nested list written as a sibling
                    // of its parent item) joins the previous item.
                    let blocks = into_blocks(self.convert_node(other));
                    if blocks.is_empty() {
                        continue;
                    }
                    match items.last_mut() {
                        Some(item) => item.children.extend(blocks),
                        None => items.push(ListItem {
                            checked: None,
                            children: blocks,
                        }),
                    }
                }
            }
        }
        if items.is_empty() {
            return Vec::new();
        }
        vec![Fragment::Block(Block::List(List {
            ordered,
            start,
            items,
        }))]
    }

    fn list_item(&mut self, li: &Element) -> ListItem {
        ListItem {
            checked: task_state(li),
            children: self.blocks(li),
        }
    }

    fn figure(&mut self, el: &Element) -> Vec<Fragment> {
        let mut imgs = Vec::new();
        el.find_all(&|e| e.is("img"), &mut imgs);
        if imgs.is_empty() {
            return self.blocks(el).into_iter().map(Fragment::Block).collect();
        }
        let caption = el
            .find(&|e| e.is("figcaption"))
            .map(|c| collapse_whitespace(&c.text_content()).trim().to_string())
            .filter(|c| !c.is_empty());

        let mut images: Vec<Image> = imgs.iter().filter_map(|img| self.image(img)).collect();
        if let Some(last) = images.last_mut() {
            last.caption = caption;
        }
        images
            .into_iter()
            .map(|image| Fragment::Block(Block::ImageBlock(image)))
            .collect()
    }

    fn definition_list(&mut self, el: &Element) -> Vec<Fragment> {
        let mut out = Vec::new();
        for child in el.children_elements() {
            match child.tag.as_str() {
                "dt" => {
                    let term = self.inlines(child);
                    if !term.is_empty() {
                        out.push(Fragment::Block(Block::paragraph(vec![Inline::Strong {
                            children: term,
                        }])));
                    }
                }
                "dd" => {
                    let children = self.blocks(child);
                    if !children.is_empty() {
                        out.push(Fragment::Block(Block::Blockquote { children }));
                    }
                }
                _ => out.extend(self.convert_element(child)),
            }
        }
        out
    }

    fn details(&mut self, el: &Element) -> Vec<Fragment> {
        let mut out = Vec::new();
        for child in &el.children {
            match child {
                DomNode::Element(summary) if summary.is("summary") => {
                    let children = self.inlines(summary);
                    if !children.is_empty() {
                        out.push(Fragment::Block(Block::paragraph(vec![Inline::Strong {
                            children,
                        }])));
                    }
                }
                other => out.extend(self.convert_node(other)),
            }
        }
        into_blocks(out).into_iter().map(Fragment::Block).collect()
    }

    fn footnote_defs(&mut self, el: &Element) -> Vec<Fragment> {
        let mut items = Vec::new();
        el.find_all(
            &|e| e.is("li") && (e.attr("id").is_some() || e.has_attr("data-footnote-id")),
            &mut items,
        );
        if items.is_empty() {
            el.find_all(&|e| e.is("li"), &mut items);
        }
        items
            .iter()
            .enumerate()
            .map(|(i, li)| {
                let label = li
                    .attr("id")
                    .and_then(footnote_label)
                    .or_else(|| li.attr_nonempty("data-footnote-id").map(str::to_string))
                    .unwrap_or_else(|| (i + 1).to_string());
                Fragment::Block(Block::FootnoteDef {
                    label,
                    children: self.blocks(li),
                })
            })
            .collect()
    }
}

// ── Fragment assembly ────────────────────────────────────────────────────

/// Attach fragments under a block container: each maximal inline run
/// becomes an implicit paragraph, or an image block when the run is a
/// single image.
pub fn into_blocks(fragments: Vec<Fragment>) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut run = Vec::new();
    for fragment in fragments {
        match fragment {
            Fragment::Block(block) => {
                flush_run(&mut run, &mut blocks);
                blocks.push(block);
            }
            Fragment::Inline(inline) => run.push(inline),
        }
    }
    flush_run(&mut run, &mut blocks);
    blocks
}

/// Attach fragments under an inline container: blocks are lowered and
/// separated by hard breaks.
pub fn into_inlines(fragments: Vec<Fragment>) -> Vec<Inline> {
    let mut out: Vec<Inline> = Vec::new();
    let mut after_block = false;
    for fragment in fragments {
        match fragment {
            Fragment::Inline(inline) => {
                let blank = matches!(&inline, Inline::Text { value } if value.trim().is_empty());
                if after_block && !blank {
                    out.push(Inline::Break);
                    after_block = false;
                }
                out.push(inline);
            }
            Fragment::Block(block) => {
                let inlines = block.into_inlines();
                if inlines.is_empty() {
                    continue;
                }
                if out.iter().any(|i| !is_blank(i)) {
                    out.push(Inline::Break);
                }
                out.extend(inlines);
                after_block = true;
            }
        }
    }
    normalize_inlines(out)
}

fn flush_run(run: &mut Vec<Inline>, blocks: &mut Vec<Block>) {
    let mut inlines = normalize_inlines(std::mem::take(run));
    trim_run(&mut inlines);
    if inlines.is_empty() {
        return;
    }
    if let [Inline::ImageInline(_)] = inlines.as_slice() {
        if let Some(Inline::ImageInline(image)) = inlines.pop() {
            blocks.push(Block::ImageBlock(image));
        }
        return;
    }
    blocks.push(Block::paragraph(inlines));
}

fn is_blank(inline: &Inline) -> bool {
    matches!(inline, Inline::Text { value } if value.trim().is_empty())
}

/// Merge adjacent text, drop empty text, and eat spaces around breaks.
fn normalize_inlines(inlines: Vec<Inline>) -> Vec<Inline> {
    let mut out: Vec<Inline> = Vec::with_capacity(inlines.len());
    for inline in inlines {
        match inline {
            Inline::Text { value } => {
                if value.is_empty() {
                    continue;
                }
                let value = match out.last() {
                    Some(Inline::Break) => value.trim_start().to_string(),
                    _ => value,
                };
                if value.is_empty() {
                    continue;
                }
                if let Some(Inline::Text { value: prev }) = out.last_mut() {
                    prev.push_str(&value);
                    *prev = collapse_whitespace(prev);
                } else {
                    out.push(Inline::Text { value });
                }
            }
            Inline::Break => {
                if let Some(Inline::Text { value }) = out.last_mut() {
                    let trimmed = value.trim_end().to_string();
                    if trimmed.is_empty() {
                        out.pop();
                    } else {
                        *value = trimmed;
                    }
                }
                out.push(Inline::Break);
            }
            other => out.push(other),
        }
    }
    out
}

/// Trim whitespace and breaks at both ends of a run, descending into the
/// first/last formatting container.
fn trim_run(inlines: &mut Vec<Inline>) {
    trim_start(inlines);
    trim_end(inlines);
}

fn trim_start(inlines: &mut Vec<Inline>) {
    while let Some(first) = inlines.first_mut() {
        match first {
            Inline::Text { value } => {
                let trimmed = value.trim_start().to_string();
                if !trimmed.is_empty() {
                    *value = trimmed;
                    return;
                }
            }
            Inline::Break => {}
            Inline::Emphasis { children }
            | Inline::Strong { children }
            | Inline::Delete { children }
            | Inline::Link { children, .. } => {
                trim_start(children);
                if !children.is_empty() {
                    return;
                }
            }
            _ => return,
        }
        inlines.remove(0);
    }
}

fn trim_end(inlines: &mut Vec<Inline>) {
    while let Some(last) = inlines.last_mut() {
        match last {
            Inline::Text { value } => {
                let trimmed = value.trim_end().to_string();
                if !trimmed.is_empty() {
                    *value = trimmed;
                    return;
                }
            }
            Inline::Break => {}
            Inline::Emphasis { children }
            | Inline::Strong { children }
            | Inline::Delete { children }
            | Inline::Link { children, .. } => {
                trim_end(children);
                if !children.is_empty() {
                    return;
                }
            }
            _ => return,
        }
        inlines.pop();
    }
}

/// HTML whitespace collapsing. Non-breaking spaces survive.
pub fn collapse_whitespace(text: &str) -> String {
    RE_HTML_WS.replace_all(text, " ").into_owned()
}

// ── Element helpers ──────────────────────────────────────────────────────

fn raw_html(el: &Element) -> Fragment {
    let raw = el.outer_html();
    let block = BLOCK_LEVEL_TAGS.contains(&el.tag.as_str())
        || el
            .find(&|e| BLOCK_LEVEL_TAGS.contains(&e.tag.as_str()))
            .is_some();
    if block {
        Fragment::Block(Block::HtmlBlock { raw })
    } else {
        Fragment::Inline(Inline::HtmlInline { raw })
    }
}

fn is_toc(el: &Element) -> bool {
    if !matches!(
        el.tag.as_str(),
        "div" | "nav" | "ul" | "ol" | "section" | "p" | "aside"
    ) {
        return false;
    }
    el.has_any_class(TOC_CLASSES)
        || matches!(el.attr("id"), Some("toc") | Some("table-of-contents"))
        || el.attr("role") == Some("doc-toc")
}

fn frontmatter(el: &Element) -> Option<Block> {
    let marked = el.has_attr("data-frontmatter") || el.has_class("frontmatter");
    if !marked {
        return None;
    }
    let format = el
        .attr_nonempty("data-frontmatter")
        .filter(|f| !f.eq_ignore_ascii_case("true"))
        .or_else(|| el.attr_nonempty("data-format"))
        .unwrap_or("yaml")
        .to_ascii_lowercase();
    let value = el.text_content().trim().to_string();
    Some(Block::Frontmatter { format, value })
}

fn is_footnote_section(el: &Element) -> bool {
    matches!(el.tag.as_str(), "section" | "div" | "aside" | "ol")
        && (el.has_class("footnotes")
            || el.attr("role") == Some("doc-endnotes")
            || el.has_attr("data-footnotes"))
}

fn strip_fragment_prefix(href: &str) -> &str {
    let frag = href.trim_start_matches('#');
    frag.strip_prefix("user-content-").unwrap_or(frag)
}

fn is_footnote_backref(a: &Element) -> bool {
    a.has_any_class(&["footnote-backref", "footnote-back", "reversefootnote"])
        || a.has_attr("data-footnote-backref")
        || a.attr("role") == Some("doc-backlink")
        || a.attr("href")
            .is_some_and(|h| h.starts_with('#') && strip_fragment_prefix(h).starts_with("fnref"))
}

/// `fn1`, `fn:1`, `fn-1` → `1`.
fn footnote_label(id: &str) -> Option<String> {
    let rest = strip_fragment_prefix(id).strip_prefix("fn")?;
    let first = rest.chars().next()?;
    if !(first.is_ascii_digit() || matches!(first, ':' | '-' | '_')) {
        return None;
    }
    let label = rest.trim_start_matches([':', '-', '_']);
    (!label.is_empty()).then(|| label.to_string())
}

fn footnote_ref_label(a: &Element) -> Option<String> {
    let marked = a.has_any_class(&["footnote-ref", "footnote"])
        || a.has_attr("data-footnote-ref")
        || a.attr("role") == Some("doc-noteref");
    let href = a.attr("href").filter(|h| h.starts_with('#'));
    let from_href = href.and_then(footnote_label);
    if from_href.is_some() {
        return from_href;
    }
    if !marked {
        return None;
    }
    let text = a.text_content();
    let label = text.trim().trim_start_matches('[').trim_end_matches(']').trim();
    (!label.is_empty()).then(|| label.to_string())
}

/// Tri-state task flag: the item's own checkbox (not one in a nested
/// list), or editor attributes on the item.
fn task_state(li: &Element) -> Option<bool> {
    fn checkbox(el: &Element) -> Option<&Element> {
        for child in el.children_elements() {
            if child.is("ul") || child.is("ol") {
                continue;
            }
            let is_checkbox = child.is("input")
                && child
                    .attr("type")
                    .is_some_and(|t| t.eq_ignore_ascii_case("checkbox"));
            if is_checkbox {
                return Some(child);
            }
            if let Some(found) = checkbox(child) {
                return Some(found);
            }
        }
        None
    }

    if let Some(input) = checkbox(li) {
        return Some(input.has_attr("checked"));
    }
    match li.attr("data-checked").or_else(|| li.attr("aria-checked")) {
        Some("true") => Some(true),
        Some("false") => Some(false),
        _ if li.has_class("task-list-item") => Some(li.has_class("checked")),
        _ => None,
    }
}

fn code_lang(el: &Element) -> Option<String> {
    let from_attr = ["data-lang", "data-language", "lang"]
        .iter()
        .find_map(|a| el.attr_nonempty(a));
    let from_class = || {
        el.classes().find_map(|c| {
            c.strip_prefix("language-")
                .or_else(|| c.strip_prefix("lang-"))
                .or_else(|| c.strip_prefix("highlight-source-"))
        })
    };
    from_attr
        .or_else(from_class)
        .filter(|l| !l.is_empty())
        .map(|l| l.to_ascii_lowercase())
}

fn code_block(pre: &Element) -> Block {
    let code = pre.first_child_element("code");
    let lang = code.and_then(code_lang).or_else(|| code_lang(pre));
    let mut value = String::new();
    push_code_text(pre, &mut value);
    let value = value.trim_end_matches(['\n', '\r']).to_string();
    Block::CodeBlock { lang, value }
}

/// Text of a code block, with `<br>` and per-line wrapper elements turned
/// into newlines and line-number gutters skipped.
fn push_code_text(el: &Element, out: &mut String) {
    for child in &el.children {
        match child {
            DomNode::Text { text } => out.push_str(text),
            DomNode::Comment { .. } => {}
            DomNode::Element(e) => {
                if e.is("br") {
                    out.push('\n');
                    continue;
                }
                if e.has_any_class(CODE_GUTTER_CLASSES) || DROPPED_TAGS.contains(&e.tag.as_str()) {
                    continue;
                }
                push_code_text(e, out);
                let line_wrapper = matches!(e.tag.as_str(), "div" | "p" | "li")
                    || e.has_any_class(&["line", "code-line"]);
                if line_wrapper && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
    }
}
