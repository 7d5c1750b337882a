//! The canonical document AST.
//!
//! Every source dialect (rendered HTML from any editor or site) is lowered
//! into this one tree. Two super-kinds exist, [`Block`] and [`Inline`], under
//! a single [`Root`]. The split is enforced by the types: a `Vec<Block>` can
//! never hold an inline node, so the "no bare inline under a block container"
//! rule is checked by the compiler rather than at runtime.
//!
//! Image nodes carry only a manifest id plus their source reference. The
//! binary payloads live in [`crate::manifest::AssetManifest`], which keeps the
//! tree small and serialisable on its own.

use serde::{Deserialize, Serialize};

/// Manifest-local identifier of an extracted asset (`img_1`, `formula_3`, ...).
pub type AssetId = String;

/// The document root. Holds block children only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Root {
    pub children: Vec<Block>,
}

/// Column or cell alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    Left,
    Center,
    Right,
}

/// The rendering engine a formula was recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MathEngine {
    Katex,
    Mathjax,
    Mathml,
    /// Formula shipped as an image whose alt/data attribute holds the TeX.
    Image,
    Generic,
}

/// Broad category of an embedded resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedKind {
    Video,
    Audio,
    Iframe,
    Social,
    Code,
}

/// Shared payload of `imageBlock` and `imageInline`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// `None` only for self-contained `data:` images, which never enter the manifest.
    pub asset_id: Option<AssetId>,
    /// Resolved absolute URL, `local://<id>`, or an untouched `data:` URI.
    pub src: String,
    pub alt: Option<String>,
    pub title: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List {
    pub ordered: bool,
    pub start: Option<u32>,
    pub items: Vec<ListItem>,
}

/// A list item. `checked` is tri-state: `Some(true)`, `Some(false)`, or
/// `None` for an ordinary (non-task) item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub checked: Option<bool>,
    pub children: Vec<Block>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    /// Per-column alignment, taken from the header row (or first row).
    pub align: Vec<Option<Align>>,
    pub rows: Vec<TableRow>,
    pub has_rowspan: bool,
    pub has_colspan: bool,
    /// Set by [`crate::transform::passes::flag_complex_tables`]: the table
    /// cannot be expressed as a simple grid and needs raw-markup output.
    pub requires_html: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub cells: Vec<TableCell>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableCell {
    pub header: bool,
    pub align: Option<Align>,
    pub rowspan: Option<u32>,
    pub colspan: Option<u32>,
    pub children: Vec<Inline>,
}

/// Block-level nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Block {
    Paragraph {
        children: Vec<Inline>,
    },
    Heading {
        depth: u8,
        children: Vec<Inline>,
    },
    Blockquote {
        children: Vec<Block>,
    },
    List(List),
    CodeBlock {
        lang: Option<String>,
        value: String,
    },
    MermaidBlock {
        code: String,
        diagram_type: Option<String>,
        /// Source was regenerated from rendered output and is lossy.
        reconstructed: bool,
    },
    MathBlock {
        tex: String,
        engine: Option<MathEngine>,
    },
    ThematicBreak,
    ImageBlock(Image),
    Table(Table),
    HtmlBlock {
        raw: String,
    },
    EmbedBlock {
        kind: EmbedKind,
        url: Option<String>,
        raw: Option<String>,
        provider: Option<String>,
    },
    FootnoteDef {
        label: String,
        children: Vec<Block>,
    },
    Toc,
    Frontmatter {
        format: String,
        value: String,
    },
    CustomBlock {
        name: String,
        data: serde_json::Value,
        children: Vec<Block>,
    },
}

/// Inline-level nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Inline {
    Text {
        value: String,
    },
    Emphasis {
        children: Vec<Inline>,
    },
    Strong {
        children: Vec<Inline>,
    },
    Delete {
        children: Vec<Inline>,
    },
    InlineCode {
        value: String,
    },
    Link {
        url: String,
        title: Option<String>,
        children: Vec<Inline>,
    },
    ImageInline(Image),
    MathInline {
        tex: String,
        engine: Option<MathEngine>,
    },
    Break,
    HtmlInline {
        raw: String,
    },
    FootnoteRef {
        label: String,
    },
}

/// Fieldless discriminant of every node kind, used as the `parent` in
/// visitor callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Root,
    Paragraph,
    Heading,
    Blockquote,
    List,
    ListItem,
    CodeBlock,
    MermaidBlock,
    MathBlock,
    ThematicBreak,
    ImageBlock,
    Table,
    TableRow,
    TableCell,
    HtmlBlock,
    EmbedBlock,
    FootnoteDef,
    Toc,
    Frontmatter,
    CustomBlock,
    Text,
    Emphasis,
    Strong,
    Delete,
    InlineCode,
    Link,
    ImageInline,
    MathInline,
    Break,
    HtmlInline,
    FootnoteRef,
}

impl Root {
    pub fn new(children: Vec<Block>) -> Self {
        Self { children }
    }

    /// Visit every image node (block and inline) mutably, in document order.
    pub fn for_each_image_mut(&mut self, f: &mut impl FnMut(&mut Image)) {
        for block in &mut self.children {
            block.for_each_image_mut(f);
        }
    }

    /// Visit every block in document order, depth first.
    pub fn for_each_block(&self, f: &mut impl FnMut(&Block)) {
        for block in &self.children {
            block.for_each_block(f);
        }
    }

    /// Visit every inline in document order, depth first.
    pub fn for_each_inline(&self, f: &mut impl FnMut(&Inline)) {
        self.for_each_block(&mut |block| {
            for inline in block.inline_children() {
                inline.for_each_inline(f);
            }
        });
    }
}

impl Block {
    pub fn paragraph(children: Vec<Inline>) -> Self {
        Block::Paragraph { children }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Block::Paragraph { .. } => NodeKind::Paragraph,
            Block::Heading { .. } => NodeKind::Heading,
            Block::Blockquote { .. } => NodeKind::Blockquote,
            Block::List(_) => NodeKind::List,
            Block::CodeBlock { .. } => NodeKind::CodeBlock,
            Block::MermaidBlock { .. } => NodeKind::MermaidBlock,
            Block::MathBlock { .. } => NodeKind::MathBlock,
            Block::ThematicBreak => NodeKind::ThematicBreak,
            Block::ImageBlock(_) => NodeKind::ImageBlock,
            Block::Table(_) => NodeKind::Table,
            Block::HtmlBlock { .. } => NodeKind::HtmlBlock,
            Block::EmbedBlock { .. } => NodeKind::EmbedBlock,
            Block::FootnoteDef { .. } => NodeKind::FootnoteDef,
            Block::Toc => NodeKind::Toc,
            Block::Frontmatter { .. } => NodeKind::Frontmatter,
            Block::CustomBlock { .. } => NodeKind::CustomBlock,
        }
    }

    /// Inline children held directly by this block (not by nested blocks).
    /// Table cells count as direct children of their table.
    pub fn inline_children(&self) -> Vec<&Inline> {
        match self {
            Block::Paragraph { children } | Block::Heading { children, .. } => {
                children.iter().collect()
            }
            Block::Table(table) => table
                .rows
                .iter()
                .flat_map(|row| row.cells.iter())
                .flat_map(|cell| cell.children.iter())
                .collect(),
            Block::Blockquote { .. }
            | Block::List(_)
            | Block::CodeBlock { .. }
            | Block::MermaidBlock { .. }
            | Block::MathBlock { .. }
            | Block::ThematicBreak
            | Block::ImageBlock(_)
            | Block::HtmlBlock { .. }
            | Block::EmbedBlock { .. }
            | Block::FootnoteDef { .. }
            | Block::Toc
            | Block::Frontmatter { .. }
            | Block::CustomBlock { .. } => Vec::new(),
        }
    }

    pub fn for_each_block(&self, f: &mut impl FnMut(&Block)) {
        f(self);
        match self {
            Block::Blockquote { children }
            | Block::FootnoteDef { children, .. }
            | Block::CustomBlock { children, .. } => {
                for child in children {
                    child.for_each_block(f);
                }
            }
            Block::List(list) => {
                for item in &list.items {
                    for child in &item.children {
                        child.for_each_block(f);
                    }
                }
            }
            Block::Paragraph { .. }
            | Block::Heading { .. }
            | Block::CodeBlock { .. }
            | Block::MermaidBlock { .. }
            | Block::MathBlock { .. }
            | Block::ThematicBreak
            | Block::ImageBlock(_)
            | Block::Table(_)
            | Block::HtmlBlock { .. }
            | Block::EmbedBlock { .. }
            | Block::Toc
            | Block::Frontmatter { .. } => {}
        }
    }

    pub fn for_each_image_mut(&mut self, f: &mut impl FnMut(&mut Image)) {
        match self {
            Block::ImageBlock(image) => f(image),
            Block::Paragraph { children } | Block::Heading { children, .. } => {
                for inline in children {
                    inline.for_each_image_mut(f);
                }
            }
            Block::Blockquote { children }
            | Block::FootnoteDef { children, .. }
            | Block::CustomBlock { children, .. } => {
                for child in children {
                    child.for_each_image_mut(f);
                }
            }
            Block::List(list) => {
                for item in &mut list.items {
                    for child in &mut item.children {
                        child.for_each_image_mut(f);
                    }
                }
            }
            Block::Table(table) => {
                for cell in table.rows.iter_mut().flat_map(|r| r.cells.iter_mut()) {
                    for inline in &mut cell.children {
                        inline.for_each_image_mut(f);
                    }
                }
            }
            Block::CodeBlock { .. }
            | Block::MermaidBlock { .. }
            | Block::MathBlock { .. }
            | Block::ThematicBreak
            | Block::HtmlBlock { .. }
            | Block::EmbedBlock { .. }
            | Block::Toc
            | Block::Frontmatter { .. } => {}
        }
    }

    /// Flattened plain text of this block and everything below it.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        self.push_text(&mut out);
        out
    }

    fn push_text(&self, out: &mut String) {
        match self {
            Block::Paragraph { children } | Block::Heading { children, .. } => {
                push_inlines_text(children, out)
            }
            Block::Blockquote { children }
            | Block::FootnoteDef { children, .. }
            | Block::CustomBlock { children, .. } => {
                for child in children {
                    child.push_text(out);
                }
            }
            Block::List(list) => {
                for item in &list.items {
                    for child in &item.children {
                        child.push_text(out);
                    }
                }
            }
            Block::CodeBlock { value, .. } => out.push_str(value),
            Block::MermaidBlock { code, .. } => out.push_str(code),
            Block::MathBlock { tex, .. } => out.push_str(tex),
            Block::ImageBlock(image) => {
                if let Some(alt) = &image.alt {
                    out.push_str(alt);
                }
            }
            Block::Table(table) => {
                for cell in table.rows.iter().flat_map(|r| r.cells.iter()) {
                    push_inlines_text(&cell.children, out);
                }
            }
            Block::HtmlBlock { raw } => out.push_str(raw),
            Block::ThematicBreak
            | Block::EmbedBlock { .. }
            | Block::Toc
            | Block::Frontmatter { .. } => {}
        }
    }

    /// Lower a block into inline content, for containers that only accept
    /// inlines (table cells, links, headings).
    pub fn into_inlines(self) -> Vec<Inline> {
        match self {
            Block::Paragraph { children } | Block::Heading { children, .. } => children,
            Block::Blockquote { children }
            | Block::FootnoteDef { children, .. }
            | Block::CustomBlock { children, .. } => join_blocks(children),
            Block::List(list) => join_blocks(
                list.items
                    .into_iter()
                    .flat_map(|item| item.children)
                    .collect(),
            ),
            Block::CodeBlock { value, .. } => vec![Inline::InlineCode { value }],
            Block::MermaidBlock { code, .. } => vec![Inline::InlineCode { value: code }],
            Block::MathBlock { tex, engine } => vec![Inline::MathInline { tex, engine }],
            Block::ImageBlock(image) => vec![Inline::ImageInline(image)],
            Block::Table(table) => {
                let rows = table
                    .rows
                    .into_iter()
                    .map(|row| {
                        let mut line = Vec::new();
                        for (i, cell) in row.cells.into_iter().enumerate() {
                            if i > 0 {
                                line.push(Inline::text(" "));
                            }
                            line.extend(cell.children);
                        }
                        Block::paragraph(line)
                    })
                    .collect();
                join_blocks(rows)
            }
            Block::HtmlBlock { raw } => vec![Inline::HtmlInline { raw }],
            Block::EmbedBlock { url, .. } => match url {
                Some(url) => vec![Inline::Link {
                    children: vec![Inline::text(url.clone())],
                    url,
                    title: None,
                }],
                None => Vec::new(),
            },
            Block::ThematicBreak | Block::Toc | Block::Frontmatter { .. } => Vec::new(),
        }
    }
}

fn join_blocks(blocks: Vec<Block>) -> Vec<Inline> {
    let mut out = Vec::new();
    for block in blocks {
        let inlines = block.into_inlines();
        if inlines.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(Inline::Break);
        }
        out.extend(inlines);
    }
    out
}

impl Inline {
    pub fn text(value: impl Into<String>) -> Self {
        Inline::Text {
            value: value.into(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Inline::Text { .. } => NodeKind::Text,
            Inline::Emphasis { .. } => NodeKind::Emphasis,
            Inline::Strong { .. } => NodeKind::Strong,
            Inline::Delete { .. } => NodeKind::Delete,
            Inline::InlineCode { .. } => NodeKind::InlineCode,
            Inline::Link { .. } => NodeKind::Link,
            Inline::ImageInline(_) => NodeKind::ImageInline,
            Inline::MathInline { .. } => NodeKind::MathInline,
            Inline::Break => NodeKind::Break,
            Inline::HtmlInline { .. } => NodeKind::HtmlInline,
            Inline::FootnoteRef { .. } => NodeKind::FootnoteRef,
        }
    }

    pub fn children(&self) -> &[Inline] {
        match self {
            Inline::Emphasis { children }
            | Inline::Strong { children }
            | Inline::Delete { children }
            | Inline::Link { children, .. } => children,
            Inline::Text { .. }
            | Inline::InlineCode { .. }
            | Inline::ImageInline(_)
            | Inline::MathInline { .. }
            | Inline::Break
            | Inline::HtmlInline { .. }
            | Inline::FootnoteRef { .. } => &[],
        }
    }

    pub fn for_each_inline(&self, f: &mut impl FnMut(&Inline)) {
        f(self);
        for child in self.children() {
            child.for_each_inline(f);
        }
    }

    pub fn for_each_image_mut(&mut self, f: &mut impl FnMut(&mut Image)) {
        match self {
            Inline::ImageInline(image) => f(image),
            Inline::Emphasis { children }
            | Inline::Strong { children }
            | Inline::Delete { children }
            | Inline::Link { children, .. } => {
                for child in children {
                    child.for_each_image_mut(f);
                }
            }
            Inline::Text { .. }
            | Inline::InlineCode { .. }
            | Inline::MathInline { .. }
            | Inline::Break
            | Inline::HtmlInline { .. }
            | Inline::FootnoteRef { .. } => {}
        }
    }

    fn push_text(&self, out: &mut String) {
        match self {
            Inline::Text { value } | Inline::InlineCode { value } => out.push_str(value),
            Inline::Emphasis { children }
            | Inline::Strong { children }
            | Inline::Delete { children }
            | Inline::Link { children, .. } => push_inlines_text(children, out),
            Inline::ImageInline(image) => {
                if let Some(alt) = &image.alt {
                    out.push_str(alt);
                }
            }
            Inline::MathInline { tex, .. } => out.push_str(tex),
            Inline::Break => out.push('\n'),
            Inline::HtmlInline { raw } => out.push_str(raw),
            Inline::FootnoteRef { .. } => {}
        }
    }
}

fn push_inlines_text(inlines: &[Inline], out: &mut String) {
    for inline in inlines {
        inline.push_text(out);
    }
}

/// Flattened plain text of an inline run.
pub fn inlines_text(inlines: &[Inline]) -> String {
    let mut out = String::new();
    push_inlines_text(inlines, &mut out);
    out
}
