//! Tree-to-tree rewrites applied after conversion.
//!
//! ## Visiting
//!
//! [`visit`] walks a [`Root`] in pre-order. The visitor sees each node
//! before its children and answers with an [`Action`]:
//!
//! - `Keep`: the node stays and the walk descends into its children, which
//!   are visited and reattached in place.
//! - `Replace(nodes)`: the node is swapped for zero or more nodes of the
//!   same super-kind. Replacements are not visited again.
//! - `Remove`: the node and its subtree are dropped.
//!
//! Block and inline hooks are separate and replacements are typed
//! (`Action<Block>` / `Action<Inline>`), so a visitor cannot put an inline
//! where a block belongs.
//!
//! ## Passes
//!
//! A [`Pass`] is a total function `Root → Root`. [`compose`] left-folds a
//! tree through several passes in order; [`standard`] is
//! `remove_toc → remove_ads → clean`.

pub mod passes;

pub use passes::{
    clean, flag_complex_tables, math_to_image, remove_ads, remove_ads_with, remove_toc,
    DEFAULT_AD_PATTERNS,
};

use crate::ast::{Block, Inline, List, NodeKind, Root};

/// What to do with a visited node.
#[derive(Debug, Clone, PartialEq)]
pub enum Action<T> {
    Keep,
    Replace(Vec<T>),
    Remove,
}

/// Position of the visited node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisitContext {
    pub parent: NodeKind,
    /// Index among the parent's original children.
    pub index: usize,
    /// 0 for children of the root.
    pub depth: usize,
}

/// Callbacks for [`visit`]. Both default to [`Action::Keep`].
pub trait Visitor {
    fn block(&mut self, block: &Block, cx: &VisitContext) -> Action<Block> {
        let _ = (block, cx);
        Action::Keep
    }

    fn inline(&mut self, inline: &Inline, cx: &VisitContext) -> Action<Inline> {
        let _ = (inline, cx);
        Action::Keep
    }
}

/// Walk `root` with `visitor`, returning the rewritten tree.
pub fn visit(root: Root, visitor: &mut impl Visitor) -> Root {
    Root {
        children: visit_blocks(root.children, NodeKind::Root, 0, visitor),
    }
}

fn visit_blocks(
    blocks: Vec<Block>,
    parent: NodeKind,
    depth: usize,
    v: &mut impl Visitor,
) -> Vec<Block> {
    let mut out = Vec::with_capacity(blocks.len());
    for (index, block) in blocks.into_iter().enumerate() {
        let cx = VisitContext {
            parent,
            index,
            depth,
        };
        match v.block(&block, &cx) {
            Action::Keep => out.push(descend_block(block, depth + 1, v)),
            Action::Replace(nodes) => out.extend(nodes),
            Action::Remove => {}
        }
    }
    out
}

fn visit_inlines(
    inlines: Vec<Inline>,
    parent: NodeKind,
    depth: usize,
    v: &mut impl Visitor,
) -> Vec<Inline> {
    let mut out = Vec::with_capacity(inlines.len());
    for (index, inline) in inlines.into_iter().enumerate() {
        let cx = VisitContext {
            parent,
            index,
            depth,
        };
        match v.inline(&inline, &cx) {
            Action::Keep => out.push(descend_inline(inline, depth + 1, v)),
            Action::Replace(nodes) => out.extend(nodes),
            Action::Remove => {}
        }
    }
    out
}

fn descend_block(block: Block, depth: usize, v: &mut impl Visitor) -> Block {
    let kind = block.kind();
    match block {
        Block::Paragraph { children } => Block::Paragraph {
            children: visit_inlines(children, kind, depth, v),
        },
        Block::Heading {
            depth: level,
            children,
        } => Block::Heading {
            depth: level,
            children: visit_inlines(children, kind, depth, v),
        },
        Block::Blockquote { children } => Block::Blockquote {
            children: visit_blocks(children, kind, depth, v),
        },
        Block::FootnoteDef { label, children } => Block::FootnoteDef {
            label,
            children: visit_blocks(children, kind, depth, v),
        },
        Block::CustomBlock {
            name,
            data,
            children,
        } => Block::CustomBlock {
            name,
            data,
            children: visit_blocks(children, kind, depth, v),
        },
        Block::List(list) => Block::List(List {
            items: list
                .items
                .into_iter()
                .map(|mut item| {
                    item.children =
                        visit_blocks(item.children, NodeKind::ListItem, depth + 1, v);
                    item
                })
                .collect(),
            ..list
        }),
        Block::Table(mut table) => {
            for row in &mut table.rows {
                for cell in &mut row.cells {
                    let children = std::mem::take(&mut cell.children);
                    cell.children = visit_inlines(children, NodeKind::TableCell, depth + 1, v);
                }
            }
            Block::Table(table)
        }
        leaf @ (Block::CodeBlock { .. }
        | Block::MermaidBlock { .. }
        | Block::MathBlock { .. }
        | Block::ThematicBreak
        | Block::ImageBlock(_)
        | Block::HtmlBlock { .. }
        | Block::EmbedBlock { .. }
        | Block::Toc
        | Block::Frontmatter { .. }) => leaf,
    }
}

fn descend_inline(inline: Inline, depth: usize, v: &mut impl Visitor) -> Inline {
    let kind = inline.kind();
    match inline {
        Inline::Emphasis { children } => Inline::Emphasis {
            children: visit_inlines(children, kind, depth, v),
        },
        Inline::Strong { children } => Inline::Strong {
            children: visit_inlines(children, kind, depth, v),
        },
        Inline::Delete { children } => Inline::Delete {
            children: visit_inlines(children, kind, depth, v),
        },
        Inline::Link {
            url,
            title,
            children,
        } => Inline::Link {
            url,
            title,
            children: visit_inlines(children, kind, depth, v),
        },
        leaf @ (Inline::Text { .. }
        | Inline::InlineCode { .. }
        | Inline::ImageInline(_)
        | Inline::MathInline { .. }
        | Inline::Break
        | Inline::HtmlInline { .. }
        | Inline::FootnoteRef { .. }) => leaf,
    }
}

// ── Passes ───────────────────────────────────────────────────────────────

/// A whole-tree rewrite.
pub type Pass = Box<dyn Fn(Root) -> Root + Send + Sync>;

/// Chain passes left to right.
pub fn compose(passes: Vec<Pass>) -> Pass {
    Box::new(move |root| passes.iter().fold(root, |root, pass| pass(root)))
}

/// `remove_toc → remove_ads → clean`.
pub fn standard() -> Pass {
    let passes: Vec<Pass> = vec![Box::new(remove_toc), Box::new(remove_ads), Box::new(clean)];
    compose(passes)
}
