//! The provided passes. Each is pure and total.

use super::{visit, Action, Pass, VisitContext, Visitor};
use crate::ast::{inlines_text, Block, Image, Inline, Root};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

// ── clean ────────────────────────────────────────────────────────────────

/// Drop structurally empty nodes: empty text, formatting wrappers with no
/// text inside, and paragraphs holding nothing but whitespace and breaks.
///
/// Idempotent: a kept node always has a non-empty descendant, and this
/// pass never removes one.
pub fn clean(root: Root) -> Root {
    visit(root, &mut Clean)
}

struct Clean;

impl Visitor for Clean {
    fn block(&mut self, block: &Block, _cx: &VisitContext) -> Action<Block> {
        match block {
            Block::Paragraph { children } if children.iter().all(is_blank) => Action::Remove,
            _ => Action::Keep,
        }
    }

    fn inline(&mut self, inline: &Inline, _cx: &VisitContext) -> Action<Inline> {
        if is_void(inline) {
            Action::Remove
        } else {
            Action::Keep
        }
    }
}

/// Contributes no characters at all.
fn is_void(inline: &Inline) -> bool {
    match inline {
        Inline::Text { value } => value.is_empty(),
        Inline::Emphasis { children } | Inline::Strong { children } | Inline::Delete { children } => {
            children.iter().all(is_void)
        }
        _ => false,
    }
}

/// Contributes nothing visible.
fn is_blank(inline: &Inline) -> bool {
    match inline {
        Inline::Text { value } => value.trim().is_empty(),
        Inline::Break => true,
        Inline::Emphasis { children } | Inline::Strong { children } | Inline::Delete { children } => {
            children.iter().all(is_blank)
        }
        _ => false,
    }
}

// ── remove_toc ───────────────────────────────────────────────────────────

static RE_TOC_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(\[\[?_?toc_?\]\]?|\{:?toc\}|\$\{toc\}|@\[toc\]|<!--\s*toc\s*-->)$").unwrap()
});

/// Drop `toc` nodes and paragraphs that are only a TOC marker (`[TOC]`,
/// `[[_TOC_]]`, `${toc}`, ...).
pub fn remove_toc(root: Root) -> Root {
    visit(root, &mut RemoveToc)
}

struct RemoveToc;

impl Visitor for RemoveToc {
    fn block(&mut self, block: &Block, _cx: &VisitContext) -> Action<Block> {
        match block {
            Block::Toc => Action::Remove,
            Block::Paragraph { children } if RE_TOC_MARKER.is_match(inlines_text(children).trim()) => {
                Action::Remove
            }
            _ => Action::Keep,
        }
    }
}

// ── remove_ads ───────────────────────────────────────────────────────────

/// Boilerplate that publishing platforms reject or readers do not want.
/// Matched case-insensitively against a paragraph's whole flattened text.
pub const DEFAULT_AD_PATTERNS: &[&str] = &[
    r"^(advertisement|advertising|sponsored( content)?|promoted)$",
    r"^(subscribe|sign up) (to|for) (our|the) newsletter\b.*$",
    r"^share this (article|post|story)\b.*$",
    r"^follow us on\b.*$",
    r"^(originally published|this (article|post) (was )?(first )?(appeared|published)) (at|on|in)\b.*$",
    r"^(click|tap) here to (subscribe|download|read more)\b.*$",
    r"^(related|recommended) (articles|posts|reading):?$",
];

static DEFAULT_ADS: Lazy<Vec<Regex>> = Lazy::new(|| {
    DEFAULT_AD_PATTERNS
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
        .collect()
});

/// [`remove_ads_with`] using [`DEFAULT_AD_PATTERNS`].
pub fn remove_ads(root: Root) -> Root {
    visit(
        root,
        &mut RemoveAds {
            patterns: &DEFAULT_ADS,
        },
    )
}

/// Build a pass dropping paragraphs whose flattened text matches any of
/// `patterns`.
pub fn remove_ads_with(patterns: Vec<Regex>) -> Pass {
    Box::new(move |root| {
        visit(
            root,
            &mut RemoveAds {
                patterns: &patterns,
            },
        )
    })
}

struct RemoveAds<'a> {
    patterns: &'a [Regex],
}

impl Visitor for RemoveAds<'_> {
    fn block(&mut self, block: &Block, _cx: &VisitContext) -> Action<Block> {
        let Block::Paragraph { children } = block else {
            return Action::Keep;
        };
        let text = inlines_text(children);
        let text = text.trim();
        if !text.is_empty() && self.patterns.iter().any(|re| re.is_match(text)) {
            debug!("Removing boilerplate paragraph: {:?}", text);
            Action::Remove
        } else {
            Action::Keep
        }
    }
}

// ── math_to_image ────────────────────────────────────────────────────────

/// Build a pass replacing math nodes whose exact `tex` has a rendering in
/// `tex_to_url` with image nodes (alt = the TeX). Unmatched math stays.
///
/// The new image nodes have no asset id yet; run
/// [`crate::manifest::AssetManifest::sync`] on the result to register them.
pub fn math_to_image(tex_to_url: HashMap<String, String>) -> Pass {
    Box::new(move |root| visit(root, &mut MathToImage { urls: &tex_to_url }))
}

struct MathToImage<'a> {
    urls: &'a HashMap<String, String>,
}

impl MathToImage<'_> {
    fn image(&self, tex: &str) -> Option<Image> {
        self.urls.get(tex).map(|url| Image {
            asset_id: None,
            src: url.clone(),
            alt: Some(tex.to_string()),
            title: None,
            caption: None,
        })
    }
}

impl Visitor for MathToImage<'_> {
    fn block(&mut self, block: &Block, _cx: &VisitContext) -> Action<Block> {
        match block {
            Block::MathBlock { tex, .. } => match self.image(tex) {
                Some(image) => Action::Replace(vec![Block::ImageBlock(image)]),
                None => Action::Keep,
            },
            _ => Action::Keep,
        }
    }

    fn inline(&mut self, inline: &Inline, _cx: &VisitContext) -> Action<Inline> {
        match inline {
            Inline::MathInline { tex, .. } => match self.image(tex) {
                Some(image) => Action::Replace(vec![Inline::ImageInline(image)]),
                None => Action::Keep,
            },
            _ => Action::Keep,
        }
    }
}

// ── flag_complex_tables ──────────────────────────────────────────────────

/// Mark tables with row or column spans as needing raw-markup output.
pub fn flag_complex_tables(root: Root) -> Root {
    visit(root, &mut FlagTables)
}

struct FlagTables;

impl Visitor for FlagTables {
    fn block(&mut self, block: &Block, _cx: &VisitContext) -> Action<Block> {
        match block {
            Block::Table(table) if (table.has_rowspan || table.has_colspan) && !table.requires_html => {
                let mut table = table.clone();
                table.requires_html = true;
                Action::Replace(vec![Block::Table(table)])
            }
            _ => Action::Keep,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{List, ListItem, Table};
    use crate::transform::standard;

    fn p(text: &str) -> Block {
        Block::paragraph(vec![Inline::text(text)])
    }

    #[test]
    fn clean_drops_empty_structure() {
        let root = Root::new(vec![
            p("   "),
            Block::paragraph(vec![Inline::Break, Inline::Emphasis { children: vec![] }]),
            Block::paragraph(vec![
                Inline::text("x"),
                Inline::text(""),
                Inline::Strong {
                    children: vec![Inline::text("")],
                },
            ]),
        ]);
        let out = clean(root);
        assert_eq!(out.children, vec![p("x")]);
    }

    #[test]
    fn clean_is_idempotent() {
        let root = Root::new(vec![
            Block::paragraph(vec![Inline::Emphasis {
                children: vec![Inline::text(""), Inline::text("y"), Inline::text(" ")],
            }]),
            Block::List(List {
                ordered: false,
                start: None,
                items: vec![ListItem {
                    checked: None,
                    children: vec![p(""), p("item")],
                }],
            }),
        ]);
        let once = clean(root);
        let twice = clean(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn remove_toc_markers() {
        let root = Root::new(vec![Block::Toc, p("[TOC]"), p(" [[_TOC_]] "), p("Table stakes")]);
        assert_eq!(remove_toc(root).children, vec![p("Table stakes")]);
    }

    #[test]
    fn remove_ads_default_and_custom() {
        let root = Root::new(vec![
            p("Advertisement"),
            p("Subscribe to our newsletter for more!"),
            p("The advertisement industry grew."),
        ]);
        assert_eq!(
            remove_ads(root).children,
            vec![p("The advertisement industry grew.")]
        );

        let pass = remove_ads_with(vec![Regex::new("^Buy now").unwrap()]);
        let out = pass(Root::new(vec![p("Buy now!"), p("Advertisement")]));
        assert_eq!(out.children, vec![p("Advertisement")]);
    }

    #[test]
    fn math_to_image_only_replaces_known_tex() {
        let mut urls = HashMap::new();
        urls.insert("x^2".to_string(), "https://tex/x2.svg".to_string());
        let root = Root::new(vec![
            Block::MathBlock {
                tex: "x^2".into(),
                engine: None,
            },
            Block::paragraph(vec![
                Inline::MathInline {
                    tex: "x^2".into(),
                    engine: None,
                },
                Inline::MathInline {
                    tex: "y".into(),
                    engine: None,
                },
            ]),
        ]);
        let out = math_to_image(urls)(root);
        match &out.children[0] {
            Block::ImageBlock(img) => {
                assert_eq!(img.src, "https://tex/x2.svg");
                assert_eq!(img.alt.as_deref(), Some("x^2"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match &out.children[1] {
            Block::Paragraph { children } => {
                assert!(matches!(children[0], Inline::ImageInline(_)));
                assert!(matches!(children[1], Inline::MathInline { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn flags_span_tables() {
        let root = Root::new(vec![
            Block::Table(Table {
                has_colspan: true,
                ..Default::default()
            }),
            Block::Table(Table::default()),
        ]);
        let out = flag_complex_tables(root);
        let flags: Vec<bool> = out
            .children
            .iter()
            .map(|b| matches!(b, Block::Table(t) if t.requires_html))
            .collect();
        assert_eq!(flags, vec![true, false]);
    }

    #[test]
    fn standard_pipeline() {
        let root = Root::new(vec![p("[toc]"), p("Sponsored"), p(""), p("Body")]);
        assert_eq!(standard()(root).children, vec![p("Body")]);
    }
}
