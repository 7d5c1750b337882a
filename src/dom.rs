//! The input document tree.
//!
//! The conversion engine does not care where a tree came from: a browser
//! DOM snapshot, an editor's export, or HTML text run through
//! [`parse_html`]. It only needs tag names, attributes, ordered children and
//! text, which is exactly what [`DomNode`] holds.

use html5ever::driver::ParseOpts;
use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use html5ever::tree_builder::TreeBuilderOpts;
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use serde::{Deserialize, Serialize};

/// A node of the input tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DomNode {
    Element(Element),
    Text { text: String },
    Comment { text: String },
}

/// An element with a lower-cased tag name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub tag: String,
    #[serde(default)]
    pub attrs: Vec<(String, String)>,
    #[serde(default)]
    pub children: Vec<DomNode>,
}

/// Elements with no closing tag when serialised.
const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

impl DomNode {
    pub fn text(text: impl Into<String>) -> Self {
        DomNode::Text { text: text.into() }
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            DomNode::Element(el) => Some(el),
            DomNode::Text { .. } | DomNode::Comment { .. } => None,
        }
    }

    /// Concatenated text of this node and all descendants.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.push_text(&mut out);
        out
    }

    fn push_text(&self, out: &mut String) {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                DomNode::Element(el) => stack.extend(el.children.iter().rev()),
                DomNode::Text { text } => out.push_str(text),
                DomNode::Comment { .. } => {}
            }
        }
    }

    pub fn to_html(&self) -> String {
        let mut out = String::new();
        write_html(vec![Step::Node(self)], &mut out);
        out
    }
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into().to_ascii_lowercase(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs
            .push((name.into().to_ascii_lowercase(), value.into()));
        self
    }

    pub fn with_child(mut self, child: impl Into<DomNode>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_child(DomNode::text(text))
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Attribute value, ignoring empty/whitespace-only values.
    pub fn attr_nonempty(&self, name: &str) -> Option<&str> {
        self.attr(name).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn is(&self, tag: &str) -> bool {
        self.tag == tag
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or("").split_ascii_whitespace()
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes().any(|c| c == class)
    }

    pub fn has_any_class(&self, classes: &[&str]) -> bool {
        self.classes().any(|c| classes.contains(&c))
    }

    /// Value of a single declaration in the inline `style` attribute.
    pub fn style(&self, property: &str) -> Option<String> {
        self.attr("style")?.split(';').find_map(|decl| {
            let (name, value) = decl.split_once(':')?;
            if name.trim().eq_ignore_ascii_case(property) {
                Some(value.trim().to_ascii_lowercase())
            } else {
                None
            }
        })
    }

    /// Hidden through the `hidden` attribute or an inline `display:none`.
    pub fn is_hidden(&self) -> bool {
        self.has_attr("hidden")
            || self.style("display").as_deref() == Some("none")
            || self.attr("aria-hidden") == Some("true") && self.children_elements().count() == 0
    }

    pub fn children_elements(&self) -> impl DoubleEndedIterator<Item = &Element> {
        self.children.iter().filter_map(DomNode::as_element)
    }

    pub fn first_child_element(&self, tag: &str) -> Option<&Element> {
        self.children_elements().find(|el| el.is(tag))
    }

    /// Descendant elements in document order, excluding `self`.
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants {
            stack: self.children_elements().rev().collect(),
        }
    }

    /// First descendant (depth first, excluding `self`) matching `pred`.
    pub fn find(&self, pred: &impl Fn(&Element) -> bool) -> Option<&Element> {
        self.descendants().find(|el| pred(el))
    }

    /// All descendants (depth first, excluding `self`) matching `pred`.
    pub fn find_all<'a>(&'a self, pred: &impl Fn(&Element) -> bool, out: &mut Vec<&'a Element>) {
        out.extend(self.descendants().filter(|el| pred(el)));
    }

    pub fn text_content(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            child.push_text(&mut out);
        }
        out
    }

    pub fn is_void(&self) -> bool {
        VOID_TAGS.contains(&self.tag.as_str())
    }

    /// Serialise back to HTML, used for opaque `htmlBlock`/`htmlInline` nodes.
    pub fn outer_html(&self) -> String {
        let mut out = String::new();
        write_html(vec![Step::Element(self)], &mut out);
        out
    }

    fn write_open_tag(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.tag);
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape_attr(value));
            out.push('"');
        }
        out.push('>');
    }
}

/// Pre-order iterator over descendant elements.
pub struct Descendants<'a> {
    stack: Vec<&'a Element>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a Element;

    fn next(&mut self) -> Option<&'a Element> {
        let el = self.stack.pop()?;
        self.stack.extend(el.children_elements().rev());
        Some(el)
    }
}

enum Step<'a> {
    Node(&'a DomNode),
    Element(&'a Element),
    Close(&'a str),
}

fn write_html(mut stack: Vec<Step<'_>>, out: &mut String) {
    while let Some(step) = stack.pop() {
        match step {
            Step::Node(DomNode::Element(el)) => stack.push(Step::Element(el)),
            Step::Node(DomNode::Text { text }) => out.push_str(&escape_text(text)),
            Step::Node(DomNode::Comment { text }) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
            Step::Element(el) => {
                el.write_open_tag(out);
                if !el.is_void() {
                    stack.push(Step::Close(&el.tag));
                    stack.extend(el.children.iter().rev().map(Step::Node));
                }
            }
            Step::Close(tag) => {
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }
}

impl From<Element> for DomNode {
    fn from(el: Element) -> Self {
        DomNode::Element(el)
    }
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;")
}

// ── HTML front-end ───────────────────────────────────────────────────────

/// Element depth past which parsed subtrees are kept as their text only.
/// Deeper than the converter's own flattening depth, so conversion output
/// is unaffected.
pub const MAX_PARSE_DEPTH: usize = 256;

/// Parse an HTML string into a tree rooted at a synthetic `#document`
/// element. html5ever never rejects input, so neither does this.
pub fn parse_html(html: &str) -> DomNode {
    let opts = ParseOpts {
        tree_builder: TreeBuilderOpts {
            drop_doctype: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let dom = parse_document(RcDom::default(), opts).one(html);
    let mut root = Element::new("#document");
    root.children = lower_children(&dom.document, 0);
    DomNode::Element(root)
}

fn lower_children(handle: &Handle, depth: usize) -> Vec<DomNode> {
    handle
        .children
        .borrow()
        .iter()
        .filter_map(|child| lower_node(child, depth))
        .collect()
}

fn lower_node(handle: &Handle, depth: usize) -> Option<DomNode> {
    if depth >= MAX_PARSE_DEPTH && matches!(handle.data, NodeData::Element { .. }) {
        return Some(DomNode::text(collect_text(handle)));
    }
    match &handle.data {
        NodeData::Element {
            name,
            attrs,
            template_contents,
            ..
        } => {
            let mut el = Element::new(name.local.to_string());
            el.attrs = attrs
                .borrow()
                .iter()
                .map(|a| (a.name.local.to_string(), a.value.to_string()))
                .collect();
            el.children = match template_contents.borrow().as_ref() {
                Some(contents) => lower_children(contents, depth + 1),
                None => lower_children(handle, depth + 1),
            };
            Some(DomNode::Element(el))
        }
        NodeData::Text { contents } => Some(DomNode::text(contents.borrow().to_string())),
        NodeData::Comment { contents } => Some(DomNode::Comment {
            text: contents.to_string(),
        }),
        NodeData::Document => {
            let mut el = Element::new("#document");
            el.children = lower_children(handle, depth + 1);
            Some(DomNode::Element(el))
        }
        NodeData::Doctype { .. } | NodeData::ProcessingInstruction { .. } => None,
    }
}

fn collect_text(handle: &Handle) -> String {
    let mut out = String::new();
    let mut stack = vec![handle.clone()];
    while let Some(node) = stack.pop() {
        if let NodeData::Text { contents } = &node.data {
            out.push_str(&contents.borrow());
        }
        stack.extend(node.children.borrow().iter().rev().cloned());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_html_builds_tree() {
        let root = parse_html("<p class=\"a b\">Hello <b>world</b></p>");
        let doc = root.as_element().unwrap();
        let mut ps = Vec::new();
        doc.find_all(&|el| el.is("p"), &mut ps);
        assert_eq!(ps.len(), 1);
        assert!(ps[0].has_class("b"));
        assert_eq!(ps[0].text_content(), "Hello world");
    }

    #[test]
    fn style_lookup_is_case_insensitive() {
        let el = Element::new("td").with_attr("style", "color: red; Text-Align: Center");
        assert_eq!(el.style("text-align").as_deref(), Some("center"));
        assert_eq!(el.style("width"), None);
    }

    #[test]
    fn outer_html_escapes() {
        let el = Element::new("span")
            .with_attr("title", "a\"b")
            .with_text("1 < 2");
        assert_eq!(el.outer_html(), "<span title=\"a&quot;b\">1 &lt; 2</span>");
    }

    #[test]
    fn deep_parse_keeps_text_below_the_cap() {
        let depth = 10_000;
        let html = format!("{}deep{}", "<span>".repeat(depth), "</span>".repeat(depth));
        let root = parse_html(&html);
        assert!(root.text_content().contains("deep"));

        let doc = root.as_element().unwrap();
        let nested = doc.descendants().count();
        assert!(nested <= MAX_PARSE_DEPTH + 1, "{nested} elements kept");
        assert!(doc.outer_html().contains("deep"));
    }

    #[test]
    fn descendants_are_in_document_order() {
        let el = Element::new("div")
            .with_child(Element::new("a").with_child(Element::new("b")))
            .with_child(Element::new("c"));
        let tags: Vec<&str> = el.descendants().map(|e| e.tag.as_str()).collect();
        assert_eq!(tags, ["a", "b", "c"]);
        assert_eq!(el.find(&|e| e.is("c")).map(|e| e.tag.as_str()), Some("c"));
    }

    #[test]
    fn void_elements_have_no_close_tag() {
        let el = Element::new("img").with_attr("src", "x.png");
        assert_eq!(el.outer_html(), "<img src=\"x.png\">");
    }
}
