//! Diagram-as-code detection.
//!
//! Editors render Mermaid diagrams to SVG and keep the source in one of
//! several places, if at all. Each place gets its own pure extractor; they
//! are tried in a fixed priority order and the first hit wins:
//!
//! 1. marker class + source attribute (`<div class="mermaid" data-source="…">`)
//! 2. dedicated `data-*` source attribute on any element
//! 3. a hidden source element nested in a marker-class container
//! 4. a `<script type="text/x-mermaid">` payload
//! 5. un-rendered text matched against the Mermaid header/arrow grammar
//! 6. reconstruction from the rendered SVG
//!
//! Step 6 only sees node and edge labels, so its output is pseudo-source
//! flagged `reconstructed`. It is lossy and never fails: when nothing can be
//! read, detection simply does not match.

use crate::dom::Element;
use once_cell::sync::Lazy;
use regex::Regex;

const MARKER_CLASSES: &[&str] = &[
    "mermaid",
    "mermaid-diagram",
    "mermaid-container",
    "diagram-mermaid",
];

const MARKER_SOURCE_ATTRS: &[&str] = &[
    "data-source",
    "data-code",
    "data-content",
    "data-mermaid-source",
    "data-diagram-source",
    "data-graph",
];

const DATA_SOURCE_ATTRS: &[&str] = &[
    "data-mermaid",
    "data-mermaid-code",
    "data-mermaid-source",
    "data-diagram-code",
];

const HIDDEN_SOURCE_CLASSES: &[&str] = &["mermaid-source", "diagram-source", "mermaid-code"];

const SCRIPT_TYPES: &[&str] = &["text/x-mermaid", "text/mermaid", "application/mermaid"];

const LANGUAGE_CLASSES: &[&str] = &["language-mermaid", "lang-mermaid"];

static RE_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:(graph|flowchart)(?:\s+(?:TB|TD|BT|RL|LR))?\s*$|(sequenceDiagram|classDiagram(?:-v2)?|stateDiagram(?:-v2)?|erDiagram|gantt|pie|journey|gitGraph|mindmap|timeline|quadrantChart|requirementDiagram|C4Context|sankey-beta|xychart-beta|block-beta)\b)",
    )
    .unwrap()
});

static RE_ARROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(-->|---|->>|-->>|==>|-\.->|--[xo]\b|<\|--)").unwrap());

/// Where the source came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagramSource {
    MarkerAttribute,
    DataAttribute,
    HiddenSource,
    Script,
    RawText,
    Reconstructed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagramMatch {
    pub code: String,
    pub diagram_type: Option<String>,
    pub source: DiagramSource,
}

impl DiagramMatch {
    pub fn reconstructed(&self) -> bool {
        self.source == DiagramSource::Reconstructed
    }
}

type Extractor = fn(&Element) -> Option<String>;

const EXTRACTORS: &[(DiagramSource, Extractor)] = &[
    (DiagramSource::MarkerAttribute, from_marker_attribute),
    (DiagramSource::DataAttribute, from_data_attribute),
    (DiagramSource::HiddenSource, from_hidden_source),
    (DiagramSource::Script, from_script),
    (DiagramSource::RawText, from_raw_text),
];

/// Run the cascade against one element.
pub fn detect(el: &Element) -> Option<DiagramMatch> {
    for (source, extract) in EXTRACTORS {
        if let Some(code) = extract(el) {
            let code = code.trim().to_string();
            if code.is_empty() {
                continue;
            }
            let diagram_type = el
                .attr_nonempty("data-diagram-type")
                .map(str::to_string)
                .or_else(|| diagram_type(&code));
            return Some(DiagramMatch {
                code,
                diagram_type,
                source: *source,
            });
        }
    }
    reconstruct(el).map(|(code, diagram_type)| DiagramMatch {
        code,
        diagram_type,
        source: DiagramSource::Reconstructed,
    })
}

/// Whether `text` reads as Mermaid: a known header on the first
/// meaningful line, or (with `loose`) any arrow token.
pub fn looks_like_mermaid(text: &str, loose: bool) -> bool {
    match first_line(text) {
        Some(line) if RE_HEADER.is_match(line) => true,
        Some(_) => loose && RE_ARROW.is_match(text),
        None => false,
    }
}

/// Diagram type from the header keyword (`graph` is reported as `flowchart`).
pub fn diagram_type(code: &str) -> Option<String> {
    let caps = RE_HEADER.captures(first_line(code)?)?;
    if caps.get(1).is_some() {
        return Some("flowchart".to_string());
    }
    let kw = caps.get(2)?.as_str();
    Some(kw.trim_end_matches("-v2").to_string())
}

fn first_line(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("%%"))
}

fn is_marker(el: &Element) -> bool {
    el.has_any_class(MARKER_CLASSES)
}

fn has_svg(el: &Element) -> bool {
    el.is("svg") || el.find(&|e| e.is("svg")).is_some()
}

// ── Extractors ───────────────────────────────────────────────────────────

fn from_marker_attribute(el: &Element) -> Option<String> {
    if !is_marker(el) {
        return None;
    }
    MARKER_SOURCE_ATTRS
        .iter()
        .find_map(|a| el.attr_nonempty(a))
        .map(str::to_string)
}

fn from_data_attribute(el: &Element) -> Option<String> {
    DATA_SOURCE_ATTRS
        .iter()
        .filter_map(|a| el.attr_nonempty(a))
        .find(|v| looks_like_mermaid(v, true))
        .map(str::to_string)
}

fn from_hidden_source(el: &Element) -> Option<String> {
    if !is_marker(el) {
        return None;
    }
    let hidden = el.find(&|e| {
        e.has_any_class(HIDDEN_SOURCE_CLASSES)
            || e.is("textarea")
            || e.is("template")
            || (e.is_hidden() && !e.is("svg"))
    })?;
    let text = hidden.text_content();
    looks_like_mermaid(&text, true).then_some(text)
}

fn from_script(el: &Element) -> Option<String> {
    let is_diagram_script = |e: &Element| {
        e.is("script")
            && e.attr("type")
                .is_some_and(|t| SCRIPT_TYPES.contains(&t.trim().to_ascii_lowercase().as_str()))
    };
    if is_diagram_script(el) {
        return Some(el.text_content());
    }
    if is_marker(el) {
        return el.find(&is_diagram_script).map(Element::text_content);
    }
    None
}

fn from_raw_text(el: &Element) -> Option<String> {
    // Explicitly tagged code: trust the tag.
    if el.is("pre") || el.is("code") {
        let tagged = |e: &Element| {
            e.has_any_class(LANGUAGE_CLASSES)
                || e.has_class("mermaid")
                || e.attr("lang") == Some("mermaid")
                || e.attr("data-lang") == Some("mermaid")
                || e.attr("data-language") == Some("mermaid")
        };
        if tagged(el) || el.first_child_element("code").is_some_and(tagged) {
            return Some(el.text_content());
        }
        // Untagged `pre`: require a strict header.
        if el.is("pre") && el.attr("lang").is_none() {
            let code = el.first_child_element("code");
            let lang_tagged = code.is_some_and(|c| c.classes().any(|k| k.starts_with("language-")));
            let text = el.text_content();
            if !lang_tagged && looks_like_mermaid(&text, false) {
                return Some(text);
            }
        }
        return None;
    }
    if is_marker(el) && !has_svg(el) {
        let text = el.text_content();
        if looks_like_mermaid(&text, true) {
            return Some(text);
        }
    }
    None
}

// ── Reconstruction ───────────────────────────────────────────────────────

fn reconstruct(el: &Element) -> Option<(String, Option<String>)> {
    let svg = if el.is("svg") {
        let mermaid_svg = el.attr("id").is_some_and(|id| id.starts_with("mermaid"))
            || el.has_attr("aria-roledescription");
        if !mermaid_svg {
            return None;
        }
        el
    } else if is_marker(el) {
        el.find(&|e| e.is("svg"))?
    } else {
        return None;
    };

    let role = svg
        .attr("aria-roledescription")
        .map(|r| r.to_ascii_lowercase())
        .unwrap_or_default();

    if role.starts_with("sequence") || svg.find(&|e| e.has_class("actor")).is_some() {
        return reconstruct_sequence(svg);
    }
    if role.is_empty() || role.starts_with("flowchart") || role.starts_with("graph") {
        if let Some(flow) = reconstruct_flowchart(svg) {
            return Some(flow);
        }
    }
    reconstruct_labels(svg, &role)
}

fn label_of(el: &Element) -> String {
    el.text_content()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `flowchart-A-12` → `A`.
fn node_key(id: &str, index: usize) -> String {
    let id = id.strip_prefix("flowchart-").unwrap_or(id);
    let trimmed = match id.rsplit_once('-') {
        Some((head, tail)) if !head.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) => head,
        _ => id,
    };
    if trimmed.is_empty() {
        format!("n{index}")
    } else {
        trimmed.to_string()
    }
}

/// Endpoints from `LS-A LE-B` classes or an `L-A-B-0` / `L_A_B_0` id.
fn edge_endpoints(path: &Element) -> Option<(String, String)> {
    let from = path.classes().find_map(|c| c.strip_prefix("LS-"));
    let to = path.classes().find_map(|c| c.strip_prefix("LE-"));
    if let (Some(a), Some(b)) = (from, to) {
        return Some((a.to_string(), b.to_string()));
    }
    let id = path.attr("id")?;
    let sep = if id.starts_with("L_") { '_' } else { '-' };
    let body = id.strip_prefix("L-").or_else(|| id.strip_prefix("L_"))?;
    let mut parts: Vec<&str> = body.split(sep).collect();
    if parts.len() > 2 && parts.last().is_some_and(|p| p.chars().all(|c| c.is_ascii_digit())) {
        parts.pop();
    }
    if parts.len() != 2 {
        return None;
    }
    Some((parts[0].to_string(), parts[1].to_string()))
}

fn reconstruct_flowchart(svg: &Element) -> Option<(String, Option<String>)> {
    let mut nodes = Vec::new();
    svg.find_all(&|e| e.is("g") && e.has_class("node"), &mut nodes);
    if nodes.is_empty() {
        return None;
    }

    let mut paths = Vec::new();
    svg.find_all(
        &|e| {
            e.is("path")
                && (e.has_class("flowchart-link")
                    || e.attr("id")
                        .is_some_and(|id| id.starts_with("L-") || id.starts_with("L_")))
        },
        &mut paths,
    );
    let mut edge_labels = Vec::new();
    svg.find_all(&|e| e.has_class("edgeLabel"), &mut edge_labels);
    let edge_labels: Vec<String> = edge_labels.iter().map(|e| label_of(e)).collect();
    let edges: Vec<(String, String)> = paths.iter().filter_map(|p| edge_endpoints(p)).collect();
    let labels_align = edge_labels.len() == edges.len();

    let mut code = String::from("flowchart TD\n");
    for (i, node) in nodes.iter().enumerate() {
        let key = node_key(node.attr("id").unwrap_or(""), i + 1);
        let label = label_of(node).replace('"', "'");
        code.push_str(&format!("    {key}[\"{label}\"]\n"));
    }
    for (i, (from, to)) in edges.iter().enumerate() {
        match edge_labels.get(i).filter(|l| labels_align && !l.is_empty()) {
            Some(label) => code.push_str(&format!("    {from} -->|{label}| {to}\n")),
            None => code.push_str(&format!("    {from} --> {to}\n")),
        }
    }
    Some((code.trim_end().to_string(), Some("flowchart".to_string())))
}

fn reconstruct_sequence(svg: &Element) -> Option<(String, Option<String>)> {
    let mut actors = Vec::new();
    svg.find_all(&|e| e.is("text") && e.has_class("actor"), &mut actors);
    let mut participants: Vec<String> = Vec::new();
    for actor in actors {
        let name = label_of(actor);
        if !name.is_empty() && !participants.contains(&name) {
            participants.push(name);
        }
    }
    let mut messages = Vec::new();
    svg.find_all(&|e| e.has_class("messageText"), &mut messages);
    if participants.is_empty() && messages.is_empty() {
        return None;
    }

    let mut code = String::from("sequenceDiagram\n");
    for p in &participants {
        code.push_str(&format!("    participant {p}\n"));
    }
    for m in messages {
        code.push_str(&format!("    %% message: {}\n", label_of(m)));
    }
    Some((code.trim_end().to_string(), Some("sequenceDiagram".to_string())))
}

fn reconstruct_labels(svg: &Element, role: &str) -> Option<(String, Option<String>)> {
    let mut texts = Vec::new();
    svg.find_all(&|e| e.is("text") || e.is("foreignobject"), &mut texts);
    let labels: Vec<String> = texts
        .iter()
        .map(|t| label_of(t))
        .filter(|l| !l.is_empty())
        .collect();
    if labels.is_empty() {
        return None;
    }
    let mut code = String::from("%% reconstructed from rendered diagram\n");
    for label in labels {
        code.push_str(&format!("%% {label}\n"));
    }
    let diagram_type = (!role.is_empty()).then(|| role.to_string());
    Some((code.trim_end().to_string(), diagram_type))
}
