//! Formula detection across math rendering engines.
//!
//! Every engine leaves the TeX source somewhere different: KaTeX in a MathML
//! `annotation`, MathJax 2 in a `script type="math/tex"` sibling, MathJax 3
//! in its assistive MathML, image renderers in `alt` or `data-*`. Each shape
//! is one extractor; the rendered chrome engines emit next to the source
//! (preview spans, assistive copies) is reported separately so the caller
//! can drop it instead of converting it into noise.

use crate::ast::MathEngine;
use crate::dom::Element;
use once_cell::sync::Lazy;
use regex::Regex;

/// Chrome emitted by MathJax 2 around its `script` source element.
const MATHJAX_CHROME_CLASSES: &[&str] = &[
    "MathJax",
    "MathJax_Display",
    "MathJax_Preview",
    "MathJax_SVG",
    "MathJax_SVG_Display",
    "MathJax_CHTML",
    "MJX_Assistive_MathML",
];

const TEX_ATTRS: &[&str] = &[
    "data-tex",
    "data-latex",
    "data-formula",
    "data-math",
    "data-expr",
];

const IMAGE_FORMULA_HOSTS: &[&str] = &[
    "latex.codecogs.com",
    "www.zhihu.com/equation",
    "math.now.sh",
    "render.githubusercontent.com/render/math",
    "chart.googleapis.com/chart?cht=tx",
];

static RE_DELIMITED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^\s*(?:\$\$(.+)\$\$|\\\[(.+)\\\]|\$(.+)\$|\\\((.+)\\\))\s*$").unwrap()
});

#[derive(Debug, Clone, PartialEq)]
pub enum FormulaMatch {
    Formula {
        tex: String,
        display: bool,
        engine: MathEngine,
    },
    /// Rendered output whose source lives elsewhere in the tree.
    Chrome,
}

impl FormulaMatch {
    fn new(tex: &str, display: bool, engine: MathEngine) -> Option<Self> {
        let tex = tex.trim();
        if tex.is_empty() {
            return None;
        }
        Some(FormulaMatch::Formula {
            tex: tex.to_string(),
            display,
            engine,
        })
    }
}

type Extractor = fn(&Element) -> Option<FormulaMatch>;

const EXTRACTORS: &[Extractor] = &[
    katex,
    mathjax_v3,
    mathjax_v2_script,
    mathjax_chrome,
    mathml,
    wikipedia,
    image_formula,
    generic,
];

pub fn detect(el: &Element) -> Option<FormulaMatch> {
    EXTRACTORS.iter().find_map(|extract| extract(el))
}

/// TeX from a MathML `annotation` carrying `application/x-tex`.
fn annotation_tex(el: &Element) -> Option<String> {
    let matches_tex = |e: &Element| {
        e.is("annotation")
            && e.attr("encoding")
                .is_some_and(|enc| enc.eq_ignore_ascii_case("application/x-tex"))
    };
    if matches_tex(el) {
        return Some(el.text_content());
    }
    el.find(&matches_tex).map(Element::text_content)
}

fn tex_attr(el: &Element) -> Option<&str> {
    TEX_ATTRS.iter().find_map(|a| el.attr_nonempty(a))
}

/// Strip `$…$`, `$$…$$`, `\(…\)` or `\[…\]`; the bool is the display flag.
pub fn strip_delimiters(text: &str) -> Option<(String, bool)> {
    let caps = RE_DELIMITED.captures(text)?;
    if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
        return Some((m.as_str().trim().to_string(), true));
    }
    caps.get(3)
        .or_else(|| caps.get(4))
        .map(|m| (m.as_str().trim().to_string(), false))
}

// ── Extractors ───────────────────────────────────────────────────────────

fn katex(el: &Element) -> Option<FormulaMatch> {
    let display = el.has_class("katex-display");
    if !display && !el.has_class("katex") {
        // Stray halves of a KaTeX render whose wrapper was not seen.
        if el.has_class("katex-html") {
            return Some(FormulaMatch::Chrome);
        }
        return None;
    }
    let display = display || el.find(&|e| e.has_class("katex-display")).is_some();
    match annotation_tex(el).or_else(|| tex_attr(el).map(str::to_string)) {
        Some(tex) => FormulaMatch::new(&tex, display, MathEngine::Katex),
        None => Some(FormulaMatch::Chrome),
    }
}

fn mathjax_v3(el: &Element) -> Option<FormulaMatch> {
    if !el.is("mjx-container") {
        return None;
    }
    let display = el.attr("display") == Some("true") || el.attr("display") == Some("block");
    let tex = tex_attr(el)
        .map(str::to_string)
        .or_else(|| annotation_tex(el));
    match tex {
        Some(tex) => FormulaMatch::new(&tex, display, MathEngine::Mathjax),
        // The assistive MathML copy may still carry alttext.
        None => el
            .find(&|e| e.is("math"))
            .and_then(|m| m.attr_nonempty("alttext"))
            .and_then(|tex| FormulaMatch::new(tex, display, MathEngine::Mathjax))
            .or(Some(FormulaMatch::Chrome)),
    }
}

fn mathjax_v2_script(el: &Element) -> Option<FormulaMatch> {
    if !el.is("script") {
        return None;
    }
    let ty = el.attr("type")?.trim().to_ascii_lowercase();
    let (kind, mode) = ty.split_once(';').unwrap_or((ty.as_str(), ""));
    if kind.trim() != "math/tex" {
        return None;
    }
    let display = mode.trim() == "mode=display";
    FormulaMatch::new(&el.text_content(), display, MathEngine::Mathjax)
}

fn mathjax_chrome(el: &Element) -> Option<FormulaMatch> {
    let chrome = el.has_any_class(MATHJAX_CHROME_CLASSES)
        || el.attr("id").is_some_and(|id| id.starts_with("MathJax-Element-"))
        || el.is("mjx-assistive-mml");
    chrome.then_some(FormulaMatch::Chrome)
}

fn mathml(el: &Element) -> Option<FormulaMatch> {
    if !el.is("math") {
        return None;
    }
    let display = el.attr("display") == Some("block") || el.attr("mode") == Some("display");
    let tex = annotation_tex(el)
        .or_else(|| el.attr_nonempty("alttext").map(str::to_string))
        .or_else(|| tex_attr(el).map(str::to_string))
        .unwrap_or_else(|| el.text_content());
    FormulaMatch::new(&tex, display, MathEngine::Mathml)
}

/// MediaWiki wraps MathML and a fallback image in `mwe-math-element`.
fn wikipedia(el: &Element) -> Option<FormulaMatch> {
    if !el.has_class("mwe-math-element") {
        return None;
    }
    let display = el
        .find(&|e| e.has_class("mwe-math-fallback-image-display"))
        .is_some();
    let tex = annotation_tex(el)
        .or_else(|| {
            el.find(&|e| e.is("math"))
                .and_then(|m| m.attr_nonempty("alttext"))
                .map(str::to_string)
        })
        .or_else(|| {
            el.find(&|e| e.is("img"))
                .and_then(|img| img.attr_nonempty("alt"))
                .map(str::to_string)
        })?;
    let tex = tex
        .trim()
        .strip_prefix("{\\displaystyle")
        .and_then(|t| t.trim_end().strip_suffix('}'))
        .map(str::to_string)
        .unwrap_or(tex);
    FormulaMatch::new(&tex, display, MathEngine::Mathml)
}

fn image_formula(el: &Element) -> Option<FormulaMatch> {
    if !el.is("img") {
        return None;
    }
    let display = el.has_class("ztext-math-display")
        || el.attr("data-display") == Some("block")
        || el.style("display").as_deref() == Some("block");
    if let Some(tex) = tex_attr(el) {
        return FormulaMatch::new(tex, display, MathEngine::Image);
    }
    let src = el.attr("src").unwrap_or("");
    let is_formula_image = el.has_any_class(&["ztext-math", "math-img", "latex", "tex"])
        || IMAGE_FORMULA_HOSTS.iter().any(|h| src.contains(h));
    if !is_formula_image {
        return None;
    }
    el.attr_nonempty("alt")
        .map(|alt| strip_delimiters(alt).map(|(t, _)| t).unwrap_or_else(|| alt.to_string()))
        .and_then(|tex| FormulaMatch::new(&tex, display, MathEngine::Image))
}

/// Elements that only announce themselves as math through a class or a
/// `data-*` attribute, with the TeX either there or in delimited text.
fn generic(el: &Element) -> Option<FormulaMatch> {
    let block_tag = el.is("div") || el.is("p");
    if let Some(tex) = tex_attr(el) {
        let display = el.has_any_class(&["math-display", "display", "block"])
            || el.attr("data-display") == Some("true")
            || el.attr("data-display") == Some("block")
            || block_tag;
        return match strip_delimiters(tex) {
            Some((inner, d)) => FormulaMatch::new(&inner, d || display, MathEngine::Generic),
            None => FormulaMatch::new(tex, display, MathEngine::Generic),
        };
    }
    if !el.has_any_class(&["math", "math-inline", "math-display", "arithmatex", "tex"]) {
        return None;
    }
    if el.children_elements().next().is_some() {
        return None;
    }
    let text = el.text_content();
    match strip_delimiters(&text) {
        Some((tex, display)) => FormulaMatch::new(
            &tex,
            display || el.has_class("math-display"),
            MathEngine::Generic,
        ),
        None if el.has_class("math-display") || el.has_class("math-inline") => {
            FormulaMatch::new(&text, el.has_class("math-display"), MathEngine::Generic)
        }
        None => None,
    }
}
