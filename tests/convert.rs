//! Integration tests for the conversion engine and the transform passes.
//!
//! Everything here runs offline against inline HTML fixtures.

use docpress::ast::{Align, EmbedKind, MathEngine};
use docpress::transform;
use docpress::{
    convert_html, Block, ConversionOutput, ConvertContext, ConvertOptions, Element,
    ElementHandler, Fragment, Inline, Root,
};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;

// ── Test helpers ─────────────────────────────────────────────────────────

fn convert(html: &str) -> ConversionOutput {
    convert_html(html, &ConvertOptions::default())
}

fn with_base(html: &str, base: &str) -> ConversionOutput {
    let options = ConvertOptions::builder().base_url(base).build().unwrap();
    convert_html(html, &options)
}

fn p(text: &str) -> Block {
    Block::paragraph(vec![Inline::text(text)])
}

fn images(root: &Root) -> Vec<(Option<String>, String)> {
    let mut root = root.clone();
    let mut out = Vec::new();
    root.for_each_image_mut(&mut |img| out.push((img.asset_id.clone(), img.src.clone())));
    out
}

// ── Basic shape ──────────────────────────────────────────────────────────

#[test]
fn single_paragraph() {
    let out = convert("<p>Hello</p>");
    assert_eq!(out.root, Root::new(vec![p("Hello")]));
    assert!(out.manifest.is_empty());
}

#[test]
fn ast_serialises_with_type_tags() {
    let out = convert(r#"<h2>Title</h2><p><img src="https://cdn.example.com/a.png" alt="A"></p>"#);
    let value = serde_json::to_value(&out.root).unwrap();
    assert_eq!(
        value,
        json!({
            "children": [
                { "type": "heading", "depth": 2, "children": [{ "type": "text", "value": "Title" }] },
                {
                    "type": "imageBlock",
                    "assetId": "img_1",
                    "src": "https://cdn.example.com/a.png",
                    "alt": "A",
                    "title": null,
                    "caption": null
                }
            ]
        })
    );
}

#[test]
fn inline_formatting_and_links() {
    let out = with_base(
        r#"<p>Read <strong>the <em>docs</em></strong> at <a href="/guide" title="Guide">our site</a>.</p>"#,
        "https://example.com/blog/post",
    );
    assert_eq!(
        out.root.children,
        vec![Block::paragraph(vec![
            Inline::text("Read "),
            Inline::Strong {
                children: vec![
                    Inline::text("the "),
                    Inline::Emphasis {
                        children: vec![Inline::text("docs")]
                    }
                ]
            },
            Inline::text(" at "),
            Inline::Link {
                url: "https://example.com/guide".into(),
                title: Some("Guide".into()),
                children: vec![Inline::text("our site")],
            },
            Inline::text("."),
        ])]
    );
}

// ── Manifest ─────────────────────────────────────────────────────────────

#[test]
fn repeated_image_shares_one_entry() {
    let out = with_base(
        r#"<p><img src="/img/a.png"></p>
           <p>again <img src="https://example.com/img/a.png" alt="second"></p>
           <figure><img src="/img/b.png"><figcaption>Figure 2</figcaption></figure>"#,
        "https://example.com/post/1",
    );
    assert_eq!(out.manifest.images.len(), 2);
    assert_eq!(out.manifest.images[0].original_url, "https://example.com/img/a.png");
    assert_eq!(out.manifest.images[0].alt.as_deref(), Some("second"));

    let refs = images(&out.root);
    assert_eq!(refs.len(), 3);
    assert_eq!(refs[0].0.as_deref(), Some("img_1"));
    assert_eq!(refs[1].0.as_deref(), Some("img_1"));
    assert_eq!(refs[2].0.as_deref(), Some("img_2"));

    match out.root.children.last() {
        Some(Block::ImageBlock(img)) => assert_eq!(img.caption.as_deref(), Some("Figure 2")),
        other => panic!("expected captioned image, got {other:?}"),
    }
}

#[test]
fn lazy_and_data_images() {
    let out = with_base(
        r#"<p><img src="data:image/gif;base64,R0lGODlhAQABAAAAACw=" data-src="/real.png"></p>
           <p><img src="data:image/png;base64,iVBORw0KGgo="></p>
           <p><img alt="nothing"></p>"#,
        "https://example.com/",
    );
    let refs = images(&out.root);
    assert_eq!(refs.len(), 2);
    assert_eq!(refs[0].1, "https://example.com/real.png");
    assert_eq!(refs[1].0, None);
    assert!(refs[1].1.starts_with("data:image/png"));
    assert_eq!(out.manifest.images.len(), 1);
}

// ── Heuristics ───────────────────────────────────────────────────────────

const KATEX: &str = r#"<span class="katex"><span class="katex-mathml"><math><semantics><mrow><mi>E</mi></mrow><annotation encoding="application/x-tex">E=mc^2</annotation></semantics></math></span><span class="katex-html" aria-hidden="true">E=mc2</span></span>"#;

#[test]
fn katex_formulas_are_recovered_and_not_deduplicated() {
    let html = format!("<p>Energy {KATEX} and again {KATEX}</p>");
    let out = convert(&html);
    let Block::Paragraph { children } = &out.root.children[0] else {
        panic!("expected paragraph, got {:?}", out.root.children);
    };
    let math: Vec<&Inline> = children
        .iter()
        .filter(|i| matches!(i, Inline::MathInline { .. }))
        .collect();
    assert_eq!(math.len(), 2);
    assert_eq!(
        math[0],
        &Inline::MathInline {
            tex: "E=mc^2".into(),
            engine: Some(MathEngine::Katex)
        }
    );
    assert_eq!(out.manifest.formulas.len(), 2);
    assert_ne!(out.manifest.formulas[0].id, out.manifest.formulas[1].id);
    assert!(!out.root.children.iter().any(|b| b.plain_text().contains("E=mc2")));
}

#[test]
fn mermaid_source_from_tagged_code() {
    let out = convert(
        r#"<pre><code class="language-mermaid">graph TD
A--&gt;B</code></pre><pre><code class="language-rust">let x = 1;</code></pre>"#,
    );
    assert_eq!(
        out.root.children,
        vec![
            Block::MermaidBlock {
                code: "graph TD\nA-->B".into(),
                diagram_type: Some("flowchart".into()),
                reconstructed: false,
            },
            Block::CodeBlock {
                lang: Some("rust".into()),
                value: "let x = 1;".into(),
            },
        ]
    );
}

#[test]
fn iframe_becomes_embed() {
    let out = convert(r#"<iframe src="https://www.youtube.com/embed/xyz"></iframe>"#);
    match &out.root.children[..] {
        [Block::EmbedBlock { kind, url, provider, .. }] => {
            assert_eq!(*kind, EmbedKind::Video);
            assert_eq!(url.as_deref(), Some("https://www.youtube.com/embed/xyz"));
            assert_eq!(provider.as_deref(), Some("youtube"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(out.manifest.embeds.len(), 1);
}

// ── Structure ────────────────────────────────────────────────────────────

#[test]
fn table_with_header_alignment_and_spans() {
    let out = convert(
        r#"<table>
             <thead><tr><th>Name</th><th style="text-align: right">Qty</th></tr></thead>
             <tbody><tr><td colspan="2">total</td></tr><tr><td>a</td><td>1</td></tr></tbody>
           </table>"#,
    );
    let Block::Table(table) = &out.root.children[0] else {
        panic!("expected table, got {:?}", out.root.children);
    };
    assert_eq!(table.rows.len(), 3);
    assert!(table.rows[0].cells.iter().all(|c| c.header));
    assert!(!table.rows[1].cells[0].header);
    assert_eq!(table.align, vec![None, Some(Align::Right)]);
    assert!(table.has_colspan);
    assert!(!table.has_rowspan);
    assert_eq!(table.rows[1].cells[0].children, vec![Inline::text("total")]);

    let flagged = transform::flag_complex_tables(out.root);
    assert!(matches!(&flagged.children[0], Block::Table(t) if t.requires_html));
}

#[test]
fn task_lists_and_nesting() {
    let out = convert(
        r#"<ol start="3">
             <li><input type="checkbox" checked> done</li>
             <li>plain<ul><li><input type="checkbox"> nested</li></ul></li>
           </ol>"#,
    );
    let Block::List(list) = &out.root.children[0] else {
        panic!("expected list, got {:?}", out.root.children);
    };
    assert!(list.ordered);
    assert_eq!(list.start, Some(3));
    assert_eq!(list.items[0].checked, Some(true));
    assert_eq!(list.items[0].children, vec![p("done")]);
    assert_eq!(list.items[1].checked, None);
    match &list.items[1].children[..] {
        [first, Block::List(nested)] => {
            assert_eq!(first, &p("plain"));
            assert_eq!(nested.items[0].checked, Some(false));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn footnotes() {
    let out = convert(
        r##"<p>Claim<sup><a href="#fn1" class="footnote-ref">1</a></sup></p>
            <section class="footnotes"><ol><li id="fn1"><p>Source <a href="#fnref1" class="footnote-backref">↩</a></p></li></ol></section>"##,
    );
    assert_eq!(
        out.root.children,
        vec![
            Block::paragraph(vec![
                Inline::text("Claim"),
                Inline::FootnoteRef { label: "1".into() }
            ]),
            Block::FootnoteDef {
                label: "1".into(),
                children: vec![p("Source")],
            },
        ]
    );
}

// ── Options ──────────────────────────────────────────────────────────────

struct Callout;

impl ElementHandler for Callout {
    fn handle(&self, element: &Element, cx: &mut ConvertContext<'_>) -> Option<Vec<Fragment>> {
        let kind = element.attr("data-kind")?.to_string();
        Some(vec![Fragment::Block(Block::CustomBlock {
            name: "callout".into(),
            data: json!({ "kind": kind }),
            children: cx.blocks(element),
        })])
    }
}

#[test]
fn custom_handler_runs_first_and_may_decline() {
    let options = ConvertOptions::builder()
        .handler("aside", Arc::new(Callout))
        .build()
        .unwrap();
    let out = convert_html(
        r#"<aside data-kind="warning"><p>Careful</p></aside><aside><p>Plain</p></aside>"#,
        &options,
    );
    assert_eq!(
        out.root.children,
        vec![
            Block::CustomBlock {
                name: "callout".into(),
                data: json!({ "kind": "warning" }),
                children: vec![p("Careful")],
            },
            p("Plain"),
        ]
    );
}

#[test]
fn unknown_elements_pass_through_or_are_preserved() {
    let html = "<x-widget><p>inside</p></x-widget>";
    assert_eq!(convert(html).root.children, vec![p("inside")]);

    let options = ConvertOptions::builder()
        .preserve_unknown_html(true)
        .build()
        .unwrap();
    match &convert_html(html, &options).root.children[..] {
        [Block::HtmlBlock { raw }] => {
            assert!(raw.starts_with("<x-widget>"));
            assert!(raw.contains("<p>inside</p>"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

// ── Totality ─────────────────────────────────────────────────────────────

#[test]
fn malformed_markup_never_fails() {
    let inputs = [
        "",
        "   ",
        "<p><b>unclosed <i>x</p></div></span>",
        "<table><tr><td>orphan cell",
        "<ul>stray text<li>item</ul></li>",
        "<a href='javascript:alert(1)'>click</a>",
        "<img src=''><img>",
        "<script>alert(1)</script><style>p{}</style>",
        "<math><semantics><annotation encoding='application/x-tex'></annotation></semantics></math>",
    ];
    for html in inputs {
        let out = convert(html);
        serde_json::to_string(&out).unwrap();
    }
}

#[test]
fn deep_nesting_is_flattened() {
    for (tag, depth) in [("div", 10_000), ("span", 10_000)] {
        let html = format!("{}deep{}", format!("<{tag}>").repeat(depth), format!("</{tag}>").repeat(depth));
        let out = convert(&html);
        assert_eq!(out.root.children.len(), 1, "<{tag}> x {depth}");
        assert!(out.root.children[0].plain_text().contains("deep"));
    }
}

// ── Transform + bundle ───────────────────────────────────────────────────

#[test]
fn standard_passes_on_converted_page() {
    let out = convert(
        r##"<nav class="toc"><a href="#a">A</a></nav>
            <p>[TOC]</p>
            <p>Advertisement</p>
            <p><em> </em></p>
            <p>Body text</p>"##,
    );
    let root = transform::standard()(out.root);
    assert_eq!(root.children, vec![p("Body text")]);
}

#[test]
fn math_to_image_then_sync_registers_new_images() {
    let out = convert(&format!("<p>{KATEX}</p>"));
    let mut urls = std::collections::HashMap::new();
    urls.insert("E=mc^2".to_string(), "https://tex.example.com/e.svg".to_string());

    let mut root = transform::math_to_image(urls)(out.root);
    let mut manifest = out.manifest;
    assert!(manifest.images.is_empty());
    manifest.sync(&mut root);

    assert_eq!(manifest.images.len(), 1);
    assert_eq!(images(&root)[0].0.as_deref(), Some("img_1"));
}

#[test]
fn bundle_round_trips_through_a_file() {
    let out = with_base(r#"<p><img src="a.png"></p>"#, "https://example.com/");
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", serde_json::to_string(&out).unwrap()).unwrap();

    let loaded = ConversionOutput::from_path(file.path()).unwrap();
    assert_eq!(loaded, out);

    assert!(ConversionOutput::from_json("{ not json").is_err());
    assert!(ConversionOutput::from_path(file.path().with_extension("missing")).is_err());
}
