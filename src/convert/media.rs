//! Image source selection and URL resolution.
//!
//! Rich-text sites rarely put the real image URL in `src`. Lazy loaders park
//! a 1×1 placeholder there and stash the real URL in one of a dozen
//! `data-*` attributes; responsive images list several sizes in `srcset`.
//! The priority order is: explicit `src` → widest `srcset` candidate →
//! lazy-load attributes → nothing (the image is dropped).

use crate::dom::Element;
use crate::manifest::{is_data_uri, LOCAL_SCHEME};
use reqwest::Url;

/// Lazy-load attributes, most common first.
pub const LAZY_ATTRS: &[&str] = &[
    "data-src",
    "data-original",
    "data-actualsrc",
    "data-lazy-src",
    "data-lazy",
    "data-original-src",
    "data-url",
    "data-croporisrc",
    "data-backsrc",
    "_src",
];

/// Pick the raw (unresolved) source of an `<img>`.
///
/// A `data:` URI in `src` is treated as a lazy-load placeholder when a
/// better candidate exists elsewhere.
pub fn image_source(el: &Element) -> Option<String> {
    let srcset = el
        .attr_nonempty("srcset")
        .or_else(|| el.attr_nonempty("data-srcset"))
        .and_then(best_srcset_candidate);
    let lazy = LAZY_ATTRS
        .iter()
        .find_map(|name| el.attr_nonempty(name))
        .map(str::to_string);

    match el.attr_nonempty("src") {
        Some(src) if !is_data_uri(src) => Some(src.to_string()),
        Some(src) => srcset.or(lazy).or_else(|| Some(src.to_string())),
        None => srcset.or(lazy),
    }
}

/// Widest candidate of a `srcset` value. Width (`480w`) and density (`2x`)
/// descriptors are both accepted; a bare URL counts as `1x`.
pub fn best_srcset_candidate(srcset: &str) -> Option<String> {
    srcset
        .split(',')
        .filter_map(|candidate| {
            let mut parts = candidate.split_whitespace();
            let url = parts.next()?;
            let score = parts
                .next()
                .and_then(|d| {
                    d.strip_suffix('w')
                        .or_else(|| d.strip_suffix('x'))
                        .and_then(|num| num.parse::<f64>().ok())
                })
                .unwrap_or(1.0);
            Some((url, score))
        })
        .fold(None, |best: Option<(&str, f64)>, (url, score)| match best {
            Some((_, s)) if s >= score => best,
            _ => Some((url, score)),
        })
        .map(|(url, _)| url.to_string())
}

/// Resolve a reference against the base URL.
///
/// `data:`, `blob:` and `local://` references pass through untouched.
/// Protocol-relative URLs inherit the base scheme (or `https`). Relative
/// URLs without a base are returned as written.
pub fn resolve_url(raw: &str, base: Option<&Url>) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if is_data_uri(raw) || raw.starts_with("blob:") || raw.starts_with(LOCAL_SCHEME) {
        return Some(raw.to_string());
    }
    if let Some(rest) = raw.strip_prefix("//") {
        let scheme = base.map(Url::scheme).unwrap_or("https");
        return Url::parse(&format!("{scheme}://{rest}"))
            .map(|u| u.to_string())
            .ok()
            .or_else(|| Some(raw.to_string()));
    }
    match Url::parse(raw) {
        Ok(url) => Some(url.to_string()),
        Err(_) => match base {
            Some(base) => base
                .join(raw)
                .map(|u| u.to_string())
                .ok()
                .or_else(|| Some(raw.to_string())),
            None => Some(raw.to_string()),
        },
    }
}
