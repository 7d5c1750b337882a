//! Embedded media and third-party widgets.

use crate::ast::EmbedKind;
use crate::dom::Element;

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedMatch {
    pub kind: EmbedKind,
    /// Unresolved; the caller resolves it against the base URL.
    pub url: Option<String>,
    pub provider: Option<String>,
    /// Original markup, kept for widgets that only work as HTML.
    pub raw: Option<String>,
}

/// `(host fragment, provider, kind)`, matched against iframe sources.
const PROVIDERS: &[(&str, &str, EmbedKind)] = &[
    ("youtube.com", "youtube", EmbedKind::Video),
    ("youtube-nocookie.com", "youtube", EmbedKind::Video),
    ("youtu.be", "youtube", EmbedKind::Video),
    ("player.vimeo.com", "vimeo", EmbedKind::Video),
    ("player.bilibili.com", "bilibili", EmbedKind::Video),
    ("v.qq.com", "tencent-video", EmbedKind::Video),
    ("open.spotify.com", "spotify", EmbedKind::Audio),
    ("w.soundcloud.com", "soundcloud", EmbedKind::Audio),
    ("music.163.com", "netease-music", EmbedKind::Audio),
    ("codepen.io", "codepen", EmbedKind::Code),
    ("jsfiddle.net", "jsfiddle", EmbedKind::Code),
    ("codesandbox.io", "codesandbox", EmbedKind::Code),
    ("stackblitz.com", "stackblitz", EmbedKind::Code),
    ("platform.twitter.com", "twitter", EmbedKind::Social),
    ("instagram.com", "instagram", EmbedKind::Social),
];

type Extractor = fn(&Element) -> Option<EmbedMatch>;

const EXTRACTORS: &[Extractor] = &[iframe, media, object, social_blockquote, gist];

pub fn detect(el: &Element) -> Option<EmbedMatch> {
    EXTRACTORS.iter().find_map(|extract| extract(el))
}

/// Provider and kind for a URL, if it belongs to a known host.
pub fn provider_for(url: &str) -> Option<(&'static str, EmbedKind)> {
    let lower = url.to_ascii_lowercase();
    PROVIDERS
        .iter()
        .find(|(host, _, _)| lower.contains(host))
        .map(|(_, provider, kind)| (*provider, *kind))
}

fn iframe(el: &Element) -> Option<EmbedMatch> {
    if !el.is("iframe") {
        return None;
    }
    let url = el
        .attr_nonempty("src")
        .or_else(|| el.attr_nonempty("data-src"))
        .map(str::to_string);
    let (provider, kind) = match url.as_deref().and_then(provider_for) {
        Some((provider, kind)) => (Some(provider.to_string()), kind),
        None => (None, EmbedKind::Iframe),
    };
    Some(EmbedMatch {
        kind,
        url,
        provider,
        raw: Some(el.outer_html()),
    })
}

fn media(el: &Element) -> Option<EmbedMatch> {
    let kind = match el.tag.as_str() {
        "video" => EmbedKind::Video,
        "audio" => EmbedKind::Audio,
        _ => return None,
    };
    let url = el
        .attr_nonempty("src")
        .or_else(|| {
            el.children_elements()
                .filter(|c| c.is("source"))
                .find_map(|c| c.attr_nonempty("src"))
        })
        .map(str::to_string);
    Some(EmbedMatch {
        kind,
        url,
        provider: None,
        raw: None,
    })
}

fn object(el: &Element) -> Option<EmbedMatch> {
    let url = match el.tag.as_str() {
        "embed" => el.attr_nonempty("src"),
        "object" => el.attr_nonempty("data"),
        _ => return None,
    }
    .map(str::to_string);
    let (provider, kind) = match url.as_deref().and_then(provider_for) {
        Some((provider, kind)) => (Some(provider.to_string()), kind),
        None => (None, EmbedKind::Iframe),
    };
    Some(EmbedMatch {
        kind,
        url,
        provider,
        raw: Some(el.outer_html()),
    })
}

fn social_blockquote(el: &Element) -> Option<EmbedMatch> {
    if !el.is("blockquote") {
        return None;
    }
    let provider = if el.has_class("twitter-tweet") {
        "twitter"
    } else if el.has_class("instagram-media") {
        "instagram"
    } else if el.has_class("tiktok-embed") {
        "tiktok"
    } else {
        return None;
    };
    let url = el
        .attr_nonempty("cite")
        .or_else(|| el.attr_nonempty("data-instgrm-permalink"))
        .map(str::to_string)
        .or_else(|| {
            // Tweets link the status as the last anchor.
            let mut links = Vec::new();
            el.find_all(&|e| e.is("a") && e.has_attr("href"), &mut links);
            links.last().and_then(|a| a.attr_nonempty("href")).map(str::to_string)
        });
    Some(EmbedMatch {
        kind: EmbedKind::Social,
        url,
        provider: Some(provider.to_string()),
        raw: Some(el.outer_html()),
    })
}

fn gist(el: &Element) -> Option<EmbedMatch> {
    let src = el.attr_nonempty("src")?;
    if !el.is("script") || !src.contains("gist.github.com") {
        return None;
    }
    let url = src.strip_suffix(".js").unwrap_or(src).to_string();
    Some(EmbedMatch {
        kind: EmbedKind::Code,
        url: Some(url),
        provider: Some("gist".to_string()),
        raw: Some(el.outer_html()),
    })
}
