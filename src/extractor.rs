use std::borrow::Cow;
use std::sync::LazyLock;

use regex::bytes::Regex;
use select::document::Document;
use select::predicate::{Any, Name};
use tracing::debug;
use url::Url;

use crate::error::MirrorError;
use crate::fetcher::{mime_essence, FetchResult};
use crate::frontier::LinkKind;
use crate::normalize::normalize;

/// A reference found in a fetched document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredLink {
    pub url: Url,
    /// The reference exactly as written in the document.
    pub raw: String,
    pub kind: LinkKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Html,
    Css,
    Opaque,
}

#[derive(Debug, Default)]
pub struct Extraction {
    pub links: Vec<DiscoveredLink>,
    /// Non-fatal problems met while parsing.
    pub diagnostics: Vec<MirrorError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttrSyntax {
    Url,
    SrcSet,
}

/// Attributes that may carry a reference, across all recognized tags.
pub(crate) const REFERENCE_ATTRS: [&str; 4] = ["href", "src", "srcset", "poster"];

static CSS_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i-u)url\(\s*(?:"([^"]*)"|'([^']*)'|([^)"'\s]*))\s*\)"#).expect("valid regex")
});

static CSS_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i-u)@import\s+(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
});

pub(crate) fn css_url_regex() -> &'static Regex {
    &CSS_URL
}

pub(crate) fn css_import_regex() -> &'static Regex {
    &CSS_IMPORT
}

/// Decides which (tag, attribute) pairs are references and how they are
/// classified. Shared with the rewriter so both see the same references.
pub(crate) fn classify_attribute(
    tag: &str,
    attr: &str,
    rel: Option<&str>,
    input_type: Option<&str>,
) -> Option<(LinkKind, AttrSyntax)> {
    let tag = tag.to_ascii_lowercase();
    let attr = attr.to_ascii_lowercase();

    match (tag.as_str(), attr.as_str()) {
        ("a" | "area", "href") | ("iframe" | "frame", "src") => {
            Some((LinkKind::Page, AttrSyntax::Url))
        }
        ("link", "href") if rel.map_or(false, is_asset_rel) => {
            Some((LinkKind::Asset, AttrSyntax::Url))
        }
        ("script" | "img" | "source" | "video" | "audio" | "track" | "embed", "src")
        | ("video", "poster") => Some((LinkKind::Asset, AttrSyntax::Url)),
        ("img" | "source", "srcset") => Some((LinkKind::Asset, AttrSyntax::SrcSet)),
        ("input", "src") if input_type.map_or(false, |t| t.eq_ignore_ascii_case("image")) => {
            Some((LinkKind::Asset, AttrSyntax::Url))
        }
        _ => None,
    }
}

fn is_asset_rel(rel: &str) -> bool {
    rel.split_ascii_whitespace().any(|token| {
        matches!(
            token.to_ascii_lowercase().as_str(),
            "stylesheet"
                | "icon"
                | "preload"
                | "prefetch"
                | "modulepreload"
                | "manifest"
                | "apple-touch-icon"
                | "mask-icon"
        )
    })
}

/// URL part of each `srcset` candidate (`url [descriptor], ...`).
pub(crate) fn srcset_urls(value: &str) -> Vec<&str> {
    value
        .split(',')
        .filter_map(|candidate| candidate.split_ascii_whitespace().next())
        .collect()
}

/// Resolution base of an HTML document, honoring `<base href>`.
pub(crate) fn document_base(page_url: &Url, base_href: Option<&str>) -> Url {
    base_href
        .and_then(|href| page_url.join(href.trim()).ok())
        .filter(|base| matches!(base.scheme(), "http" | "https"))
        .unwrap_or_else(|| page_url.clone())
}

pub fn detect_format(url: &Url, content_type: Option<&str>, body: &[u8]) -> DocumentFormat {
    let essence = content_type.map(mime_essence);
    match essence.as_deref() {
        Some("text/html" | "application/xhtml+xml") => return DocumentFormat::Html,
        Some("text/css") => return DocumentFormat::Css,
        None | Some("text/plain" | "application/octet-stream" | "") => {}
        Some(_) => return DocumentFormat::Opaque,
    }

    if looks_like_html(body) {
        DocumentFormat::Html
    } else if url.path().to_ascii_lowercase().ends_with(".css") {
        DocumentFormat::Css
    } else {
        DocumentFormat::Opaque
    }
}

fn looks_like_html(body: &[u8]) -> bool {
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    let head: Vec<u8> = body[start..]
        .iter()
        .take(14)
        .map(u8::to_ascii_lowercase)
        .collect();
    head.starts_with(b"<!doctype html") || head.starts_with(b"<html")
}

/// Discovers the references of a fetched resource.
///
/// HTML is only scanned for pages; an HTML body reached through an asset
/// reference is stored but not crawled. CSS is always scanned. Anything
/// else yields no links.
pub fn extract(result: &FetchResult, kind: LinkKind) -> Extraction {
    let format = detect_format(&result.url, result.content_type.as_deref(), &result.body);
    let mut extraction = Extraction::default();

    let crawlable = match format {
        DocumentFormat::Html => kind == LinkKind::Page,
        DocumentFormat::Css => true,
        DocumentFormat::Opaque => false,
    };
    if !crawlable {
        return extraction;
    }

    let text = match std::str::from_utf8(&result.body) {
        Ok(text) => Cow::Borrowed(text),
        Err(e) => {
            extraction.diagnostics.push(MirrorError::Parse {
                url: result.url.to_string(),
                reason: format!("body is not valid UTF-8 ({}), extracted best-effort", e),
            });
            String::from_utf8_lossy(&result.body)
        }
    };

    extraction.links = match format {
        DocumentFormat::Html => extract_html(&text, &result.url),
        DocumentFormat::Css => extract_css(&text, &result.url),
        DocumentFormat::Opaque => Vec::new(),
    };
    extraction
}

pub fn extract_html(html: &str, page_url: &Url) -> Vec<DiscoveredLink> {
    let document = Document::from(html);
    let base_href = document.find(Name("base")).find_map(|node| node.attr("href"));
    let base = document_base(page_url, base_href);
    let mut links = Vec::new();

    for node in document.find(Any) {
        let Some(tag) = node.name() else {
            continue;
        };

        if tag == "style" {
            links.extend(extract_css(&node.text(), &base));
        }
        if let Some(style) = node.attr("style") {
            links.extend(extract_css(style, &base));
        }

        for attr in REFERENCE_ATTRS {
            let Some(value) = node.attr(attr) else {
                continue;
            };
            let classified = classify_attribute(tag, attr, node.attr("rel"), node.attr("type"));
            let Some((kind, syntax)) = classified else {
                continue;
            };
            match syntax {
                AttrSyntax::Url => push_link(&mut links, &base, value, kind),
                AttrSyntax::SrcSet => {
                    for candidate in srcset_urls(value) {
                        push_link(&mut links, &base, candidate, kind);
                    }
                }
            }
        }
    }

    links
}

pub fn extract_css(css: &str, doc_url: &Url) -> Vec<DiscoveredLink> {
    let mut found: Vec<(usize, &str)> = Vec::new();

    for regex in [css_import_regex(), css_url_regex()] {
        for cap in regex.captures_iter(css.as_bytes()) {
            let Some(value) = (1..=3).find_map(|i| cap.get(i)) else {
                continue;
            };
            // Match boundaries sit on ASCII delimiters.
            if let Some(raw) = css.get(value.start()..value.end()) {
                found.push((value.start(), raw));
            }
        }
    }
    found.sort_by_key(|(position, _)| *position);

    let mut links = Vec::new();
    for (_, raw) in found {
        push_link(&mut links, doc_url, raw, LinkKind::Asset);
    }
    links
}

fn push_link(links: &mut Vec<DiscoveredLink>, base: &Url, raw: &str, kind: LinkKind) {
    if raw.trim().starts_with('#') {
        return;
    }
    match normalize(base, raw) {
        Ok(url) => links.push(DiscoveredLink {
            url,
            raw: raw.to_string(),
            kind,
        }),
        Err(e) => debug!("dropping reference: {}", e),
    }
}
