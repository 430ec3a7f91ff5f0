use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::bytes::{Captures, Regex};
use url::Url;

use crate::extractor::{
    classify_attribute, css_import_regex, css_url_regex, document_base, AttrSyntax,
    DocumentFormat,
};
use crate::normalize::normalize;

/// Lookup from normalized URL to its path relative to the output root.
pub trait LocalPaths {
    fn local_path(&self, url: &Url) -> Option<&Path>;
}

impl LocalPaths for HashMap<Url, PathBuf> {
    fn local_path(&self, url: &Url) -> Option<&Path> {
        self.get(url).map(PathBuf::as_path)
    }
}

static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?-u)<([a-zA-Z][a-zA-Z0-9]*)((?:[^>"']|"[^"]*"|'[^']*')*)>"#)
        .expect("valid regex")
});

static ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?-u)([^\s"'>/=]+)(?:(\s*=\s*)(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("valid regex")
});

/// Spans whose contents are not markup: comments, scripts and style blocks.
static RAW_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r#"(?is-u)(<!--.*?-->)"#,
        r#"|(<script\b(?:[^>"']|"[^"]*"|'[^']*')*>)(.*?)(</script\s*>)"#,
        r#"|(<style\b(?:[^>"']|"[^"]*"|'[^']*')*>)(.*?)(</style\s*>)"#,
    ))
    .expect("valid regex")
});

enum Segment<'h> {
    Markup(&'h [u8]),
    Comment(&'h [u8]),
    RawText {
        open: &'h [u8],
        body: &'h [u8],
        close: &'h [u8],
        is_style: bool,
    },
}

fn segments(html: &[u8]) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut last = 0;

    for caps in RAW_TEXT.captures_iter(html) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if whole.start() > last {
            segments.push(Segment::Markup(&html[last..whole.start()]));
        }
        if let Some(comment) = caps.get(1) {
            segments.push(Segment::Comment(comment.as_bytes()));
        } else {
            let is_style = caps.get(5).is_some();
            let group = if is_style { 5 } else { 2 };
            match (caps.get(group), caps.get(group + 1), caps.get(group + 2)) {
                (Some(open), Some(body), Some(close)) => segments.push(Segment::RawText {
                    open: open.as_bytes(),
                    body: body.as_bytes(),
                    close: close.as_bytes(),
                    is_style,
                }),
                _ => segments.push(Segment::Markup(whole.as_bytes())),
            }
        }
        last = whole.end();
    }
    if last < html.len() {
        segments.push(Segment::Markup(&html[last..]));
    }
    segments
}

/// Dispatches on the document format. Returns `None` for opaque bodies.
pub fn rewrite_document<P: LocalPaths + ?Sized>(
    format: DocumentFormat,
    content: &[u8],
    doc_url: &Url,
    doc_path: &Path,
    paths: &P,
) -> Option<Vec<u8>> {
    match format {
        DocumentFormat::Html => Some(rewrite_html(content, doc_url, doc_path, paths)),
        DocumentFormat::Css => Some(rewrite_css(content, doc_url, doc_path, paths)),
        DocumentFormat::Opaque => None,
    }
}

/// Points every recognized reference of an HTML document at its local copy.
///
/// References to mirrored URLs become paths relative to `doc_path`; all
/// other resolvable references become absolute URLs. `<base href>` tags are
/// dropped since the rewritten references no longer depend on them.
///
/// Works on raw bytes so documents in any ASCII-compatible charset keep
/// every byte outside the rewritten values. Comments and script bodies are
/// copied unchanged.
pub fn rewrite_html<P: LocalPaths + ?Sized>(
    html: &[u8],
    page_url: &Url,
    doc_path: &Path,
    paths: &P,
) -> Vec<u8> {
    let segments = segments(html);

    let base_href = segments.iter().find_map(|segment| match segment {
        Segment::Markup(markup) => TAG
            .captures_iter(markup)
            .filter(|caps| caps[1].eq_ignore_ascii_case(b"base"))
            .find_map(|caps| attribute_value(&caps[2], "href")),
        _ => None,
    });
    let base = document_base(page_url, base_href.as_deref());

    let mut out = Vec::with_capacity(html.len());
    for segment in segments {
        match segment {
            Segment::Markup(markup) => out.extend(rewrite_tags(markup, &base, doc_path, paths)),
            Segment::Comment(comment) => out.extend_from_slice(comment),
            Segment::RawText {
                open,
                body,
                close,
                is_style,
            } => {
                out.extend(rewrite_tags(open, &base, doc_path, paths));
                if is_style {
                    out.extend(rewrite_css(body, &base, doc_path, paths));
                } else {
                    out.extend_from_slice(body);
                }
                out.extend_from_slice(close);
            }
        }
    }
    out
}

fn rewrite_tags<P: LocalPaths + ?Sized>(
    markup: &[u8],
    base: &Url,
    doc_path: &Path,
    paths: &P,
) -> Vec<u8> {
    TAG.replace_all(markup, |caps: &Captures| {
        let tag = String::from_utf8_lossy(&caps[1]);
        let attrs = &caps[2];

        if tag.eq_ignore_ascii_case("base") && attribute_value(attrs, "href").is_some() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(caps[0].len());
        out.push(b'<');
        out.extend_from_slice(&caps[1]);
        out.extend(rewrite_attributes(&tag, attrs, base, doc_path, paths));
        out.push(b'>');
        out
    })
    .into_owned()
}

fn rewrite_attributes<P: LocalPaths + ?Sized>(
    tag: &str,
    attrs: &[u8],
    base: &Url,
    doc_path: &Path,
    paths: &P,
) -> Vec<u8> {
    let rel = attribute_value(attrs, "rel");
    let input_type = attribute_value(attrs, "type");

    ATTR.replace_all(attrs, |caps: &Captures| {
        let name = String::from_utf8_lossy(&caps[1]);
        let (Some(equals), Some(value)) = (caps.get(2), (3..=5).find_map(|i| caps.get(i))) else {
            return caps[0].to_vec();
        };
        // Values that are not UTF-8 are left as written.
        let Ok(value) = std::str::from_utf8(value.as_bytes()) else {
            return caps[0].to_vec();
        };
        let quote = if caps.get(4).is_some() { b'\'' } else { b'"' };
        let decoded = decode_entities(value);

        let replacement = if name.eq_ignore_ascii_case("style") {
            let css = rewrite_css(decoded.as_bytes(), base, doc_path, paths);
            String::from_utf8(css).ok().filter(|css| *css != decoded)
        } else {
            match classify_attribute(tag, &name, rel.as_deref(), input_type.as_deref()) {
                Some((_, AttrSyntax::Url)) => rewrite_reference(&decoded, base, doc_path, paths),
                Some((_, AttrSyntax::SrcSet)) => rewrite_srcset(&decoded, base, doc_path, paths),
                None => None,
            }
        };

        match replacement {
            Some(new_value) => {
                let mut out = caps[1].to_vec();
                out.extend_from_slice(equals.as_bytes());
                out.push(quote);
                out.extend_from_slice(escape_attribute(&new_value, quote).as_bytes());
                out.push(quote);
                out
            }
            None => caps[0].to_vec(),
        }
    })
    .into_owned()
}

/// Rewrites `url(...)` and `@import` references of a stylesheet.
pub fn rewrite_css<P: LocalPaths + ?Sized>(
    css: &[u8],
    doc_url: &Url,
    doc_path: &Path,
    paths: &P,
) -> Vec<u8> {
    let splice = |caps: &Captures| -> Vec<u8> {
        let Some(whole) = caps.get(0) else {
            return Vec::new();
        };
        let Some(value) = (1..=3).find_map(|i| caps.get(i)) else {
            return whole.as_bytes().to_vec();
        };
        let replacement = std::str::from_utf8(value.as_bytes())
            .ok()
            .and_then(|raw| rewrite_reference(raw, doc_url, doc_path, paths));

        match replacement {
            Some(new_value) => {
                let text = whole.as_bytes();
                let mut out = text[..value.start() - whole.start()].to_vec();
                out.extend_from_slice(new_value.as_bytes());
                out.extend_from_slice(&text[value.end() - whole.start()..]);
                out
            }
            None => whole.as_bytes().to_vec(),
        }
    };

    let imports = css_import_regex().replace_all(css, &splice);
    css_url_regex().replace_all(&imports, &splice).into_owned()
}

fn rewrite_srcset<P: LocalPaths + ?Sized>(
    value: &str,
    base: &Url,
    doc_path: &Path,
    paths: &P,
) -> Option<String> {
    let mut changed = false;
    let candidates: Vec<String> = value
        .split(',')
        .map(|candidate| {
            let trimmed = candidate.trim();
            let (url_part, descriptor) = match trimmed.split_once(char::is_whitespace) {
                Some((url_part, descriptor)) => (url_part, Some(descriptor.trim())),
                None => (trimmed, None),
            };
            let new_url = match rewrite_reference(url_part, base, doc_path, paths) {
                Some(new_url) => {
                    changed = true;
                    new_url
                }
                None => url_part.to_string(),
            };
            match descriptor {
                Some(descriptor) => format!("{} {}", new_url, descriptor),
                None => new_url,
            }
        })
        .collect();

    changed.then(|| candidates.join(", "))
}

/// New text for one reference, or `None` to leave it untouched.
fn rewrite_reference<P: LocalPaths + ?Sized>(
    raw: &str,
    base: &Url,
    doc_path: &Path,
    paths: &P,
) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let target = normalize(base, trimmed).ok()?;
    let absolute = base.join(trimmed).ok()?;

    match paths.local_path(&target) {
        Some(local) => {
            let mut relative = relative_path(doc_path, local);
            if let Some(fragment) = absolute.fragment() {
                relative.push('#');
                relative.push_str(fragment);
            }
            Some(relative)
        }
        None if absolute.as_str() == trimmed => None,
        None => Some(absolute.to_string()),
    }
}

/// `target` as seen from the directory containing `doc_path`, with forward
/// slashes.
pub fn relative_path(doc_path: &Path, target: &Path) -> String {
    let doc_dir = doc_path.parent().unwrap_or_else(|| Path::new(""));
    let relative = pathdiff::diff_paths(target, doc_dir).unwrap_or_else(|| target.to_path_buf());

    let joined = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");

    if joined.is_empty() {
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        joined
    }
}

fn attribute_value(attrs: &[u8], wanted: &str) -> Option<String> {
    ATTR.captures_iter(attrs)
        .filter(|caps| caps[1].eq_ignore_ascii_case(wanted.as_bytes()))
        .find_map(|caps| {
            (3..=5)
                .find_map(|i| caps.get(i))
                .map(|m| decode_entities(&String::from_utf8_lossy(m.as_bytes())))
        })
}

fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Escapes `&` and the delimiting quote.
fn escape_attribute(value: &str, quote: u8) -> String {
    let escaped = value.replace('&', "&amp;");
    match quote {
        b'\'' => escaped.replace('\'', "&#39;"),
        _ => escaped.replace('"', "&quot;"),
    }
}
