use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use url::Url;

use crate::fetcher::mime_essence;
use crate::normalize::strip_query;
use crate::rewriter::LocalPaths;

/// Bijective mapping from mirrored URLs to paths relative to the output
/// root. Redirect sources are kept as aliases of their final URL.
#[derive(Debug, Default)]
pub struct MirrorTree {
    by_url: HashMap<Url, PathBuf>,
    owners: HashMap<PathBuf, Url>,
    aliases: HashMap<Url, Url>,
    ignore_query: bool,
}

impl MirrorTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookups drop the query, matching a crawl that fetched every query
    /// variant as its bare URL.
    pub fn with_ignore_query(mut self, ignore_query: bool) -> Self {
        self.ignore_query = ignore_query;
        self
    }

    /// Returns the local path for `url`, allocating one on first use.
    pub fn assign(&mut self, url: &Url, content_type: Option<&str>) -> PathBuf {
        if let Some(existing) = self.by_url.get(url) {
            return existing.clone();
        }

        let candidate = candidate_path(url, content_type);
        let mut path = candidate.clone();
        let mut salt = 0u32;
        while self.owners.contains_key(&path) {
            let seed = if salt == 0 {
                url.to_string()
            } else {
                format!("{}#{}", url, salt)
            };
            path = with_file_suffix(&candidate, &short_hash(&seed));
            salt += 1;
        }

        self.owners.insert(path.clone(), url.clone());
        self.by_url.insert(url.clone(), path.clone());
        path
    }

    /// Forgets a URL whose file could not be written.
    pub fn release(&mut self, url: &Url) {
        if let Some(path) = self.by_url.remove(url) {
            self.owners.remove(&path);
        }
    }

    pub fn add_alias(&mut self, from: Url, to: Url) {
        if from != to {
            self.aliases.insert(from, to);
        }
    }

    pub fn resolve(&self, url: &Url) -> Option<&Path> {
        if self.ignore_query && url.query().is_some() {
            return self.resolve(&strip_query(url.clone()));
        }
        self.by_url
            .get(url)
            .or_else(|| self.aliases.get(url).and_then(|target| self.by_url.get(target)))
            .map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.by_url.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_url.is_empty()
    }
}

impl LocalPaths for MirrorTree {
    fn local_path(&self, url: &Url) -> Option<&Path> {
        self.resolve(url)
    }
}

/// First 8 hex digits of the SHA-256 of `input`.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

/// The path a URL maps to before collision handling.
pub fn candidate_path(url: &Url, content_type: Option<&str>) -> PathBuf {
    let essence = content_type.map(mime_essence);
    let is_html = matches!(essence.as_deref(), Some("text/html" | "application/xhtml+xml"));
    let is_css = essence.as_deref() == Some("text/css");

    let mut path = PathBuf::from(host_dir(url));
    let segments: Vec<&str> = url.path_segments().map(|s| s.collect()).unwrap_or_default();
    let (last, dirs) = match segments.split_last() {
        Some((last, dirs)) => (*last, dirs),
        None => ("", &[][..]),
    };

    for dir in dirs.iter().filter(|d| !d.is_empty()) {
        path.push(sanitize_segment(dir));
    }

    let mut file_name = if last.is_empty() {
        "index.html".to_string()
    } else {
        let name = sanitize_segment(last);
        match extension_of(&name) {
            None if is_html => {
                path.push(name);
                "index.html".to_string()
            }
            // A bare name could later be needed as a directory.
            None => match essence.as_deref().and_then(preferred_extension) {
                Some(ext) => format!("{}.{}", name, ext),
                None => format!("{}.bin", name),
            },
            // Local browsers pick the renderer from the extension.
            Some(ext) if is_html && !matches!(ext.as_str(), "html" | "htm" | "xhtml") => {
                format!("{}.html", name)
            }
            Some(ext) if is_css && ext != "css" => format!("{}.css", name),
            Some(_) => name,
        }
    };

    if let Some(query) = url.query().filter(|q| !q.is_empty()) {
        file_name = insert_suffix(&file_name, &short_hash(query));
    }

    path.push(file_name);
    path
}

fn host_dir(url: &Url) -> String {
    let host = url.host_str().unwrap_or("unknown-host");
    let dir = match url.port() {
        Some(port) => format!("{}_{}", host, port),
        None => host.to_string(),
    };
    sanitize_segment(&dir)
}

/// Keeps `[A-Za-z0-9._-]`, everything else becomes `_`.
pub fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' => c,
            _ => '_',
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

fn preferred_extension(essence: &str) -> Option<&'static str> {
    if essence == "text/plain" {
        return Some("txt");
    }
    let extensions = mime_guess::get_mime_extensions_str(essence)?;
    let subtype = essence.rsplit('/').next().unwrap_or_default();
    extensions
        .iter()
        .find(|ext| **ext == subtype)
        .or_else(|| extensions.first())
        .copied()
}

/// `name.ext` becomes `name-suffix.ext`; names without extension get
/// `name-suffix`.
fn insert_suffix(file_name: &str, suffix: &str) -> String {
    match file_name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}-{}{}", &file_name[..dot], suffix, &file_name[dot..]),
        _ => format!("{}-{}", file_name, suffix),
    }
}

fn with_file_suffix(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(insert_suffix(&file_name, suffix))
}
