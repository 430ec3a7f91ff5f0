use std::path::PathBuf;
use thiserror::Error;

/// Every failure the mirror can report. Only `Config` aborts a run; the
/// other variants are recorded against a single URL and the crawl goes on.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to fetch {url} after {attempts} attempt(s): {reason}")]
    Fetch {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("Parse error in {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("Failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MirrorError {
    pub(crate) fn invalid_url(url: &str, reason: impl ToString) -> Self {
        MirrorError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, MirrorError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
