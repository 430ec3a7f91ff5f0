use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::Serialize;
use url::Url;

use crate::error::{MirrorError, Result};
use crate::frontier::LinkKind;

/// What happened to one URL during the crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UrlOutcome {
    Fetched {
        kind: LinkKind,
        status: u16,
        depth: usize,
        local_path: PathBuf,
    },
    Redirected {
        to: String,
    },
    Failed {
        reason: String,
    },
    OutOfScope,
    BeyondDepth,
}

impl UrlOutcome {
    // A URL can be reported several times (e.g. linked from many pages);
    // the most informative outcome wins.
    fn rank(&self) -> u8 {
        match self {
            UrlOutcome::Fetched { .. } => 3,
            UrlOutcome::Redirected { .. } | UrlOutcome::Failed { .. } => 2,
            UrlOutcome::OutOfScope | UrlOutcome::BeyondDepth => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub pages: usize,
    pub assets: usize,
    pub redirected: usize,
    pub failed: usize,
    pub out_of_scope: usize,
    pub beyond_depth: usize,
}

impl ReportSummary {
    fn counter(&mut self, outcome: &UrlOutcome) -> &mut usize {
        match outcome {
            UrlOutcome::Fetched { kind: LinkKind::Page, .. } => &mut self.pages,
            UrlOutcome::Fetched { kind: LinkKind::Asset, .. } => &mut self.assets,
            UrlOutcome::Redirected { .. } => &mut self.redirected,
            UrlOutcome::Failed { .. } => &mut self.failed,
            UrlOutcome::OutOfScope => &mut self.out_of_scope,
            UrlOutcome::BeyondDepth => &mut self.beyond_depth,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlReport {
    pub seed: String,
    pub summary: ReportSummary,
    entries: BTreeMap<String, UrlOutcome>,
}

impl CrawlReport {
    pub fn new(seed: &Url) -> Self {
        Self {
            seed: seed.to_string(),
            summary: ReportSummary::default(),
            entries: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, url: &Url, outcome: UrlOutcome) {
        let key = url.to_string();
        let replace = self
            .entries
            .get(&key)
            .map_or(true, |existing| outcome.rank() >= existing.rank());
        if !replace {
            return;
        }

        *self.summary.counter(&outcome) += 1;
        if let Some(previous) = self.entries.insert(key, outcome) {
            *self.summary.counter(&previous) -= 1;
        }
    }

    pub fn get(&self, url: &str) -> Option<&UrlOutcome> {
        self.entries.get(url)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &UrlOutcome)> {
        self.entries.iter().map(|(url, outcome)| (url.as_str(), outcome))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|(url, outcome)| match outcome {
            UrlOutcome::Failed { reason } => Some((url.as_str(), reason.as_str())),
            _ => None,
        })
    }

    /// True when the seed, or the URL it redirected to, was saved.
    pub fn seed_mirrored(&self) -> bool {
        match self.entries.get(&self.seed) {
            Some(UrlOutcome::Fetched { .. }) => true,
            Some(UrlOutcome::Redirected { to }) => {
                matches!(self.entries.get(to), Some(UrlOutcome::Fetched { .. }))
            }
            _ => false,
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let write_error = |source: std::io::Error| MirrorError::Write {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(write_error)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| write_error(e.into()))
    }
}
