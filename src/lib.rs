pub mod cli;
pub mod config;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod file_manager;
pub mod frontier;
pub mod mirror;
pub mod mirror_tree;
pub mod normalize;
pub mod report;
pub mod rewriter;

// Re-export main types for convenience
pub use cli::MirrorCommand;
pub use config::{Credentials, MirrorConfig};
pub use error::{MirrorError, Result};
pub use extractor::{extract, extract_css, extract_html, DiscoveredLink, DocumentFormat};
pub use fetcher::{FetchResult, Fetcher, RetryPolicy};
pub use file_manager::FileManager;
pub use frontier::{Admission, CrawlTask, Frontier, LinkKind};
pub use mirror::{StopHandle, WebsiteMirror};
pub use mirror_tree::MirrorTree;
pub use normalize::normalize;
pub use report::{CrawlReport, ReportSummary, UrlOutcome};
pub use rewriter::{rewrite_css, rewrite_html, LocalPaths};
