use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::MirrorConfig;
use crate::error::Result;
use crate::extractor::{self, DocumentFormat};
use crate::fetcher::{FetchResult, Fetcher};
use crate::file_manager::FileManager;
use crate::frontier::{Admission, CrawlTask, Frontier, LinkKind};
use crate::normalize::{normalize_absolute, strip_query};
use crate::report::{CrawlReport, UrlOutcome};
use crate::rewriter::rewrite_document;

/// A saved HTML or CSS file whose references still point at the live site.
struct PendingDocument {
    url: Url,
    local_path: PathBuf,
    format: DocumentFormat,
}

/// Lets another task (e.g. a Ctrl-C handler) end a running crawl. Work
/// already in flight finishes and everything saved so far is rewritten.
#[derive(Clone)]
pub struct StopHandle {
    frontier: Arc<Frontier>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.frontier.stop();
    }
}

pub struct WebsiteMirror {
    config: MirrorConfig,
    seed: Url,
    fetcher: Fetcher,
    file_manager: FileManager,
    frontier: Arc<Frontier>,
    report: Mutex<CrawlReport>,
    pending_documents: Mutex<Vec<PendingDocument>>,
}

impl WebsiteMirror {
    pub fn new(config: MirrorConfig) -> Result<Self> {
        config.validate()?;

        let seed = if config.ignore_query {
            strip_query(config.seed.clone())
        } else {
            config.seed.clone()
        };
        let fetcher = Fetcher::new(&config)?;
        let file_manager =
            FileManager::new(&config.output_dir)?.with_ignore_query(config.ignore_query);
        let frontier = Arc::new(Frontier::new(seed.origin(), config.max_depth, config.max_pages));
        let report = Mutex::new(CrawlReport::new(&seed));

        Ok(Self {
            config,
            seed,
            fetcher,
            file_manager,
            frontier,
            report,
            pending_documents: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            frontier: Arc::clone(&self.frontier),
        }
    }

    /// Crawls from the seed until the frontier drains, a budget runs out or
    /// the run is stopped, then rewrites every saved document for local
    /// browsing. Only configuration problems are returned as errors; each
    /// URL's fate is in the report.
    pub async fn mirror_website(self) -> Result<CrawlReport> {
        info!(
            seed = %self.seed,
            output = %self.config.output_dir.display(),
            max_depth = ?self.config.max_depth,
            workers = self.config.max_concurrent,
            "starting mirror"
        );
        if self.config.show_progress {
            println!("🚀 Starting website mirroring for: {}", self.seed.as_str().blue());
            println!("📁 Output directory: {:?}", self.config.output_dir);
        }

        self.frontier.enqueue(self.seed.clone(), 0, LinkKind::Page);

        let progress = self.progress_bar();
        let workers = (0..self.config.max_concurrent).map(|id| self.run_worker(id, &progress));
        futures::future::join_all(workers).await;

        if self.frontier.is_stopped() {
            progress.finish_with_message("⏹️  Crawl stopped, finishing up");
        } else {
            progress.finish_with_message("✅ All downloads completed!");
        }

        self.finalize_documents();

        let report = self.lock_report().clone();
        info!(
            pages = report.summary.pages,
            assets = report.summary.assets,
            failed = report.summary.failed,
            out_of_scope = report.summary.out_of_scope,
            "mirror finished"
        );
        Ok(report)
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let progress = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} [{pos}] {msg}") {
            progress.set_style(style);
        }
        progress.enable_steady_tick(Duration::from_millis(120));
        progress
    }

    async fn run_worker(&self, worker_id: usize, progress: &ProgressBar) {
        debug!(worker_id, "worker started");
        while let Some(task) = self.frontier.next().await {
            progress.set_message(format!("Downloading: {}", task.url));
            self.process(task).await;
            self.frontier.complete();
            progress.inc(1);
        }
        debug!(worker_id, "worker finished");
    }

    async fn process(&self, task: CrawlTask) {
        debug!(url = %task.url, depth = task.depth, kind = ?task.kind, "fetching");
        match self.fetcher.fetch(&task.url).await {
            Ok(result) => self.handle_response(&task, result),
            Err(e) => {
                warn!(url = %task.url, error = %e, "fetch failed");
                self.record(&task.url, UrlOutcome::Failed { reason: e.to_string() });
            }
        }
    }

    fn handle_response(&self, task: &CrawlTask, mut result: FetchResult) {
        let final_url = match normalize_absolute(result.url.as_str()) {
            Ok(url) => self.scoped(url),
            Err(e) => {
                warn!(url = %task.url, error = %e, "redirected to an unusable URL");
                self.record(&task.url, UrlOutcome::Failed { reason: e.to_string() });
                return;
            }
        };

        if final_url != task.url {
            debug!(from = %task.url, to = %final_url, "redirected");
            self.record(&task.url, UrlOutcome::Redirected { to: final_url.to_string() });

            if task.depth == 0 && !self.frontier.in_scope(&final_url) {
                info!(
                    origin = %final_url.origin().ascii_serialization(),
                    "seed redirected, adding origin to scope"
                );
                self.frontier.allow_origin(final_url.origin());
            }
            if !self.frontier.in_scope(&final_url) {
                self.record(&final_url, UrlOutcome::OutOfScope);
                return;
            }

            self.file_manager.add_alias(task.url.clone(), final_url.clone());
            if !self.frontier.claim(&final_url) {
                debug!(url = %final_url, "redirect target already mirrored");
                return;
            }
            result.url = final_url.clone();
        }

        let extraction = extractor::extract(&result, task.kind);
        for diagnostic in &extraction.diagnostics {
            warn!(url = %final_url, "{}", diagnostic);
        }
        result.links = extraction.links;

        for link in &result.links {
            let url = self.scoped(link.url.clone());
            match self.frontier.enqueue(url.clone(), task.depth + 1, link.kind) {
                Admission::Queued => debug!(url = %url, kind = ?link.kind, "queued"),
                Admission::Duplicate => {}
                Admission::OutOfScope => self.record(&url, UrlOutcome::OutOfScope),
                Admission::TooDeep => self.record(&url, UrlOutcome::BeyondDepth),
            }
        }

        let content_type = result.content_type.as_deref();
        match self.file_manager.write(&final_url, content_type, &result.body) {
            Ok(local_path) => {
                info!(url = %final_url, path = %local_path.display(), "saved");
                let format = extractor::detect_format(&final_url, content_type, &result.body);
                if format != DocumentFormat::Opaque {
                    self.lock_pending().push(PendingDocument {
                        url: final_url.clone(),
                        local_path: local_path.clone(),
                        format,
                    });
                }
                self.record(
                    &final_url,
                    UrlOutcome::Fetched {
                        kind: task.kind,
                        status: result.status,
                        depth: task.depth,
                        local_path,
                    },
                );
            }
            Err(e) => {
                warn!(url = %final_url, error = %e, "write failed");
                self.record(&final_url, UrlOutcome::Failed { reason: e.to_string() });
            }
        }
    }

    /// Runs once every worker has finished, so the URL-to-path mapping is
    /// final and each reference can be resolved to a local file or left
    /// absolute.
    fn finalize_documents(&self) {
        let documents = std::mem::take(&mut *self.lock_pending());
        debug!(count = documents.len(), "rewriting references");

        let tree = self.file_manager.tree();
        for document in documents {
            let bytes = match self.file_manager.read_file(&document.local_path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(url = %document.url, error = %e, "could not reread saved document");
                    continue;
                }
            };
            let rewritten = rewrite_document(
                document.format,
                &bytes,
                &document.url,
                &document.local_path,
                &*tree,
            );
            let Some(rewritten) = rewritten.filter(|rewritten| *rewritten != bytes) else {
                continue;
            };
            if let Err(e) = self.file_manager.save_file(&document.local_path, &rewritten) {
                warn!(url = %document.url, error = %e, "could not save rewritten document");
            }
        }
    }

    fn scoped(&self, url: Url) -> Url {
        if self.config.ignore_query {
            strip_query(url)
        } else {
            url
        }
    }

    fn record(&self, url: &Url, outcome: UrlOutcome) {
        self.lock_report().record(url, outcome);
    }

    fn lock_report(&self) -> MutexGuard<'_, CrawlReport> {
        self.report.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<PendingDocument>> {
        self.pending_documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
