use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::Notify;
use url::{Origin, Url};

/// Whether a discovered URL is crawled further or only downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Page,
    Asset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlTask {
    pub url: Url,
    pub depth: usize,
    pub kind: LinkKind,
}

/// What `enqueue` did with a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    Duplicate,
    OutOfScope,
    TooDeep,
}

#[derive(Default)]
struct FrontierState {
    seen: HashSet<Url>,
    queue: VecDeque<CrawlTask>,
    scope: HashSet<Origin>,
    in_flight: usize,
    dispatched: usize,
    stopped: bool,
}

/// Breadth-first work queue shared by all workers.
///
/// Every operation takes the single state lock once, so the dedup check and
/// the queue mutation are atomic with respect to each other.
pub struct Frontier {
    state: Mutex<FrontierState>,
    notify: Notify,
    max_depth: Option<usize>,
    max_pages: Option<usize>,
}

impl Frontier {
    pub fn new(scope: Origin, max_depth: Option<usize>, max_pages: Option<usize>) -> Self {
        let mut state = FrontierState::default();
        state.scope.insert(scope);

        Self {
            state: Mutex::new(state),
            notify: Notify::new(),
            max_depth,
            max_pages,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FrontierState> {
        // A panicking worker cannot leave the sets half-updated, so keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn allow_origin(&self, origin: Origin) {
        self.lock().scope.insert(origin);
    }

    pub fn in_scope(&self, url: &Url) -> bool {
        self.lock().scope.contains(&url.origin())
    }

    pub fn enqueue(&self, url: Url, depth: usize, kind: LinkKind) -> Admission {
        let admission = {
            let mut state = self.lock();
            if state.seen.contains(&url) {
                Admission::Duplicate
            } else if !state.scope.contains(&url.origin()) {
                Admission::OutOfScope
            } else if self.max_depth.map_or(false, |max| depth > max) {
                Admission::TooDeep
            } else {
                state.seen.insert(url.clone());
                state.queue.push_back(CrawlTask { url, depth, kind });
                Admission::Queued
            }
        };

        if admission == Admission::Queued {
            self.notify.notify_waiters();
        }
        admission
    }

    /// Marks a redirect target as seen. Returns `false` when some other
    /// task already owns that URL.
    pub fn claim(&self, url: &Url) -> bool {
        self.lock().seen.insert(url.clone())
    }

    /// Non-blocking dequeue. A returned task counts as in flight until
    /// [`Frontier::complete`] is called for it.
    pub fn try_dequeue(&self) -> Option<CrawlTask> {
        let mut state = self.lock();
        self.pop_locked(&mut state)
    }

    fn pop_locked(&self, state: &mut FrontierState) -> Option<CrawlTask> {
        if state.stopped {
            return None;
        }
        if let Some(max) = self.max_pages {
            if state.dispatched >= max {
                state.stopped = true;
                return None;
            }
        }

        let task = state.queue.pop_front()?;
        state.in_flight += 1;
        state.dispatched += 1;
        Some(task)
    }

    /// Waits for the next task. Returns `None` once the crawl is drained
    /// (queue empty and nothing in flight) or has been stopped.
    pub async fn next(&self) -> Option<CrawlTask> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(task) = self.pop_locked(&mut state) {
                    return Some(task);
                }
                if state.stopped || (state.queue.is_empty() && state.in_flight == 0) {
                    drop(state);
                    self.notify.notify_waiters();
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn complete(&self) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    /// Suppresses further dequeues. In-flight work is unaffected.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn seen_count(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }
}
