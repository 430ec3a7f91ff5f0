use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{redirect, Client, ClientBuilder, StatusCode};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::{Origin, Url};

use crate::config::{origin_key, Credentials, MirrorConfig};
use crate::error::{MirrorError, Result};
use crate::extractor::DiscoveredLink;

/// A successfully retrieved resource.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Final URL after redirects.
    pub url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// Filled in by the extractor, in document order.
    pub links: Vec<DiscoveredLink>,
}

impl FetchResult {
    /// Content-type without parameters, lower-cased.
    pub fn mime_essence(&self) -> Option<String> {
        self.content_type.as_deref().map(mime_essence)
    }
}

pub(crate) fn mime_essence(content_type: &str) -> String {
    content_type
        .parse::<mime::Mime>()
        .map(|m| m.essence_str().to_ascii_lowercase())
        .unwrap_or_else(|_| {
            content_type
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retry_after_cap: Duration,
}

impl RetryPolicy {
    /// `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Spaces request start times per origin.
struct Politeness {
    delay: Duration,
    next_slot: Mutex<HashMap<Origin, Instant>>,
}

impl Politeness {
    async fn wait_turn(&self, origin: &Origin) {
        if self.delay.is_zero() {
            return;
        }

        let slot = {
            let mut slots = self
                .next_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Instant::now();
            let slot = slots.get(origin).map_or(now, |next| (*next).max(now));
            slots.insert(origin.clone(), slot + self.delay);
            slot
        };

        tokio::time::sleep_until(slot).await;
    }
}

enum Attempt {
    Done(FetchResult),
    Retry {
        reason: String,
        wait: Option<Duration>,
    },
    Fail(String),
}

pub struct Fetcher {
    client: Client,
    semaphore: Semaphore,
    politeness: Politeness,
    credentials: HashMap<String, Credentials>,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(config: &MirrorConfig) -> Result<Self> {
        let client = Self::build_http_client(config)?;

        Ok(Self {
            client,
            semaphore: Semaphore::new(config.max_concurrent.max(1)),
            politeness: Politeness {
                delay: config.politeness_delay,
                next_slot: Mutex::new(HashMap::new()),
            },
            credentials: config.credentials.clone(),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: config.retry_base_delay,
                max_delay: config.retry_max_delay,
                retry_after_cap: config.retry_after_cap,
            },
        })
    }

    fn build_http_client(config: &MirrorConfig) -> Result<Client> {
        ClientBuilder::new()
            .use_rustls_tls()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout)
            .redirect(redirect::Policy::limited(config.max_redirects))
            .cookie_store(true)
            .build()
            .map_err(|e| MirrorError::Config(format!("failed to build HTTP client: {}", e)))
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// GET `url`, retrying transient failures. The returned result carries
    /// the post-redirect URL.
    pub async fn fetch(&self, url: &Url) -> Result<FetchResult> {
        let origin = url.origin();
        let max_attempts = self.retry.max_retries + 1;
        let mut last_reason = String::new();

        for attempt in 0..max_attempts {
            let outcome = {
                let _permit = self.semaphore.acquire().await.map_err(|e| MirrorError::Fetch {
                    url: url.to_string(),
                    attempts: attempt,
                    reason: e.to_string(),
                })?;
                self.politeness.wait_turn(&origin).await;
                self.attempt(url).await
            };

            match outcome {
                Attempt::Done(result) => {
                    if attempt > 0 {
                        debug!(url = %url, attempts = attempt + 1, "fetched after retry");
                    }
                    return Ok(result);
                }
                Attempt::Fail(reason) => {
                    return Err(MirrorError::Fetch {
                        url: url.to_string(),
                        attempts: attempt + 1,
                        reason,
                    });
                }
                Attempt::Retry { reason, wait } => {
                    last_reason = reason;
                    if attempt + 1 < max_attempts {
                        let delay = wait.unwrap_or_else(|| self.retry.backoff(attempt));
                        debug!(
                            url = %url,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            reason = %last_reason,
                            "transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        warn!(url = %url, attempts = max_attempts, reason = %last_reason, "retries exhausted");
        Err(MirrorError::Fetch {
            url: url.to_string(),
            attempts: max_attempts,
            reason: last_reason,
        })
    }

    async fn attempt(&self, url: &Url) -> Attempt {
        let mut request = self.client.get(url.clone());
        if let Some(credentials) = self.credentials.get(&origin_key(url)) {
            request = request.basic_auth(&credentials.username, credentials.password.as_ref());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_redirect() => return Attempt::Fail(format!("redirect limit: {}", e)),
            Err(e) if e.is_builder() => return Attempt::Fail(e.to_string()),
            Err(e) => {
                return Attempt::Retry {
                    reason: describe_error(&e),
                    wait: None,
                }
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after)
                .map(|d| d.min(self.retry.retry_after_cap));
            return Attempt::Retry {
                reason: format!("HTTP {}", status),
                wait,
            };
        }
        if status.is_server_error() {
            return Attempt::Retry {
                reason: format!("HTTP {}", status),
                wait: None,
            };
        }
        if !status.is_success() {
            return Attempt::Fail(format!("HTTP {}", status));
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match response.bytes().await {
            Ok(body) => Attempt::Done(FetchResult {
                url: final_url,
                status: status.as_u16(),
                content_type,
                body: body.to_vec(),
                links: Vec::new(),
            }),
            Err(e) => Attempt::Retry {
                reason: format!("failed to read body: {}", e),
                wait: None,
            },
        }
    }
}

fn describe_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        format!("timed out: {}", error)
    } else if error.is_connect() {
        format!("connection failed: {}", error)
    } else {
        error.to_string()
    }
}

/// `Retry-After` is either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
