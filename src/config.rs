use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::error::{MirrorError, Result};
use crate::normalize::{normalize_absolute, origin_of};

pub const DEFAULT_MAX_CONCURRENT: usize = 8;
pub const DEFAULT_POLITENESS_DELAY: Duration = Duration::from_millis(250);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Basic-auth credentials for one origin.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    /// Parses `user:password` (the password part is optional).
    pub fn parse(value: &str) -> Result<Self> {
        let (username, password) = match value.split_once(':') {
            Some((user, pass)) => (user, Some(pass.to_string())),
            None => (value, None),
        };
        if username.is_empty() {
            return Err(MirrorError::Config(
                "credentials need a non-empty user name".to_string(),
            ));
        }
        Ok(Self::new(username, password))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Everything a mirror run needs. Built from the command line in `main.rs`,
/// or directly by library users and tests.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub seed: Url,
    pub output_dir: PathBuf,
    /// `None` means unlimited; `Some(0)` fetches only the seed.
    pub max_depth: Option<usize>,
    pub max_pages: Option<usize>,
    pub max_concurrent: usize,
    pub politeness_delay: Duration,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_after_cap: Duration,
    pub max_redirects: usize,
    pub user_agent: String,
    /// Keyed by ASCII origin serialization, e.g. `https://example.com`.
    pub credentials: HashMap<String, Credentials>,
    pub ignore_query: bool,
    pub show_progress: bool,
}

impl MirrorConfig {
    pub fn new(seed: &str, output_dir: impl AsRef<Path>) -> Result<Self> {
        let raw_seed = Url::parse(seed.trim())
            .map_err(|e| MirrorError::Config(format!("invalid seed URL '{}': {}", seed, e)))?;
        let normalized = normalize_absolute(seed)
            .map_err(|e| MirrorError::Config(format!("unusable seed URL: {}", e)))?;

        let output_dir = output_dir.as_ref().to_path_buf();
        if output_dir.as_os_str().is_empty() {
            return Err(MirrorError::Config("output directory is empty".to_string()));
        }
        if output_dir.exists() && !output_dir.is_dir() {
            return Err(MirrorError::Config(format!(
                "output path {:?} exists and is not a directory",
                output_dir
            )));
        }

        let mut credentials = HashMap::new();
        if !raw_seed.username().is_empty() {
            credentials.insert(
                origin_key(&normalized),
                Credentials::new(raw_seed.username(), raw_seed.password().map(str::to_string)),
            );
        }

        Ok(Self {
            seed: normalized,
            output_dir,
            max_depth: None,
            max_pages: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            politeness_delay: DEFAULT_POLITENESS_DELAY,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            retry_after_cap: Duration::from_secs(60),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: format!("site-mirror/{}", env!("CARGO_PKG_VERSION")),
            credentials,
            ignore_query: false,
            show_progress: false,
        })
    }

    pub fn with_max_depth(mut self, depth: Option<usize>) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_pages(mut self, pages: Option<usize>) -> Self {
        self.max_pages = pages;
        self
    }

    pub fn with_max_concurrent(mut self, workers: usize) -> Self {
        self.max_concurrent = workers;
        self
    }

    pub fn with_politeness_delay(mut self, delay: Duration) -> Self {
        self.politeness_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_redirects(mut self, redirects: usize) -> Self {
        self.max_redirects = redirects;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_ignore_query(mut self, ignore: bool) -> Self {
        self.ignore_query = ignore;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Registers credentials for the origin of `origin_url`.
    pub fn with_credentials(mut self, origin_url: &str, credentials: Credentials) -> Result<Self> {
        let url = normalize_absolute(origin_url)
            .map_err(|e| MirrorError::Config(format!("invalid credential origin: {}", e)))?;
        self.credentials.insert(origin_key(&url), credentials);
        Ok(self)
    }

    /// Credentials for the seed's own origin.
    pub fn with_seed_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials.insert(origin_key(&self.seed), credentials);
        self
    }

    pub fn credentials_for(&self, url: &Url) -> Option<&Credentials> {
        self.credentials.get(&origin_key(url))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(MirrorError::Config(
                "concurrency limit must be at least 1".to_string(),
            ));
        }
        if self.max_redirects == 0 {
            return Err(MirrorError::Config(
                "redirect limit must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(MirrorError::Config("timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

pub(crate) fn origin_key(url: &Url) -> String {
    origin_of(url).ascii_serialization()
}
