use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{
    Credentials, MirrorConfig, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_RETRIES,
};
use crate::error::{MirrorError, Result};

#[derive(Parser, Debug)]
#[command(
    name = "site-mirror",
    about = "Mirror a website into a locally browsable directory tree",
    version,
    long_about = "Crawls a website from a seed URL, downloads its pages and the assets they \
                  reference, and rewrites links so the copy can be browsed offline. Links that \
                  leave the seed's origin are kept as absolute URLs."
)]
pub struct MirrorCommand {
    /// The URL to start mirroring from
    #[arg(required = true)]
    pub url: String,

    /// Output directory for the mirrored website
    #[arg(short, long, default_value = "./mirrored_site")]
    pub output_dir: PathBuf,

    /// Maximum link depth from the seed (unlimited when omitted)
    #[arg(short = 'd', long)]
    pub max_depth: Option<usize>,

    /// Maximum concurrent downloads
    #[arg(
        short = 'c',
        long,
        default_value_t = DEFAULT_MAX_CONCURRENT,
        value_parser = parse_positive
    )]
    pub max_concurrent: usize,

    /// Stop after this many resources have been fetched
    #[arg(long)]
    pub max_pages: Option<usize>,

    /// Minimum delay between requests to the same origin, in milliseconds
    #[arg(long, default_value = "250")]
    pub delay_ms: u64,

    /// Timeout for each request in seconds
    #[arg(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: u64,

    /// Retries for timeouts, connection errors and 5xx responses
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub retries: u32,

    /// Maximum redirects followed per request
    #[arg(long, default_value_t = DEFAULT_MAX_REDIRECTS, value_parser = parse_positive)]
    pub max_redirects: usize,

    /// User agent string to use for requests
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Basic-auth user for the seed's origin
    #[arg(long, env = "MIRROR_USER")]
    pub user: Option<String>,

    /// Basic-auth password for the seed's origin
    #[arg(long, env = "MIRROR_PASSWORD", requires = "user", hide_env_values = true)]
    pub password: Option<String>,

    /// Extra credentials as ORIGIN=USER:PASS, may be repeated
    #[arg(long, value_name = "ORIGIN=USER:PASS")]
    pub auth: Vec<String>,

    /// Treat URLs that differ only in their query string as the same resource
    #[arg(long)]
    pub ignore_query: bool,

    /// Write a JSON report of every URL's outcome to this file
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Disable the progress spinner
    #[arg(long)]
    pub no_progress: bool,

    /// Verbose logging (debug level unless RUST_LOG is set)
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_positive(value: &str) -> std::result::Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

impl MirrorCommand {
    pub fn into_config(self) -> Result<MirrorConfig> {
        let mut config = MirrorConfig::new(&self.url, &self.output_dir)?
            .with_max_depth(self.max_depth)
            .with_max_pages(self.max_pages)
            .with_max_concurrent(self.max_concurrent)
            .with_politeness_delay(Duration::from_millis(self.delay_ms))
            .with_timeout(Duration::from_secs(self.timeout))
            .with_max_redirects(self.max_redirects)
            .with_ignore_query(self.ignore_query)
            .with_max_retries(self.retries)
            .with_progress(!self.no_progress);

        if let Some(user_agent) = self.user_agent {
            config = config.with_user_agent(user_agent);
        }
        if let Some(user) = self.user {
            config = config.with_seed_credentials(Credentials::new(user, self.password));
        }
        for entry in &self.auth {
            let (origin, credentials) = entry.split_once('=').ok_or_else(|| {
                MirrorError::Config(format!("--auth expects ORIGIN=USER:PASS, got '{}'", entry))
            })?;
            config = config.with_credentials(origin, Credentials::parse(credentials)?)?;
        }

        config.validate()?;
        Ok(config)
    }
}
