use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use site_mirror::{CrawlReport, MirrorCommand, WebsiteMirror};

#[tokio::main]
async fn main() -> Result<()> {
    let args = MirrorCommand::parse();

    let default_filter = if args.verbose { "debug,hyper=info,reqwest=info" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let report_path = args.report.clone();
    let config = args.into_config().context("Invalid configuration")?;
    let mirror = WebsiteMirror::new(config).context("Failed to set up the mirror")?;

    let stop = mirror.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, letting in-flight downloads finish");
            stop.stop();
        }
    });

    let report = mirror.mirror_website().await?;
    print_summary(&report);

    if let Some(path) = report_path {
        report
            .write_json(&path)
            .with_context(|| format!("Failed to write report to {:?}", path))?;
        println!("📝 Report written to {:?}", path);
    }

    if !report.seed_mirrored() {
        anyhow::bail!("the seed URL {} could not be mirrored", report.seed);
    }

    println!("✅ Website mirroring completed successfully!");
    Ok(())
}

fn print_summary(report: &CrawlReport) {
    let summary = &report.summary;
    println!("📊 Pages mirrored: {}", summary.pages.to_string().green());
    println!("🖼️  Assets mirrored: {}", summary.assets.to_string().green());
    if summary.redirected > 0 {
        println!("↪️  Redirected: {}", summary.redirected);
    }
    println!("🌐 Out of scope: {}", summary.out_of_scope);
    if summary.beyond_depth > 0 {
        println!("🔗 Beyond depth limit: {}", summary.beyond_depth);
    }
    if summary.failed > 0 {
        println!("❌ Failed: {}", summary.failed.to_string().red());
        for (url, reason) in report.failures() {
            println!("   {} {}", url.yellow(), reason);
        }
    }
}
