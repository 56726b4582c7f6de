//! Crawl a site from the command line and write its sitemap.
//!
//! Usage: `crawl_site <seed-url> [sitemap-output-path]`

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use sitefetch::{build_pipeline, logging, ConfigManager, Crawler};

#[tokio::main]
async fn main() -> Result<()> {
    let config_manager = ConfigManager::new()?;
    let config = config_manager.load_config().await?;
    logging::init_logging_with_config(&config.logging)?;

    let mut args = std::env::args().skip(1);
    let seed = args
        .next()
        .context("usage: crawl_site <seed-url> [sitemap-output-path]")?;
    let sitemap_path = args.next().unwrap_or_else(|| "sitemap.xml".to_string());

    let pipeline = Arc::new(build_pipeline(&config.http)?);
    let crawler = Crawler::new(pipeline, config.crawler.clone());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; finishing current page");
                cancel.cancel();
            }
        });
    }

    let result = crawler.crawl(&seed, cancel).await?;

    println!(
        "crawled {} pages ({} failed, {} skipped by robots.txt) in {}ms",
        result.stats.pages_visited,
        result.stats.pages_failed,
        result.stats.robots_skipped,
        result.stats.elapsed_ms
    );
    for page in result.pages.iter().filter(|p| !p.ok) {
        eprintln!("  failed [{}] {}", page.status_code, page.url);
    }

    tokio::fs::write(&sitemap_path, &result.sitemap_xml)
        .await
        .with_context(|| format!("failed to write sitemap to {sitemap_path}"))?;
    println!("sitemap written to {sitemap_path}");

    Ok(())
}
