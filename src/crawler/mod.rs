//! Breadth-first same-origin site crawler
//!
//! Fetches pages through the shared request pipeline, inheriting its
//! retry, caching, and circuit-breaker behavior transparently. The
//! frontier is processed serially with a politeness delay and an optional
//! requests-per-second cap; a single page's failure is a per-page fact,
//! never a crawl-aborting fault.

pub mod robots;
pub mod sitemap;

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::CrawlerConfig;
use crate::pipeline::{RequestDescriptor, SendService};

static ANCHOR_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("static anchor selector is valid"));

/// Outcome of one fetched page.
#[derive(Debug, Clone, Serialize)]
pub struct PageRecord {
    pub url: String,
    pub status_code: u16,
    /// Link distance from the seed; the seed itself is depth 0.
    pub depth: u32,
    pub ok: bool,
    pub errors: Vec<String>,
}

/// Aggregate counters for one crawl session.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlStats {
    pub pages_visited: usize,
    pub pages_failed: usize,
    pub links_discovered: usize,
    pub robots_skipped: usize,
    pub elapsed_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Everything a crawl produces, returned as one value once the frontier
/// empties or a budget is exhausted.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlResult {
    pub session_id: String,
    pub seed: String,
    pub pages: Vec<PageRecord>,
    pub sitemap_xml: String,
    pub stats: CrawlStats,
}

/// Breadth-first crawler over the shared send pipeline.
pub struct Crawler<S> {
    service: Arc<S>,
    config: CrawlerConfig,
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl<S: SendService> Crawler<S> {
    pub fn new(service: Arc<S>, config: CrawlerConfig) -> Self {
        let limiter = NonZeroU32::new(config.max_requests_per_second)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));
        Self { service, config, limiter }
    }

    /// Crawl from a seed URL until the frontier empties, a budget is
    /// exhausted, or the caller cancels. Returns `Err` only for an
    /// unusable seed or an unwritable output directory; page-level
    /// failures land in the result set.
    pub async fn crawl(&self, seed: &str, cancel: CancellationToken) -> Result<CrawlResult> {
        let seed_url = Url::parse(seed).with_context(|| format!("invalid seed url: {seed}"))?;
        anyhow::ensure!(seed_url.host_str().is_some(), "seed url has no host: {seed}");

        let session_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let started_at = Utc::now();
        info!("crawl session {session_id} starting at {seed_url}");

        let robots = if self.config.respect_robots_txt {
            robots::RobotsPolicy::fetch(
                self.service.as_ref(),
                &seed_url,
                &self.config.user_agent,
                &cancel,
            )
            .await
        } else {
            robots::RobotsPolicy::allow_all()
        };

        if self.config.save_pages_to_disk {
            tokio::fs::create_dir_all(&self.config.output_directory)
                .await
                .with_context(|| {
                    format!(
                        "failed to create output directory {}",
                        self.config.output_directory.display()
                    )
                })?;
        }

        let mut frontier: VecDeque<(Url, u32)> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(normalize_url(&seed_url));
        frontier.push_back((seed_url.clone(), 0));

        let mut pages: Vec<PageRecord> = Vec::new();
        let mut links_discovered = 0usize;
        let mut robots_skipped = 0usize;

        while let Some((url, depth)) = frontier.pop_front() {
            if pages.len() >= self.config.max_pages {
                info!("page budget ({}) reached; stopping", self.config.max_pages);
                break;
            }
            if cancel.is_cancelled() {
                info!("crawl session {session_id} cancelled");
                break;
            }
            if !robots.allows(url.path()) {
                debug!("robots.txt disallows {url}; skipping");
                robots_skipped += 1;
                continue;
            }

            // Politeness: delay between fetches, never before the first.
            if !pages.is_empty() && self.config.request_delay_ms > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.config.request_delay_ms)) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    _ = limiter.until_ready() => {}
                    _ = cancel.cancelled() => break,
                }
            }

            let request = RequestDescriptor::<String>::get(url.as_str())
                .with_header("User-Agent", self.config.user_agent.clone())
                .with_header("Accept", "text/html,application/xhtml+xml");
            let result = self.service.dispatch(request, cancel.clone()).await;

            let mut record = PageRecord {
                url: url.to_string(),
                status_code: result.status_code,
                depth,
                ok: result.is_success(),
                errors: result.errors.clone(),
            };

            match result.response_body.as_deref() {
                Some(body) if record.ok => {
                    if self.config.validate_html && !looks_like_html(body) {
                        record.ok = false;
                        record.errors.push(format!("html validation failed for {url}"));
                    } else {
                        if self.config.save_pages_to_disk {
                            self.save_page(&url, body).await;
                        }
                        if depth < self.config.max_depth {
                            for link in extract_same_origin_links(body, &url, &seed_url) {
                                links_discovered += 1;
                                if visited.insert(normalize_url(&link)) {
                                    frontier.push_back((link, depth + 1));
                                }
                            }
                        }
                    }
                }
                _ => {
                    if !record.ok {
                        warn!("page fetch failed ({}): {}", record.status_code, url);
                    }
                }
            }
            pages.push(record);
        }

        let completed_at = Utc::now();
        let sitemap_xml = sitemap::render_sitemap(&pages, completed_at);
        let stats = CrawlStats {
            pages_visited: pages.len(),
            pages_failed: pages.iter().filter(|p| !p.ok).count(),
            links_discovered,
            robots_skipped,
            elapsed_ms: started.elapsed().as_millis() as u64,
            started_at,
            completed_at,
        };
        info!(
            "crawl session {session_id} finished: {} pages ({} failed) in {}ms",
            stats.pages_visited, stats.pages_failed, stats.elapsed_ms
        );

        Ok(CrawlResult {
            session_id,
            seed: seed_url.to_string(),
            pages,
            sitemap_xml,
            stats,
        })
    }

    /// Persist one page's raw HTML. Best-effort: a write failure is
    /// logged and does not fail the page or the crawl.
    async fn save_page(&self, url: &Url, body: &str) {
        let path = self.config.output_directory.join(page_file_name(url));
        if let Err(e) = tokio::fs::write(&path, body).await {
            warn!("failed to persist {url} to {}: {e}", path.display());
        }
    }
}

/// Scan a fetched page for same-origin anchor links, resolved against the
/// page URL with fragments stripped.
fn extract_same_origin_links(body: &str, page_url: &Url, seed_url: &Url) -> Vec<Url> {
    let document = Html::parse_document(body);
    let mut links = Vec::new();
    for element in document.select(&ANCHOR_SELECTOR) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Ok(mut resolved) = page_url.join(href) else {
            debug!("unresolvable link {href:?} on {page_url}");
            continue;
        };
        resolved.set_fragment(None);
        if is_same_origin(&resolved, seed_url) {
            links.push(resolved);
        }
    }
    links
}

/// A link is traversable when it shares scheme, host, and effective port
/// with the crawl seed.
fn is_same_origin(candidate: &Url, seed: &Url) -> bool {
    candidate.scheme() == seed.scheme()
        && candidate.host_str() == seed.host_str()
        && candidate.port_or_known_default() == seed.port_or_known_default()
}

/// Canonical form used for visited-set bookkeeping: no fragment, no
/// trailing slash except on the root path.
fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut text = normalized.to_string();
    if text.ends_with('/') && normalized.path() != "/" {
        text.pop();
    }
    text
}

/// Shallow structural check used by the validate_html toggle.
fn looks_like_html(body: &str) -> bool {
    let head: String = body.chars().take(2048).collect::<String>().to_ascii_lowercase();
    head.contains("<!doctype html") || head.contains("<html")
}

fn page_file_name(url: &Url) -> String {
    let raw = format!("{}{}", url.host_str().unwrap_or("page"), url.path());
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    name.truncate(120);
    format!("{name}.html")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::de::DeserializeOwned;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::pipeline::sender::decode_payload;

    /// In-memory site served through the SendService contract.
    struct MockSite {
        pages: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl MockSite {
        fn new(pages: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                pages: pages
                    .iter()
                    .map(|(url, body)| (url.to_string(), body.to_string()))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SendService for MockSite {
        async fn dispatch<T>(
            &self,
            mut request: RequestDescriptor<T>,
            _cancel: CancellationToken,
        ) -> RequestDescriptor<T>
        where
            T: DeserializeOwned + Send + 'static,
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.pages.get(&request.path) {
                Some(body) => {
                    request.status_code = 200;
                    request.payload = decode_payload::<T>(body).ok();
                    request.response_body = Some(body.clone());
                }
                None => {
                    request.status_code = 404;
                    request.record_error(format!("HTTP error status 404 from {}", request.path));
                }
            }
            request
        }
    }

    fn quick_config() -> CrawlerConfig {
        CrawlerConfig {
            request_delay_ms: 0,
            max_requests_per_second: 0,
            respect_robots_txt: false,
            ..CrawlerConfig::default()
        }
    }

    fn links_page(hrefs: &[&str]) -> String {
        let anchors: String = hrefs
            .iter()
            .map(|h| format!("<a href=\"{h}\">link</a>"))
            .collect();
        format!("<html><body>{anchors}</body></html>")
    }

    #[tokio::test]
    async fn budgets_cap_pages_and_depth() {
        let hrefs: Vec<String> = (0..10).map(|i| format!("/p{i}")).collect();
        let href_refs: Vec<&str> = hrefs.iter().map(String::as_str).collect();
        let mut pages: Vec<(String, String)> =
            vec![("https://site.test/".to_string(), links_page(&href_refs))];
        for i in 0..10 {
            // Every first-level page links one level deeper.
            pages.push((
                format!("https://site.test/p{i}"),
                links_page(&[&format!("/deep/{i}")]),
            ));
        }
        let page_refs: Vec<(&str, &str)> = pages
            .iter()
            .map(|(u, b)| (u.as_str(), b.as_str()))
            .collect();
        let site = MockSite::new(&page_refs);

        let config = CrawlerConfig {
            max_pages: 5,
            max_depth: 1,
            ..quick_config()
        };
        let crawler = Crawler::new(Arc::clone(&site), config);
        let result = crawler
            .crawl("https://site.test/", CancellationToken::new())
            .await
            .expect("crawl");

        assert_eq!(result.stats.pages_visited, 5);
        assert_eq!(site.calls.load(Ordering::SeqCst), 5);
        assert!(
            result.pages.iter().all(|p| !p.url.contains("/deep/")),
            "depth-2 pages must never be fetched"
        );
    }

    #[tokio::test]
    async fn page_failure_does_not_abort_the_crawl() {
        let site = MockSite::new(&[
            ("https://site.test/", &links_page(&["/missing", "/ok"])),
            ("https://site.test/ok", "<html><body>fine</body></html>"),
        ]);
        let crawler = Crawler::new(Arc::clone(&site), quick_config());
        let result = crawler
            .crawl("https://site.test/", CancellationToken::new())
            .await
            .expect("crawl");

        assert_eq!(result.stats.pages_visited, 3);
        assert_eq!(result.stats.pages_failed, 1);
        let failed: Vec<_> = result.pages.iter().filter(|p| !p.ok).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status_code, 404);
    }

    #[tokio::test]
    async fn external_links_are_not_followed() {
        let site = MockSite::new(&[(
            "https://site.test/",
            &links_page(&["https://elsewhere.test/page", "mailto:x@site.test", "/local"]),
        ), ("https://site.test/local", "<html></html>")]);
        let crawler = Crawler::new(Arc::clone(&site), quick_config());
        let result = crawler
            .crawl("https://site.test/", CancellationToken::new())
            .await
            .expect("crawl");

        assert_eq!(result.stats.pages_visited, 2);
        assert!(result.pages.iter().all(|p| p.url.starts_with("https://site.test")));
    }

    #[tokio::test]
    async fn duplicate_links_are_fetched_once() {
        let site = MockSite::new(&[
            ("https://site.test/", &links_page(&["/a", "/a", "/a#section", "/a/"])),
            ("https://site.test/a", "<html></html>"),
        ]);
        let crawler = Crawler::new(Arc::clone(&site), quick_config());
        let result = crawler
            .crawl("https://site.test/", CancellationToken::new())
            .await
            .expect("crawl");

        assert_eq!(result.stats.pages_visited, 2);
    }

    #[tokio::test]
    async fn robots_exclusions_are_honored() {
        let site = MockSite::new(&[
            (
                "https://site.test/robots.txt",
                "User-agent: *\nDisallow: /private",
            ),
            ("https://site.test/", &links_page(&["/private/x", "/public"])),
            ("https://site.test/public", "<html></html>"),
        ]);
        let config = CrawlerConfig {
            respect_robots_txt: true,
            ..quick_config()
        };
        let crawler = Crawler::new(Arc::clone(&site), config);
        let result = crawler
            .crawl("https://site.test/", CancellationToken::new())
            .await
            .expect("crawl");

        assert_eq!(result.stats.robots_skipped, 1);
        assert!(result.pages.iter().all(|p| !p.url.contains("/private")));
    }

    #[tokio::test]
    async fn html_validation_marks_non_html_failed() {
        let site = MockSite::new(&[
            ("https://site.test/", &links_page(&["/blob"])),
            ("https://site.test/blob", "%PDF-1.7 binary soup"),
        ]);
        let config = CrawlerConfig {
            validate_html: true,
            ..quick_config()
        };
        let crawler = Crawler::new(Arc::clone(&site), config);
        let result = crawler
            .crawl("https://site.test/", CancellationToken::new())
            .await
            .expect("crawl");

        let blob = result
            .pages
            .iter()
            .find(|p| p.url.ends_with("/blob"))
            .expect("blob fetched");
        assert!(!blob.ok);
        assert!(blob.errors.iter().any(|e| e.contains("html validation failed")));
    }

    #[tokio::test]
    async fn pages_are_persisted_when_enabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let site = MockSite::new(&[(
            "https://site.test/",
            "<html><body>home</body></html>",
        )]);
        let config = CrawlerConfig {
            save_pages_to_disk: true,
            output_directory: dir.path().to_path_buf(),
            ..quick_config()
        };
        let crawler = Crawler::new(Arc::clone(&site), config);
        crawler
            .crawl("https://site.test/", CancellationToken::new())
            .await
            .expect("crawl");

        let saved: Vec<_> = std::fs::read_dir(dir.path()).expect("read dir").collect();
        assert_eq!(saved.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_frontier() {
        let site = MockSite::new(&[(
            "https://site.test/",
            &links_page(&["/a", "/b", "/c"]),
        )]);
        let config = CrawlerConfig {
            request_delay_ms: 50,
            ..quick_config()
        };
        let crawler = Crawler::new(Arc::clone(&site), config);
        let cancel = CancellationToken::new();
        cancel.cancel();

        // Already-cancelled token: the seed is dequeued but the loop
        // exits before any fetch.
        let result = crawler.crawl("https://site.test/", cancel).await.expect("crawl");
        assert_eq!(result.stats.pages_visited, 0);
    }

    #[test]
    fn origin_comparison_considers_scheme_host_port() {
        let seed = Url::parse("https://site.test/").expect("seed");
        for (candidate, expected) in [
            ("https://site.test/about", true),
            ("https://site.test:443/about", true),
            ("http://site.test/about", false),
            ("https://other.test/", false),
            ("https://sub.site.test/", false),
        ] {
            let url = Url::parse(candidate).expect("candidate");
            assert_eq!(is_same_origin(&url, &seed), expected, "{candidate}");
        }
    }

    #[test]
    fn normalization_strips_fragment_and_trailing_slash() {
        let a = Url::parse("https://site.test/page/").expect("a");
        let b = Url::parse("https://site.test/page#top").expect("b");
        assert_eq!(normalize_url(&a), normalize_url(&b));

        let root = Url::parse("https://site.test/").expect("root");
        assert_eq!(normalize_url(&root), "https://site.test/");
    }

    #[test]
    fn file_names_are_sanitized() {
        let url = Url::parse("https://site.test/a/b?q=1").expect("url");
        let name = page_file_name(&url);
        assert!(name.ends_with(".html"));
        assert!(!name.contains('/'));
    }
}
