//! Minimal robots.txt gate
//!
//! Fetched once per crawl through the shared pipeline. Only `Disallow:`
//! prefix rules from groups matching the crawler's user agent (or `*`)
//! are honored; an unreachable or unparseable robots.txt means crawling
//! is allowed.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::{Position, Url};

use crate::pipeline::{RequestDescriptor, SendService};

/// Disallow rules applicable to this crawler.
#[derive(Debug, Clone, Default)]
pub struct RobotsPolicy {
    disallowed: Vec<String>,
}

impl RobotsPolicy {
    /// Policy with no exclusions.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Parse robots.txt content, keeping the rules of every group that
    /// names `*` or a token of the given user agent.
    pub fn parse(content: &str, user_agent: &str) -> Self {
        let agent_token = user_agent
            .split('/')
            .next()
            .unwrap_or(user_agent)
            .to_ascii_lowercase();

        let mut disallowed = Vec::new();
        let mut group_applies = false;
        let mut in_agent_lines = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match field.trim().to_ascii_lowercase().as_str() {
                "user-agent" => {
                    // Consecutive user-agent lines open a new group.
                    if !in_agent_lines {
                        group_applies = false;
                        in_agent_lines = true;
                    }
                    let agent = value.to_ascii_lowercase();
                    if agent == "*" || agent == agent_token {
                        group_applies = true;
                    }
                }
                "disallow" => {
                    in_agent_lines = false;
                    if group_applies && !value.is_empty() {
                        disallowed.push(value.to_string());
                    }
                }
                _ => {
                    in_agent_lines = false;
                }
            }
        }
        Self { disallowed }
    }

    /// Whether the given request path is crawlable.
    pub fn allows(&self, path: &str) -> bool {
        !self.disallowed.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Fetch and parse the seed origin's robots.txt through the pipeline.
    pub async fn fetch<S: SendService>(
        service: &S,
        seed: &Url,
        user_agent: &str,
        cancel: &CancellationToken,
    ) -> Self {
        let robots_url = format!("{}/robots.txt", &seed[..Position::BeforePath]);
        let request = RequestDescriptor::<String>::get(robots_url.as_str())
            .with_header("User-Agent", user_agent)
            .with_retries(0);
        let result = service.dispatch(request, cancel.clone()).await;

        if result.is_success() {
            if let Some(content) = result.payload {
                debug!("robots.txt loaded from {robots_url}");
                return Self::parse(&content, user_agent);
            }
        }
        warn!("could not fetch robots.txt from {robots_url}; assuming allowed");
        Self::allow_all()
    }
}
