//! robots.txt parsing: the crawl delay a server asks for, plus path
//! allow/deny decisions for the crawl targets we pick.

use std::time::Duration;

use robotstxt::DefaultMatcher;
use url::Url;

use crate::network::USER_AGENT;

/// Parsed view of a server's robots.txt, kept on the connection that
/// fetched it. Path membership is delegated to the robotstxt matcher
/// (first-match, most-specific-prefix semantics); the crawl delay is
/// extracted by hand since the matcher does not expose it.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    crawl_delay: Option<Duration>,
    raw: String,
}

impl RobotsRules {
    pub fn parse(body: &str) -> Self {
        Self {
            crawl_delay: extract_crawl_delay(body, USER_AGENT),
            raw: body.to_string(),
        }
    }

    /// The wildcard-agent Crawl-delay, if one was declared
    pub fn crawl_delay(&self) -> Option<Duration> {
        self.crawl_delay
    }

    /// Whether the rules permit fetching the given URL
    pub fn allows(&self, url: &Url) -> bool {
        if self.raw.is_empty() {
            return true;
        }
        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.raw, USER_AGENT, url.as_str())
    }
}

/// Extract the Crawl-delay for the wildcard agent (or our own user
/// agent). Fractional seconds are permitted; the first value wins.
fn extract_crawl_delay(body: &str, user_agent: &str) -> Option<Duration> {
    let mut in_matching_agent = false;
    let mut crawl_delay = None;

    for line in body.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let lower = line.to_ascii_lowercase();
        if let Some(agent) = lower.strip_prefix("user-agent:") {
            let agent = agent.trim();
            in_matching_agent = agent == "*" || agent.eq_ignore_ascii_case(user_agent);
            continue;
        }

        if in_matching_agent && crawl_delay.is_none() {
            if let Some(value) = lower.strip_prefix("crawl-delay:") {
                if let Ok(secs) = value.trim().parse::<f64>() {
                    if secs.is_finite() && secs >= 0.0 {
                        crawl_delay = Some(Duration::from_secs_f64(secs));
                    }
                }
            }
        }
    }

    crawl_delay
}
