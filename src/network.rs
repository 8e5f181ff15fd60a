//! The single-GET fetch primitive and the endpoint-pinned HTTP client
//! every connection owns.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, CONTENT_TYPE, LOCATION, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use url::Url;

use crate::parser;
use crate::robots::RobotsRules;
use crate::url_utils::RelativeUrl;

pub const USER_AGENT: &str = "natprobe/1.0";

/// Raise to the server's Retry-After on a 429 without one, extend by this
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("dial failed: {0}")]
    Dial(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("failed to build http client: {0}")]
    ClientBuild(String),
}

impl FetchError {
    fn classify(error: reqwest::Error) -> Self {
        // Connect timeouts count as dial failures: the socket never opened.
        if error.is_connect() {
            FetchError::Dial(error.to_string())
        } else if error.is_timeout() {
            FetchError::Timeout(error.to_string())
        } else {
            FetchError::Transport(error.to_string())
        }
    }

    /// Dial failures are the saturation signal: the middlebox may have
    /// run out of ports for this client.
    pub fn is_dial(&self) -> bool {
        matches!(self, FetchError::Dial(_))
    }

    /// Whether the connection's pinned flow can no longer be assumed held.
    /// Timeouts are excluded: the socket opened and stays open.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FetchError::Timeout(_))
    }
}

/// Build the HTTP client for one connection.
///
/// Every client needs its own transport so no two connections can ever be
/// coalesced onto one TCP flow, which would undercount NAT mappings. The
/// transport holds a single connection that never idle-closes, and its
/// dial step is hard-bound to `endpoint` instead of re-resolving the URL
/// host; TLS SNI still comes from the URL.
pub fn build_pinned_client(
    url: &Url,
    endpoint: SocketAddr,
    config: &ClientConfig,
) -> Result<Client, FetchError> {
    let host = url
        .host_str()
        .ok_or_else(|| FetchError::ClientBuild(format!("url has no host: {url}")))?;

    Client::builder()
        .user_agent(USER_AGENT)
        .resolve(host, endpoint)
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .pool_max_idle_per_host(1)
        .pool_idle_timeout(None)
        .tcp_keepalive(Duration::from_secs(10))
        .tcp_nodelay(true)
        .http1_only()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| FetchError::ClientBuild(e.to_string()))
}

/// One request/reply cycle on a connection: what was asked, when, and
/// everything scraped out of the answer.
#[derive(Debug)]
pub struct Roundtrip {
    pub conn_id: u64,
    pub target: RelativeUrl,
    pub url: Url,
    pub crawl_delay: Duration,
    pub request_ts: Option<Instant>,
    pub reply_ts: Option<Instant>,
    pub status: Option<StatusCode>,
    pub scraped_urls: Vec<Url>,
    pub robots: Option<RobotsRules>,
    pub error: Option<FetchError>,
}

impl Roundtrip {
    pub fn new(conn_id: u64, target: RelativeUrl, url: Url, crawl_delay: Duration) -> Self {
        Self {
            conn_id,
            target,
            url,
            crawl_delay,
            request_ts: None,
            reply_ts: None,
            status: None,
            scraped_urls: Vec::new(),
            robots: None,
            error: None,
        }
    }
}

/// Issue the roundtrip's GET on the connection's pinned client and scrape
/// the reply. Redirects are not followed; the Location target joins the
/// scraped URL set instead. The body is always consumed so the flow stays
/// reusable.
pub async fn crawl_target(client: Client, mut roundtrip: Roundtrip) -> Roundtrip {
    roundtrip.request_ts = Some(Instant::now());
    let response = client.get(roundtrip.url.clone()).send().await;
    roundtrip.reply_ts = Some(Instant::now());

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            roundtrip.error = Some(FetchError::classify(e));
            return roundtrip;
        }
    };

    let status = response.status();
    roundtrip.status = Some(status);
    let headers = response.headers().clone();

    if status == StatusCode::TOO_MANY_REQUESTS {
        match parse_retry_after(&headers) {
            Some(retry) => roundtrip.crawl_delay = roundtrip.crawl_delay.max(retry),
            None => roundtrip.crawl_delay += RATE_LIMIT_BACKOFF,
        }
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let location = headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|loc| roundtrip.url.join(loc.trim()).ok())
        .filter(crate::url_utils::is_crawlable);

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            roundtrip.error = Some(FetchError::classify(e));
            return roundtrip;
        }
    };

    let mut urls = Vec::new();
    if is_robots_reply(content_type.as_deref(), &roundtrip.url) {
        let body = String::from_utf8_lossy(&body);
        let rules = RobotsRules::parse(&body);
        if let Some(delay) = rules.crawl_delay() {
            roundtrip.crawl_delay = delay;
        }
        roundtrip.robots = Some(rules);
    } else if is_html_reply(content_type.as_deref(), &roundtrip.url) {
        let body = String::from_utf8_lossy(&body);
        urls = parser::scrap_html(&roundtrip.url, &body);
    }

    if let Some(location) = location {
        let duplicate = urls
            .iter()
            .any(|u| u.host_str() == location.host_str() && u.path() == location.path());
        if !duplicate {
            urls.push(location);
        }
    }

    roundtrip.scraped_urls = urls;
    roundtrip
}

fn is_robots_reply(content_type: Option<&str>, url: &Url) -> bool {
    url.path().ends_with("robots.txt")
        && content_type.is_some_and(|ct| ct.starts_with("text/plain"))
}

fn is_html_reply(content_type: Option<&str>, url: &Url) -> bool {
    match content_type {
        Some(ct) => ct.starts_with("text/html") || ct.starts_with("application/xhtml+xml"),
        None => url.path().ends_with(".html"),
    }
}

/// Retry-After is either delta-seconds or an HTTP-date; the last header
/// value wins. Dates already in the past yield nothing.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get_all(RETRY_AFTER).iter().last()?.to_str().ok()?;
    let value = value.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    when.signed_duration_since(chrono::Utc::now()).to_std().ok()
}
