//! The per-connection state object and the rotating lookup queue. Each
//! connection must keep to exactly one server flow so the NAT mapping
//! count stays honest.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use reqwest::Client;
use url::Url;

use crate::network::{self, ClientConfig, FetchError, Roundtrip};
use crate::robots::RobotsRules;
use crate::url_utils::{self, RelativeUrl};

/// One NAT-consuming flow to one endpoint, with the crawl bookkeeping
/// that keeps it busy: which relative URLs are still to fetch, which one
/// is in flight, and when the flow last saw traffic.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    client: Client,
    endpoint: SocketAddr,
    host_key: String,
    seed: Url,
    uncrawled: HashSet<RelativeUrl>,
    crawling: HashSet<RelativeUrl>,
    crawled: HashSet<RelativeUrl>,
    crawl_delay: Duration,
    last_request: Option<Instant>,
    last_reply: Option<Instant>,
    robots: Option<RobotsRules>,
}

impl Connection {
    /// Build a connection pinned to `endpoint`, seeded with the target's
    /// relative URL and `/robots.txt`. The crawl delay starts at the
    /// keep-alive budget until robots.txt or a 429 says otherwise.
    pub fn new(
        id: u64,
        endpoint: SocketAddr,
        seed: Url,
        keep_alive: Duration,
        client_config: &ClientConfig,
    ) -> Result<Self, FetchError> {
        let host_key = url_utils::host_key(&seed)
            .ok_or_else(|| FetchError::ClientBuild(format!("seed url has no host: {seed}")))?;
        let client = network::build_pinned_client(&seed, endpoint, client_config)?;

        let mut uncrawled = HashSet::new();
        uncrawled.insert(RelativeUrl::robots());
        uncrawled.insert(RelativeUrl::from_url(&seed));

        Ok(Self {
            id,
            client,
            endpoint,
            host_key,
            seed,
            uncrawled,
            crawling: HashSet::new(),
            crawled: HashSet::new(),
            crawl_delay: keep_alive,
            last_request: None,
            last_reply: None,
            robots: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn host_key(&self) -> &str {
        &self.host_key
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn crawl_delay(&self) -> Duration {
        self.crawl_delay
    }

    pub fn last_reply(&self) -> Option<Instant> {
        self.last_reply
    }

    /// Whether this connection has received any reply at all
    pub fn replied(&self) -> bool {
        !self.crawled.is_empty()
    }

    /// Whether any crawl work remains, queued or in flight
    pub fn has_work(&self) -> bool {
        !self.uncrawled.is_empty() || !self.crawling.is_empty()
    }

    /// Due for a keep-alive refresh: idle long enough for the NAT mapping
    /// to be at risk, past the crawl delay, and nothing already in flight.
    pub fn refresh_due(&self, keep_alive: Duration) -> bool {
        self.crawling.is_empty()
            && age(self.last_reply) > keep_alive
            && age(self.last_request) > self.crawl_delay
    }

    /// Has uncrawled URLs and is past its crawl delay, with nothing in
    /// flight. Used to widen discovery when workers are free.
    pub fn crawl_ready(&self) -> bool {
        self.crawling.is_empty()
            && !self.uncrawled.is_empty()
            && age(self.last_request) >= self.crawl_delay
    }

    /// Pick the next crawl target: robots.txt before anything else, then
    /// any uncrawled URL the robots rules permit. Disallowed entries are
    /// retired unfetched. With nothing left the seed is re-requested,
    /// which is exactly the keep-alive refresh.
    fn next_crawl_target(&mut self) -> (RelativeUrl, Url) {
        let robots = RelativeUrl::robots();
        if self.uncrawled.contains(&robots) {
            let target = robots.resolve(&self.seed);
            return (robots, target);
        }

        while let Some(rel) = self.uncrawled.iter().next().cloned() {
            let target = rel.resolve(&self.seed);
            let allowed = self
                .robots
                .as_ref()
                .map(|rules| rules.allows(&target))
                .unwrap_or(true);
            if allowed {
                return (rel, target);
            }
            self.uncrawled.remove(&rel);
            self.crawled.insert(rel);
        }

        let seed_rel = RelativeUrl::from_url(&self.seed);
        let target = seed_rel.resolve(&self.seed);
        (seed_rel, target)
    }

    /// Build the request for the next crawl target on this connection
    pub fn make_roundtrip(&mut self) -> Roundtrip {
        let (rel, target) = self.next_crawl_target();
        Roundtrip::new(self.id, rel, target, self.crawl_delay)
    }

    /// Record a dispatched request: the target moves into `crawling` and
    /// the request clock restarts. Re-requests of already-crawled targets
    /// (refreshes) keep the three sets disjoint.
    pub fn on_request_dispatched(&mut self, rel: &RelativeUrl) {
        self.uncrawled.remove(rel);
        self.crawled.remove(rel);
        self.crawling.insert(rel.clone());
        self.last_request = Some(Instant::now());
    }

    /// Absorb a completed roundtrip: the target is retired, the clocks
    /// adopt the worker-observed timestamps, and any crawl-delay or
    /// robots update takes effect.
    pub fn on_reply(&mut self, roundtrip: &Roundtrip) {
        self.crawling.remove(&roundtrip.target);
        self.crawled.insert(roundtrip.target.clone());
        self.crawl_delay = roundtrip.crawl_delay;
        self.last_request = roundtrip.request_ts.or(self.last_request);
        self.last_reply = roundtrip.reply_ts.or(self.last_reply);
        if let Some(rules) = &roundtrip.robots {
            self.robots = Some(rules.clone());
        }
    }

    /// Adopt a URL discovered elsewhere that belongs to this connection's
    /// server. Already-crawled and in-flight targets are not re-queued.
    pub fn steal_url(&mut self, url: &Url) {
        let rel = RelativeUrl::from_url(url);
        if !self.crawling.contains(&rel) && !self.crawled.contains(&rel) {
            self.uncrawled.insert(rel);
        }
    }
}

fn age(ts: Option<Instant>) -> Duration {
    ts.map(|t| t.elapsed()).unwrap_or(Duration::MAX)
}

/// Rotates lookups from each crawl response so one link-heavy page does
/// not starve every other server's discovery.
#[derive(Debug, Default)]
pub struct LookupQueue {
    batches: VecDeque<Vec<Url>>,
}

impl LookupQueue {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn peek(&self) -> Option<&Url> {
        self.batches.front().and_then(|batch| batch.first())
    }

    /// Append one batch of URLs atomically
    pub fn push_batch(&mut self, batch: Vec<Url>) {
        if !batch.is_empty() {
            self.batches.push_back(batch);
        }
    }

    /// Take the first URL of the first batch; the batch remainder rotates
    /// to the tail so later batches get their turn.
    pub fn pop(&mut self) -> Option<Url> {
        let mut batch = self.batches.pop_front()?;
        let url = batch.remove(0);
        if !batch.is_empty() {
            self.batches.push_back(batch);
        }
        Some(url)
    }
}
