//! The measurement orchestrator: one cooperative event loop that owns
//! every connection, fed by a bounded worker pool that only runs DNS
//! lookups and fetches. All state mutation happens in the loop; workers
//! hand results back over reply channels and are applied serially.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::connection::{Connection, LookupQueue};
use crate::network::{self, ClientConfig, Roundtrip};
use crate::resolver::{self, ResolvedUrl};
use crate::url_utils;

/// Idle tick bounding the wait when nothing is runnable
const IDLE_TICK: Duration = Duration::from_millis(50);

/// Rolling window of crawl dispatches watched for pool growth
const DISPATCH_WINDOW: usize = 10;

#[derive(Debug, Clone)]
pub struct MeasureConfig {
    /// Largest request gap tolerated on an idle connection before its
    /// NAT mapping is at risk. 3.5s sits under the tightest common HTTP
    /// keep-alive (5s) with slack for scheduling.
    pub keep_alive: Duration,
    /// Hard cap on the worker pool; None lets it grow with the seed list
    pub max_workers: Option<usize>,
    /// Consecutive dial failures read as NAT saturation
    pub dial_fail_limit: u32,
    /// Also stop once every seed host is accounted for. Only sound for
    /// closed topologies where crawling never discovers new servers.
    pub seed_coverage_stop: bool,
    pub client: ClientConfig,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_millis(3500),
            max_workers: None,
            dial_fail_limit: 5,
            seed_coverage_stop: false,
            client: ClientConfig::default(),
        }
    }
}

/// Why the measurement loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Every reachable server is held open and fully crawled
    Complete,
    /// Repeated dial failures: the middlebox is refusing new flows
    Saturated,
    /// The external stop signal was asserted
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct MeasureReport {
    /// Connections still held open when the loop stopped
    pub connections: usize,
    pub termination: Termination,
}

/// What the next-crawl policy picked for this iteration
#[derive(Debug, Clone, Copy)]
enum CrawlSlot {
    /// Keep-alive refresh of an active connection
    Refresh(u64),
    /// First request of the oldest pending connection
    Pending,
    /// Extra crawl on an active connection to find new hosts
    Discover(u64),
}

pub struct Orchestrator {
    config: MeasureConfig,
    seed_count: usize,
    lookups: LookupQueue,
    pending: VecDeque<Connection>,
    active: Vec<Connection>,
    failed: Vec<Connection>,
    next_conn_id: u64,
    consecutive_dial_fails: u32,
    workers: Arc<Semaphore>,
    pool_size: usize,
    pool_limit: usize,
    dispatch_window: VecDeque<bool>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Prepare a run: seeds are deduplicated by host key and queued for
    /// resolution, and the worker pool is sized to the seed list.
    pub fn new(seeds: Vec<Url>, config: MeasureConfig) -> Self {
        let seeds = url_utils::dedup_by_host_key(seeds);
        let seed_count = seeds.len();

        let mut lookups = LookupQueue::default();
        for url in seeds {
            lookups.push_batch(vec![url]);
        }

        let cpus = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let mut pool_size = seed_count.min(2 * cpus).max(seed_count / 100).max(1);
        let mut pool_limit = seed_count.max(pool_size);
        if let Some(cap) = config.max_workers {
            let cap = cap.max(1);
            pool_size = pool_size.min(cap);
            pool_limit = pool_limit.min(cap);
        }

        Self {
            config,
            seed_count,
            lookups,
            pending: VecDeque::new(),
            active: Vec::new(),
            failed: Vec::new(),
            next_conn_id: 0,
            consecutive_dial_fails: 0,
            workers: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            pool_limit,
            dispatch_window: VecDeque::with_capacity(DISPATCH_WINDOW + 1),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the run from outside; the loop drains its
    /// workers before returning.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the measurement to termination. Returns how many connections
    /// were held open at that moment, which is a lower bound on the
    /// middlebox's concurrent mapping budget.
    pub async fn run(mut self) -> MeasureReport {
        let (lookup_tx, mut lookup_rx) = mpsc::channel::<ResolvedUrl>(1);
        let (crawl_tx, mut crawl_rx) = mpsc::channel::<Roundtrip>(1);

        tracing::info!(
            seeds = self.seed_count,
            workers = self.pool_size,
            "starting measurement"
        );

        let termination = loop {
            if self.cancel.is_cancelled() {
                break Termination::Cancelled;
            }
            if self.consecutive_dial_fails >= self.config.dial_fail_limit {
                break Termination::Saturated;
            }
            if self.is_complete() {
                break Termination::Complete;
            }

            let want_lookup = !self.lookups.is_empty();
            let next_crawl = self.select_crawl();
            let cancel = self.cancel.clone();

            tokio::select! {
                _ = cancel.cancelled() => {}
                Some(resolved) = lookup_rx.recv() => self.accept_resolved(resolved),
                Some(reply) = crawl_rx.recv() => self.apply_reply(reply),
                Ok(permit) = Arc::clone(&self.workers).acquire_owned(), if want_lookup => {
                    self.dispatch_lookup(permit, lookup_tx.clone());
                }
                Ok(permit) = Arc::clone(&self.workers).acquire_owned(), if next_crawl.is_some() => {
                    if let Some(slot) = next_crawl {
                        self.dispatch_crawl(permit, slot, crawl_tx.clone());
                    }
                }
                _ = tokio::time::sleep(IDLE_TICK) => {}
            }
        };

        self.drain_workers().await;

        let connections = self.active.len();
        tracing::info!(connections, ?termination, "measurement finished");
        MeasureReport {
            connections,
            termination,
        }
    }

    /// Next-crawl policy, in priority order: connections about to idle
    /// out of the NAT table, then the oldest pending connection, then
    /// spare-capacity discovery on the stalest active connection.
    fn select_crawl(&self) -> Option<CrawlSlot> {
        if let Some(conn) = self
            .active
            .iter()
            .find(|c| c.refresh_due(self.config.keep_alive))
        {
            return Some(CrawlSlot::Refresh(conn.id()));
        }

        if !self.pending.is_empty() {
            return Some(CrawlSlot::Pending);
        }

        if self.workers.available_permits() > 0 {
            if let Some(conn) = self
                .active
                .iter()
                .filter(|c| c.crawl_ready())
                .min_by_key(|c| c.last_reply())
            {
                return Some(CrawlSlot::Discover(conn.id()));
            }
        }

        None
    }

    fn dispatch_lookup(&mut self, permit: OwnedSemaphorePermit, tx: mpsc::Sender<ResolvedUrl>) {
        let Some(url) = self.lookups.pop() else { return };
        tracing::debug!(url = %url, "dispatching lookup");

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let resolved = resolver::resolve_ipv4(url).await;
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tx.send(resolved) => {}
            }
            drop(permit);
        });
    }

    fn dispatch_crawl(
        &mut self,
        permit: OwnedSemaphorePermit,
        slot: CrawlSlot,
        tx: mpsc::Sender<Roundtrip>,
    ) {
        let conn = match slot {
            CrawlSlot::Pending => {
                let Some(conn) = self.pending.pop_front() else {
                    return;
                };
                self.active.push(conn);
                let Some(conn) = self.active.last_mut() else {
                    return;
                };
                conn
            }
            CrawlSlot::Refresh(id) | CrawlSlot::Discover(id) => {
                let Some(conn) = self.active.iter_mut().find(|c| c.id() == id) else {
                    return;
                };
                conn
            }
        };

        let roundtrip = conn.make_roundtrip();
        conn.on_request_dispatched(&roundtrip.target);
        let client = conn.client();
        tracing::debug!(conn = conn.id(), url = %roundtrip.url, ?slot, "dispatching crawl");

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let reply = network::crawl_target(client, roundtrip).await;
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tx.send(reply) => {}
            }
            drop(permit);
        });

        self.record_dispatch(matches!(slot, CrawlSlot::Refresh(_)));
    }

    /// A resolved host becomes a pending connection on its first endpoint
    /// that no other connection has pinned. A host whose every address is
    /// already owned would share a NAT mapping and undercount, so it is
    /// dropped.
    fn accept_resolved(&mut self, resolved: ResolvedUrl) {
        let Some(endpoint) = resolved
            .addresses
            .iter()
            .copied()
            .find(|addr| !self.endpoint_owned(*addr))
        else {
            tracing::debug!(url = %resolved.url, "no unowned endpoint, discarding");
            return;
        };

        match Connection::new(
            self.next_conn_id,
            endpoint,
            resolved.url,
            self.config.keep_alive,
            &self.config.client,
        ) {
            Ok(conn) => {
                tracing::debug!(conn = conn.id(), endpoint = %endpoint, "new pending connection");
                self.next_conn_id += 1;
                self.pending.push_back(conn);
            }
            Err(e) => tracing::warn!(error = %e, "failed to build connection client"),
        }
    }

    fn endpoint_owned(&self, addr: SocketAddr) -> bool {
        self.pending
            .iter()
            .chain(self.active.iter())
            .any(|c| c.endpoint() == addr)
    }

    /// Apply one completed roundtrip: dial-failure accounting, timestamp
    /// and crawl-delay adoption, failure transitions, and routing of the
    /// scraped URLs either onto the owning connection or into a fresh
    /// lookup batch.
    fn apply_reply(&mut self, reply: Roundtrip) {
        let Some(idx) = self.active.iter().position(|c| c.id() == reply.conn_id) else {
            tracing::debug!(conn = reply.conn_id, "late reply for retired connection, dropping");
            return;
        };

        let is_dial = reply.error.as_ref().is_some_and(|e| e.is_dial());
        let is_fatal = reply.error.as_ref().is_some_and(|e| e.is_fatal());
        if is_dial {
            self.consecutive_dial_fails += 1;
            tracing::debug!(
                consecutive = self.consecutive_dial_fails,
                "dial failure observed"
            );
        } else if !self.active[idx].replied() {
            self.consecutive_dial_fails = 0;
        }

        self.active[idx].on_reply(&reply);

        if is_fatal {
            let conn = self.active.remove(idx);
            if let Some(error) = &reply.error {
                tracing::info!(conn = conn.id(), host = conn.host_key(), %error, "connection failed");
            }
            self.failed.push(conn);
        }

        // Route discoveries: URLs on servers we already hold go onto that
        // connection; the rest become one lookup batch, skipping hosts
        // that are pending or known-bad so no NAT mapping is wasted.
        let mut to_resolve: Vec<Url> = Vec::new();
        for url in &reply.scraped_urls {
            let Some(key) = url_utils::host_key(url) else {
                continue;
            };
            if let Some(conn) = self.active.iter_mut().find(|c| c.host_key() == key) {
                conn.steal_url(url);
                continue;
            }

            let known = to_resolve
                .iter()
                .any(|u| url_utils::host_key(u).as_deref() == Some(key.as_str()))
                || self.pending.iter().any(|c| c.host_key() == key)
                || self.failed.iter().any(|c| c.host_key() == key);
            if !known {
                to_resolve.push(url.clone());
            }
        }
        if !to_resolve.is_empty() {
            tracing::debug!(hosts = to_resolve.len(), "queueing discovered hosts");
            self.lookups.push_batch(to_resolve);
        }
    }

    /// Refresh dispatches are pure overhead for the measurement; when
    /// they crowd past 10% of the recent window, widen the pool so
    /// discovery keeps up.
    fn record_dispatch(&mut self, refresh: bool) {
        self.dispatch_window.push_back(refresh);
        if self.dispatch_window.len() > DISPATCH_WINDOW {
            self.dispatch_window.pop_front();
        }
        if self.dispatch_window.len() < DISPATCH_WINDOW {
            return;
        }

        let refreshes = self.dispatch_window.iter().filter(|r| **r).count();
        if refreshes <= DISPATCH_WINDOW / 10 {
            return;
        }

        let target = (self.pool_size + refreshes).min(self.pool_limit);
        if target > self.pool_size {
            self.workers.add_permits(target - self.pool_size);
            tracing::debug!(from = self.pool_size, to = target, "growing worker pool");
            self.pool_size = target;
            self.dispatch_window.clear();
        }
    }

    fn in_flight(&self) -> usize {
        self.pool_size.saturating_sub(self.workers.available_permits())
    }

    fn is_complete(&self) -> bool {
        if !self.lookups.is_empty() || !self.pending.is_empty() || self.in_flight() > 0 {
            return false;
        }

        if self.config.seed_coverage_stop
            && self.active.len() + self.failed.len() == self.seed_count
            && self.active.iter().all(Connection::replied)
        {
            return true;
        }

        self.active.iter().all(|c| !c.has_work())
    }

    /// Assert the stop signal and wait until every worker has observed it
    /// and released its permit. Reply channels are only closed afterwards
    /// so no late worker write can race their teardown.
    async fn drain_workers(&mut self) {
        self.cancel.cancel();
        let permits = u32::try_from(self.pool_size).unwrap_or(u32::MAX);
        if let Ok(all) = Arc::clone(&self.workers).acquire_many_owned(permits).await {
            drop(all);
        }
    }
}

/// Measure with default settings; the convenience entry point mirroring
/// the CLI behaviour.
pub async fn measure_max_connections(seeds: Vec<Url>) -> usize {
    Orchestrator::new(seeds, MeasureConfig::default())
        .run()
        .await
        .connections
}
