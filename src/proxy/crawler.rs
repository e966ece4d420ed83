//! Link crawler for harvesting proxy candidates from listing sites
//!
//! Walks a site breadth-first from a start URL, one depth at a time. Every
//! URL of a depth is fetched concurrently, bounded by an admission gate, and
//! the links each page yields become the next depth's frontier. Only links on
//! the same origin as the target are followed and no URL is fetched twice.

use crate::proxy::gateway::{
    Endpoint, Fetcher, RequestContext, RequestKind, Transport, DEFAULT_FETCH_TIMEOUT_SECS,
};
use crate::proxy::ledger::ErrorLedger;
use crate::proxy::models::ProxyCandidate;
use crate::proxy::parser::PageParser;
use crate::Result;
use anyhow::Context;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

/// Default number of concurrent page fetches
const DEFAULT_CONCURRENCY: usize = 10;

const COMPONENT: &str = "LinkCrawler";

/// A site to crawl
#[derive(Debug, Clone)]
pub struct CrawlTarget {
    pub start_url: Url,
    /// Links must share scheme and host with this URL to be followed
    pub same_origin_base: Url,
    pub max_depth: usize,
}

impl CrawlTarget {
    /// Crawl `start_url`, following links on its own origin
    pub fn new(start_url: &str, max_depth: usize) -> Result<Self> {
        let start_url =
            Url::parse(start_url).with_context(|| format!("invalid start url: {}", start_url))?;
        Ok(Self {
            same_origin_base: start_url.clone(),
            start_url,
            max_depth,
        })
    }

    pub fn with_origin_base(mut self, base: &str) -> Result<Self> {
        self.same_origin_base =
            Url::parse(base).with_context(|| format!("invalid origin base: {}", base))?;
        Ok(self)
    }

    /// Whether `url` shares scheme and host with the origin base
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.scheme() == self.same_origin_base.scheme()
            && url.host_str() == self.same_origin_base.host_str()
    }
}

/// Fetch accounting for one crawl
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrawlStats {
    /// Fetch attempts, one per dispatched URL
    pub fetched: usize,
    /// Attempts that ended in a failure
    pub errors: usize,
}

impl CrawlStats {
    pub fn merge(&mut self, other: CrawlStats) {
        self.fetched += other.fetched;
        self.errors += other.errors;
    }
}

/// Result of crawling one target
#[derive(Debug, Clone, Default)]
pub struct CrawlResult {
    pub candidates: HashSet<ProxyCandidate>,
    pub stats: CrawlStats,
    /// Every URL dispatched during the crawl
    pub visited: HashSet<String>,
}

/// Configuration for the link crawler
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// In-flight page fetches allowed at once
    pub max_concurrency: usize,
    /// Timeout for each page fetch
    pub fetch_timeout: Duration,
    /// How pages are fetched; anything but `Direct` goes through a proxy
    pub transport: Transport,
    /// Proxy to fetch through; required for `PublicProxy`, optional for Tor
    pub endpoint: Option<Endpoint>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_CONCURRENCY,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            transport: Transport::Direct,
            endpoint: None,
        }
    }
}

impl CrawlerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    fn request(&self) -> (RequestKind, RequestContext) {
        let kind = match self.transport {
            Transport::Direct => RequestKind::GetDirect,
            Transport::Tor | Transport::PublicProxy => RequestKind::GetProxied,
        };
        let mut ctx = RequestContext::direct().with_timeout(self.fetch_timeout);
        ctx.transport = self.transport;
        ctx.endpoint = self.endpoint.clone();
        (kind, ctx)
    }
}

/// Mutable crawl state, touched by every fetch task
#[derive(Default)]
struct CrawlState {
    visited: HashSet<String>,
    candidates: HashMap<String, ProxyCandidate>,
    next_frontier: Vec<Url>,
    queued: HashSet<String>,
}

impl CrawlState {
    /// Mark every unvisited URL as visited and return those to dispatch
    fn claim(&mut self, frontier: Vec<Url>) -> Vec<Url> {
        frontier
            .into_iter()
            .filter(|url| self.visited.insert(url.to_string()))
            .collect()
    }

    fn take_frontier(&mut self) -> Vec<Url> {
        self.queued.clear();
        std::mem::take(&mut self.next_frontier)
    }

    fn merge_page(&mut self, candidates: Vec<ProxyCandidate>, links: Vec<Url>) {
        for candidate in candidates {
            self.candidates
                .entry(candidate.sha.clone())
                .or_insert(candidate);
        }
        for link in links {
            let key = link.to_string();
            if !self.visited.contains(&key) && self.queued.insert(key) {
                self.next_frontier.push(link);
            }
        }
    }
}

/// Depth-bounded same-origin crawler
pub struct LinkCrawler {
    fetcher: Arc<dyn Fetcher>,
    ledger: Arc<ErrorLedger>,
    config: CrawlerConfig,
}

impl LinkCrawler {
    pub fn new(fetcher: Arc<dyn Fetcher>, ledger: Arc<ErrorLedger>) -> Self {
        Self::with_config(fetcher, ledger, CrawlerConfig::default())
    }

    pub fn with_config(
        fetcher: Arc<dyn Fetcher>,
        ledger: Arc<ErrorLedger>,
        config: CrawlerConfig,
    ) -> Self {
        Self {
            fetcher,
            ledger,
            config,
        }
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &ErrorLedger {
        &self.ledger
    }

    /// Crawl a target with the configured concurrency
    pub async fn crawl_target(&self, target: &CrawlTarget, parser: &dyn PageParser) -> CrawlResult {
        self.crawl(target, parser, self.config.max_concurrency).await
    }

    /// Crawl depths `0..=max_depth`, stopping early on an empty frontier
    pub async fn crawl(
        &self,
        target: &CrawlTarget,
        parser: &dyn PageParser,
        max_concurrency: usize,
    ) -> CrawlResult {
        let max_concurrency = max_concurrency.max(1);
        let gate = Semaphore::new(max_concurrency);
        let state = Mutex::new(CrawlState::default());
        let mut stats = CrawlStats::default();
        let mut frontier = vec![target.start_url.clone()];

        for depth in 0..=target.max_depth {
            let batch = state.lock().claim(frontier);
            if batch.is_empty() {
                debug!("{}: frontier empty at depth {}", target.start_url, depth);
                break;
            }
            info!("{}: depth {} with {} urls", target.start_url, depth, batch.len());

            let follow_links = depth < target.max_depth;
            let outcomes: Vec<bool> = stream::iter(batch)
                .map(|url| {
                    let gate = &gate;
                    let state = &state;
                    async move {
                        // the gate is never closed, so acquire cannot fail
                        let _permit = gate.acquire().await.ok();
                        self.fetch_page(url, target, parser, state, follow_links)
                            .await
                    }
                })
                .buffer_unordered(max_concurrency)
                .collect()
                .await;

            stats.fetched += outcomes.len();
            stats.errors += outcomes.iter().filter(|ok| !**ok).count();
            frontier = state.lock().take_frontier();
        }

        let state = state.into_inner();
        info!(
            "{}: fetched {} pages ({} errors), {} candidates",
            target.start_url,
            stats.fetched,
            stats.errors,
            state.candidates.len()
        );
        CrawlResult {
            candidates: state.candidates.into_values().collect(),
            stats,
            visited: state.visited,
        }
    }

    /// Fetch and parse one page; returns whether the fetch succeeded
    async fn fetch_page(
        &self,
        url: Url,
        target: &CrawlTarget,
        parser: &dyn PageParser,
        state: &Mutex<CrawlState>,
        follow_links: bool,
    ) -> bool {
        let (kind, ctx) = self.config.request();
        let response = match self.fetcher.fetch(kind, url.as_str(), &ctx, None).await {
            Ok(response) => response,
            Err(failure) => {
                warn!("fetch {} failed: {}", url, failure);
                self.ledger
                    .record_failure(COMPONENT, "fetch", &failure, Some(url.as_str()));
                return false;
            }
        };

        let page = parser.extract(response.bytes(), target.same_origin_base.as_str());
        let links: Vec<Url> = if follow_links {
            let base = Url::parse(response.url()).unwrap_or(url);
            page.links
                .iter()
                .filter_map(|href| resolve_link(&base, href))
                .filter(|link| target.is_same_origin(link))
                .collect()
        } else {
            Vec::new()
        };

        debug!(
            "{}: {} candidates, {} links",
            response.url(),
            page.candidates.len(),
            links.len()
        );
        state.lock().merge_page(page.candidates, links);
        true
    }
}

/// Resolve an href against the page it was found on, dropping fragments
fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let mut link = base.join(href).ok()?;
    if !matches!(link.scheme(), "http" | "https") {
        return None;
    }
    link.set_fragment(None);
    Some(link)
}
