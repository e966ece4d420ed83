//! One harvesting run: crawl every provider, then validate what was found
//!
//! A [`HarvestRun`] owns everything the run touches: the gateway and one
//! error ledger per phase. Nothing outlives it.

use crate::proxy::crawler::{CrawlResult, CrawlStats, CrawlTarget, CrawlerConfig, LinkCrawler};
use crate::proxy::gateway::{
    fetch_public_ip, Fetcher, GatewayConfig, RequestFailure, RequestGateway,
};
use crate::proxy::ledger::{ErrorLedger, ErrorSummary};
use crate::proxy::models::{ProxyCandidate, ProxyVerdict};
use crate::proxy::parser::{PageParser, RegexPageParser};
use crate::proxy::pool::VerdictPool;
use crate::proxy::validator::{JudgeSet, ProxyValidator, ValidatorConfig};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Default number of providers crawled at once
const DEFAULT_PROVIDER_CONCURRENCY: usize = 4;

/// A proxy listing site and the parser that understands it
#[derive(Clone)]
pub struct Provider {
    pub target: CrawlTarget,
    pub parser: Arc<dyn PageParser>,
}

impl Provider {
    pub fn new(target: CrawlTarget, parser: Arc<dyn PageParser>) -> Self {
        Self { target, parser }
    }

    /// Provider read with the generic regex parser
    pub fn with_regex_parser(target: CrawlTarget) -> Self {
        Self::new(target, Arc::new(RegexPageParser::new()))
    }
}

/// Configuration for a harvesting run
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub crawler: CrawlerConfig,
    pub validator: ValidatorConfig,
    /// Providers crawled at once
    pub provider_concurrency: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            crawler: CrawlerConfig::default(),
            validator: ValidatorConfig::default(),
            provider_concurrency: DEFAULT_PROVIDER_CONCURRENCY,
        }
    }
}

impl HarvestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_crawler(mut self, crawler: CrawlerConfig) -> Self {
        self.crawler = crawler;
        self
    }

    pub fn with_validator(mut self, validator: ValidatorConfig) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_provider_concurrency(mut self, provider_concurrency: usize) -> Self {
        self.provider_concurrency = provider_concurrency;
        self
    }
}

/// Everything a run produced
#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Unique candidates across all providers, ordered by address
    pub candidates: Vec<ProxyCandidate>,
    /// Verdicts keyed by candidate `sha`
    pub verdicts: HashMap<String, ProxyVerdict>,
    pub crawl_stats: CrawlStats,
    pub crawl_errors: ErrorSummary,
    pub validation_errors: ErrorSummary,
}

impl HarvestReport {
    /// Candidates that passed validation
    pub fn usable(&self) -> impl Iterator<Item = &ProxyCandidate> {
        self.candidates
            .iter()
            .filter(|c| self.verdicts.get(&c.sha).map_or(false, ProxyVerdict::is_usable))
    }

    /// Leasable pool over this run's good proxies
    pub fn pool(&self) -> VerdictPool {
        VerdictPool::from_verdicts(&self.candidates, &self.verdicts)
    }
}

/// Run-scoped harvesting context
pub struct HarvestRun {
    run_id: Uuid,
    fetcher: Arc<dyn Fetcher>,
    crawl_ledger: Arc<ErrorLedger>,
    validation_ledger: Arc<ErrorLedger>,
    config: HarvestConfig,
}

impl HarvestRun {
    /// A run that talks to the network through a fresh gateway
    pub fn new(gateway: GatewayConfig, config: HarvestConfig) -> Self {
        Self::with_fetcher(Arc::new(RequestGateway::with_config(gateway)), config)
    }

    pub fn with_fetcher(fetcher: Arc<dyn Fetcher>, config: HarvestConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetcher,
            crawl_ledger: Arc::new(ErrorLedger::new()),
            validation_ledger: Arc::new(ErrorLedger::new()),
            config,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn crawl_ledger(&self) -> &ErrorLedger {
        &self.crawl_ledger
    }

    pub fn validation_ledger(&self) -> &ErrorLedger {
        &self.validation_ledger
    }

    /// Our public address as seen by an IP echo endpoint
    pub async fn discover_ip(&self, url: &str) -> Result<String, RequestFailure> {
        fetch_public_ip(self.fetcher.as_ref(), url).await
    }

    /// Crawl all providers, then validate every unique candidate
    pub async fn harvest(
        &self,
        providers: &[Provider],
        judges: &JudgeSet,
        my_ip: &str,
    ) -> HarvestReport {
        let started_at = Utc::now();
        info!(
            "run {}: crawling {} providers",
            self.run_id,
            providers.len()
        );

        let crawler = LinkCrawler::with_config(
            self.fetcher.clone(),
            self.crawl_ledger.clone(),
            self.config.crawler.clone(),
        );
        let results: Vec<CrawlResult> = stream::iter(providers)
            .map(|provider| crawler.crawl_target(&provider.target, provider.parser.as_ref()))
            .buffer_unordered(self.config.provider_concurrency.max(1))
            .collect()
            .await;

        let mut crawl_stats = CrawlStats::default();
        let mut unique: HashMap<String, ProxyCandidate> = HashMap::new();
        for result in results {
            crawl_stats.merge(result.stats);
            for candidate in result.candidates {
                unique.entry(candidate.sha.clone()).or_insert(candidate);
            }
        }
        let mut candidates: Vec<ProxyCandidate> = unique.into_values().collect();
        candidates.sort_by(|a, b| a.ip.cmp(&b.ip).then(a.port.cmp(&b.port)));

        info!(
            "run {}: {} candidates from {} fetches, validating",
            self.run_id,
            candidates.len(),
            crawl_stats.fetched
        );

        let validator = ProxyValidator::with_config(
            self.fetcher.clone(),
            self.validation_ledger.clone(),
            self.config.validator.clone(),
        );
        let verdicts = validator
            .validate_candidates(candidates.iter().cloned(), judges, my_ip)
            .await;

        let report = HarvestReport {
            run_id: self.run_id,
            started_at,
            finished_at: Utc::now(),
            candidates,
            verdicts,
            crawl_stats,
            crawl_errors: self.crawl_ledger.summary(),
            validation_errors: self.validation_ledger.summary(),
        };
        info!(
            "run {}: {} usable proxies, {} crawl errors, {} validation errors",
            self.run_id,
            report.usable().count(),
            report.crawl_errors.total_errors,
            report.validation_errors.total_errors
        );
        report
    }
}
