//! Proxy harvesting engine
//!
//! This module provides functionality for:
//! - Sending requests directly, over Tor or through a public proxy
//! - Crawling proxy listing sites for candidates
//! - Validating candidates concurrently against judge endpoints
//! - Leasing validated proxies from an in-memory pool

pub mod crawler;
pub mod gateway;
pub mod harvest;
pub mod ledger;
pub mod models;
pub mod parser;
pub mod pool;
pub mod validator;

#[cfg(test)]
mod testing;

pub use crawler::{CrawlResult, CrawlStats, CrawlTarget, CrawlerConfig, LinkCrawler};
pub use gateway::{
    classify, fetch_public_ip, merge_args, Endpoint, FailureKind, Fetcher, GatewayConfig,
    Payload, RequestArgs, RequestContext, RequestFailure, RequestGateway, RequestKind,
    ResponseView, Transport,
};
pub use harvest::{HarvestConfig, HarvestReport, HarvestRun, Provider};
pub use ledger::{error_id, ErrorLedger, ErrorRecord, ErrorSummary};
pub use models::{Anonymity, Protocol, ProxyCandidate, ProxyVerdict};
pub use parser::{PageParser, ParsedPage, RegexPageParser};
pub use pool::VerdictPool;
pub use validator::{JudgeEndpoint, JudgeSet, ProxyValidator, ValidatorConfig};
