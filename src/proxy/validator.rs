//! Proxy validator
//!
//! Probes every candidate through itself against judge endpoints: pages that
//! echo back the request environment. A judge answer proves the proxy
//! forwards requests, and whether our own address appears in it tells if the
//! proxy hides us.

use crate::proxy::gateway::{
    Fetcher, RequestContext, RequestFailure, RequestKind, ResponseView,
    DEFAULT_FETCH_TIMEOUT_SECS,
};
use crate::proxy::ledger::ErrorLedger;
use crate::proxy::models::{derive_bad_proxy, Protocol, ProxyCandidate, ProxyVerdict};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Present in a judge body only when the proxy forwarded our request headers
pub const ECHO_MARKER: &str = "HTTP_USER_AGENT";

/// Judge body of a proxy that rejected the request outright
pub const BAD_REQUEST_MARKER: &str = "HTTP/1.1 400 Bad Request";

/// Default number of judges tried per protocol before giving up
const DEFAULT_MAX_JUDGES: usize = 3;

/// Default number of candidates validated concurrently
const DEFAULT_CONCURRENCY: usize = 50;

const COMPONENT: &str = "ProxyValidator";

/// A judge page for one protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeEndpoint {
    pub url: String,
    pub protocol: Protocol,
}

impl JudgeEndpoint {
    pub fn new(url: &str, protocol: Protocol) -> Self {
        Self {
            url: url.to_string(),
            protocol,
        }
    }

    pub fn http(url: &str) -> Self {
        Self::new(url, Protocol::Http)
    }

    pub fn https(url: &str) -> Self {
        Self::new(url, Protocol::Https)
    }
}

/// Judge endpoints grouped by protocol
#[derive(Debug, Clone, Default)]
pub struct JudgeSet {
    judges: HashMap<Protocol, Vec<JudgeEndpoint>>,
}

impl JudgeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, judge: JudgeEndpoint) {
        self.judges.entry(judge.protocol).or_default().push(judge);
    }

    pub fn for_protocol(&self, protocol: Protocol) -> &[JudgeEndpoint] {
        self.judges
            .get(&protocol)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.judges.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<JudgeEndpoint> for JudgeSet {
    fn from_iter<I: IntoIterator<Item = JudgeEndpoint>>(iter: I) -> Self {
        let mut set = JudgeSet::new();
        for judge in iter {
            set.push(judge);
        }
        set
    }
}

/// Configuration for the proxy validator
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Failed judge attempts after which a protocol counts as bad
    pub max_judges_per_protocol: usize,
    /// Number of candidates validated at once
    pub concurrency: usize,
    /// Timeout for each judge probe
    pub probe_timeout: Duration,
    /// Verify TLS certificates of judges reached through a candidate
    pub verify_tls: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_judges_per_protocol: DEFAULT_MAX_JUDGES,
            concurrency: DEFAULT_CONCURRENCY,
            probe_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            verify_tls: false,
        }
    }
}

impl ValidatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_judges(mut self, max_judges_per_protocol: usize) -> Self {
        self.max_judges_per_protocol = max_judges_per_protocol;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_verify_tls(mut self, verify_tls: bool) -> Self {
        self.verify_tls = verify_tls;
        self
    }
}

/// What one judge probe showed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// No usable answer; counts as one failed attempt
    Failed(RequestFailure),
    /// The proxy forwarded the request but exposed our address
    Leaks,
    /// The proxy forwarded the request and hid our address
    Anonymous,
}

/// Judge a probe result
///
/// An empty `my_ip` disables the leak check.
pub fn judge_probe(result: Result<ResponseView, RequestFailure>, my_ip: &str) -> ProbeOutcome {
    let response = match result {
        Ok(response) => response,
        Err(failure) => return ProbeOutcome::Failed(failure),
    };
    let body = response.text();
    if body.contains(BAD_REQUEST_MARKER) {
        return ProbeOutcome::Failed(RequestFailure::bad_ip("bad-request"));
    }
    if !body.contains(ECHO_MARKER) {
        return ProbeOutcome::Failed(RequestFailure::bad_ip("missing-echo"));
    }
    if !my_ip.is_empty() && body.contains(my_ip) {
        return ProbeOutcome::Leaks;
    }
    ProbeOutcome::Anonymous
}

/// Per-protocol result of probing one candidate
#[derive(Debug, Clone, Copy, Default)]
struct ProtocolOutcome {
    bad: Option<bool>,
    failed: u32,
}

impl ProtocolOutcome {
    fn noresp(&self) -> Option<u32> {
        (self.failed > 0).then_some(self.failed)
    }
}

/// Concurrent validator for harvested candidates
pub struct ProxyValidator {
    fetcher: Arc<dyn Fetcher>,
    ledger: Arc<ErrorLedger>,
    config: ValidatorConfig,
}

impl ProxyValidator {
    pub fn new(fetcher: Arc<dyn Fetcher>, ledger: Arc<ErrorLedger>) -> Self {
        Self::with_config(fetcher, ledger, ValidatorConfig::default())
    }

    pub fn with_config(
        fetcher: Arc<dyn Fetcher>,
        ledger: Arc<ErrorLedger>,
        config: ValidatorConfig,
    ) -> Self {
        Self {
            fetcher,
            ledger,
            config,
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn ledger(&self) -> &ErrorLedger {
        &self.ledger
    }

    /// Validate with the configured judge budget
    pub async fn validate_candidates<I>(
        &self,
        candidates: I,
        judges: &JudgeSet,
        my_ip: &str,
    ) -> HashMap<String, ProxyVerdict>
    where
        I: IntoIterator<Item = ProxyCandidate>,
    {
        self.validate(candidates, judges, self.config.max_judges_per_protocol, my_ip)
            .await
    }

    /// Validate every candidate concurrently, keyed by candidate `sha`
    ///
    /// Candidates sharing a `sha` are validated once.
    pub async fn validate<I>(
        &self,
        candidates: I,
        judges: &JudgeSet,
        max_judges_per_protocol: usize,
        my_ip: &str,
    ) -> HashMap<String, ProxyVerdict>
    where
        I: IntoIterator<Item = ProxyCandidate>,
    {
        let unique: HashMap<String, ProxyCandidate> = candidates
            .into_iter()
            .map(|c| (c.sha.clone(), c))
            .collect();
        let total = unique.len();
        let concurrency = self.config.concurrency.max(1);
        let gate = Semaphore::new(concurrency);

        let verdicts: HashMap<String, ProxyVerdict> = stream::iter(unique.into_values())
            .map(|candidate| {
                let gate = &gate;
                async move {
                    let _permit = gate.acquire().await.ok();
                    self.validate_one(&candidate, judges, max_judges_per_protocol, my_ip)
                        .await
                }
            })
            .buffer_unordered(concurrency)
            .map(|verdict| (verdict.sha.clone(), verdict))
            .collect()
            .await;

        let good = verdicts.values().filter(|v| !v.bad_proxy).count();
        info!("validated {} candidates: {} usable", total, good);
        verdicts
    }

    async fn validate_one(
        &self,
        candidate: &ProxyCandidate,
        judges: &JudgeSet,
        max_judges: usize,
        my_ip: &str,
    ) -> ProxyVerdict {
        let mut timings = Vec::new();
        let mut protocols = BTreeSet::new();

        let http = self
            .probe_protocol(candidate, Protocol::Http, judges, max_judges, my_ip, &mut timings)
            .await;
        let https = self
            .probe_protocol(candidate, Protocol::Https, judges, max_judges, my_ip, &mut timings)
            .await;

        for (protocol, outcome) in [(Protocol::Http, http), (Protocol::Https, https)] {
            if outcome.bad == Some(false) {
                protocols.insert(protocol);
            }
        }

        let avg_resp_seconds = if timings.is_empty() {
            None
        } else {
            Some(timings.iter().sum::<f64>() / timings.len() as f64)
        };

        let verdict = ProxyVerdict {
            sha: candidate.sha.clone(),
            bad_proxy: derive_bad_proxy(http.bad, https.bad),
            bad_http: http.bad,
            bad_https: https.bad,
            protocols,
            avg_resp_seconds,
            noresp_http: http.noresp(),
            noresp_https: https.noresp(),
            checked_at: Utc::now(),
        };
        debug!(
            "{}: bad={} http={:?} https={:?}",
            candidate, verdict.bad_proxy, verdict.bad_http, verdict.bad_https
        );
        verdict
    }

    /// Try judges one at a time until one decides or the budget runs out
    async fn probe_protocol(
        &self,
        candidate: &ProxyCandidate,
        protocol: Protocol,
        judges: &JudgeSet,
        max_judges: usize,
        my_ip: &str,
        timings: &mut Vec<f64>,
    ) -> ProtocolOutcome {
        let mut order: Vec<&JudgeEndpoint> = judges.for_protocol(protocol).iter().collect();
        order.shuffle(&mut rand::thread_rng());

        let ctx = RequestContext::through_candidate(candidate)
            .with_timeout(self.config.probe_timeout)
            .with_verify_tls(self.config.verify_tls);
        let mut outcome = ProtocolOutcome::default();

        for judge in order {
            if outcome.failed as usize >= max_judges {
                break;
            }

            let started = Instant::now();
            let result = self
                .fetcher
                .fetch(RequestKind::GetProxied, &judge.url, &ctx, None)
                .await;
            timings.push(started.elapsed().as_secs_f64());

            match judge_probe(result, my_ip) {
                ProbeOutcome::Failed(failure) => {
                    debug!("{} via {} failed: {}", judge.url, candidate, failure);
                    self.ledger
                        .record_failure(COMPONENT, "probe", &failure, Some(&judge.url));
                    outcome.failed += 1;
                    if outcome.failed as usize >= max_judges {
                        outcome.bad = Some(true);
                    }
                }
                ProbeOutcome::Leaks => {
                    outcome.bad = Some(true);
                    break;
                }
                ProbeOutcome::Anonymous => {
                    outcome.bad = Some(false);
                    break;
                }
            }
        }

        // ran out of judges before the budget: every one of them failed
        if outcome.bad.is_none() && outcome.failed > 0 {
            outcome.bad = Some(true);
        }
        outcome
    }
}
