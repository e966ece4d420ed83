//! In-memory pool of validated proxies
//!
//! Hands out known-good proxies one lease at a time, fastest first.

use crate::proxy::models::{Protocol, ProxyCandidate, ProxyVerdict};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Age after which [`VerdictPool::expire_stale_leases`] reclaims a lease
pub const LEASE_TTL_MINUTES: i64 = 30;

/// Lease key: optional site scope and proxy `sha`
type LeaseKey = (Option<String>, String);

#[derive(Debug, Clone)]
struct PoolEntry {
    candidate: ProxyCandidate,
    verdict: ProxyVerdict,
}

#[derive(Debug, Default)]
struct Leases {
    leased: HashMap<LeaseKey, DateTime<Utc>>,
    /// Excluded for every scope
    banned: HashSet<String>,
    /// Excluded for one scope only
    scoped_bans: HashSet<(String, String)>,
}

impl Leases {
    fn is_free(&self, scope: Option<&str>, sha: &str) -> bool {
        if self.banned.contains(sha) {
            return false;
        }
        if let Some(scope) = scope {
            if self
                .scoped_bans
                .contains(&(scope.to_string(), sha.to_string()))
            {
                return false;
            }
        }
        !self.leased.contains_key(&lease_key(scope, sha))
    }
}

fn lease_key(scope: Option<&str>, sha: &str) -> LeaseKey {
    (scope.map(str::to_string), sha.to_string())
}

/// Leasable proxies built from one validation run
///
/// Leases and bans are tracked per scope, usually the base URL of the site
/// the proxy is used against, so one proxy can serve several sites at once.
/// The unscoped methods use a shared default scope.
#[derive(Debug, Default)]
pub struct VerdictPool {
    /// Usable entries sorted by response time, unknown times last
    entries: Vec<PoolEntry>,
    leases: Mutex<Leases>,
}

impl VerdictPool {
    /// Keep candidates that have a verdict confirming at least one protocol
    pub fn from_verdicts<'a, I>(candidates: I, verdicts: &HashMap<String, ProxyVerdict>) -> Self
    where
        I: IntoIterator<Item = &'a ProxyCandidate>,
    {
        let mut seen = HashSet::new();
        let mut entries: Vec<PoolEntry> = candidates
            .into_iter()
            .filter(|c| seen.insert(c.sha.clone()))
            .filter_map(|c| {
                let verdict = verdicts.get(&c.sha)?;
                verdict.is_usable().then(|| PoolEntry {
                    candidate: c.clone(),
                    verdict: verdict.clone(),
                })
            })
            .collect();
        entries.sort_by(|a, b| compare_latency(&a.verdict, &b.verdict));

        debug!("pool built with {} usable proxies", entries.len());
        Self {
            entries,
            leases: Mutex::new(Leases::default()),
        }
    }

    /// Lease the fastest free proxy confirmed for `protocol`
    pub fn get_proxy(&self, protocol: Protocol) -> Option<ProxyCandidate> {
        self.get_proxy_for(None, protocol)
    }

    /// Lease the fastest proxy free within `scope`
    pub fn get_proxy_for(&self, scope: Option<&str>, protocol: Protocol) -> Option<ProxyCandidate> {
        let mut leases = self.leases.lock();
        let entry = self
            .entries
            .iter()
            .find(|e| e.verdict.supports(protocol) && leases.is_free(scope, &e.candidate.sha))?;
        leases
            .leased
            .insert(lease_key(scope, &entry.candidate.sha), Utc::now());
        Some(entry.candidate.clone())
    }

    /// Return a lease; returns false if `sha` was not leased
    pub fn release(&self, sha: &str) -> bool {
        self.release_for(None, sha)
    }

    pub fn release_for(&self, scope: Option<&str>, sha: &str) -> bool {
        self.leases
            .lock()
            .leased
            .remove(&lease_key(scope, sha))
            .is_some()
    }

    /// Exclude a proxy everywhere for the rest of this pool's lifetime
    pub fn ban(&self, sha: &str) {
        let mut leases = self.leases.lock();
        leases.leased.retain(|(_, leased), _| leased != sha);
        leases.banned.insert(sha.to_string());
    }

    /// Exclude a proxy for one scope only
    pub fn ban_for(&self, scope: &str, sha: &str) {
        let mut leases = self.leases.lock();
        leases.leased.remove(&lease_key(Some(scope), sha));
        leases
            .scoped_bans
            .insert((scope.to_string(), sha.to_string()));
    }

    /// Reclaim leases held longer than [`LEASE_TTL_MINUTES`]
    pub fn expire_stale_leases(&self) -> usize {
        self.expire_leases(Duration::minutes(LEASE_TTL_MINUTES))
    }

    /// Reclaim leases held for at least `older_than`; returns how many
    pub fn expire_leases(&self, older_than: Duration) -> usize {
        self.expire_leases_at(Utc::now(), older_than)
    }

    fn expire_leases_at(&self, now: DateTime<Utc>, older_than: Duration) -> usize {
        let mut leases = self.leases.lock();
        let before = leases.leased.len();
        leases
            .leased
            .retain(|_, leased_at| now.signed_duration_since(*leased_at) < older_than);
        let expired = before - leases.leased.len();
        if expired > 0 {
            debug!("expired {} proxy leases", expired);
        }
        expired
    }

    pub fn verdict(&self, sha: &str) -> Option<&ProxyVerdict> {
        self.entries
            .iter()
            .find(|e| e.candidate.sha == sha)
            .map(|e| &e.verdict)
    }

    /// Proxies neither leased nor banned within `scope`
    pub fn available(&self, scope: Option<&str>) -> usize {
        let leases = self.leases.lock();
        self.entries
            .iter()
            .filter(|e| leases.is_free(scope, &e.candidate.sha))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn compare_latency(a: &ProxyVerdict, b: &ProxyVerdict) -> Ordering {
    match (a.avg_resp_seconds, b.avg_resp_seconds) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.sha.cmp(&b.sha))
}
