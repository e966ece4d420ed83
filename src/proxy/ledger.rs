//! Run-scoped error ledger
//!
//! Deduplicates failures seen during one crawl or validation run. Identical
//! failures share an id and bump a counter instead of adding records.

use crate::proxy::gateway::{FailureKind, RequestFailure};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// Separates fields in the canonical form hashed for an error id
const FIELD_SEPARATOR: &[u8] = b"\x1f";

/// One deduplicated failure
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub id: String,
    pub program: String,
    pub operation: String,
    pub kind: FailureKind,
    pub detail: Option<String>,
    pub url: Option<String>,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Totals over a ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorSummary {
    /// Every recorded occurrence, duplicates included
    pub total_errors: u64,
    pub by_kind: BTreeMap<FailureKind, u64>,
}

/// Error id over the canonical field tuple
///
/// Fields are labelled and emitted in a fixed order so the id does not depend
/// on any map iteration order.
pub fn error_id(
    program: &str,
    operation: &str,
    kind: FailureKind,
    detail: Option<&str>,
    url: Option<&str>,
) -> String {
    let kind = kind.to_string();
    let fields = [
        ("program", Some(program)),
        ("operation", Some(operation)),
        ("kind", Some(kind.as_str())),
        ("detail", detail),
        ("url", url),
    ];

    let mut hasher = Sha256::new();
    for (label, value) in fields {
        hasher.update(label.as_bytes());
        hasher.update(b"=");
        match value {
            Some(v) => {
                hasher.update(b"1");
                hasher.update(v.as_bytes());
            }
            None => hasher.update(b"0"),
        }
        hasher.update(FIELD_SEPARATOR);
    }
    hex::encode(hasher.finalize())
}

/// Failure accounting for a single run
#[derive(Debug, Default)]
pub struct ErrorLedger {
    records: Mutex<HashMap<String, ErrorRecord>>,
}

impl ErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure occurrence and return its id
    pub fn record(
        &self,
        program: &str,
        operation: &str,
        kind: FailureKind,
        detail: Option<&str>,
        url: Option<&str>,
    ) -> String {
        let id = error_id(program, operation, kind, detail, url);
        let now = Utc::now();

        let mut records = self.records.lock();
        records
            .entry(id.clone())
            .and_modify(|r| {
                r.count += 1;
                r.last_seen = now;
            })
            .or_insert_with(|| ErrorRecord {
                id: id.clone(),
                program: program.to_string(),
                operation: operation.to_string(),
                kind,
                detail: detail.map(str::to_string),
                url: url.map(str::to_string),
                count: 1,
                first_seen: now,
                last_seen: now,
            });
        id
    }

    /// Record a gateway failure
    pub fn record_failure(
        &self,
        program: &str,
        operation: &str,
        failure: &RequestFailure,
        url: Option<&str>,
    ) -> String {
        self.record(program, operation, failure.kind, failure.detail.as_deref(), url)
    }

    pub fn get(&self, id: &str) -> Option<ErrorRecord> {
        self.records.lock().get(id).cloned()
    }

    /// Number of distinct records
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Snapshot of all records, most frequent first
    pub fn records(&self) -> Vec<ErrorRecord> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub fn summary(&self) -> ErrorSummary {
        let records = self.records.lock();
        let mut summary = ErrorSummary::default();
        for record in records.values() {
            summary.total_errors += record.count;
            *summary.by_kind.entry(record.kind).or_insert(0) += record.count;
        }
        summary
    }
}
