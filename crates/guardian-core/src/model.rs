//! Domain entities shared by every Guardian-Log component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single DNS query as read off the upstream proxy's log, normalized for
/// internal use. `domain` has already been lower-cased and had its trailing
/// dot stripped by the time a `QueryRecord` exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub client_id: String,
    pub client_display_name: String,
    pub domain: String,
    pub timestamp: DateTime<Utc>,
    pub query_type: String,
    pub answer: Option<String>,
    pub reason: Option<String>,
}

impl QueryRecord {
    /// Deterministic identifier used for dedup. Collisions across distinct
    /// records are tolerated: the cost is a missed anomaly, never a
    /// duplicate alert.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}",
            self.client_id,
            self.domain,
            self.timestamp.to_rfc3339()
        )
    }
}

/// One client's set of domains considered normal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub client_id: String,
    pub client_display_name: String,
    pub domains: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl Baseline {
    pub fn contains(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d == domain)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Safe,
    Suspicious,
    Malicious,
}

impl Classification {
    pub fn is_anomalous(&self) -> bool {
        !matches!(self, Classification::Safe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestedAction {
    Allow,
    Investigate,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyStatus {
    Pending,
    Approved,
    Blocked,
}

/// The full, append-only verdict record for a classified candidate.
/// Includes `Safe` verdicts, unlike `Anomaly`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub client_id: String,
    pub client_display_name: String,
    pub domain: String,
    pub query_type: String,
    pub classification: Classification,
    pub explanation: String,
    pub risk_score: u8,
    pub suggested_action: SuggestedAction,
    pub analyzed_at: DateTime<Utc>,
}

/// A persisted non-Safe verdict for a first-seen (client, domain) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub client_id: String,
    pub client_display_name: String,
    pub domain: String,
    pub query_type: String,
    pub classification: Classification,
    pub risk_score: u8,
    pub explanation: String,
    pub suggested_action: SuggestedAction,
    pub detected_at: DateTime<Utc>,
    pub status: AnomalyStatus,
}

impl Anomaly {
    /// `client_id|domain|detected_at_rfc3339`, second precision. A second
    /// collision for the same (client, domain) pair is accepted; see
    /// DESIGN.md for why `anomaly_put`'s upsert semantics make that safe.
    pub fn make_id(client_id: &str, domain: &str, detected_at: DateTime<Utc>) -> String {
        format!(
            "{}|{}|{}",
            client_id,
            domain,
            detected_at.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// Domain registration metadata, cached for 24h from `looked_up_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoisRecord {
    pub domain: String,
    pub registrar: String,
    pub country: String,
    pub created_date: String,
    pub updated_date: String,
    pub expiry_date: String,
    pub name_servers: Vec<String>,
    pub looked_up_at: DateTime<Utc>,
}

impl WhoisRecord {
    pub fn empty(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            registrar: String::new(),
            country: String::new(),
            created_date: String::new(),
            updated_date: String::new(),
            expiry_date: String::new(),
            name_servers: Vec::new(),
            looked_up_at: Utc::now(),
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.looked_up_at) < chrono::Duration::hours(24)
    }
}

/// A verdict returned by a `Classifier` for a single query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub domain: String,
    pub classification: Classification,
    pub explanation: String,
    pub risk_score: u8,
    pub suggested_action: SuggestedAction,
}

impl Verdict {
    /// Invariants a classifier response must satisfy to be accepted.
    pub fn is_valid(&self) -> bool {
        !self.explanation.is_empty() && (1..=10).contains(&self.risk_score)
    }
}

/// Aggregate counters returned by `Store::stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub unique_clients: u64,
    pub total_queries: u64,
    pub total_anomalies: u64,
    pub pending: u64,
    pub approved: u64,
    pub blocked: u64,
    pub malicious: u64,
    pub suspicious: u64,
    pub total_analyses: u64,
}
