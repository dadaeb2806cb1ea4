//! Domain registration lookups with a 24h TTL cache and outbound pacing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use guardian_core::{model::WhoisRecord, error::GuardianError};
use guardian_store::Store;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

const MIN_LOOKUP_GAP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnricherStats {
    pub hits: u64,
    pub misses: u64,
    pub lookups: u64,
}

/// RDAP-backed registration lookup, paced to one outbound request per
/// `MIN_LOOKUP_GAP` and cached for 24h in the Store's `whois_cache`
/// partition.
pub struct Enricher {
    store: Arc<Store>,
    http: reqwest::Client,
    rdap_base_url: String,
    last_lookup: Mutex<Option<Instant>>,
    hits: AtomicU64,
    misses: AtomicU64,
    lookups: AtomicU64,
}

impl Enricher {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_rdap_base_url(store, "https://rdap.org/domain".to_string())
    }

    pub fn with_rdap_base_url(store: Arc<Store>, rdap_base_url: String) -> Self {
        Self {
            store,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("building enricher http client"),
            rdap_base_url,
            last_lookup: Mutex::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
        }
    }

    /// Never fails: a lookup or parse failure yields a minimal record with
    /// `looked_up_at = now` and empty fields rather than propagating an error.
    pub async fn lookup(&self, domain: &str) -> WhoisRecord {
        let domain = domain.trim().trim_end_matches('.').to_lowercase();

        if let Ok(Some(cached)) = self.store.whois_get(&domain) {
            if cached.is_fresh(Utc::now()) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return cached;
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        self.pace().await;
        self.lookups.fetch_add(1, Ordering::Relaxed);

        let record = match self.fetch_rdap(&domain).await {
            Ok(record) => record,
            Err(e) => {
                warn!(domain, error = %e, "whois lookup failed, caching empty record");
                WhoisRecord::empty(&domain)
            }
        };

        if let Err(e) = self.store.whois_put(&record) {
            warn!(domain, error = %e, "failed to persist whois record");
        }
        record
    }

    pub fn stats(&self) -> EnricherStats {
        EnricherStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
        }
    }

    async fn pace(&self) {
        let mut last = self.last_lookup.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < MIN_LOOKUP_GAP {
                tokio::time::sleep(MIN_LOOKUP_GAP - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn fetch_rdap(&self, domain: &str) -> Result<WhoisRecord, GuardianError> {
        let url = format!("{}/{}", self.rdap_base_url.trim_end_matches('/'), domain);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(GuardianError::ProviderError(format!(
                "rdap lookup returned {}",
                resp.status()
            )));
        }
        let body: RdapResponse = resp.json().await.map_err(GuardianError::from)?;
        debug!(domain, "rdap lookup succeeded");
        Ok(body.into_whois_record(domain))
    }
}

#[derive(Debug, serde::Deserialize)]
struct RdapResponse {
    #[serde(default)]
    entities: Vec<RdapEntity>,
    #[serde(default)]
    events: Vec<RdapEvent>,
    #[serde(default)]
    nameservers: Vec<RdapNameserver>,
    #[serde(default, rename = "country")]
    country: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct RdapEntity {
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default, rename = "vcardArray")]
    vcard_array: Option<serde_json::Value>,
}

#[derive(Debug, serde::Deserialize)]
struct RdapEvent {
    #[serde(rename = "eventAction")]
    event_action: String,
    #[serde(rename = "eventDate")]
    event_date: String,
}

#[derive(Debug, serde::Deserialize)]
struct RdapNameserver {
    #[serde(rename = "ldhName")]
    ldh_name: Option<String>,
}

impl RdapResponse {
    fn into_whois_record(self, domain: &str) -> WhoisRecord {
        let registrar = self
            .entities
            .iter()
            .find(|e| e.roles.iter().any(|r| r == "registrar"))
            .and_then(|e| e.vcard_array.as_ref())
            .map(|v| v.to_string())
            .unwrap_or_default();

        let created_date = self
            .events
            .iter()
            .find(|e| e.event_action == "registration")
            .map(|e| e.event_date.clone())
            .unwrap_or_default();
        let updated_date = self
            .events
            .iter()
            .find(|e| e.event_action == "last changed")
            .map(|e| e.event_date.clone())
            .unwrap_or_default();
        let expiry_date = self
            .events
            .iter()
            .find(|e| e.event_action == "expiration")
            .map(|e| e.event_date.clone())
            .unwrap_or_default();

        WhoisRecord {
            domain: domain.to_string(),
            registrar,
            country: self.country.unwrap_or_default(),
            created_date,
            updated_date,
            expiry_date,
            name_servers: self
                .nameservers
                .into_iter()
                .filter_map(|ns| ns.ldh_name)
                .collect(),
            looked_up_at: Utc::now(),
        }
    }
}
