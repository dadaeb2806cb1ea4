//! Adaptor to the upstream DNS filtering proxy's query log and rule set.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guardian_core::{error::GuardianError, QueryRecord};
use serde::Deserialize;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub enum ProbeResult {
    Ok,
    Unauthorized,
    Unreachable,
}

/// Capability set the Poller and ControlSurface need from the upstream DNS
/// filtering proxy. A trait rather than a bare struct so tests can swap in a
/// fake instead of making real HTTP calls.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn probe(&self) -> ProbeResult;

    /// Most recent `limit` records as a snapshot. Callers must tolerate
    /// overlap between consecutive calls; dedup is the Detector's job.
    async fn fetch_page(&self, limit: u32) -> Result<Vec<QueryRecord>, GuardianError>;

    /// Idempotent from the caller's perspective: a duplicate-rule rejection
    /// from the upstream is reported as success.
    async fn install_block_rule(&self, domain: &str) -> Result<(), GuardianError>;
}

#[derive(Debug, Deserialize)]
struct QueryLogPage {
    data: Vec<QueryLogEntry>,
    #[allow(dead_code)]
    oldest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryLogEntry {
    client: Option<String>,
    client_id: Option<String>,
    question: QueryLogQuestion,
    original_question: Option<QueryLogQuestion>,
    time: DateTime<Utc>,
    answer: Option<Vec<QueryLogAnswer>>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryLogQuestion {
    name: Option<String>,
    unicode_name: Option<String>,
    #[serde(rename = "type")]
    qtype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryLogAnswer {
    value: String,
}

impl QueryLogEntry {
    fn into_query_record(self) -> QueryRecord {
        let client_id = self
            .client_id
            .clone()
            .or_else(|| self.client.clone())
            .unwrap_or_default();
        let client_display_name = self.client.clone().or(self.client_id).unwrap_or_default();

        let raw_domain = self
            .question
            .name
            .clone()
            .or_else(|| self.original_question.as_ref().and_then(|q| q.name.clone()))
            .or(self.question.unicode_name)
            .unwrap_or_default();
        let domain = normalize_domain(&raw_domain);

        let query_type = self.question.qtype.unwrap_or_else(|| "A".to_string());
        let answer = self
            .answer
            .and_then(|a| a.first().map(|entry| entry.value.clone()));

        QueryRecord {
            client_id,
            client_display_name,
            domain,
            timestamp: self.time,
            query_type,
            answer,
            reason: self.reason,
        }
    }
}

fn normalize_domain(raw: &str) -> String {
    raw.trim().trim_end_matches('.').to_lowercase()
}

/// Static-credential adaptor to the upstream filtering proxy.
pub struct UpstreamClient {
    base_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("building upstream http client");

        Self {
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            http,
        }
    }

}

#[async_trait]
impl UpstreamApi for UpstreamClient {
    async fn probe(&self) -> ProbeResult {
        let url = format!("{}/control/status", self.base_url.trim_end_matches('/'));
        match self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => ProbeResult::Ok,
            Ok(resp) if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 => {
                ProbeResult::Unauthorized
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "upstream probe returned unexpected status");
                ProbeResult::Unreachable
            }
            Err(e) => {
                warn!(error = %e, "upstream probe failed");
                ProbeResult::Unreachable
            }
        }
    }

    async fn fetch_page(&self, limit: u32) -> Result<Vec<QueryRecord>, GuardianError> {
        let url = format!(
            "{}/control/querylog?limit={}",
            self.base_url.trim_end_matches('/'),
            limit
        );

        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 {
            return Err(GuardianError::Unauthorized(
                "upstream rejected credentials".to_string(),
            ));
        }
        if !resp.status().is_success() {
            return Err(GuardianError::Unreachable(format!(
                "upstream returned {}",
                resp.status()
            )));
        }

        let page: QueryLogPage = resp.json().await.map_err(GuardianError::from)?;
        debug!(count = page.data.len(), "fetched upstream query log page");

        let records = page
            .data
            .into_iter()
            .map(QueryLogEntry::into_query_record)
            .collect();
        Ok(records)
    }

    async fn install_block_rule(&self, domain: &str) -> Result<(), GuardianError> {
        let url = format!(
            "{}/control/filtering/add_url",
            self.base_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "name": format!("Guardian-Log block: {domain}"),
            "url": format!("data:text/plain,||{domain}^"),
            "enabled": true,
        });

        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        // A duplicate rule is reported by the upstream as a client error;
        // from our caller's perspective the desired state (rule present)
        // already holds, so it is not a failure.
        if resp.status().is_success() || resp.status().as_u16() == 409 {
            Ok(())
        } else {
            Err(GuardianError::UpstreamFailure(format!(
                "install_block_rule for {domain} returned {}",
                resp.status()
            )))
        }
    }
}
