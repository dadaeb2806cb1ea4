//! Capability-based adaptor to an external text-generation classifier.

use std::time::Duration;

use async_trait::async_trait;
use guardian_core::{
    error::GuardianError,
    model::{Classification, QueryRecord, SuggestedAction, Verdict, WhoisRecord},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;

/// Capability set a concrete provider adaptor must implement. A provider
/// lacking batch support returns `supports_batch() == false`; the
/// Dispatcher checks this before calling `classify_many`.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;
    fn supports_batch(&self) -> bool;

    async fn classify_one(
        &self,
        query: &QueryRecord,
        whois: &WhoisRecord,
    ) -> Result<Verdict, GuardianError>;

    /// Must return verdicts in the same length and order as `queries`.
    async fn classify_many(
        &self,
        queries: &[QueryRecord],
        whois_by_domain: &std::collections::HashMap<String, WhoisRecord>,
    ) -> Result<Vec<Verdict>, GuardianError>;
}

fn system_prompt_single() -> &'static str {
    r#"You are a DNS security analyst. Given a single DNS query and its domain
registration metadata, classify it. Respond with JSON only, no prose, matching
exactly this shape:
{"classification": "Safe"|"Suspicious"|"Malicious", "explanation": "<non-empty reason>", "risk_score": <integer 1-10>, "suggested_action": "Allow"|"Investigate"|"Block"}"#
}

fn system_prompt_batch() -> &'static str {
    r#"You are a DNS security analyst. Given a JSON array of DNS queries, each
with its domain registration metadata, classify every one. Respond with a JSON
array only, no prose, in the same order as the input, one object per input
item, each matching exactly this shape:
{"domain": "<echoed from input>", "classification": "Safe"|"Suspicious"|"Malicious", "explanation": "<non-empty reason>", "risk_score": <integer 1-10>, "suggested_action": "Allow"|"Investigate"|"Block"}"#
}

fn user_prompt_single(query: &QueryRecord, whois: &WhoisRecord) -> String {
    serde_json::json!({
        "client_id": query.client_id,
        "domain": query.domain,
        "query_type": query.query_type,
        "registrar": whois.registrar,
        "country": whois.country,
        "created_date": whois.created_date,
        "name_servers": whois.name_servers,
    })
    .to_string()
}

fn user_prompt_batch(
    queries: &[QueryRecord],
    whois_by_domain: &std::collections::HashMap<String, WhoisRecord>,
) -> String {
    let items: Vec<_> = queries
        .iter()
        .map(|q| {
            let whois = whois_by_domain.get(&q.domain);
            serde_json::json!({
                "client_id": q.client_id,
                "domain": q.domain,
                "query_type": q.query_type,
                "registrar": whois.map(|w| w.registrar.as_str()).unwrap_or(""),
                "country": whois.map(|w| w.country.as_str()).unwrap_or(""),
                "created_date": whois.map(|w| w.created_date.as_str()).unwrap_or(""),
            })
        })
        .collect();
    serde_json::Value::Array(items).to_string()
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    classification: Classification,
    explanation: String,
    risk_score: u8,
    suggested_action: SuggestedAction,
}

#[derive(Debug, Deserialize)]
struct RawBatchVerdict {
    domain: String,
    #[serde(flatten)]
    verdict: RawVerdict,
}

/// Adaptor to a generic chat-completion style text-generation endpoint
/// (the shape shared by OpenAI- and Anthropic-compatible HTTP APIs: a
/// system prompt, a user prompt, JSON response format, pinned temperature).
pub struct HttpClassifier {
    name: String,
    endpoint: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
    supports_batch: bool,
}

impl HttpClassifier {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            http: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .expect("building classifier http client"),
            supports_batch: true,
        }
    }

    async fn complete(&self, system_prompt: &str, user_prompt: String) -> Result<String, GuardianError> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let mut delay = INITIAL_BACKOFF;
        for attempt in 0..=MAX_RETRIES {
            let result = self.send_once(&request).await;
            match result {
                Ok(content) => return Ok(content),
                Err(ClassifierTransportError::Throttled) if attempt < MAX_RETRIES => {
                    warn!(attempt, delay_secs = delay.as_secs(), "classifier throttled, backing off");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
                Err(ClassifierTransportError::Throttled) => return Err(GuardianError::Throttled),
                Err(ClassifierTransportError::Timeout) => return Err(GuardianError::Timeout),
                Err(ClassifierTransportError::Provider(msg)) => {
                    return Err(GuardianError::ProviderError(msg))
                }
            }
        }
        Err(GuardianError::Throttled)
    }

    async fn send_once(&self, request: &ChatCompletionRequest) -> Result<String, ClassifierTransportError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierTransportError::Timeout
                } else {
                    ClassifierTransportError::Provider(e.to_string())
                }
            })?;

        if resp.status().as_u16() == 429 {
            return Err(ClassifierTransportError::Throttled);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if is_throttle_signal(status.as_u16(), &body) {
                return Err(ClassifierTransportError::Throttled);
            }
            return Err(ClassifierTransportError::Provider(format!(
                "classifier returned {status}: {body}"
            )));
        }

        let body: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| ClassifierTransportError::Provider(e.to_string()))?;

        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ClassifierTransportError::Provider("empty choices array".to_string()))
    }
}

enum ClassifierTransportError {
    Throttled,
    Timeout,
    Provider(String),
}

fn is_throttle_signal(status: u16, body: &str) -> bool {
    if status == 429 {
        return true;
    }
    let lowered = body.to_lowercase();
    lowered.contains("rate limit")
        || lowered.contains("quota exceeded")
        || lowered.contains("resource_exhausted")
}

/// Parses and validates a single-query response body. Pure so it can be
/// tested without a live HTTP call.
fn parse_one(content: &str, domain: &str) -> Result<Verdict, GuardianError> {
    let raw: RawVerdict = serde_json::from_str(content)
        .map_err(|e| GuardianError::ProviderError(format!("malformed verdict json: {e}")))?;

    let verdict = Verdict {
        domain: domain.to_string(),
        classification: raw.classification,
        explanation: raw.explanation,
        risk_score: raw.risk_score,
        suggested_action: raw.suggested_action,
    };
    if !verdict.is_valid() {
        return Err(GuardianError::ProviderError(
            "verdict failed validation (empty explanation or risk_score out of range)".to_string(),
        ));
    }
    Ok(verdict)
}

/// Parses and validates a batch response body against the queries it should
/// cover: length and per-position domain must both match, and every verdict
/// must individually validate. Pure so it can be tested without a live HTTP
/// call.
fn parse_many(content: &str, queries: &[QueryRecord]) -> Result<Vec<Verdict>, GuardianError> {
    let raw: Vec<RawBatchVerdict> = serde_json::from_str(content)
        .map_err(|e| GuardianError::ProviderError(format!("malformed batch verdict json: {e}")))?;

    if raw.len() != queries.len() {
        return Err(GuardianError::ProviderError(format!(
            "batch size mismatch: expected {}, got {}",
            queries.len(),
            raw.len()
        )));
    }

    let mut verdicts = Vec::with_capacity(raw.len());
    for (query, entry) in queries.iter().zip(raw.into_iter()) {
        if entry.domain != query.domain {
            return Err(GuardianError::ProviderError(format!(
                "batch misalignment: expected domain {} at this position, got {}",
                query.domain, entry.domain
            )));
        }
        let verdict = Verdict {
            domain: entry.domain,
            classification: entry.verdict.classification,
            explanation: entry.verdict.explanation,
            risk_score: entry.verdict.risk_score,
            suggested_action: entry.verdict.suggested_action,
        };
        if !verdict.is_valid() {
            return Err(GuardianError::ProviderError(
                "batch contains a verdict failing validation".to_string(),
            ));
        }
        verdicts.push(verdict);
    }

    Ok(verdicts)
}

#[async_trait]
impl Classifier for HttpClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_batch(&self) -> bool {
        self.supports_batch
    }

    async fn classify_one(
        &self,
        query: &QueryRecord,
        whois: &WhoisRecord,
    ) -> Result<Verdict, GuardianError> {
        let content = self
            .complete(system_prompt_single(), user_prompt_single(query, whois))
            .await?;
        parse_one(&content, &query.domain)
    }

    async fn classify_many(
        &self,
        queries: &[QueryRecord],
        whois_by_domain: &std::collections::HashMap<String, WhoisRecord>,
    ) -> Result<Vec<Verdict>, GuardianError> {
        let content = self
            .complete(system_prompt_batch(), user_prompt_batch(queries, whois_by_domain))
            .await?;
        let verdicts = parse_many(&content, queries)?;
        debug!(count = verdicts.len(), "classifier batch validated");
        Ok(verdicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn throttle_signal_detects_429_and_message_substrings() {
        assert!(is_throttle_signal(429, ""));
        assert!(is_throttle_signal(503, "Rate limit exceeded, try later"));
        assert!(is_throttle_signal(400, "RESOURCE_EXHAUSTED"));
        assert!(!is_throttle_signal(500, "internal server error"));
    }

    #[test]
    fn verdict_validation_rejects_empty_explanation_and_bad_risk_score() {
        let mut verdict = Verdict {
            domain: "example.org".to_string(),
            classification: Classification::Malicious,
            explanation: String::new(),
            risk_score: 9,
            suggested_action: SuggestedAction::Block,
        };
        assert!(!verdict.is_valid());

        verdict.explanation = "C2 beaconing pattern".to_string();
        verdict.risk_score = 0;
        assert!(!verdict.is_valid());

        verdict.risk_score = 11;
        assert!(!verdict.is_valid());

        verdict.risk_score = 9;
        assert!(verdict.is_valid());
    }

    fn sample_query(domain: &str) -> QueryRecord {
        QueryRecord {
            client_id: "iot-plug".to_string(),
            client_display_name: "iot-plug".to_string(),
            domain: domain.to_string(),
            timestamp: Utc::now(),
            query_type: "A".to_string(),
            answer: None,
            reason: None,
        }
    }

    #[test]
    fn parse_one_accepts_a_well_formed_verdict() {
        let content = r#"{"classification":"Malicious","explanation":"C2 beaconing","risk_score":9,"suggested_action":"Block"}"#;
        let verdict = parse_one(content, "telemetry.example.org").unwrap();
        assert_eq!(verdict.domain, "telemetry.example.org");
        assert!(matches!(verdict.classification, Classification::Malicious));
    }

    #[test]
    fn parse_one_rejects_a_verdict_failing_validation() {
        let content = r#"{"classification":"Malicious","explanation":"","risk_score":9,"suggested_action":"Block"}"#;
        assert!(parse_one(content, "telemetry.example.org").is_err());
    }

    #[test]
    fn parse_many_accepts_an_aligned_batch() {
        let queries = vec![sample_query("a.example.org"), sample_query("b.example.org")];
        let content = r#"[
            {"domain":"a.example.org","classification":"Safe","explanation":"benign CDN","risk_score":1,"suggested_action":"Allow"},
            {"domain":"b.example.org","classification":"Suspicious","explanation":"new registrar","risk_score":5,"suggested_action":"Investigate"}
        ]"#;
        let verdicts = parse_many(content, &queries).unwrap();
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[1].domain, "b.example.org");
    }

    /// Property 4: a batch response misaligned with its request is rejected
    /// wholesale rather than silently paired with the wrong query.
    #[test]
    fn parse_many_rejects_a_misaligned_batch() {
        let queries = vec![sample_query("a.example.org"), sample_query("b.example.org")];
        let content = r#"[
            {"domain":"a.example.org","classification":"Safe","explanation":"benign CDN","risk_score":1,"suggested_action":"Allow"},
            {"domain":"c.example.org","classification":"Suspicious","explanation":"new registrar","risk_score":5,"suggested_action":"Investigate"}
        ]"#;
        assert!(parse_many(content, &queries).is_err());
    }

    #[test]
    fn parse_many_rejects_a_short_batch() {
        let queries = vec![sample_query("a.example.org"), sample_query("b.example.org")];
        let content = r#"[
            {"domain":"a.example.org","classification":"Safe","explanation":"benign CDN","risk_score":1,"suggested_action":"Allow"}
        ]"#;
        assert!(parse_many(content, &queries).is_err());
    }
}
