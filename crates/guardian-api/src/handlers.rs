//! Thin HTTP adaptors over the Store/UpstreamApi contracts.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use guardian_core::error::GuardianError;
use guardian_core::model::{Anomaly, AnomalyStatus};
use guardian_store::Store;
use guardian_upstream::UpstreamApi;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

// =============================================================================
// Anomaly listing and actions
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListAnomaliesQuery {
    pub status: Option<String>,
}

fn parse_status(raw: &str) -> Option<AnomalyStatus> {
    match raw {
        "pending" => Some(AnomalyStatus::Pending),
        "approved" => Some(AnomalyStatus::Approved),
        "blocked" => Some(AnomalyStatus::Blocked),
        _ => None,
    }
}

pub async fn list_anomalies(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListAnomaliesQuery>,
) -> Result<Json<Vec<Anomaly>>, ApiError> {
    let status_filter = query.status.as_deref().and_then(parse_status);
    let anomalies = state.store.anomalies_list(status_filter)?;
    Ok(Json(anomalies))
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
}

/// `approve` is idempotent: baseline_add is idempotent and re-setting an
/// already-approved status is a no-op transition.
async fn do_approve(store: &Store, id: &str) -> Result<(), GuardianError> {
    let anomaly = store
        .anomaly_get(id)?
        .ok_or_else(|| GuardianError::NotFound(format!("anomaly {id}")))?;

    store.baseline_add(
        &anomaly.client_id,
        &anomaly.client_display_name,
        &anomaly.domain,
    )?;
    store.anomaly_set_status(id, AnomalyStatus::Approved)?;
    Ok(())
}

pub async fn approve_anomaly(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    do_approve(&state.store, &id).await?;
    Ok(Json(ActionResponse { success: true }))
}

/// `block` leaves the anomaly `pending` (no state change) if the upstream
/// write fails, so the analyst may retry.
async fn do_block(store: &Store, upstream: &dyn UpstreamApi, id: &str) -> Result<(), GuardianError> {
    let anomaly = store
        .anomaly_get(id)?
        .ok_or_else(|| GuardianError::NotFound(format!("anomaly {id}")))?;

    upstream.install_block_rule(&anomaly.domain).await?;
    store.anomaly_set_status(id, AnomalyStatus::Blocked)?;
    Ok(())
}

pub async fn block_anomaly(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    do_block(&state.store, state.upstream.as_ref(), &id).await?;
    Ok(Json(ActionResponse { success: true }))
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub store: guardian_core::model::StoreStats,
    pub dispatcher: guardian_dispatcher::DispatcherStats,
    pub enricher: guardian_enricher::EnricherStats,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let store_stats = state.store.stats()?;
    Ok(Json(StatsResponse {
        store: store_stats,
        dispatcher: state.dispatcher.stats(),
        enricher: state.enricher.stats(),
    }))
}

// =============================================================================
// Settings (redacted configuration)
// =============================================================================

pub async fn settings(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.config.to_redacted_json())
}

// =============================================================================
// Health
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub time: chrono::DateTime<Utc>,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        time: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_core::model::{Classification, SuggestedAction};
    use guardian_core::QueryRecord;
    use guardian_upstream::ProbeResult;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeUpstream {
        block_succeeds: AtomicBool,
    }

    #[async_trait::async_trait]
    impl UpstreamApi for FakeUpstream {
        async fn probe(&self) -> ProbeResult {
            ProbeResult::Ok
        }

        async fn fetch_page(&self, _limit: u32) -> Result<Vec<QueryRecord>, GuardianError> {
            Ok(Vec::new())
        }

        async fn install_block_rule(&self, _domain: &str) -> Result<(), GuardianError> {
            if self.block_succeeds.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(GuardianError::UpstreamFailure("simulated failure".to_string()))
            }
        }
    }

    fn sample_anomaly(id: &str) -> Anomaly {
        Anomaly {
            id: id.to_string(),
            client_id: "iot-plug".to_string(),
            client_display_name: "IoT Plug".to_string(),
            domain: "telemetry.example.org".to_string(),
            query_type: "A".to_string(),
            classification: Classification::Suspicious,
            risk_score: 6,
            explanation: "newly seen domain with no registration history".to_string(),
            suggested_action: SuggestedAction::Investigate,
            detected_at: Utc::now(),
            status: AnomalyStatus::Pending,
        }
    }

    #[tokio::test]
    async fn approve_adds_to_baseline_and_sets_status_approved() {
        let store = Store::open(":memory:").unwrap();
        let anomaly = sample_anomaly("a1");
        store.anomaly_put(anomaly.clone()).unwrap();

        do_approve(&store, &anomaly.id).await.unwrap();

        let stored = store.anomaly_get(&anomaly.id).unwrap().unwrap();
        assert_eq!(stored.status, AnomalyStatus::Approved);
        assert!(store
            .baseline_contains(&anomaly.client_id, &anomaly.domain)
            .unwrap());
    }

    #[tokio::test]
    async fn block_sets_status_blocked_when_upstream_succeeds() {
        let store = Store::open(":memory:").unwrap();
        let anomaly = sample_anomaly("a2");
        store.anomaly_put(anomaly.clone()).unwrap();
        let upstream = FakeUpstream {
            block_succeeds: AtomicBool::new(true),
        };

        do_block(&store, &upstream, &anomaly.id).await.unwrap();

        let stored = store.anomaly_get(&anomaly.id).unwrap().unwrap();
        assert_eq!(stored.status, AnomalyStatus::Blocked);
    }

    #[tokio::test]
    async fn block_leaves_status_pending_when_upstream_fails() {
        let store = Store::open(":memory:").unwrap();
        let anomaly = sample_anomaly("a3");
        store.anomaly_put(anomaly.clone()).unwrap();
        let upstream = FakeUpstream {
            block_succeeds: AtomicBool::new(false),
        };

        let result = do_block(&store, &upstream, &anomaly.id).await;

        assert!(result.is_err());
        let stored = store.anomaly_get(&anomaly.id).unwrap().unwrap();
        assert_eq!(stored.status, AnomalyStatus::Pending);
    }
}
