//! Accumulates first-seen candidates into batches, paces dispatch to the
//! Classifier, persists results, requeues on throttling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use guardian_classifier::Classifier;
use guardian_core::model::{Analysis, Anomaly, QueryRecord};
use guardian_core::error::GuardianError;
use guardian_enricher::Enricher;
use guardian_store::Store;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

const INBOUND_CAPACITY: usize = 100;
const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub inter_batch_delay: Duration,
    /// How long a throttled item waits before being resubmitted.
    pub requeue_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            flush_interval: Duration::from_secs(60),
            inter_batch_delay: Duration::from_secs(60),
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub submitted: u64,
    pub batches_run: u64,
    pub analyses_ok: u64,
    pub analyses_failed: u64,
    pub throttled: u64,
}

#[derive(Default)]
struct StatsInner {
    submitted: AtomicU64,
    batches_run: AtomicU64,
    analyses_ok: AtomicU64,
    analyses_failed: AtomicU64,
    throttled: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            batches_run: self.batches_run.load(Ordering::Relaxed),
            analyses_ok: self.analyses_ok.load(Ordering::Relaxed),
            analyses_failed: self.analyses_failed.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
        }
    }
}

/// The central concurrency object of the pipeline.
pub struct Dispatcher {
    tx: mpsc::Sender<QueryRecord>,
    stats: Arc<StatsInner>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn spawn(
        config: DispatcherConfig,
        store: Arc<Store>,
        enricher: Arc<Enricher>,
        classifier: Arc<dyn Classifier>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(StatsInner::default());

        let worker_stats = stats.clone();
        let worker_tx = tx.clone();
        let handle = tokio::spawn(worker_loop(
            config,
            store,
            enricher,
            classifier,
            rx,
            worker_tx,
            worker_stats,
            shutdown_rx,
        ));

        Arc::new(Self {
            tx,
            stats,
            shutdown_tx,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Non-blocking. On queue overflow the submission is dropped and the
    /// event is logged; the caller is not notified.
    pub fn submit(&self, query: QueryRecord) {
        match self.tx.try_send(query) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(query)) => {
                warn!(
                    client_id = %query.client_id,
                    domain = %query.domain,
                    "dispatcher inbound queue full, dropping submission"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("dispatcher worker has shut down, dropping submission");
            }
        }
    }

    /// Signals the worker to drain at most one final batch, then waits for
    /// it to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.snapshot()
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    config: DispatcherConfig,
    store: Arc<Store>,
    enricher: Arc<Enricher>,
    classifier: Arc<dyn Classifier>,
    mut rx: mpsc::Receiver<QueryRecord>,
    requeue_tx: mpsc::Sender<QueryRecord>,
    stats: Arc<StatsInner>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut accumulator: Vec<QueryRecord> = Vec::new();
    let mut deadline: Option<Instant> = None;
    let mut last_dispatch_end: Option<Instant> = None;

    loop {
        let sleep_fut = match deadline {
            Some(d) => tokio::time::sleep_until(d),
            None => tokio::time::sleep(config.flush_interval),
        };

        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    if !accumulator.is_empty() {
                        let batch = std::mem::take(&mut accumulator);
                        dispatch_batch(
                            batch, &store, &enricher, &classifier, &requeue_tx, &stats,
                            &mut last_dispatch_end, &config,
                        ).await;
                    }
                    info!("dispatcher worker shutting down");
                    return;
                }
            }

            maybe_item = rx.recv() => {
                match maybe_item {
                    Some(item) => {
                        stats.submitted.fetch_add(1, Ordering::Relaxed);
                        if accumulator.is_empty() {
                            deadline = Some(Instant::now() + config.flush_interval);
                        }
                        accumulator.push(item);
                        if accumulator.len() >= config.batch_size {
                            let batch = std::mem::take(&mut accumulator);
                            deadline = None;
                            dispatch_batch(
                                batch, &store, &enricher, &classifier, &requeue_tx, &stats,
                                &mut last_dispatch_end, &config,
                            ).await;
                        }
                    }
                    None => return,
                }
            }

            _ = sleep_fut => {
                if !accumulator.is_empty() {
                    let batch = std::mem::take(&mut accumulator);
                    deadline = None;
                    dispatch_batch(
                        batch, &store, &enricher, &classifier, &requeue_tx, &stats,
                        &mut last_dispatch_end, &config,
                    ).await;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_batch(
    batch: Vec<QueryRecord>,
    store: &Arc<Store>,
    enricher: &Arc<Enricher>,
    classifier: &Arc<dyn Classifier>,
    requeue_tx: &mpsc::Sender<QueryRecord>,
    stats: &Arc<StatsInner>,
    last_dispatch_end: &mut Option<Instant>,
    config: &DispatcherConfig,
) {
    let mut whois_by_domain = HashMap::new();
    for query in &batch {
        if !whois_by_domain.contains_key(&query.domain) {
            let record = enricher.lookup(&query.domain).await;
            whois_by_domain.insert(query.domain.clone(), record);
        }
    }

    if let Some(previous_end) = *last_dispatch_end {
        let elapsed = previous_end.elapsed();
        if elapsed < config.inter_batch_delay {
            tokio::time::sleep(config.inter_batch_delay - elapsed).await;
        }
    }

    let result = if classifier.supports_batch() {
        classifier.classify_many(&batch, &whois_by_domain).await
    } else {
        classify_one_by_one(classifier.as_ref(), &batch, &whois_by_domain).await
    };

    stats.batches_run.fetch_add(1, Ordering::Relaxed);

    match result {
        Ok(verdicts) => {
            for (query, verdict) in batch.iter().zip(verdicts.into_iter()) {
                let analysis = Analysis {
                    client_id: query.client_id.clone(),
                    client_display_name: query.client_display_name.clone(),
                    domain: query.domain.clone(),
                    query_type: query.query_type.clone(),
                    classification: verdict.classification,
                    explanation: verdict.explanation.clone(),
                    risk_score: verdict.risk_score,
                    suggested_action: verdict.suggested_action,
                    analyzed_at: Utc::now(),
                };
                if let Err(e) = store.analysis_append(&analysis) {
                    warn!(error = %e, "failed to persist analysis");
                }

                if verdict.classification.is_anomalous() {
                    let detected_at = Utc::now();
                    let anomaly = Anomaly {
                        id: Anomaly::make_id(&query.client_id, &query.domain, detected_at),
                        client_id: query.client_id.clone(),
                        client_display_name: query.client_display_name.clone(),
                        domain: query.domain.clone(),
                        query_type: query.query_type.clone(),
                        classification: verdict.classification,
                        risk_score: verdict.risk_score,
                        explanation: verdict.explanation,
                        suggested_action: verdict.suggested_action,
                        detected_at,
                        status: guardian_core::model::AnomalyStatus::Pending,
                    };
                    if let Err(e) = store.anomaly_put(anomaly) {
                        warn!(error = %e, "failed to persist anomaly");
                    }
                }
                stats.analyses_ok.fetch_add(1, Ordering::Relaxed);
            }
        }
        Err(GuardianError::Throttled) => {
            stats.throttled.fetch_add(1, Ordering::Relaxed);
            let requeue_delay = config.requeue_delay;
            for query in batch {
                let requeue_tx = requeue_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(requeue_delay).await;
                    let _ = requeue_tx.try_send(query);
                });
            }
        }
        Err(e) => {
            warn!(error = %e, batch_size = batch.len(), "classifier batch failed, not requeuing");
            stats
                .analyses_failed
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
    }

    *last_dispatch_end = Some(Instant::now());
}

async fn classify_one_by_one(
    classifier: &(dyn Classifier),
    batch: &[QueryRecord],
    whois_by_domain: &HashMap<String, guardian_core::model::WhoisRecord>,
) -> Result<Vec<guardian_core::model::Verdict>, GuardianError> {
    let mut verdicts = Vec::with_capacity(batch.len());
    for query in batch {
        let empty = guardian_core::model::WhoisRecord::empty(&query.domain);
        let whois = whois_by_domain.get(&query.domain).unwrap_or(&empty);
        verdicts.push(classifier.classify_one(query, whois).await?);
    }
    Ok(verdicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use guardian_core::model::{Classification, SuggestedAction, Verdict};
    use std::sync::atomic::AtomicUsize;

    struct AlwaysSafeClassifier {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Classifier for AlwaysSafeClassifier {
        fn name(&self) -> &str {
            "always-safe"
        }
        fn supports_batch(&self) -> bool {
            true
        }
        async fn classify_one(
            &self,
            query: &QueryRecord,
            _whois: &guardian_core::model::WhoisRecord,
        ) -> Result<Verdict, GuardianError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(Verdict {
                domain: query.domain.clone(),
                classification: Classification::Safe,
                explanation: "reputable provider".to_string(),
                risk_score: 2,
                suggested_action: SuggestedAction::Allow,
            })
        }
        async fn classify_many(
            &self,
            queries: &[QueryRecord],
            _whois_by_domain: &HashMap<String, guardian_core::model::WhoisRecord>,
        ) -> Result<Vec<Verdict>, GuardianError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(queries
                .iter()
                .map(|q| Verdict {
                    domain: q.domain.clone(),
                    classification: Classification::Safe,
                    explanation: "reputable provider".to_string(),
                    risk_score: 2,
                    suggested_action: SuggestedAction::Allow,
                })
                .collect())
        }
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

    #[tokio::test]
    async fn flush_interval_dispatches_a_partial_batch() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let enricher = Arc::new(Enricher::new(store.clone()));
        let classifier: Arc<dyn Classifier> = Arc::new(AlwaysSafeClassifier {
            calls: AtomicUsize::new(0),
        });

        let config = DispatcherConfig {
            batch_size: 20,
            flush_interval: Duration::from_millis(50),
            inter_batch_delay: Duration::from_millis(0),
            requeue_delay: Duration::from_millis(10),
        };
        let dispatcher = Dispatcher::spawn(config, store.clone(), enricher, classifier);
        dispatcher.submit(sample_query("safe.example.org"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        dispatcher.stop().await;

        let stats = dispatcher.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.batches_run, 1);
        assert_eq!(stats.analyses_ok, 1);
    }

    #[tokio::test]
    async fn batch_size_threshold_dispatches_immediately() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let enricher = Arc::new(Enricher::new(store.clone()));
        let classifier: Arc<dyn Classifier> = Arc::new(AlwaysSafeClassifier {
            calls: AtomicUsize::new(0),
        });

        let config = DispatcherConfig {
            batch_size: 2,
            flush_interval: Duration::from_secs(60),
            inter_batch_delay: Duration::from_millis(0),
            requeue_delay: Duration::from_millis(10),
        };
        let dispatcher = Dispatcher::spawn(config, store.clone(), enricher, classifier);
        dispatcher.submit(sample_query("a.example.org"));
        dispatcher.submit(sample_query("b.example.org"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        dispatcher.stop().await;

        let stats = dispatcher.stats();
        assert_eq!(stats.batches_run, 1);
        assert_eq!(stats.analyses_ok, 2);
    }

    /// Throttles the first call then answers safe on every call after, so a
    /// requeued item succeeds on its second attempt.
    struct ThrottleOnceClassifier {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Classifier for ThrottleOnceClassifier {
        fn name(&self) -> &str {
            "throttle-once"
        }
        fn supports_batch(&self) -> bool {
            true
        }
        async fn classify_one(
            &self,
            query: &QueryRecord,
            _whois: &guardian_core::model::WhoisRecord,
        ) -> Result<Verdict, GuardianError> {
            if self.calls.fetch_add(1, Ordering::Relaxed) == 0 {
                return Err(GuardianError::Throttled);
            }
            Ok(Verdict {
                domain: query.domain.clone(),
                classification: Classification::Safe,
                explanation: "reputable provider".to_string(),
                risk_score: 2,
                suggested_action: SuggestedAction::Allow,
            })
        }
        async fn classify_many(
            &self,
            queries: &[QueryRecord],
            _whois_by_domain: &HashMap<String, guardian_core::model::WhoisRecord>,
        ) -> Result<Vec<Verdict>, GuardianError> {
            if self.calls.fetch_add(1, Ordering::Relaxed) == 0 {
                return Err(GuardianError::Throttled);
            }
            Ok(queries
                .iter()
                .map(|q| Verdict {
                    domain: q.domain.clone(),
                    classification: Classification::Safe,
                    explanation: "reputable provider".to_string(),
                    risk_score: 2,
                    suggested_action: SuggestedAction::Allow,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn throttled_batch_is_requeued_and_later_succeeds() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let enricher = Arc::new(Enricher::new(store.clone()));
        let classifier: Arc<dyn Classifier> = Arc::new(ThrottleOnceClassifier {
            calls: AtomicUsize::new(0),
        });

        let config = DispatcherConfig {
            batch_size: 20,
            flush_interval: Duration::from_millis(20),
            inter_batch_delay: Duration::from_millis(0),
            requeue_delay: Duration::from_millis(20),
        };
        let dispatcher = Dispatcher::spawn(config, store.clone(), enricher, classifier);
        dispatcher.submit(sample_query("throttled.example.org"));

        // First flush is throttled and requeued; wait past the requeue
        // delay plus another flush interval for the retry to land.
        tokio::time::sleep(Duration::from_millis(400)).await;
        dispatcher.stop().await;

        let stats = dispatcher.stats();
        assert_eq!(stats.throttled, 1);
        assert_eq!(stats.analyses_ok, 1);
        assert_eq!(stats.analyses_failed, 0);
    }
}
