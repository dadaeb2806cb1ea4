//! Composition root: wires every component together.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use guardian_classifier::{Classifier, HttpClassifier};
use guardian_core::GuardianConfig;
use guardian_detector::Detector;
use guardian_dispatcher::{Dispatcher, DispatcherConfig};
use guardian_enricher::Enricher;
use guardian_poller::{Poller, PollerConfig};
use guardian_store::Store;
use guardian_upstream::{UpstreamApi, UpstreamClient};
use tracing::info;

pub struct AppState {
    pub config: Arc<GuardianConfig>,
    pub store: Arc<Store>,
    pub upstream: Arc<dyn UpstreamApi>,
    pub enricher: Arc<Enricher>,
    pub dispatcher: Arc<Dispatcher>,
    pub poller: Arc<Poller>,
    pub start_time: Instant,
}

impl AppState {
    pub async fn new(config: GuardianConfig) -> Result<Self> {
        let config = Arc::new(config);

        info!(path = %config.store_path.display(), "opening store");
        let store = Arc::new(Store::open(
            config.store_path.to_str().expect("store_path is valid utf-8"),
        )?);

        let upstream: Arc<dyn UpstreamApi> = Arc::new(UpstreamClient::new(
            config.upstream.url.clone(),
            config.upstream.username.clone(),
            config.upstream.password.clone(),
        ));

        let enricher = Arc::new(Enricher::new(store.clone()));

        let classifier: Arc<dyn Classifier> = Arc::new(HttpClassifier::new(
            config.classifier.provider.clone(),
            format!("{}/v1/chat/completions", config.classifier.endpoint),
            config.classifier.api_key.clone(),
            config.classifier.model.clone(),
            std::time::Duration::from_secs(config.classifier.request_timeout_secs),
        ));

        let dispatcher = Dispatcher::spawn(
            DispatcherConfig {
                batch_size: config.classifier.batch_size,
                flush_interval: std::time::Duration::from_secs(config.classifier.flush_interval_secs),
                inter_batch_delay: std::time::Duration::from_secs(
                    config.classifier.inter_batch_delay_secs,
                ),
                ..DispatcherConfig::default()
            },
            store.clone(),
            enricher.clone(),
            classifier,
        );

        let detector = Arc::new(Detector::new(store.clone(), dispatcher.clone()));

        let poller = Poller::start(
            PollerConfig {
                period: std::time::Duration::from_secs(config.poll.period_secs),
                page_size: config.poll.page_size,
            },
            upstream.clone(),
            detector,
            dispatcher.clone(),
        )
        .await?;

        Ok(Self {
            config,
            store,
            upstream,
            enricher,
            dispatcher,
            poller,
            start_time: Instant::now(),
        })
    }

    /// Finishes the in-flight poll tick, then drains the dispatcher, so no
    /// batch is abandoned mid-classification on shutdown.
    pub async fn shutdown(&self) {
        self.poller.stop().await;
    }
}
