//! Timer-driven polling loop that pulls new query log pages from upstream.

use std::sync::Arc;
use std::time::Duration;

use guardian_core::error::GuardianError;
use guardian_detector::Detector;
use guardian_dispatcher::Dispatcher;
use guardian_upstream::{ProbeResult, UpstreamApi};
use tokio::sync::watch;
use tracing::{info, warn};

pub struct PollerConfig {
    pub period: Duration,
    pub page_size: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(10),
            page_size: 100,
        }
    }
}

/// Handle to the running poller task.
pub struct Poller {
    shutdown_tx: watch::Sender<bool>,
    worker: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Poller {
    /// Probes the upstream once before spawning the loop. Fails startup on
    /// `Unauthorized`; an `Unreachable` probe is logged and the loop starts
    /// anyway, retrying silently on each tick.
    pub async fn start(
        config: PollerConfig,
        upstream: Arc<dyn UpstreamApi>,
        detector: Arc<Detector>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Arc<Self>, GuardianError> {
        match upstream.probe().await {
            ProbeResult::Ok => info!("upstream probe succeeded"),
            ProbeResult::Unauthorized => {
                return Err(GuardianError::Unauthorized(
                    "upstream rejected credentials at startup".to_string(),
                ))
            }
            ProbeResult::Unreachable => {
                warn!("upstream unreachable at startup, will retry on tick");
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(config, upstream, detector, dispatcher, shutdown_rx));

        Ok(Arc::new(Self {
            shutdown_tx,
            worker: tokio::sync::Mutex::new(Some(handle)),
        }))
    }

    /// Signals shutdown and waits for the in-flight page (if any) to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn run_loop(
    config: PollerConfig,
    upstream: Arc<dyn UpstreamApi>,
    detector: Arc<Detector>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                match upstream.fetch_page(config.page_size).await {
                    Ok(records) => {
                        for record in records {
                            detector.handle(record);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "poll tick failed, retrying next tick");
                    }
                }
            }
        }
    }

    info!("poller exiting, draining dispatcher");
    dispatcher.stop().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_a_ten_second_period() {
        let config = PollerConfig::default();
        assert_eq!(config.period, Duration::from_secs(10));
        assert_eq!(config.page_size, 100);
    }
}
