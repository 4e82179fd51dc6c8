use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{info, warn};

use crate::config::Config;
use crate::decoder::TradeDecoder;
use crate::enrichment::EnrichmentPipeline;
use crate::grpc::{StreamClient, SubscriptionFilter};
use crate::metadata::CreatorHistoryClient;
use crate::monitor::PoolMonitor;
use crate::registry::FirstEventRegistry;
use crate::router::EventRouter;
use crate::rpc::ChainRpc;
use crate::store::Store;
use crate::token_queue::{spawn_token_worker, TokenQueue};

/// Window for pending fire-and-forget work to drain during stop.
const STOP_CLEANUP_WINDOW: Duration = Duration::from_millis(500);

/// How long stop waits for the stream loop to wind down.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ControlResponse {
    pub ok: bool,
    pub msg: String,
}

impl ControlResponse {
    fn ok(msg: &str) -> Self {
        Self {
            ok: true,
            msg: msg.to_string(),
        }
    }

    fn refused(msg: &str) -> Self {
        Self {
            ok: false,
            msg: msg.to_string(),
        }
    }
}

/// Long-lived tracker handle: owns the wiring and the start/stop lifecycle.
pub struct Tracker {
    addresses: Mutex<Vec<String>>,
    running: Arc<AtomicBool>,
    stream: Arc<StreamClient>,
    router: Arc<EventRouter>,
    monitor: Arc<PoolMonitor>,
    token_queue: Arc<TokenQueue>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Tracker {
    /// Wire the full pipeline. Must run inside a tokio runtime (the token
    /// queue worker is spawned here).
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        decoder: Arc<dyn TradeDecoder>,
    ) -> Result<Self> {
        let rpc = Arc::new(ChainRpc::new(&config.rpc));
        let registry = Arc::new(FirstEventRegistry::new(store.clone()));

        let creator_history = match &config.enrichment.creator_history_api_url {
            Some(url) => Some(Arc::new(CreatorHistoryClient::new(
                url.clone(),
                config.enrichment.metadata_api_key.clone(),
            )?)),
            None => None,
        };

        let enrichment = Arc::new(EnrichmentPipeline::new(
            store.clone(),
            rpc.clone(),
            registry.clone(),
            creator_history,
            config.enrichment.creator_count_delay,
        ));

        let monitor = Arc::new(PoolMonitor::new(
            store.clone(),
            rpc.clone(),
            registry,
            config.monitoring.clone(),
        ));

        let token_queue = Arc::new(spawn_token_worker(store, rpc));

        let router = Arc::new(EventRouter::new(
            decoder,
            enrichment,
            monitor.clone(),
            token_queue.clone(),
        ));

        let stream = Arc::new(StreamClient::new(
            &config.stream,
            Some(config.checkpoint_path.clone()),
        ));

        Ok(Self {
            addresses: Mutex::new(config.tracked_wallets.clone()),
            running: Arc::new(AtomicBool::new(false)),
            stream,
            router,
            monitor,
            token_queue,
            stop_tx: Mutex::new(None),
            run_handle: Mutex::new(None),
        })
    }

    pub fn set_addresses(&self, addresses: Vec<String>) {
        info!("👥 Tracking {} wallets", addresses.len());
        *self.addresses.lock().unwrap() = addresses;
    }

    pub fn addresses(&self) -> Vec<String> {
        self.addresses.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the stream loop. Refuses when already running or when no
    /// addresses are configured.
    pub async fn start(&self) -> ControlResponse {
        if self.is_running() {
            return ControlResponse::refused("tracker is already running");
        }
        let addresses = self.addresses();
        if addresses.is_empty() {
            return ControlResponse::refused("no wallet addresses configured");
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock().unwrap() = Some(stop_tx);
        self.running.store(true, Ordering::SeqCst);

        let filter = SubscriptionFilter::for_addresses(addresses);
        let stream = self.stream.clone();
        let router = self.router.clone();
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = stream
                .run(filter, move |event| router.handle(event), stop_rx)
                .await
            {
                warn!("Stream loop exited with error: {}", e);
            }
            running.store(false, Ordering::SeqCst);
        });
        *self.run_handle.lock().unwrap() = Some(handle);

        info!("🚀 Tracker started");
        ControlResponse::ok("tracker started")
    }

    /// Stop the tracker: clear the server-side filter and close the stream,
    /// stop the token queue, wait out the cleanup window, then cancel all
    /// monitoring sessions. Idempotent on a stopped tracker.
    pub async fn stop(&self) -> ControlResponse {
        if !self.is_running() {
            return ControlResponse::ok("tracker is not running");
        }

        if let Some(stop_tx) = self.stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(true);
        }

        let handle = self.run_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Stream loop did not wind down in time, detaching");
            }
        }

        self.token_queue.stop();
        sleep(STOP_CLEANUP_WINDOW).await;
        self.monitor.cancel_all();
        self.running.store(false, Ordering::SeqCst);

        info!("🛑 Tracker stopped");
        ControlResponse::ok("tracker stopped")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::BareDecoder;
    use crate::store::MemoryStore;

    fn test_config() -> Config {
        use crate::config::*;
        Config {
            stream: StreamConfig {
                endpoint: "http://127.0.0.1:1".to_string(),
                x_token: None,
                checkpoint_save_interval: 1000,
            },
            rpc: RpcConfig {
                endpoint: "http://127.0.0.1:1".to_string(),
                timeout: Duration::from_millis(100),
            },
            database_path: "unused".to_string(),
            checkpoint_path: "unused".to_string(),
            monitoring: MonitoringConfig::default(),
            enrichment: EnrichmentConfig {
                creator_history_api_url: None,
                metadata_api_key: None,
                creator_count_delay: Duration::from_secs(45),
            },
            tracked_wallets: vec![],
        }
    }

    fn tracker() -> Tracker {
        let store = Arc::new(MemoryStore::new());
        let mut config = test_config();
        config.checkpoint_path = std::env::temp_dir()
            .join(format!("tracker-test-{}.json", std::process::id()))
            .to_string_lossy()
            .to_string();
        Tracker::new(&config, store, Arc::new(BareDecoder)).unwrap()
    }

    #[tokio::test]
    async fn start_refuses_without_addresses() {
        let tracker = tracker();
        let response = tracker.start().await;
        assert!(!response.ok);
        assert!(!tracker.is_running());
    }

    #[tokio::test]
    async fn start_refuses_when_already_running() {
        let tracker = tracker();
        tracker.set_addresses(vec!["W1".to_string()]);

        assert!(tracker.start().await.ok);
        assert!(tracker.is_running());
        assert!(!tracker.start().await.ok);

        tracker.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let tracker = tracker();
        tracker.set_addresses(vec!["W1".to_string()]);

        assert!(tracker.start().await.ok);
        assert!(tracker.stop().await.ok);
        assert!(!tracker.is_running());
        // Stopping a stopped tracker succeeds.
        assert!(tracker.stop().await.ok);
    }

    #[tokio::test]
    async fn addresses_round_trip() {
        let tracker = tracker();
        tracker.set_addresses(vec!["W1".to_string(), "W2".to_string()]);
        assert_eq!(tracker.addresses(), vec!["W1".to_string(), "W2".to_string()]);
    }
}
