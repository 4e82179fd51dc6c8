use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::rpc::ChainRpc;
use crate::store::Store;

/// Deduplicating FIFO of mints awaiting metadata enrichment.
///
/// A mint stays "pending" from offer until its fetch completes, so repeated
/// offers while it is queued or in flight are no-ops. A single worker drains
/// the queue; ordering across different mints is unspecified.
pub struct TokenQueue {
    tx: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<HashSet<String>>>,
    stop_tx: watch::Sender<bool>,
}

impl TokenQueue {
    /// Queue a mint for enrichment. Returns false if it was already pending.
    pub fn offer(&self, mint: &str) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if !pending.insert(mint.to_string()) {
            return false;
        }
        drop(pending);

        if self.tx.send(mint.to_string()).is_err() {
            warn!("Token queue worker is gone, dropping {}", mint);
            self.pending.lock().unwrap().remove(mint);
            return false;
        }
        debug!("Queued token enrichment for {}", mint);
        true
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Spawn the queue and its single drain worker.
pub fn spawn_token_worker(store: Arc<dyn Store>, rpc: Arc<ChainRpc>) -> TokenQueue {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let pending: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let worker_pending = pending.clone();
    tokio::spawn(async move {
        info!("🪙 Token enrichment worker started");
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        info!("Token enrichment worker stopping");
                        break;
                    }
                }
                mint = rx.recv() => {
                    let Some(mint) = mint else { break };
                    match rpc.token_supply(&mint).await {
                        Ok((supply, decimals)) => {
                            if let Err(e) = store.upsert_token_metadata(&mint, supply, Some(decimals)) {
                                warn!("Failed to persist metadata for {}: {}", mint, e);
                            }
                        }
                        Err(e) => warn!("Token metadata fetch failed for {}: {}", mint, e),
                    }
                    worker_pending.lock().unwrap().remove(&mint);
                }
            }
        }
    });

    TokenQueue {
        tx,
        pending,
        stop_tx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn test_queue() -> TokenQueue {
        let store = Arc::new(MemoryStore::new());
        let rpc = Arc::new(ChainRpc::new(&RpcConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_millis(100),
        }));
        spawn_token_worker(store, rpc)
    }

    #[tokio::test]
    async fn offering_a_pending_mint_is_a_noop() {
        let queue = test_queue();
        // Current-thread runtime: the worker cannot run between these calls.
        assert!(queue.offer("Mint111"));
        assert!(!queue.offer("Mint111"));
        assert!(queue.offer("Mint222"));
        assert_eq!(queue.pending_len(), 2);
    }
}
