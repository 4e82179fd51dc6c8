use std::collections::{HashMap, HashSet};

use futures::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use yellowstone_grpc_client::GeyserGrpcClient;
use yellowstone_grpc_proto::geyser::{
    subscribe_update::UpdateOneof, CommitmentLevel, SubscribeRequest,
    SubscribeRequestFilterTransactions, SubscribeRequestPing, SubscribeUpdateTransaction,
};

use crate::checkpoint::Checkpoint;
use crate::config::StreamConfig;
use crate::error::TrackerError;

/// Reconnect attempts that may reuse the slot checkpoint before falling back
/// to the tip.
const MAX_CHECKPOINT_RETRIES: u32 = 5;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Grace period after sending the clear-filter update, letting the server
/// release the subscription before the channel closes.
const CLEAR_FILTER_GRACE: Duration = Duration::from_millis(200);

/// Signature dedup cache cap; the cache is cleared wholesale beyond this.
const SEEN_CACHE_MAX: usize = 50_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl Commitment {
    fn level(self) -> CommitmentLevel {
        match self {
            Commitment::Processed => CommitmentLevel::Processed,
            Commitment::Confirmed => CommitmentLevel::Confirmed,
            Commitment::Finalized => CommitmentLevel::Finalized,
        }
    }
}

/// Transaction subscription filter.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub include_addresses: Vec<String>,
    pub exclude_addresses: Vec<String>,
    pub commitment: Commitment,
    pub vote: bool,
    pub failed: bool,
    pub from_slot: Option<u64>,
}

impl SubscriptionFilter {
    pub fn for_addresses(addresses: Vec<String>) -> Self {
        Self {
            include_addresses: addresses,
            ..Default::default()
        }
    }

    /// Wire request for this filter. An empty include list produces an empty
    /// request, which the server treats as "clear subscription".
    pub fn request(&self, from_slot: Option<u64>) -> SubscribeRequest {
        let mut transactions = HashMap::new();
        if !self.include_addresses.is_empty() {
            transactions.insert(
                "wallet_txs".to_string(),
                SubscribeRequestFilterTransactions {
                    vote: Some(self.vote),
                    failed: Some(self.failed),
                    signature: None,
                    account_include: self.include_addresses.clone(),
                    account_exclude: self.exclude_addresses.clone(),
                    account_required: vec![],
                },
            );
        }

        SubscribeRequest {
            transactions,
            commitment: Some(self.commitment.level() as i32),
            from_slot,
            ..Default::default()
        }
    }
}

/// One inbound transaction event, pre-decode.
#[derive(Debug)]
pub struct StreamEvent {
    pub slot: u64,
    /// Server-side creation time of the update, epoch seconds.
    pub created_at_secs: Option<i64>,
    pub tx: SubscribeUpdateTransaction,
}

/// Where the retry budget stands after a disconnect: the slot to resume from
/// (None = tip) and the updated retry counter.
///
/// Progress on the failed stream refunds the whole budget; an exhausted
/// budget falls back to the tip and resets.
pub(crate) fn plan_reconnect(
    last_slot: Option<u64>,
    received_any: bool,
    retries: u32,
) -> (Option<u64>, u32) {
    let retries = if received_any { 0 } else { retries };
    match last_slot {
        Some(slot) if retries < MAX_CHECKPOINT_RETRIES => (Some(slot), retries + 1),
        _ => (None, 0),
    }
}

enum StreamOutcome {
    /// Cooperative stop observed; teardown already performed.
    Stopped,
    /// Stream ended or failed; carries what we saw before it died.
    Disconnected {
        last_slot: Option<u64>,
        received_any: bool,
        error: Option<String>,
    },
    /// Misconfiguration that no amount of retrying fixes.
    Fatal(String),
}

/// Resilient subscription client with slot-checkpoint resume.
pub struct StreamClient {
    endpoint: String,
    x_token: Option<String>,
    checkpoint_path: Option<String>,
    checkpoint_save_interval: u64,
}

impl StreamClient {
    pub fn new(config: &StreamConfig, checkpoint_path: Option<String>) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            x_token: config.x_token.clone(),
            checkpoint_path,
            checkpoint_save_interval: config.checkpoint_save_interval,
        }
    }

    /// Long-running subscription loop. Reconnects until `stop` flips; per-event
    /// work is delegated to `on_event`, which must not block.
    pub async fn run<F>(
        &self,
        filter: SubscriptionFilter,
        on_event: F,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), TrackerError>
    where
        F: Fn(StreamEvent) + Send + Sync,
    {
        let mut checkpoint = self.load_checkpoint();
        let mut last_slot = filter.from_slot.or_else(|| {
            checkpoint
                .as_ref()
                .map(|c| c.last_processed_slot)
                .filter(|&s| s > 0)
        });
        let mut retries: u32 = 0;
        let mut seen_signatures: HashSet<String> = HashSet::with_capacity(10_000);

        loop {
            if *stop.borrow() {
                return Ok(());
            }

            match last_slot {
                Some(slot) => info!("🔌 Connecting to {} (resume from slot {})", self.endpoint, slot),
                None => info!("🔌 Connecting to {} (from tip)", self.endpoint),
            }

            let request = filter.request(last_slot);
            let outcome = self
                .run_once(request, &on_event, &mut stop, &mut seen_signatures, &mut checkpoint)
                .await;

            match outcome {
                StreamOutcome::Stopped => {
                    self.save_checkpoint(&mut checkpoint);
                    return Ok(());
                }
                StreamOutcome::Fatal(err) => {
                    self.save_checkpoint(&mut checkpoint);
                    return Err(TrackerError::StreamFatal(err));
                }
                StreamOutcome::Disconnected {
                    last_slot: seen_slot,
                    received_any,
                    error,
                } => {
                    if let Some(err) = error {
                        warn!("{}, reconnecting in 1s...", TrackerError::StreamTransient(err));
                    } else {
                        warn!("Stream ended, reconnecting in 1s...");
                    }
                    self.save_checkpoint(&mut checkpoint);

                    if seen_slot.is_some() {
                        last_slot = seen_slot;
                    }
                    let (resume, next_retries) = plan_reconnect(last_slot, received_any, retries);
                    if resume.is_none() && last_slot.is_some() {
                        warn!(
                            "Checkpoint retry budget exhausted ({} attempts), resuming from tip",
                            MAX_CHECKPOINT_RETRIES
                        );
                    }
                    last_slot = resume;
                    retries = next_retries;

                    sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// One stream lifetime: connect, subscribe, pump events until stop,
    /// error, or server-side end.
    async fn run_once<F>(
        &self,
        request: SubscribeRequest,
        on_event: &F,
        stop: &mut watch::Receiver<bool>,
        seen_signatures: &mut HashSet<String>,
        checkpoint: &mut Option<Checkpoint>,
    ) -> StreamOutcome
    where
        F: Fn(StreamEvent) + Send + Sync,
    {
        let mut last_slot: Option<u64> = None;
        let mut received_any = false;

        // Builder errors are misconfiguration; only the network steps retry.
        let builder = match GeyserGrpcClient::build_from_shared(self.endpoint.clone()) {
            Ok(builder) => builder,
            Err(e) => return StreamOutcome::Fatal(format!("bad endpoint: {}", e)),
        };
        let builder = match builder.x_token(self.x_token.clone()) {
            Ok(builder) => builder,
            Err(e) => return StreamOutcome::Fatal(format!("invalid x-token: {}", e)),
        };
        let mut client = match builder.connect().await {
            Ok(client) => client,
            Err(e) => {
                return StreamOutcome::Disconnected {
                    last_slot,
                    received_any,
                    error: Some(format!("connect failed: {}", e)),
                }
            }
        };

        let (mut subscribe_tx, mut stream) = match client.subscribe_with_request(Some(request)).await
        {
            Ok(pair) => pair,
            Err(e) => {
                return StreamOutcome::Disconnected {
                    last_slot,
                    received_any,
                    error: Some(format!("subscribe failed: {}", e)),
                }
            }
        };
        info!("✅ Subscription established");

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        // Cooperative teardown: clear the server-side filter,
                        // give it a beat, then drop the stream.
                        if let Err(e) = subscribe_tx.send(SubscribeRequest::default()).await {
                            debug!("Failed to send clear-filter update: {}", e);
                        }
                        sleep(CLEAR_FILTER_GRACE).await;
                        info!("📴 Subscription closed");
                        return StreamOutcome::Stopped;
                    }
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(msg)) => {
                            received_any = true;
                            let created_at_secs = msg.created_at.as_ref().map(|ts| ts.seconds);
                            match msg.update_oneof {
                                Some(UpdateOneof::Transaction(tx_update)) => {
                                    let slot = tx_update.slot;
                                    last_slot = Some(slot);
                                    if let Some(cp) = checkpoint.as_mut() {
                                        cp.update(slot);
                                        if let Some(path) = &self.checkpoint_path {
                                            let _ = cp.save_if_needed(path, self.checkpoint_save_interval);
                                        }
                                    }

                                    if let Some(sig) = transaction_signature(&tx_update) {
                                        if !seen_signatures.insert(sig) {
                                            debug!("⏭️  Skipping duplicate transaction at slot {}", slot);
                                            continue;
                                        }
                                        if seen_signatures.len() > SEEN_CACHE_MAX {
                                            debug!("🗑️  Pruning signature cache ({} entries)", seen_signatures.len());
                                            seen_signatures.clear();
                                        }
                                    }

                                    on_event(StreamEvent { slot, created_at_secs, tx: tx_update });
                                }
                                Some(UpdateOneof::Ping(_)) => {
                                    let pong = SubscribeRequest {
                                        ping: Some(SubscribeRequestPing { id: 1 }),
                                        ..Default::default()
                                    };
                                    if let Err(e) = subscribe_tx.send(pong).await {
                                        debug!("Failed to answer ping: {}", e);
                                    }
                                }
                                _ => {}
                            }
                        }
                        Some(Err(status)) => {
                            error!("Stream error: {}", status);
                            return StreamOutcome::Disconnected {
                                last_slot,
                                received_any,
                                error: Some(status.to_string()),
                            };
                        }
                        None => {
                            return StreamOutcome::Disconnected {
                                last_slot,
                                received_any,
                                error: None,
                            };
                        }
                    }
                }
            }
        }
    }

    fn load_checkpoint(&self) -> Option<Checkpoint> {
        let path = self.checkpoint_path.as_ref()?;
        match Checkpoint::load(path) {
            Ok(Some(cp)) => Some(cp),
            Ok(None) => Some(Checkpoint::new(0)),
            Err(e) => {
                warn!("Failed to load checkpoint: {}", e);
                Some(Checkpoint::new(0))
            }
        }
    }

    fn save_checkpoint(&self, checkpoint: &mut Option<Checkpoint>) {
        if let (Some(cp), Some(path)) = (checkpoint.as_mut(), &self.checkpoint_path) {
            if cp.last_processed_slot > 0 {
                if let Err(e) = cp.save(path) {
                    warn!("Failed to save checkpoint: {}", e);
                }
            }
        }
    }
}

fn transaction_signature(tx_update: &SubscribeUpdateTransaction) -> Option<String> {
    tx_update
        .transaction
        .as_ref()
        .and_then(|info| info.transaction.as_ref())
        .and_then(|t| t.signatures.first())
        .map(|sig| bs58::encode(sig).into_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_resumes_from_checkpoint() {
        // Events seen up to slot 102, first failure: resume with from_slot.
        let (resume, retries) = plan_reconnect(Some(102), true, 0);
        assert_eq!(resume, Some(102));
        assert_eq!(retries, 1);
    }

    #[test]
    fn progress_refunds_the_retry_budget() {
        let (resume, retries) = plan_reconnect(Some(200), true, 4);
        assert_eq!(resume, Some(200));
        assert_eq!(retries, 1);
    }

    #[test]
    fn no_checkpoint_means_tip() {
        let (resume, retries) = plan_reconnect(None, false, 3);
        assert_eq!(resume, None);
        assert_eq!(retries, 0);
    }

    #[test]
    fn budget_exhaustion_falls_back_to_tip_and_resets() {
        // Five consecutive failures with zero messages received.
        let mut retries = 0;
        for _ in 0..5 {
            let (resume, next) = plan_reconnect(Some(102), false, retries);
            assert_eq!(resume, Some(102));
            retries = next;
        }
        assert_eq!(retries, 5);

        // Sixth reconnect goes to the tip and the counter resets.
        let (resume, retries) = plan_reconnect(Some(102), false, retries);
        assert_eq!(resume, None);
        assert_eq!(retries, 0);
    }

    #[test]
    fn filter_request_defaults() {
        let filter = SubscriptionFilter::for_addresses(vec!["W1".to_string()]);
        let request = filter.request(Some(102));

        assert_eq!(request.commitment, Some(CommitmentLevel::Confirmed as i32));
        assert_eq!(request.from_slot, Some(102));
        let tx_filter = request.transactions.get("wallet_txs").unwrap();
        assert_eq!(tx_filter.vote, Some(false));
        assert_eq!(tx_filter.failed, Some(false));
        assert_eq!(tx_filter.account_include, vec!["W1".to_string()]);
    }

    #[test]
    fn empty_filter_clears_subscription() {
        let filter = SubscriptionFilter::for_addresses(vec![]);
        let request = filter.request(None);
        assert!(request.transactions.is_empty());
    }
}
