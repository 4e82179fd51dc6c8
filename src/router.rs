use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use crate::decoder::TradeDecoder;
use crate::enrichment::EnrichmentPipeline;
use crate::grpc::StreamEvent;
use crate::monitor::PoolMonitor;
use crate::token_queue::TokenQueue;
use crate::types::{DecodedEvent, TradeKind, TransactionRecord};

/// Per-event dispatch: decode, then fan out to enrichment and pool
/// monitoring without blocking the stream loop.
pub struct EventRouter {
    decoder: Arc<dyn TradeDecoder>,
    enrichment: Arc<EnrichmentPipeline>,
    monitor: Arc<PoolMonitor>,
    token_queue: Arc<TokenQueue>,
}

impl EventRouter {
    pub fn new(
        decoder: Arc<dyn TradeDecoder>,
        enrichment: Arc<EnrichmentPipeline>,
        monitor: Arc<PoolMonitor>,
        token_queue: Arc<TokenQueue>,
    ) -> Self {
        Self {
            decoder,
            enrichment,
            monitor,
            token_queue,
        }
    }

    /// Handle one inbound stream event. Cheap: decoding plus task spawns;
    /// all real work happens in the spawned tasks.
    pub fn handle(&self, event: StreamEvent) {
        // Prefer the server-side creation time; fall back to wall clock.
        let block_time = event
            .created_at_secs
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        let slot = event.slot;

        let Some(decoded) = self.decoder.decode(&event.tx, slot, block_time) else {
            debug!("Decoder returned nothing at slot {}, dropping", slot);
            return;
        };

        let kind = decoded.kind();
        let token = decoded.token_address().map(|t| t.to_string());

        match (decoded, token) {
            (DecodedEvent::Buy(swap), Some(token)) => {
                self.token_queue.offer(&token);

                let (seed_tx, seed_rx) = oneshot::channel();

                // Reserve the session slot before fanning out, so the
                // enrichment task's first-buy merge can't make the monitor
                // think this buy isn't the first.
                let pending = self.monitor.register_buy(&token, &swap, slot, block_time);

                let enrichment = self.enrichment.clone();
                tokio::spawn(async move {
                    enrichment
                        .process_swap(TradeKind::Buy, token, swap, slot, block_time, Some(seed_tx))
                        .await;
                });

                if let Some(pending) = pending {
                    let monitor = self.monitor.clone();
                    tokio::spawn(async move {
                        monitor.activate(pending, Some(seed_rx)).await;
                    });
                }
            }
            (DecodedEvent::Sell(swap), Some(token)) => {
                self.token_queue.offer(&token);

                let enrichment = self.enrichment.clone();
                let enrich_event = swap.clone();
                let enrich_token = token.clone();
                tokio::spawn(async move {
                    enrichment
                        .process_swap(
                            TradeKind::Sell,
                            enrich_token,
                            enrich_event,
                            slot,
                            block_time,
                            None,
                        )
                        .await;
                });

                let monitor = self.monitor.clone();
                tokio::spawn(async move {
                    monitor.on_sell(&token, &swap, block_time);
                });
            }
            // A swap whose token leg is wrapped SOL, or a transaction the
            // decoder couldn't classify: persist the bare record and move on.
            (DecodedEvent::Buy(swap) | DecodedEvent::Sell(swap), None) => {
                let record = TransactionRecord::from_swap(kind, &swap, slot, block_time);
                self.persist_bare(record);
            }
            (
                DecodedEvent::Other {
                    signature,
                    platform,
                    fee_payer,
                },
                _,
            ) => {
                let record =
                    TransactionRecord::bare(signature, platform, fee_payer, slot, block_time);
                self.persist_bare(record);
            }
        }
    }

    fn persist_bare(&self, record: TransactionRecord) {
        let enrichment = self.enrichment.clone();
        tokio::spawn(async move {
            enrichment.process_bare(&record);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MonitoringConfig, RpcConfig};
    use crate::monitor::{PoolSnapshot, PriceSource};
    use crate::registry::FirstEventRegistry;
    use crate::rpc::ChainRpc;
    use crate::store::MemoryStore;
    use crate::token_queue::spawn_token_worker;
    use crate::types::{SwapEvent, WSOL_MINT};
    use anyhow::Result;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::Mutex;
    use std::time::Duration;
    use yellowstone_grpc_proto::geyser::SubscribeUpdateTransaction;

    /// Decoder that replays a scripted sequence of events.
    struct ScriptedDecoder {
        events: Mutex<Vec<Option<DecodedEvent>>>,
    }

    impl ScriptedDecoder {
        fn new(events: Vec<Option<DecodedEvent>>) -> Self {
            Self {
                events: Mutex::new(events),
            }
        }
    }

    impl TradeDecoder for ScriptedDecoder {
        fn decode(
            &self,
            _tx: &SubscribeUpdateTransaction,
            _slot: u64,
            _block_time: i64,
        ) -> Option<DecodedEvent> {
            self.events.lock().unwrap().remove(0)
        }
    }

    struct FixedSource;

    impl PriceSource for FixedSource {
        fn sample<'a>(
            &'a self,
            _pool: &'a str,
            _mint: &'a str,
        ) -> BoxFuture<'a, Result<PoolSnapshot>> {
            async move {
                Ok(PoolSnapshot {
                    price_sol: Some(0.0015),
                    slot: None,
                })
            }
            .boxed()
        }

        fn token_supply<'a>(&'a self, _mint: &'a str) -> BoxFuture<'a, Result<(Option<f64>, u8)>> {
            async move { Ok((Some(1_000_000.0), 6)) }.boxed()
        }
    }

    fn router_with(store: Arc<MemoryStore>, decoder: Arc<dyn TradeDecoder>) -> EventRouter {
        let rpc = Arc::new(ChainRpc::new(&RpcConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_millis(100),
        }));
        let registry = Arc::new(FirstEventRegistry::new(store.clone()));
        let enrichment = Arc::new(EnrichmentPipeline::new(
            store.clone(),
            rpc.clone(),
            registry.clone(),
            None,
            Duration::from_secs(45),
        ));
        let monitor = Arc::new(PoolMonitor::new(
            store.clone(),
            Arc::new(FixedSource),
            registry,
            MonitoringConfig::default(),
        ));
        let token_queue = Arc::new(spawn_token_worker(store, rpc));
        EventRouter::new(decoder, enrichment, monitor, token_queue)
    }

    fn stream_event(slot: u64) -> StreamEvent {
        StreamEvent {
            slot,
            created_at_secs: Some(1_700_000_000),
            tx: SubscribeUpdateTransaction::default(),
        }
    }

    fn buy(sig: &str) -> DecodedEvent {
        DecodedEvent::Buy(SwapEvent {
            signature: sig.to_string(),
            platform: "pumpfun".to_string(),
            fee_payer: "W1".to_string(),
            mint_in: WSOL_MINT.to_string(),
            mint_out: "T1".to_string(),
            amount_in: 1.0,
            amount_out: 1000.0,
            price_sol: Some(0.001),
            pool: Some("P1".to_string()),
            creator: Some("C1".to_string()),
        })
    }

    fn sell(sig: &str) -> DecodedEvent {
        DecodedEvent::Sell(SwapEvent {
            signature: sig.to_string(),
            platform: "pumpfun".to_string(),
            fee_payer: "W1".to_string(),
            mint_in: "T1".to_string(),
            mint_out: WSOL_MINT.to_string(),
            amount_in: 1000.0,
            amount_out: 2.0,
            price_sol: Some(0.002),
            pool: Some("P1".to_string()),
            creator: None,
        })
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(check(), "condition not reached");
    }

    #[tokio::test]
    async fn first_buy_flows_to_both_modules() {
        let store = Arc::new(MemoryStore::new());
        let decoder = Arc::new(ScriptedDecoder::new(vec![Some(buy("tx1"))]));
        let router = router_with(store.clone(), decoder);

        router.handle(stream_event(100));

        wait_for(|| store.transaction("tx1").is_some()).await;
        wait_for(|| store.pair("W1", "T1").is_some()).await;
        wait_for(|| store.sessions().len() == 1).await;

        let pair = store.pair("W1", "T1").unwrap();
        assert!(pair.first_buy_time.is_some());

        let sessions = store.sessions();
        assert_eq!(sessions[0].new.wallet, "W1");
        assert_eq!(sessions[0].new.token, "T1");
        assert_eq!(sessions[0].new.initial.price_sol, Some(0.001));
    }

    #[tokio::test]
    async fn sell_after_buy_completes_the_session() {
        let store = Arc::new(MemoryStore::new());
        let decoder = Arc::new(ScriptedDecoder::new(vec![
            Some(buy("tx1")),
            Some(sell("tx2")),
        ]));
        let router = router_with(store.clone(), decoder);

        router.handle(stream_event(100));
        wait_for(|| store.sessions().len() == 1).await;

        router.handle(stream_event(101));
        wait_for(|| store.sessions()[0].final_reason.is_some()).await;

        let session = &store.sessions()[0];
        assert_eq!(session.final_reason.as_deref(), Some("sell"));
        assert_eq!(session.first_sell_tx.as_deref(), Some("tx2"));

        wait_for(|| {
            store
                .pair("W1", "T1")
                .map_or(false, |p| p.first_sell_time.is_some())
        })
        .await;
    }

    #[tokio::test]
    async fn undecodable_event_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let decoder = Arc::new(ScriptedDecoder::new(vec![None]));
        let router = router_with(store.clone(), decoder);

        router.handle(stream_event(100));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.transaction_count(), 0);
        assert!(store.sessions().is_empty());
    }

    #[tokio::test]
    async fn other_event_is_persisted_bare() {
        let store = Arc::new(MemoryStore::new());
        let decoder = Arc::new(ScriptedDecoder::new(vec![Some(DecodedEvent::Other {
            signature: "tx9".to_string(),
            platform: "unknown".to_string(),
            fee_payer: "W1".to_string(),
        })]));
        let router = router_with(store.clone(), decoder);

        router.handle(stream_event(100));
        wait_for(|| store.transaction("tx9").is_some()).await;

        let tx = store.transaction("tx9").unwrap();
        assert_eq!(tx.record.kind, TradeKind::Other);
        assert!(store.sessions().is_empty());
        assert!(store.pair("W1", "T1").is_none());
    }

    #[tokio::test]
    async fn sol_only_swap_is_persisted_without_monitoring() {
        let store = Arc::new(MemoryStore::new());
        // A "buy" whose received leg is wrapped SOL has no trackable token.
        let event = DecodedEvent::Buy(SwapEvent {
            signature: "tx5".to_string(),
            platform: "pumpfun".to_string(),
            fee_payer: "W1".to_string(),
            mint_in: "T1".to_string(),
            mint_out: WSOL_MINT.to_string(),
            amount_in: 1000.0,
            amount_out: 1.0,
            price_sol: None,
            pool: None,
            creator: None,
        });
        let decoder = Arc::new(ScriptedDecoder::new(vec![Some(event)]));
        let router = router_with(store.clone(), decoder);

        router.handle(stream_event(100));
        wait_for(|| store.transaction("tx5").is_some()).await;
        assert!(store.sessions().is_empty());
    }
}
