use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::metadata::CreatorHistoryClient;
use crate::registry::FirstEventRegistry;
use crate::rpc::{ChainRpc, TokenAccountView};
use crate::store::Store;
use crate::types::{
    MarketData, SwapEvent, TradeKind, TransactionRecord, WalletTokenMerge, WSOL_MINT,
};

/// Per-event enrichment: persist, dev-holding, market cap, wallet-token
/// merge, open positions, creator token count.
///
/// Every step logs and continues on failure; nothing here can abort the
/// stream. Cloning is cheap: the pipeline is a bundle of shared handles.
#[derive(Clone)]
pub struct EnrichmentPipeline {
    store: Arc<dyn Store>,
    rpc: Arc<ChainRpc>,
    registry: Arc<FirstEventRegistry>,
    creator_history: Option<Arc<CreatorHistoryClient>>,
    creator_count_delay: Duration,
}

impl EnrichmentPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        rpc: Arc<ChainRpc>,
        registry: Arc<FirstEventRegistry>,
        creator_history: Option<Arc<CreatorHistoryClient>>,
        creator_count_delay: Duration,
    ) -> Self {
        Self {
            store,
            rpc,
            registry,
            creator_history,
            creator_count_delay,
        }
    }

    /// Persist a non-swap transaction and stop there.
    pub fn process_bare(&self, record: &TransactionRecord) {
        if let Err(e) = self.store.save_transaction(record) {
            warn!("Failed to persist transaction {}: {}", record.signature, e);
        }
    }

    /// Run the full pipeline for one BUY/SELL event.
    ///
    /// `seed_tx`, when present, receives the computed market data so the pool
    /// monitor can reuse it instead of recomputing.
    pub async fn process_swap(
        &self,
        kind: TradeKind,
        token: String,
        event: SwapEvent,
        slot: u64,
        block_time: i64,
        seed_tx: Option<oneshot::Sender<MarketData>>,
    ) {
        // 1. Persist the raw record; enrichers fill in the rest later.
        let record = TransactionRecord::from_swap(kind, &event, slot, block_time);
        if let Err(e) = self.store.save_transaction(&record) {
            warn!("Failed to persist transaction {}: {}", event.signature, e);
        }

        // 2. Dev-holding check, off the critical path.
        if let Some(creator) = event.creator.clone() {
            let pipeline = self.clone();
            let signature = event.signature.clone();
            let mint = token.clone();
            tokio::spawn(async move {
                pipeline.check_dev_holding(&signature, &creator, &mint).await;
            });
        }

        // 3. Market cap / prices.
        let market = self.compute_market_data(&token, event.effective_price_sol(kind)).await;
        if let Err(e) = self.store.update_market_data(&event.signature, &market) {
            warn!("Failed to update market data for {}: {}", event.signature, e);
        }
        if let Some(tx) = seed_tx {
            let _ = tx.send(market.clone());
        }

        // 4. Wallet-token merge; first-event fields are write-once in the store.
        let merge = WalletTokenMerge {
            wallet: event.fee_payer.clone(),
            token: token.clone(),
            kind,
            timestamp: block_time,
            tx_signature: event.signature.clone(),
            market_cap: market.market_cap,
        };
        match self.registry.record_event(&merge) {
            Ok(won) => {
                if won {
                    debug!(
                        "First {} of {} by {} recorded ({})",
                        kind.as_str(),
                        token,
                        event.fee_payer,
                        event.signature
                    );
                }
            }
            Err(e) => warn!("Wallet-token merge failed for {}: {}", event.signature, e),
        }

        // 5. Open positions held by the buyer as of this buy.
        if kind == TradeKind::Buy {
            self.record_open_positions(&event.fee_payer, &token).await;
        }

        // 6. Creator token count, delayed so the history API can index the
        //    new mint first.
        if let (Some(creator), Some(client)) = (event.creator.clone(), self.creator_history.clone())
        {
            let store = self.store.clone();
            let delay = self.creator_count_delay;
            let mint = token.clone();
            tokio::spawn(async move {
                sleep(delay).await;
                match client.creator_token_count(&creator).await {
                    Ok(count) => {
                        if let Err(e) = store.update_creator_token_count(&mint, &creator, count) {
                            warn!("Failed to persist creator token count: {}", e);
                        }
                    }
                    Err(e) => warn!("Creator token count fetch failed for {}: {}", creator, e),
                }
            });
        }
    }

    /// `devStillHolding`: does the creator still hold any balance of the mint
    /// under either token program?
    async fn check_dev_holding(&self, signature: &str, creator: &str, mint: &str) {
        let accounts = match self.rpc.token_accounts_all_programs(creator).await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!("Dev-holding check failed for {}: {}", creator, e);
                return;
            }
        };
        let holding = accounts
            .iter()
            .any(|a| a.mint == mint && a.ui_amount > 0.0);

        if let Err(e) = self.store.update_dev_holding(signature, holding) {
            warn!("Failed to update dev holding for {}: {}", signature, e);
        }
    }

    /// Market data from the latest SOL/USD quote and the on-chain supply.
    /// Missing inputs null the dependent outputs only.
    async fn compute_market_data(&self, token: &str, price_sol: Option<f64>) -> MarketData {
        let sol_usd = match self.store.latest_sol_price() {
            Ok(price) => price,
            Err(e) => {
                warn!("SOL price lookup failed: {}", e);
                None
            }
        };
        let supply = match self.rpc.token_supply(token).await {
            Ok((supply, _decimals)) => supply,
            Err(e) => {
                warn!("Supply fetch failed for {}: {}", token, e);
                None
            }
        };
        MarketData::compute(supply, price_sol, sol_usd)
    }

    /// Count the buyer's open positions: tokens with a positive balance where
    /// observed buys outnumber observed sells. Wrapped SOL doesn't count.
    async fn record_open_positions(&self, wallet: &str, token: &str) {
        let accounts = match self.rpc.token_accounts_all_programs(wallet).await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!("Open-position scan failed for {}: {}", wallet, e);
                return;
            }
        };

        let mut open = 0u64;
        for (mint, balance) in aggregate_balances(&accounts) {
            if balance <= 0.0 {
                continue;
            }
            let buys = self.store.buy_count(wallet, &mint).unwrap_or(0);
            let sells = self.store.sell_count(wallet, &mint).unwrap_or(0);
            if buys > sells {
                open += 1;
            }
        }

        if let Err(e) = self.store.set_open_position_count(wallet, token, open) {
            warn!("Failed to persist open-position count: {}", e);
        }
    }
}

/// Sum balances per mint across both token programs, skipping wrapped SOL.
fn aggregate_balances(accounts: &[TokenAccountView]) -> HashMap<String, f64> {
    let mut balances: HashMap<String, f64> = HashMap::new();
    for account in accounts {
        if account.mint == WSOL_MINT {
            continue;
        }
        *balances.entry(account.mint.clone()).or_default() += account.ui_amount;
    }
    balances
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::store::MemoryStore;

    fn pipeline(store: Arc<MemoryStore>) -> Arc<EnrichmentPipeline> {
        let rpc = Arc::new(ChainRpc::new(&RpcConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_millis(100),
        }));
        let registry = Arc::new(FirstEventRegistry::new(store.clone()));
        Arc::new(EnrichmentPipeline::new(
            store,
            rpc,
            registry,
            None,
            Duration::from_secs(45),
        ))
    }

    fn buy_event(sig: &str) -> SwapEvent {
        SwapEvent {
            signature: sig.to_string(),
            platform: "pumpfun".to_string(),
            fee_payer: "W1".to_string(),
            mint_in: WSOL_MINT.to_string(),
            mint_out: "T1".to_string(),
            amount_in: 1.0,
            amount_out: 1000.0,
            price_sol: Some(0.001),
            pool: Some("P1".to_string()),
            creator: None,
        }
    }

    #[tokio::test]
    async fn swap_is_persisted_and_merged() {
        let store = Arc::new(MemoryStore::new());
        store.record_sol_price(150.0, 1_700_000_000).unwrap();
        let pipeline = pipeline(store.clone());

        let (seed_tx, seed_rx) = oneshot::channel();
        pipeline
            .process_swap(
                TradeKind::Buy,
                "T1".to_string(),
                buy_event("tx1"),
                100,
                1_700_000_000,
                Some(seed_tx),
            )
            .await;

        // Transaction row exists and carries price data (supply is
        // unavailable here, so market cap stays null).
        let tx = store.transaction("tx1").unwrap();
        let market = tx.market.unwrap();
        assert_eq!(market.price_sol, Some(0.001));
        assert_eq!(market.price_usd, Some(0.15));
        assert!(market.market_cap.is_none());

        // First-buy fields were recorded.
        let pair = store.pair("W1", "T1").unwrap();
        assert_eq!(pair.first_buy_time, Some(1_700_000_000));
        assert_eq!(pair.first_buy_tx.as_deref(), Some("tx1"));

        // The monitor-side seed received the same market data.
        let seed = seed_rx.await.unwrap();
        assert_eq!(seed.price_usd, Some(0.15));
    }

    #[tokio::test]
    async fn replayed_swap_keeps_first_buy_fields() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone());

        for _ in 0..2 {
            pipeline
                .process_swap(
                    TradeKind::Buy,
                    "T1".to_string(),
                    buy_event("tx1"),
                    100,
                    1_700_000_000,
                    None,
                )
                .await;
        }
        let mut later = buy_event("tx9");
        later.price_sol = Some(0.005);
        pipeline
            .process_swap(TradeKind::Buy, "T1".to_string(), later, 120, 1_700_000_040, None)
            .await;

        assert_eq!(store.transaction_count(), 2);
        let pair = store.pair("W1", "T1").unwrap();
        assert_eq!(pair.first_buy_tx.as_deref(), Some("tx1"));
        assert_eq!(pair.first_buy_time, Some(1_700_000_000));
    }

    #[test]
    fn balance_aggregation_skips_wrapped_sol_and_merges_programs() {
        let accounts = vec![
            TokenAccountView {
                mint: "T1".to_string(),
                ui_amount: 1.0,
            },
            TokenAccountView {
                mint: "T1".to_string(),
                ui_amount: 2.5,
            },
            TokenAccountView {
                mint: WSOL_MINT.to_string(),
                ui_amount: 10.0,
            },
            TokenAccountView {
                mint: "T2".to_string(),
                ui_amount: 0.0,
            },
        ];
        let balances = aggregate_balances(&accounts);
        assert_eq!(balances.len(), 2);
        assert_eq!(balances["T1"], 3.5);
        assert_eq!(balances["T2"], 0.0);
    }
}
