use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;

use crate::store::{NewSession, Store};
use crate::types::{
    MarketData, PricePoint, TradeKind, TransactionRecord, WalletTokenMerge, WalletTokenPair,
};

/// Stored transaction plus its enrichment fields.
#[derive(Debug, Clone)]
pub struct StoredTransaction {
    pub record: TransactionRecord,
    pub dev_still_holding: Option<bool>,
    pub market: Option<MarketData>,
}

#[derive(Debug, Clone)]
pub struct StoredSession {
    pub id: i64,
    pub new: NewSession,
    pub samples: Vec<PricePoint>,
    pub final_reason: Option<String>,
    pub first_sell_tx: Option<String>,
}

#[derive(Default)]
struct Inner {
    transactions: HashMap<String, StoredTransaction>,
    pairs: HashMap<(String, String), WalletTokenPair>,
    sessions: Vec<StoredSession>,
    sol_price: Option<(i64, f64)>,
    creator_counts: HashMap<String, (String, u64)>,
    token_metadata: HashMap<String, (Option<f64>, Option<u8>)>,
}

/// Hashmap-backed store with the same merge semantics as the SQLite store.
/// Backs the unit tests and embedders that don't want a database file.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction(&self, signature: &str) -> Option<StoredTransaction> {
        self.inner.lock().unwrap().transactions.get(signature).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.lock().unwrap().transactions.len()
    }

    pub fn pair(&self, wallet: &str, token: &str) -> Option<WalletTokenPair> {
        self.inner
            .lock()
            .unwrap()
            .pairs
            .get(&(wallet.to_string(), token.to_string()))
            .cloned()
    }

    pub fn sessions(&self) -> Vec<StoredSession> {
        self.inner.lock().unwrap().sessions.clone()
    }

    pub fn creator_count(&self, token: &str) -> Option<(String, u64)> {
        self.inner.lock().unwrap().creator_counts.get(token).cloned()
    }

    pub fn token_metadata(&self, mint: &str) -> Option<(Option<f64>, Option<u8>)> {
        self.inner.lock().unwrap().token_metadata.get(mint).cloned()
    }
}

impl Store for MemoryStore {
    fn save_transaction(&self, record: &TransactionRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .transactions
            .entry(record.signature.clone())
            .or_insert_with(|| StoredTransaction {
                record: record.clone(),
                dev_still_holding: None,
                market: None,
            });
        Ok(())
    }

    fn update_dev_holding(&self, signature: &str, dev_still_holding: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.transactions.get_mut(signature) {
            tx.dev_still_holding = Some(dev_still_holding);
        }
        Ok(())
    }

    fn update_market_data(&self, signature: &str, market: &MarketData) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.transactions.get_mut(signature) {
            tx.market = Some(market.clone());
        }
        Ok(())
    }

    fn merge_wallet_token(&self, merge: &WalletTokenMerge) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let pair = inner
            .pairs
            .entry((merge.wallet.clone(), merge.token.clone()))
            .or_insert_with(|| WalletTokenPair {
                wallet: merge.wallet.clone(),
                token: merge.token.clone(),
                ..Default::default()
            });
        match merge.kind {
            TradeKind::Buy => {
                if pair.first_buy_time.is_none() {
                    pair.first_buy_time = Some(merge.timestamp);
                    pair.first_buy_tx = Some(merge.tx_signature.clone());
                    pair.first_buy_market_cap = merge.market_cap;
                }
                pair.buy_count += 1;
            }
            TradeKind::Sell => {
                if pair.first_sell_time.is_none() {
                    pair.first_sell_time = Some(merge.timestamp);
                    pair.first_sell_tx = Some(merge.tx_signature.clone());
                    pair.first_sell_market_cap = merge.market_cap;
                }
                pair.sell_count += 1;
            }
            TradeKind::Other => {}
        }
        Ok(())
    }

    fn wallet_token_pair(&self, wallet: &str, token: &str) -> Result<Option<WalletTokenPair>> {
        Ok(self.pair(wallet, token))
    }

    fn is_first_buy(&self, wallet: &str, token: &str) -> Result<bool> {
        Ok(self
            .pair(wallet, token)
            .map_or(true, |p| p.first_buy_time.is_none()))
    }

    fn buy_count(&self, wallet: &str, token: &str) -> Result<u64> {
        Ok(self.pair(wallet, token).map_or(0, |p| p.buy_count))
    }

    fn sell_count(&self, wallet: &str, token: &str) -> Result<u64> {
        Ok(self.pair(wallet, token).map_or(0, |p| p.sell_count))
    }

    fn set_open_position_count(&self, wallet: &str, token: &str, count: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pair) = inner.pairs.get_mut(&(wallet.to_string(), token.to_string())) {
            pair.open_positions_at_first_buy = Some(count);
        }
        Ok(())
    }

    fn latest_sol_price(&self) -> Result<Option<f64>> {
        Ok(self.inner.lock().unwrap().sol_price.map(|(_, p)| p))
    }

    fn record_sol_price(&self, price_usd: f64, fetched_at: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.sol_price.map_or(true, |(at, _)| fetched_at >= at) {
            inner.sol_price = Some((fetched_at, price_usd));
        }
        Ok(())
    }

    fn update_creator_token_count(&self, token: &str, creator: &str, count: u64) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .creator_counts
            .insert(token.to_string(), (creator.to_string(), count));
        Ok(())
    }

    fn upsert_token_metadata(
        &self,
        mint: &str,
        total_supply: Option<f64>,
        decimals: Option<u8>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .token_metadata
            .entry(mint.to_string())
            .or_insert((None, None));
        if total_supply.is_some() {
            entry.0 = total_supply;
        }
        if decimals.is_some() {
            entry.1 = decimals;
        }
        Ok(())
    }

    fn create_monitoring_session(&self, session: &NewSession) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.sessions.len() as i64 + 1;
        inner.sessions.push(StoredSession {
            id,
            new: session.clone(),
            samples: Vec::new(),
            final_reason: None,
            first_sell_tx: None,
        });
        Ok(id)
    }

    fn save_price_sample(&self, session_id: i64, point: &PricePoint) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id == session_id) {
            session.samples.push(point.clone());
        }
        Ok(())
    }

    fn finalize_session(
        &self,
        session_id: i64,
        reason: &str,
        terminal: Option<&PricePoint>,
        sell_tx: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id == session_id) {
            if session.final_reason.is_some() {
                return Ok(());
            }
            session.final_reason = Some(reason.to_string());
            session.first_sell_tx = sell_tx.map(|s| s.to_string());
            if let Some(point) = terminal {
                session.samples.push(point.clone());
            }
        }
        Ok(())
    }
}
