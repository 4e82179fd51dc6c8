pub mod memory;
pub mod sqlite;

use anyhow::Result;

use crate::types::{MarketData, PricePoint, TransactionRecord, WalletTokenMerge, WalletTokenPair};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A new monitoring session row.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub wallet: String,
    pub token: String,
    pub pool: String,
    pub start_slot: u64,
    pub started_at: i64,
    pub deadline_at: i64,
    pub first_buy_tx: String,
    pub initial: MarketData,
}

/// Durable-state contract the tracker requires. Any store suffices as long
/// as merges are concurrency-safe and first-event fields are write-once.
///
/// Implementations must be cheap to call from async tasks; the tracker never
/// invokes the store from the stream read loop itself.
pub trait Store: Send + Sync {
    /// Insert the transaction if unseen. Replays of the same signature are
    /// merge no-ops.
    fn save_transaction(&self, record: &TransactionRecord) -> Result<()>;

    fn update_dev_holding(&self, signature: &str, dev_still_holding: bool) -> Result<()>;

    fn update_market_data(&self, signature: &str, market: &MarketData) -> Result<()>;

    /// Fold one observed event into the (wallet, token) pair. First-event
    /// fields keep their earliest value; counters accumulate.
    fn merge_wallet_token(&self, merge: &WalletTokenMerge) -> Result<()>;

    fn wallet_token_pair(&self, wallet: &str, token: &str) -> Result<Option<WalletTokenPair>>;

    /// True iff no pair row exists or its first-buy timestamp is null.
    fn is_first_buy(&self, wallet: &str, token: &str) -> Result<bool>;

    fn buy_count(&self, wallet: &str, token: &str) -> Result<u64>;

    fn sell_count(&self, wallet: &str, token: &str) -> Result<u64>;

    /// Last-writer-wins: always overwrites the derived count.
    fn set_open_position_count(&self, wallet: &str, token: &str, count: u64) -> Result<()>;

    fn latest_sol_price(&self) -> Result<Option<f64>>;

    fn record_sol_price(&self, price_usd: f64, fetched_at: i64) -> Result<()>;

    fn update_creator_token_count(&self, token: &str, creator: &str, count: u64) -> Result<()>;

    fn upsert_token_metadata(
        &self,
        mint: &str,
        total_supply: Option<f64>,
        decimals: Option<u8>,
    ) -> Result<()>;

    fn create_monitoring_session(&self, session: &NewSession) -> Result<i64>;

    fn save_price_sample(&self, session_id: i64, point: &PricePoint) -> Result<()>;

    /// Terminal write for a session. The first recorded reason wins;
    /// re-finalizing is a no-op.
    fn finalize_session(
        &self,
        session_id: i64,
        reason: &str,
        terminal: Option<&PricePoint>,
        sell_tx: Option<&str>,
    ) -> Result<()>;
}
