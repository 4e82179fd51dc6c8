use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::store::{NewSession, Store};
use crate::types::{
    MarketData, PricePoint, TradeKind, TransactionRecord, WalletTokenMerge, WalletTokenPair,
};

/// SQLite-backed store. The connection is guarded by a mutex; all writes are
/// single statements or run under one lock scope, which is what makes the
/// concurrent merges safe.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path).context("Failed to open database connection")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;

        info!("✅ Database initialized");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                signature TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                kind TEXT CHECK(kind IN ('BUY', 'SELL', 'OTHER')) NOT NULL,
                mint_in TEXT,
                mint_out TEXT,
                amount_in REAL,
                amount_out REAL,
                fee_payer TEXT NOT NULL,
                slot INTEGER NOT NULL,
                block_time INTEGER NOT NULL,
                creator TEXT,
                market_cap REAL,
                total_supply REAL,
                price_sol REAL,
                price_usd REAL,
                dev_still_holding INTEGER
            );

            CREATE TABLE IF NOT EXISTS wallet_tokens (
                wallet TEXT NOT NULL,
                token TEXT NOT NULL,
                first_buy_time INTEGER,
                first_buy_tx TEXT,
                first_buy_market_cap REAL,
                first_sell_time INTEGER,
                first_sell_tx TEXT,
                first_sell_market_cap REAL,
                open_positions_at_first_buy INTEGER,
                buy_count INTEGER NOT NULL DEFAULT 0,
                sell_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (wallet, token)
            );

            CREATE TABLE IF NOT EXISTS monitoring_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wallet TEXT NOT NULL,
                token TEXT NOT NULL,
                pool TEXT NOT NULL,
                start_slot INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                deadline_at INTEGER NOT NULL,
                first_buy_tx TEXT NOT NULL,
                first_sell_tx TEXT,
                initial_price_sol REAL,
                initial_price_usd REAL,
                initial_market_cap REAL,
                final_reason TEXT,
                ended_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS price_points (
                session_id INTEGER NOT NULL,
                sampled_at INTEGER NOT NULL,
                slot INTEGER,
                price_sol REAL,
                price_usd REAL,
                market_cap REAL,
                FOREIGN KEY(session_id) REFERENCES monitoring_sessions(id)
            );

            CREATE TABLE IF NOT EXISTS tokens (
                mint TEXT PRIMARY KEY,
                total_supply REAL,
                decimals INTEGER,
                creator_wallet TEXT,
                creator_token_count INTEGER,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sol_prices (
                fetched_at INTEGER PRIMARY KEY,
                price_usd REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_fee_payer ON transactions(fee_payer, block_time);
            CREATE INDEX IF NOT EXISTS idx_price_points_session ON price_points(session_id, sampled_at);
            CREATE INDEX IF NOT EXISTS idx_sessions_pair ON monitoring_sessions(wallet, token);
            "#,
        )
        .context("Failed to initialize database schema")?;
        Ok(())
    }
}

impl Store for SqliteStore {
    fn save_transaction(&self, record: &TransactionRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT OR IGNORE INTO transactions (
                signature, platform, kind, mint_in, mint_out, amount_in, amount_out,
                fee_payer, slot, block_time, creator
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.signature,
                record.platform,
                record.kind.as_str(),
                record.mint_in,
                record.mint_out,
                record.amount_in,
                record.amount_out,
                record.fee_payer,
                record.slot,
                record.block_time,
                record.creator,
            ],
        )
        .context("Failed to insert transaction")?;
        Ok(())
    }

    fn update_dev_holding(&self, signature: &str, dev_still_holding: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE transactions SET dev_still_holding = ?2 WHERE signature = ?1",
            params![signature, dev_still_holding as i32],
        )
        .context("Failed to update dev holding")?;
        Ok(())
    }

    fn update_market_data(&self, signature: &str, market: &MarketData) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE transactions
            SET market_cap = ?2, total_supply = ?3, price_sol = ?4, price_usd = ?5
            WHERE signature = ?1
            "#,
            params![
                signature,
                market.market_cap,
                market.total_supply,
                market.price_sol,
                market.price_usd,
            ],
        )
        .context("Failed to update market data")?;
        Ok(())
    }

    fn merge_wallet_token(&self, merge: &WalletTokenMerge) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        match merge.kind {
            TradeKind::Buy => {
                conn.execute(
                    r#"
                    INSERT INTO wallet_tokens (
                        wallet, token, first_buy_time, first_buy_tx, first_buy_market_cap,
                        buy_count, sell_count
                    ) VALUES (?1, ?2, ?3, ?4, ?5, 1, 0)
                    ON CONFLICT(wallet, token) DO UPDATE SET
                        first_buy_time = COALESCE(first_buy_time, excluded.first_buy_time),
                        first_buy_tx = COALESCE(first_buy_tx, excluded.first_buy_tx),
                        first_buy_market_cap = COALESCE(first_buy_market_cap, excluded.first_buy_market_cap),
                        buy_count = buy_count + 1
                    "#,
                    params![
                        merge.wallet,
                        merge.token,
                        merge.timestamp,
                        merge.tx_signature,
                        merge.market_cap,
                    ],
                )
                .context("Failed to merge wallet-token buy")?;
            }
            TradeKind::Sell => {
                conn.execute(
                    r#"
                    INSERT INTO wallet_tokens (
                        wallet, token, first_sell_time, first_sell_tx, first_sell_market_cap,
                        buy_count, sell_count
                    ) VALUES (?1, ?2, ?3, ?4, ?5, 0, 1)
                    ON CONFLICT(wallet, token) DO UPDATE SET
                        first_sell_time = COALESCE(first_sell_time, excluded.first_sell_time),
                        first_sell_tx = COALESCE(first_sell_tx, excluded.first_sell_tx),
                        first_sell_market_cap = COALESCE(first_sell_market_cap, excluded.first_sell_market_cap),
                        sell_count = sell_count + 1
                    "#,
                    params![
                        merge.wallet,
                        merge.token,
                        merge.timestamp,
                        merge.tx_signature,
                        merge.market_cap,
                    ],
                )
                .context("Failed to merge wallet-token sell")?;
            }
            TradeKind::Other => {}
        }
        Ok(())
    }

    fn wallet_token_pair(&self, wallet: &str, token: &str) -> Result<Option<WalletTokenPair>> {
        let conn = self.conn.lock().unwrap();
        let pair = conn
            .query_row(
                r#"
                SELECT first_buy_time, first_buy_tx, first_buy_market_cap,
                       first_sell_time, first_sell_tx, first_sell_market_cap,
                       open_positions_at_first_buy, buy_count, sell_count
                FROM wallet_tokens WHERE wallet = ?1 AND token = ?2
                "#,
                params![wallet, token],
                |row| {
                    Ok(WalletTokenPair {
                        wallet: wallet.to_string(),
                        token: token.to_string(),
                        first_buy_time: row.get(0)?,
                        first_buy_tx: row.get(1)?,
                        first_buy_market_cap: row.get(2)?,
                        first_sell_time: row.get(3)?,
                        first_sell_tx: row.get(4)?,
                        first_sell_market_cap: row.get(5)?,
                        open_positions_at_first_buy: row.get(6)?,
                        buy_count: row.get(7)?,
                        sell_count: row.get(8)?,
                    })
                },
            )
            .optional()
            .context("Failed to read wallet-token pair")?;
        Ok(pair)
    }

    fn is_first_buy(&self, wallet: &str, token: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let first_buy_time: Option<Option<i64>> = conn
            .query_row(
                "SELECT first_buy_time FROM wallet_tokens WHERE wallet = ?1 AND token = ?2",
                params![wallet, token],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check first buy")?;
        Ok(matches!(first_buy_time, None | Some(None)))
    }

    fn buy_count(&self, wallet: &str, token: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: Option<u64> = conn
            .query_row(
                "SELECT buy_count FROM wallet_tokens WHERE wallet = ?1 AND token = ?2",
                params![wallet, token],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read buy count")?;
        Ok(count.unwrap_or(0))
    }

    fn sell_count(&self, wallet: &str, token: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: Option<u64> = conn
            .query_row(
                "SELECT sell_count FROM wallet_tokens WHERE wallet = ?1 AND token = ?2",
                params![wallet, token],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read sell count")?;
        Ok(count.unwrap_or(0))
    }

    fn set_open_position_count(&self, wallet: &str, token: &str, count: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE wallet_tokens
            SET open_positions_at_first_buy = ?3
            WHERE wallet = ?1 AND token = ?2
            "#,
            params![wallet, token, count],
        )
        .context("Failed to set open position count")?;
        Ok(())
    }

    fn latest_sol_price(&self) -> Result<Option<f64>> {
        let conn = self.conn.lock().unwrap();
        let price = conn
            .query_row(
                "SELECT price_usd FROM sol_prices ORDER BY fetched_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read latest SOL price")?;
        Ok(price)
    }

    fn record_sol_price(&self, price_usd: f64, fetched_at: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO sol_prices (fetched_at, price_usd) VALUES (?1, ?2)",
            params![fetched_at, price_usd],
        )
        .context("Failed to record SOL price")?;
        Ok(())
    }

    fn update_creator_token_count(&self, token: &str, creator: &str, count: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO tokens (mint, creator_wallet, creator_token_count, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(mint) DO UPDATE SET
                creator_wallet = excluded.creator_wallet,
                creator_token_count = excluded.creator_token_count,
                updated_at = excluded.updated_at
            "#,
            params![token, creator, count, chrono::Utc::now().timestamp()],
        )
        .context("Failed to update creator token count")?;
        Ok(())
    }

    fn upsert_token_metadata(
        &self,
        mint: &str,
        total_supply: Option<f64>,
        decimals: Option<u8>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO tokens (mint, total_supply, decimals, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(mint) DO UPDATE SET
                total_supply = COALESCE(excluded.total_supply, total_supply),
                decimals = COALESCE(excluded.decimals, decimals),
                updated_at = excluded.updated_at
            "#,
            params![mint, total_supply, decimals, chrono::Utc::now().timestamp()],
        )
        .context("Failed to upsert token metadata")?;
        Ok(())
    }

    fn create_monitoring_session(&self, session: &NewSession) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO monitoring_sessions (
                wallet, token, pool, start_slot, started_at, deadline_at, first_buy_tx,
                initial_price_sol, initial_price_usd, initial_market_cap
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                session.wallet,
                session.token,
                session.pool,
                session.start_slot,
                session.started_at,
                session.deadline_at,
                session.first_buy_tx,
                session.initial.price_sol,
                session.initial.price_usd,
                session.initial.market_cap,
            ],
        )
        .context("Failed to create monitoring session")?;
        Ok(conn.last_insert_rowid())
    }

    fn save_price_sample(&self, session_id: i64, point: &PricePoint) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO price_points (session_id, sampled_at, slot, price_sol, price_usd, market_cap)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                session_id,
                point.sampled_at,
                point.slot,
                point.price_sol,
                point.price_usd,
                point.market_cap,
            ],
        )
        .context("Failed to save price sample")?;
        Ok(())
    }

    fn finalize_session(
        &self,
        session_id: i64,
        reason: &str,
        terminal: Option<&PricePoint>,
        sell_tx: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<Option<String>> = conn
            .query_row(
                "SELECT final_reason FROM monitoring_sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read session state")?;

        match existing {
            None => anyhow::bail!("unknown monitoring session {}", session_id),
            Some(Some(_)) => return Ok(()), // already finalized
            Some(None) => {}
        }

        conn.execute(
            r#"
            UPDATE monitoring_sessions
            SET final_reason = ?2, ended_at = ?3, first_sell_tx = COALESCE(first_sell_tx, ?4)
            WHERE id = ?1
            "#,
            params![session_id, reason, chrono::Utc::now().timestamp(), sell_tx],
        )
        .context("Failed to finalize session")?;

        if let Some(point) = terminal {
            conn.execute(
                r#"
                INSERT INTO price_points (session_id, sampled_at, slot, price_sol, price_usd, market_cap)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    session_id,
                    point.sampled_at,
                    point.slot,
                    point.price_sol,
                    point.price_usd,
                    point.market_cap,
                ],
            )
            .context("Failed to save terminal price sample")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeKind;

    fn record(sig: &str, kind: TradeKind) -> TransactionRecord {
        TransactionRecord {
            signature: sig.to_string(),
            platform: "pumpfun".to_string(),
            kind,
            mint_in: Some(crate::types::WSOL_MINT.to_string()),
            mint_out: Some("Mint111".to_string()),
            amount_in: Some(1.0),
            amount_out: Some(1000.0),
            fee_payer: "W1".to_string(),
            slot: 100,
            block_time: 1_700_000_000,
            creator: None,
        }
    }

    fn buy_merge(ts: i64, tx: &str) -> WalletTokenMerge {
        WalletTokenMerge {
            wallet: "W1".to_string(),
            token: "Mint111".to_string(),
            kind: TradeKind::Buy,
            timestamp: ts,
            tx_signature: tx.to_string(),
            market_cap: Some(150_000.0),
        }
    }

    #[test]
    fn transaction_replay_is_a_merge_noop() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_transaction(&record("sig1", TradeKind::Buy)).unwrap();

        let mut replay = record("sig1", TradeKind::Sell);
        replay.platform = "raydium".to_string();
        store.save_transaction(&replay).unwrap();

        let conn = store.conn.lock().unwrap();
        let (count, platform): (i64, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(platform) FROM transactions WHERE signature = 'sig1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(platform, "pumpfun");
    }

    #[test]
    fn first_buy_fields_are_write_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.is_first_buy("W1", "Mint111").unwrap());

        store.merge_wallet_token(&buy_merge(1000, "tx_a")).unwrap();
        assert!(!store.is_first_buy("W1", "Mint111").unwrap());

        store.merge_wallet_token(&buy_merge(2000, "tx_b")).unwrap();

        let pair = store.wallet_token_pair("W1", "Mint111").unwrap().unwrap();
        assert_eq!(pair.first_buy_time, Some(1000));
        assert_eq!(pair.first_buy_tx.as_deref(), Some("tx_a"));
        assert_eq!(pair.buy_count, 2);
        assert!(pair.first_sell_time.is_none());
    }

    #[test]
    fn sell_merge_does_not_touch_buy_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.merge_wallet_token(&buy_merge(1000, "tx_a")).unwrap();

        let sell = WalletTokenMerge {
            kind: TradeKind::Sell,
            timestamp: 3000,
            tx_signature: "tx_s".to_string(),
            ..buy_merge(0, "")
        };
        store.merge_wallet_token(&sell).unwrap();

        let pair = store.wallet_token_pair("W1", "Mint111").unwrap().unwrap();
        assert_eq!(pair.first_buy_time, Some(1000));
        assert_eq!(pair.first_sell_time, Some(3000));
        assert_eq!(pair.first_sell_tx.as_deref(), Some("tx_s"));
        assert_eq!(pair.buy_count, 1);
        assert_eq!(pair.sell_count, 1);
    }

    #[test]
    fn open_position_count_is_last_writer_wins() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.merge_wallet_token(&buy_merge(1000, "tx_a")).unwrap();

        store.set_open_position_count("W1", "Mint111", 3).unwrap();
        store.set_open_position_count("W1", "Mint111", 9).unwrap();

        let pair = store.wallet_token_pair("W1", "Mint111").unwrap().unwrap();
        assert_eq!(pair.open_positions_at_first_buy, Some(9));
    }

    #[test]
    fn latest_sol_price_returns_most_recent() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.latest_sol_price().unwrap().is_none());

        store.record_sol_price(140.0, 1000).unwrap();
        store.record_sol_price(155.0, 2000).unwrap();
        assert_eq!(store.latest_sol_price().unwrap(), Some(155.0));
    }

    #[test]
    fn session_finalize_first_reason_wins() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store
            .create_monitoring_session(&NewSession {
                wallet: "W1".to_string(),
                token: "Mint111".to_string(),
                pool: "Pool1".to_string(),
                start_slot: 100,
                started_at: 1000,
                deadline_at: 1060,
                first_buy_tx: "tx_a".to_string(),
                initial: MarketData::compute(Some(1_000_000.0), Some(0.001), Some(150.0)),
            })
            .unwrap();

        let terminal = PricePoint {
            price_sol: Some(0.002),
            price_usd: Some(0.3),
            market_cap: Some(300_000.0),
            slot: Some(120),
            sampled_at: 1030,
        };
        store
            .finalize_session(id, "sell", Some(&terminal), Some("tx_s"))
            .unwrap();
        // A late duplicate finalize is dropped.
        store.finalize_session(id, "deadline", None, None).unwrap();

        let conn = store.conn.lock().unwrap();
        let (reason, sell_tx): (String, Option<String>) = conn
            .query_row(
                "SELECT final_reason, first_sell_tx FROM monitoring_sessions WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(reason, "sell");
        assert_eq!(sell_tx.as_deref(), Some("tx_s"));

        let samples: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM price_points WHERE session_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(samples, 1);
    }
}
