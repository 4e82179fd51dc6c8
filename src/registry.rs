use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;

use crate::store::Store;
use crate::types::{TradeKind, WalletTokenMerge};

#[derive(Debug, Default, Clone, Copy)]
struct FirstSeen {
    buy: bool,
    sell: bool,
}

/// Read-through cache over the store's first-event ledger.
///
/// The cache only ever latches "a first event exists" — a positive answer
/// avoids a store read, a negative one falls through to the store. The store
/// merge stays authoritative: two racing buyers may both see
/// `is_first_buy == true`, and session creation tolerates that.
pub struct FirstEventRegistry {
    store: Arc<dyn Store>,
    cache: DashMap<(String, String), FirstSeen>,
}

impl FirstEventRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// True iff no first buy is recorded for (wallet, token).
    pub fn is_first_buy(&self, wallet: &str, token: &str) -> Result<bool> {
        let key = (wallet.to_string(), token.to_string());
        if let Some(seen) = self.cache.get(&key) {
            if seen.buy {
                return Ok(false);
            }
        }
        let first = self.store.is_first_buy(wallet, token)?;
        if !first {
            self.cache.entry(key).or_default().buy = true;
        }
        Ok(first)
    }

    /// Fold the event into the pair row (write-once first-event fields) and
    /// report whether this call recorded the first event of its kind.
    pub fn record_event(&self, merge: &WalletTokenMerge) -> Result<bool> {
        if merge.kind == TradeKind::Other {
            return Ok(false);
        }

        self.store.merge_wallet_token(merge)?;
        let pair = self
            .store
            .wallet_token_pair(&merge.wallet, &merge.token)?;

        let won = match (&pair, merge.kind) {
            (Some(p), TradeKind::Buy) => p.first_buy_tx.as_deref() == Some(&merge.tx_signature),
            (Some(p), TradeKind::Sell) => p.first_sell_tx.as_deref() == Some(&merge.tx_signature),
            _ => false,
        };

        let key = (merge.wallet.clone(), merge.token.clone());
        let mut seen = self.cache.entry(key).or_default();
        match merge.kind {
            TradeKind::Buy => seen.buy = true,
            TradeKind::Sell => seen.sell = true,
            TradeKind::Other => {}
        }

        Ok(won)
    }
}
