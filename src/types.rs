use serde::{Deserialize, Serialize};

/// Wrapped SOL mint. Swaps against this mint are priced in native SOL.
pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TradeKind {
    Buy,
    Sell,
    Other,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Buy => "BUY",
            TradeKind::Sell => "SELL",
            TradeKind::Other => "OTHER",
        }
    }
}

/// A classified swap produced by the decoder.
#[derive(Debug, Clone)]
pub struct SwapEvent {
    pub signature: String,
    pub platform: String,
    pub fee_payer: String,
    pub mint_in: String,
    pub mint_out: String,
    pub amount_in: f64,
    pub amount_out: f64,
    /// Token price in SOL as reported by the venue, when the decoder has it.
    pub price_sol: Option<f64>,
    /// Liquidity pool backing the swap, when the decoder has it.
    pub pool: Option<String>,
    /// Token creator, when the decoder has it.
    pub creator: Option<String>,
}

impl SwapEvent {
    /// Venue price if present, otherwise derived from the swap amounts.
    pub fn effective_price_sol(&self, kind: TradeKind) -> Option<f64> {
        if let Some(price) = self.price_sol {
            return Some(price);
        }
        let (sol, tokens) = match kind {
            TradeKind::Buy => (self.amount_in, self.amount_out),
            TradeKind::Sell => (self.amount_out, self.amount_in),
            TradeKind::Other => return None,
        };
        if tokens > 0.0 && sol > 0.0 {
            Some(sol / tokens)
        } else {
            None
        }
    }
}

/// Output of the external transaction decoder.
#[derive(Debug, Clone)]
pub enum DecodedEvent {
    Buy(SwapEvent),
    Sell(SwapEvent),
    Other {
        signature: String,
        platform: String,
        fee_payer: String,
    },
}

impl DecodedEvent {
    pub fn kind(&self) -> TradeKind {
        match self {
            DecodedEvent::Buy(_) => TradeKind::Buy,
            DecodedEvent::Sell(_) => TradeKind::Sell,
            DecodedEvent::Other { .. } => TradeKind::Other,
        }
    }

    pub fn signature(&self) -> &str {
        match self {
            DecodedEvent::Buy(e) | DecodedEvent::Sell(e) => &e.signature,
            DecodedEvent::Other { signature, .. } => signature,
        }
    }

    /// The non-SOL side of the swap: the token the wallet traded.
    ///
    /// BUY receives the token on `mint_out`, SELL gives it up on `mint_in`.
    /// A swap whose token leg is wrapped SOL has no trackable token.
    pub fn token_address(&self) -> Option<&str> {
        fn non_sol(mint: &str) -> Option<&str> {
            if mint == WSOL_MINT {
                None
            } else {
                Some(mint)
            }
        }
        match self {
            DecodedEvent::Buy(e) => non_sol(&e.mint_out),
            DecodedEvent::Sell(e) => non_sol(&e.mint_in),
            DecodedEvent::Other { .. } => None,
        }
    }
}

/// Normalized transaction row as first persisted. Market and dev-holding
/// fields start out null and are filled in by the enrichers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub signature: String,
    pub platform: String,
    pub kind: TradeKind,
    pub mint_in: Option<String>,
    pub mint_out: Option<String>,
    pub amount_in: Option<f64>,
    pub amount_out: Option<f64>,
    pub fee_payer: String,
    pub slot: u64,
    pub block_time: i64,
    pub creator: Option<String>,
}

impl TransactionRecord {
    pub fn from_swap(kind: TradeKind, event: &SwapEvent, slot: u64, block_time: i64) -> Self {
        Self {
            signature: event.signature.clone(),
            platform: event.platform.clone(),
            kind,
            mint_in: Some(event.mint_in.clone()),
            mint_out: Some(event.mint_out.clone()),
            amount_in: Some(event.amount_in),
            amount_out: Some(event.amount_out),
            fee_payer: event.fee_payer.clone(),
            slot,
            block_time,
            creator: event.creator.clone(),
        }
    }

    pub fn bare(
        signature: String,
        platform: String,
        fee_payer: String,
        slot: u64,
        block_time: i64,
    ) -> Self {
        Self {
            signature,
            platform,
            kind: TradeKind::Other,
            mint_in: None,
            mint_out: None,
            amount_in: None,
            amount_out: None,
            fee_payer,
            slot,
            block_time,
            creator: None,
        }
    }
}

/// Derived pricing data for a token at a point in time.
///
/// A missing input nulls only the outputs that depend on it; the rest stay
/// usable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketData {
    pub price_sol: Option<f64>,
    pub price_usd: Option<f64>,
    pub market_cap: Option<f64>,
    pub total_supply: Option<f64>,
}

impl MarketData {
    /// `price_usd = price_sol * sol_usd`, `market_cap = supply * price_usd`.
    pub fn compute(supply: Option<f64>, price_sol: Option<f64>, sol_usd: Option<f64>) -> Self {
        let price_usd = match (price_sol, sol_usd) {
            (Some(p), Some(s)) => Some(p * s),
            _ => None,
        };
        let market_cap = match (supply, price_usd) {
            (Some(supply), Some(usd)) => Some(supply * usd),
            _ => None,
        };
        Self {
            price_sol,
            price_usd,
            market_cap,
            total_supply: supply,
        }
    }

    /// Fill `price_sol` from `price_usd / sol_usd` when only the USD leg is
    /// known.
    pub fn with_derived_price_sol(mut self, sol_usd: Option<f64>) -> Self {
        if self.price_sol.is_none() {
            if let (Some(usd), Some(sol)) = (self.price_usd, sol_usd) {
                if sol > 0.0 {
                    self.price_sol = Some(usd / sol);
                }
            }
        }
        self
    }

    pub fn is_complete(&self) -> bool {
        self.price_sol.is_some() && self.price_usd.is_some() && self.market_cap.is_some()
    }
}

/// One observation in a monitoring session's price trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub price_sol: Option<f64>,
    pub price_usd: Option<f64>,
    pub market_cap: Option<f64>,
    pub slot: Option<u64>,
    pub sampled_at: i64,
}

impl PricePoint {
    pub fn from_market(market: &MarketData, slot: Option<u64>, sampled_at: i64) -> Self {
        Self {
            price_sol: market.price_sol,
            price_usd: market.price_usd,
            market_cap: market.market_cap,
            slot,
            sampled_at,
        }
    }
}

/// Durable view of a (wallet, token) pair. `first_*` fields are write-once.
#[derive(Debug, Clone, Default)]
pub struct WalletTokenPair {
    pub wallet: String,
    pub token: String,
    pub first_buy_time: Option<i64>,
    pub first_buy_tx: Option<String>,
    pub first_buy_market_cap: Option<f64>,
    pub first_sell_time: Option<i64>,
    pub first_sell_tx: Option<String>,
    pub first_sell_market_cap: Option<f64>,
    pub open_positions_at_first_buy: Option<u64>,
    pub buy_count: u64,
    pub sell_count: u64,
}

/// One observed event folded into a (wallet, token) pair.
#[derive(Debug, Clone)]
pub struct WalletTokenMerge {
    pub wallet: String,
    pub token: String,
    pub kind: TradeKind,
    pub timestamp: i64,
    pub tx_signature: String,
    pub market_cap: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swap(mint_in: &str, mint_out: &str) -> SwapEvent {
        SwapEvent {
            signature: "sig".to_string(),
            platform: "pumpfun".to_string(),
            fee_payer: "wallet".to_string(),
            mint_in: mint_in.to_string(),
            mint_out: mint_out.to_string(),
            amount_in: 1.0,
            amount_out: 1000.0,
            price_sol: None,
            pool: None,
            creator: None,
        }
    }

    #[test]
    fn buy_token_address_is_non_sol_mint_out() {
        let event = DecodedEvent::Buy(swap(WSOL_MINT, "Mint111"));
        assert_eq!(event.token_address(), Some("Mint111"));
    }

    #[test]
    fn sell_token_address_is_non_sol_mint_in() {
        let event = DecodedEvent::Sell(swap("Mint111", WSOL_MINT));
        assert_eq!(event.token_address(), Some("Mint111"));
    }

    #[test]
    fn sol_to_sol_swap_has_no_token() {
        let buy = DecodedEvent::Buy(swap("Mint111", WSOL_MINT));
        assert_eq!(buy.token_address(), None);

        let sell = DecodedEvent::Sell(swap(WSOL_MINT, "Mint111"));
        assert_eq!(sell.token_address(), None);
    }

    #[test]
    fn other_has_no_token() {
        let event = DecodedEvent::Other {
            signature: "sig".to_string(),
            platform: "unknown".to_string(),
            fee_payer: "wallet".to_string(),
        };
        assert_eq!(event.token_address(), None);
    }

    #[test]
    fn price_derived_from_amounts_when_venue_price_missing() {
        let event = swap(WSOL_MINT, "Mint111");
        assert_eq!(event.effective_price_sol(TradeKind::Buy), Some(0.001));
    }

    #[test]
    fn venue_price_wins_over_derived() {
        let mut event = swap(WSOL_MINT, "Mint111");
        event.price_sol = Some(0.005);
        assert_eq!(event.effective_price_sol(TradeKind::Buy), Some(0.005));
    }

    #[test]
    fn market_data_nulls_do_not_contaminate() {
        // No SOL/USD: price_usd and market_cap stay null, price_sol survives.
        let md = MarketData::compute(Some(1_000_000.0), Some(0.001), None);
        assert_eq!(md.price_sol, Some(0.001));
        assert!(md.price_usd.is_none());
        assert!(md.market_cap.is_none());
        assert_eq!(md.total_supply, Some(1_000_000.0));

        // No supply: market_cap stays null, prices survive.
        let md = MarketData::compute(None, Some(0.001), Some(150.0));
        assert_eq!(md.price_usd, Some(0.15));
        assert!(md.market_cap.is_none());
    }

    #[test]
    fn market_data_full_compute() {
        let md = MarketData::compute(Some(1_000_000.0), Some(0.001), Some(150.0));
        assert_eq!(md.price_usd, Some(0.15));
        assert_eq!(md.market_cap, Some(150_000.0));
        assert!(md.is_complete());
    }

    #[test]
    fn derive_price_sol_from_usd_leg() {
        let md = MarketData {
            price_sol: None,
            price_usd: Some(0.15),
            market_cap: None,
            total_supply: None,
        }
        .with_derived_price_sol(Some(150.0));
        assert_eq!(md.price_sol, Some(0.001));
    }
}
