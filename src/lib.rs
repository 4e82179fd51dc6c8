// Wallet tracker - streaming trade ingest and enrichment
// Subscribes to confirmed transactions for a set of wallets, classifies
// BUY/SELL swaps, enriches them with pricing data, and monitors pool prices
// around each wallet's first buy of a token.

pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod enrichment;
pub mod error;
pub mod grpc;
pub mod metadata;
pub mod monitor;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod sol_price;
pub mod store;
pub mod token_queue;
pub mod tracker;
pub mod types;

pub use store::Store;
pub use tracker::Tracker;
