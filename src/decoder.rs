use yellowstone_grpc_proto::geyser::SubscribeUpdateTransaction;

use crate::types::DecodedEvent;

/// Turns a raw stream transaction into a classified event.
///
/// Protocol-specific parsing lives outside this crate; embedders plug in a
/// decoder for the venues they care about. Returning `None` drops the
/// transaction.
pub trait TradeDecoder: Send + Sync {
    fn decode(&self, tx: &SubscribeUpdateTransaction, slot: u64, block_time: i64)
        -> Option<DecodedEvent>;
}

/// Decoder that classifies nothing: every transaction surfaces as a plain
/// transfer record with its signature and fee payer. Useful as a default
/// until a venue decoder is wired in, and in tests.
pub struct BareDecoder;

impl TradeDecoder for BareDecoder {
    fn decode(
        &self,
        tx: &SubscribeUpdateTransaction,
        _slot: u64,
        _block_time: i64,
    ) -> Option<DecodedEvent> {
        let info = tx.transaction.as_ref()?;
        let signature = info
            .transaction
            .as_ref()
            .and_then(|t| t.signatures.first())
            .map(|sig| bs58::encode(sig).into_string())?;
        // First account key is the fee payer.
        let fee_payer = info
            .transaction
            .as_ref()
            .and_then(|t| t.message.as_ref())
            .and_then(|m| m.account_keys.first())
            .and_then(|key| solana_sdk::pubkey::Pubkey::try_from(key.as_slice()).ok())
            .map(|pk| pk.to_string())?;

        Some(DecodedEvent::Other {
            signature,
            platform: "unknown".to_string(),
            fee_payer,
        })
    }
}
