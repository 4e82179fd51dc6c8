use std::str::FromStr;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use solana_account_decoder::UiAccountData;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_request::TokenAccountsFilter;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::{pubkey, pubkey::Pubkey};
use tracing::debug;

use crate::config::RpcConfig;
use crate::monitor::{PoolSnapshot, PriceSource};

pub const TOKEN_PROGRAM_ID: Pubkey = pubkey!("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");
pub const TOKEN_2022_PROGRAM_ID: Pubkey = pubkey!("TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb");

/// One parsed fungible-token account.
#[derive(Debug, Clone)]
pub struct TokenAccountView {
    pub mint: String,
    pub ui_amount: f64,
}

/// Read-only chain RPC at confirmed commitment.
pub struct ChainRpc {
    client: RpcClient,
}

impl ChainRpc {
    pub fn new(config: &RpcConfig) -> Self {
        Self {
            client: RpcClient::new_with_timeout_and_commitment(
                config.endpoint.clone(),
                config.timeout,
                CommitmentConfig::confirmed(),
            ),
        }
    }

    /// Human-units supply and decimals for a mint.
    pub async fn token_supply(&self, mint: &str) -> Result<(Option<f64>, u8)> {
        let mint = Pubkey::from_str(mint).context("Invalid mint address")?;
        let supply = self
            .client
            .get_token_supply(&mint)
            .await
            .context("getTokenSupply failed")?;
        Ok((supply.ui_amount, supply.decimals))
    }

    pub async fn sol_balance(&self, address: &str) -> Result<u64> {
        let address = Pubkey::from_str(address).context("Invalid address")?;
        self.client
            .get_balance(&address)
            .await
            .context("getBalance failed")
    }

    /// Parsed token accounts owned by `owner` under one token program.
    pub async fn token_accounts(
        &self,
        owner: &str,
        program: &Pubkey,
    ) -> Result<Vec<TokenAccountView>> {
        let owner = Pubkey::from_str(owner).context("Invalid owner address")?;
        let accounts = self
            .client
            .get_token_accounts_by_owner(&owner, TokenAccountsFilter::ProgramId(*program))
            .await
            .context("getTokenAccountsByOwner failed")?;

        let mut views = Vec::with_capacity(accounts.len());
        for keyed in accounts {
            match &keyed.account.data {
                UiAccountData::Json(parsed) => {
                    if let Some(view) = parse_token_account(&parsed.parsed) {
                        views.push(view);
                    }
                }
                _ => debug!("Skipping unparsed token account {}", keyed.pubkey),
            }
        }
        Ok(views)
    }

    /// Token accounts across both the standard and extended token programs.
    /// A wallet may hold the same mint under either.
    pub async fn token_accounts_all_programs(&self, owner: &str) -> Result<Vec<TokenAccountView>> {
        let mut accounts = self.token_accounts(owner, &TOKEN_PROGRAM_ID).await?;
        accounts.extend(self.token_accounts(owner, &TOKEN_2022_PROGRAM_ID).await?);
        Ok(accounts)
    }
}

impl PriceSource for ChainRpc {
    /// Pool price from reserves: SOL balance of the pool over its holdings
    /// of the mint.
    fn sample<'a>(&'a self, pool: &'a str, mint: &'a str) -> BoxFuture<'a, Result<PoolSnapshot>> {
        async move {
            let lamports = self.sol_balance(pool).await?;
            let sol_reserve = lamports as f64 / 1_000_000_000.0;
            let token_reserve: f64 = self
                .token_accounts_all_programs(pool)
                .await?
                .iter()
                .filter(|a| a.mint == mint)
                .map(|a| a.ui_amount)
                .sum();
            let price_sol = if token_reserve > 0.0 && sol_reserve > 0.0 {
                Some(sol_reserve / token_reserve)
            } else {
                None
            };
            Ok(PoolSnapshot {
                price_sol,
                slot: None,
            })
        }
        .boxed()
    }

    fn token_supply<'a>(&'a self, mint: &'a str) -> BoxFuture<'a, Result<(Option<f64>, u8)>> {
        async move { ChainRpc::token_supply(self, mint).await }.boxed()
    }
}

/// Pull mint and balance out of a jsonParsed token account.
fn parse_token_account(parsed: &serde_json::Value) -> Option<TokenAccountView> {
    let info = parsed.get("info")?;
    let mint = info.get("mint")?.as_str()?.to_string();
    let ui_amount = info
        .get("tokenAmount")?
        .get("uiAmount")?
        .as_f64()
        .unwrap_or(0.0);
    Some(TokenAccountView { mint, ui_amount })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_parsed_token_account() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{
                "type": "account",
                "info": {
                    "mint": "Mint111",
                    "owner": "W1",
                    "tokenAmount": {
                        "amount": "1500000",
                        "decimals": 6,
                        "uiAmount": 1.5,
                        "uiAmountString": "1.5"
                    }
                }
            }"#,
        )
        .unwrap();

        let view = parse_token_account(&value).unwrap();
        assert_eq!(view.mint, "Mint111");
        assert_eq!(view.ui_amount, 1.5);
    }

    #[test]
    fn malformed_account_yields_none() {
        let value: serde_json::Value = serde_json::json!({ "info": { "owner": "W1" } });
        assert!(parse_token_account(&value).is_none());
    }

    #[test]
    fn null_ui_amount_reads_as_zero() {
        let value = serde_json::json!({
            "info": {
                "mint": "Mint111",
                "tokenAmount": { "amount": "0", "decimals": 6, "uiAmount": null }
            }
        });
        let view = parse_token_account(&value).unwrap();
        assert_eq!(view.ui_amount, 0.0);
    }
}
