use std::str::FromStr;
use std::sync::Arc;

use solana_account_decoder::UiAccountData;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_request::TokenAccountsFilter;
use solana_sdk::pubkey;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::sweeper::TokenBalance;

pub mod directory;

pub use directory::{TokenDirectory, TokenMetadata};

pub const WSOL_MINT: Pubkey = pubkey!("So11111111111111111111111111111111111111112");

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("RPC 调用失败: {0}")]
    Rpc(#[from] solana_client::client_error::ClientError),
}

/// 枚举钱包里所有非零 SPL 余额，两个 token program 分别扫一遍。
/// WSOL 是回收目标币种，从输入侧剔除。
pub async fn fetch_token_balances(
    rpc: &Arc<RpcClient>,
    owner: &Pubkey,
) -> Result<Vec<TokenBalance>, WalletError> {
    let mut balances = Vec::new();

    for program_id in [spl_token::id(), spl_token_2022::id()] {
        let accounts = rpc
            .get_token_accounts_by_owner(owner, TokenAccountsFilter::ProgramId(program_id))
            .await?;

        for keyed in accounts {
            let Some(balance) = parse_keyed_account(&keyed.pubkey, &keyed.account.data) else {
                continue;
            };
            if balance.amount == 0 || balance.mint == WSOL_MINT {
                continue;
            }
            balances.push(balance);
        }
    }

    debug!(target: "wallet", %owner, count = balances.len(), "已枚举代币余额");
    Ok(balances)
}

/// 整钱包快照按 owner 缓存一份，TTL 内重复扫描不再打 RPC；
/// `refresh` 绕开并覆盖快照。
pub async fn load_balances(
    rpc: &Arc<RpcClient>,
    snapshot: &CacheStore,
    owner: &Pubkey,
    refresh: bool,
) -> Result<Vec<TokenBalance>, WalletError> {
    let key = snapshot_key(owner);
    if !refresh {
        if let Some(cached) = snapshot.get::<Vec<TokenBalance>>(&key) {
            debug!(target: "wallet", %owner, count = cached.len(), "使用余额快照");
            return Ok(cached);
        }
    }
    let balances = fetch_token_balances(rpc, owner).await?;
    snapshot.set(&key, &balances);
    Ok(balances)
}

fn snapshot_key(owner: &Pubkey) -> String {
    format!("balances-{owner}")
}

/// jsonParsed 编码的 token account。解析失败的条目跳过而不是
/// 让整次扫描报错。
fn parse_keyed_account(pubkey: &str, data: &UiAccountData) -> Option<TokenBalance> {
    let UiAccountData::Json(parsed) = data else {
        return None;
    };
    let info = parsed.parsed.get("info")?;

    let mint = Pubkey::from_str(info.get("mint")?.as_str()?).ok()?;
    let account = match Pubkey::from_str(pubkey) {
        Ok(account) => account,
        Err(err) => {
            warn!(target: "wallet", pubkey, error = %err, "token account 地址非法");
            return None;
        }
    };

    let token_amount = info.get("tokenAmount")?;
    let amount = token_amount.get("amount")?.as_str()?.parse::<u64>().ok()?;
    let decimals = token_amount.get("decimals")?.as_u64()? as u8;
    let ui_amount = token_amount
        .get("uiAmount")
        .and_then(|v| v.as_f64())
        .unwrap_or_else(|| amount as f64 / 10f64.powi(decimals as i32));

    Some(TokenBalance {
        mint,
        account,
        amount,
        decimals,
        ui_amount,
        symbol: None,
        name: None,
        logo_uri: None,
    })
}

/// `EPjF...Dt1v` 这种首尾截断展示。
pub fn shorten_address(address: &str, keep: usize) -> String {
    if address.len() <= keep * 2 + 3 {
        return address.to_string();
    }
    format!("{}...{}", &address[..keep], &address[address.len() - keep..])
}

/// 余额展示：大数留两位小数，小数放到六位避免显示成 0。
pub fn format_amount(ui_amount: f64) -> String {
    if ui_amount >= 1.0 {
        format!("{ui_amount:.2}")
    } else {
        format!("{ui_amount:.6}")
    }
}

pub fn format_sol(sol: f64) -> String {
    format!("{sol:.6} SOL")
}
