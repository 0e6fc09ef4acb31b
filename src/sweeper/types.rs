use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use solana_sdk::native_token::LAMPORTS_PER_SOL;
use solana_sdk::pubkey::Pubkey;

use crate::api::serde_helpers::field_as_string;

/// 钱包枚举出的一笔代币余额。列出后不再变动，仅元数据可补充。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    #[serde(with = "field_as_string")]
    pub mint: Pubkey,
    /// 持有该余额的 token account 地址。
    #[serde(with = "field_as_string")]
    pub account: Pubkey,
    #[serde(with = "field_as_string")]
    pub amount: u64,
    pub decimals: u8,
    pub ui_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_uri: Option<String>,
}

impl TokenBalance {
    pub fn display_symbol(&self) -> String {
        self.symbol
            .clone()
            .unwrap_or_else(|| crate::wallet::shorten_address(&self.mint.to_string(), 4))
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| "Unknown Token".to_string())
    }
}

/// 余额 + 报价 + 选择状态。
///
/// 不变量：`tradeable == false` 时 `selected == false` 且估值为零；
/// 只有可交易项允许调用方翻转 `selected`。
#[derive(Debug, Clone)]
pub struct QuotedToken {
    pub token: TokenBalance,
    pub quote_out_amount: u64,
    pub quote_out_amount_ui: f64,
    pub price_impact_pct: Decimal,
    pub selected: bool,
    pub tradeable: bool,
    pub error_reason: Option<String>,
}

impl QuotedToken {
    pub fn tradeable(token: TokenBalance, out_amount: u64, price_impact_pct: Decimal) -> Self {
        Self {
            token,
            quote_out_amount: out_amount,
            quote_out_amount_ui: lamports_to_sol(out_amount),
            price_impact_pct,
            selected: true,
            tradeable: true,
            error_reason: None,
        }
    }

    pub fn untradeable(token: TokenBalance, reason: String) -> Self {
        Self {
            token,
            quote_out_amount: 0,
            quote_out_amount_ui: 0.0,
            price_impact_pct: Decimal::ZERO,
            selected: false,
            tradeable: false,
            error_reason: Some(reason),
        }
    }
}

/// 单个代币一次回收尝试的最终结局。写入结果列表后不再修改。
///
/// `signature` 仅在交易真正提交后出现：有签名的失败代表
/// “已上链但执行失败 / 提交后无法确认”，无签名代表从未提交。
#[derive(Debug, Clone, PartialEq)]
pub struct SwapOutcome {
    pub mint: String,
    pub success: bool,
    pub signature: Option<String>,
    pub amount_out: Option<f64>,
    pub error: Option<String>,
}

impl SwapOutcome {
    pub fn failure(mint: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            mint: mint.into(),
            success: false,
            signature: None,
            amount_out: None,
            error: Some(error.into()),
        }
    }

    pub fn success(mint: impl Into<String>, signature: String, amount_out: f64) -> Self {
        Self {
            mint: mint.into(),
            success: true,
            signature: Some(signature),
            amount_out: Some(amount_out),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    Building,
    Signing,
    Sending,
}

impl SweepPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SweepPhase::Building => "building",
            SweepPhase::Signing => "signing",
            SweepPhase::Sending => "sending",
        }
    }
}

/// 编排器对外的进度事件：有限、不可重放的阶段标记结果流。
#[derive(Debug, Clone)]
pub struct SweepEvent {
    pub phase: SweepPhase,
    pub outcome: SwapOutcome,
}

pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untradeable_invariant_holds() {
        let token = sample_token();
        let quoted = QuotedToken::untradeable(token, "No liquidity".to_string());
        assert!(!quoted.tradeable);
        assert!(!quoted.selected);
        assert_eq!(quoted.quote_out_amount_ui, 0.0);
    }

    #[test]
    fn lamports_convert_to_sol_units() {
        assert_eq!(lamports_to_sol(5_000_000), 0.005);
        assert_eq!(lamports_to_sol(LAMPORTS_PER_SOL), 1.0);
    }

    #[test]
    fn token_balance_serde_round_trip() {
        let token = sample_token();
        let json = serde_json::to_string(&token).expect("serialize");
        let back: TokenBalance = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.mint, token.mint);
        assert_eq!(back.amount, token.amount);
        assert_eq!(back.decimals, token.decimals);
    }

    fn sample_token() -> TokenBalance {
        TokenBalance {
            mint: Pubkey::new_unique(),
            account: Pubkey::new_unique(),
            amount: 1_000_000,
            decimals: 6,
            ui_amount: 1.0,
            symbol: None,
            name: None,
            logo_uri: None,
        }
    }
}
