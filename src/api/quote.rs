use std::ops::Deref;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use solana_sdk::pubkey::Pubkey;

use super::serde_helpers::{decimal_from_string, field_as_string};

/// 粉尘回收固定使用 ExactIn 模式。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SwapMode {
    #[default]
    #[serde(rename = "ExactIn", alias = "exactIn")]
    ExactIn,
    #[serde(rename = "ExactOut", alias = "exactOut")]
    ExactOut,
}

impl SwapMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SwapMode::ExactIn => "ExactIn",
            SwapMode::ExactOut => "ExactOut",
        }
    }
}

/// `/quote` 请求体，使用查询字符串传参。
#[derive(Debug, Clone)]
pub struct QuoteRequest {
    pub input_mint: Pubkey,
    pub output_mint: Pubkey,
    pub amount: u64,
    pub swap_mode: SwapMode,
    pub slippage_bps: u16,
    pub platform_fee_bps: Option<u16>,
    pub restrict_intermediate_tokens: Option<bool>,
    pub max_accounts: Option<u16>,
}

impl QuoteRequest {
    pub fn new(input_mint: Pubkey, output_mint: Pubkey, amount: u64, slippage_bps: u16) -> Self {
        Self {
            input_mint,
            output_mint,
            amount,
            swap_mode: SwapMode::ExactIn,
            slippage_bps,
            platform_fee_bps: None,
            restrict_intermediate_tokens: None,
            max_accounts: None,
        }
    }

    pub fn to_query_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::with_capacity(8);
        params.push(("inputMint".to_string(), self.input_mint.to_string()));
        params.push(("outputMint".to_string(), self.output_mint.to_string()));
        params.push(("amount".to_string(), self.amount.to_string()));
        params.push(("swapMode".to_string(), self.swap_mode.as_str().to_string()));
        params.push(("slippageBps".to_string(), self.slippage_bps.to_string()));
        if let Some(value) = self.platform_fee_bps {
            params.push(("platformFeeBps".to_string(), value.to_string()));
        }
        if let Some(value) = self.restrict_intermediate_tokens {
            params.push(("restrictIntermediateTokens".to_string(), value.to_string()));
        }
        if let Some(value) = self.max_accounts {
            params.push(("maxAccounts".to_string(), value.to_string()));
        }
        params
    }
}

/// `/quote` 成功响应中我们关心的字段。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteData {
    #[serde(with = "field_as_string")]
    pub input_mint: Pubkey,
    #[serde(with = "field_as_string")]
    pub output_mint: Pubkey,
    #[serde(with = "field_as_string")]
    pub in_amount: u64,
    #[serde(with = "field_as_string")]
    pub out_amount: u64,
    #[serde(default, with = "decimal_from_string")]
    pub price_impact_pct: Decimal,
    #[serde(default)]
    pub slippage_bps: u16,
    #[serde(default)]
    pub context_slot: Option<u64>,
    #[serde(default)]
    pub time_taken: Option<f64>,
}

/// 报价响应：保留原始 JSON，构建交易时按原样回传给 `/swap`。
#[derive(Clone, Debug)]
pub struct QuotePayload {
    pub raw: Value,
    data: QuoteData,
}

impl QuotePayload {
    pub fn try_from_value(value: Value) -> Result<Self, serde_json::Error> {
        let data: QuoteData = serde_json::from_value(value.clone())?;
        Ok(Self { raw: value, data })
    }
}

impl Deref for QuotePayload {
    type Target = QuoteData;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

/// 聚合器显式拒绝报价时返回的错误负载。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionPayload {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_code: String,
}

/// 报价调用的两种正常结局：拿到报价，或被聚合器拒绝。
#[derive(Debug, Clone)]
pub enum QuoteOutcome {
    Quote(QuotePayload),
    Rejected(RejectionPayload),
}
