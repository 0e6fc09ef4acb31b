use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bincode::error::DecodeError;
use bincode::serde::decode_from_slice;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::transaction::VersionedTransaction;
use thiserror::Error;

use super::serde_helpers::field_as_string;

/// `/swap` 请求体。报价 JSON 原样回传，避免丢失路由细节。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapRequest {
    pub quote_response: Value,
    #[serde(with = "field_as_string")]
    pub user_public_key: Pubkey,
    pub wrap_and_unwrap_sol: bool,
    #[serde(with = "field_as_string")]
    pub fee_account: Pubkey,
    pub dynamic_compute_unit_limit: bool,
    /// 固定传 "auto"，优先费交给聚合器估算。
    pub prioritization_fee_lamports: String,
}

impl SwapRequest {
    pub fn new(quote_response: Value, user_public_key: Pubkey, fee_account: Pubkey) -> Self {
        Self {
            quote_response,
            user_public_key,
            wrap_and_unwrap_sol: true,
            fee_account,
            dynamic_compute_unit_limit: true,
            prioritization_fee_lamports: "auto".to_string(),
        }
    }
}

/// `/swap` 响应体：base64 编码的未签名交易 + 有效高度上限。
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapResponsePayload {
    pub swap_transaction: String,
    pub last_valid_block_height: u64,
    #[serde(default)]
    pub prioritization_fee_lamports: Option<u64>,
}

impl SwapResponsePayload {
    pub fn decode_transaction(&self) -> Result<VersionedTransaction, DecodeTxError> {
        decode_base64_transaction(&self.swap_transaction)
    }
}

/// 解码 base64 编码的未签名交易。
pub fn decode_base64_transaction(encoded: &str) -> Result<VersionedTransaction, DecodeTxError> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(DecodeTxError::Base64)?;
    let (tx, _) = decode_from_slice::<VersionedTransaction, _>(&bytes, bincode_config())
        .map_err(DecodeTxError::Bincode)?;
    Ok(tx)
}

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
}

#[derive(Debug, Error)]
pub enum DecodeTxError {
    #[error("base64 解码失败: {0}")]
    Base64(base64::DecodeError),
    #[error("bincode 解码失败: {0}")]
    Bincode(DecodeError),
}
