use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::transaction::VersionedTransaction;
use tracing::{debug, warn};

use crate::api::{
    AggregatorApiClient, AggregatorError, QuotePayload, SwapRequest, SwapResponsePayload,
};

/// swap 构建端点抽象，测试里不走网络。
#[async_trait]
pub trait SwapBuildApi: Send + Sync {
    async fn swap(
        &self,
        request: &SwapRequest,
    ) -> Result<Option<SwapResponsePayload>, AggregatorError>;
}

#[async_trait]
impl SwapBuildApi for AggregatorApiClient {
    async fn swap(
        &self,
        request: &SwapRequest,
    ) -> Result<Option<SwapResponsePayload>, AggregatorError> {
        AggregatorApiClient::swap(self, request).await
    }
}

/// 已解码、待签名的 swap 交易。
#[derive(Debug, Clone)]
pub struct PreparedSwap {
    pub transaction: VersionedTransaction,
    pub last_valid_block_height: u64,
}

/// 把新鲜报价变成待签名交易。平台手续费收到手续费钱包在
/// 输出代币上的 ATA 里。
pub struct SwapBuilder<A: SwapBuildApi> {
    api: A,
    fee_account: Pubkey,
    output_mint: Pubkey,
    token_program: Pubkey,
}

impl<A: SwapBuildApi> SwapBuilder<A> {
    pub fn new(api: A, fee_account: Pubkey, output_mint: Pubkey) -> Self {
        Self {
            api,
            fee_account,
            output_mint,
            token_program: spl_token::id(),
        }
    }

    /// 手续费 ATA。推导失败时退回收款钱包本身并告警，而不是
    /// 让整笔交易作废。
    pub fn fee_token_account(&self) -> Pubkey {
        let seeds = [
            self.fee_account.as_ref(),
            self.token_program.as_ref(),
            self.output_mint.as_ref(),
        ];
        match Pubkey::try_find_program_address(&seeds, &spl_associated_token_account::id()) {
            Some((ata, _)) => ata,
            None => {
                warn!(
                    target: "sweeper::builder",
                    fee_account = %self.fee_account,
                    "ATA 推导失败，退回手续费钱包地址"
                );
                self.fee_account
            }
        }
    }

    /// 构建未签名交易。聚合器拒绝与交易解码失败都按「该项构建
    /// 失败」处理返回 `Ok(None)`，只有传输层错误向上传播。
    pub async fn build(
        &self,
        quote: &QuotePayload,
        user: &Pubkey,
    ) -> Result<Option<PreparedSwap>, AggregatorError> {
        let request = SwapRequest::new(quote.raw.clone(), *user, self.fee_token_account());

        let Some(payload) = self.api.swap(&request).await? else {
            return Ok(None);
        };

        let transaction = match payload.decode_transaction() {
            Ok(tx) => tx,
            Err(err) => {
                warn!(
                    target: "sweeper::builder",
                    input_mint = %quote.input_mint,
                    error = %err,
                    "swap 交易解码失败"
                );
                return Ok(None);
            }
        };

        debug!(
            target: "sweeper::builder",
            input_mint = %quote.input_mint,
            last_valid_block_height = payload.last_valid_block_height,
            "swap 交易已构建"
        );

        Ok(Some(PreparedSwap {
            transaction,
            last_valid_block_height: payload.last_valid_block_height,
        }))
    }
}
