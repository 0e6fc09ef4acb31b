use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use tracing::{debug, warn};

use super::error::SweepError;

const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// 链上出口：广播与确认分开，确认失败不代表交易没发出去。
#[async_trait]
pub trait ChainSink: Send + Sync {
    async fn send(&self, transaction: &VersionedTransaction) -> Result<Signature, SweepError>;

    /// 轮询直到交易确认、链上失败或超过 `last_valid_block_height`。
    /// `SweepError::OnChain` 专指链上执行失败，此时签名已经存在。
    async fn confirm(
        &self,
        signature: &Signature,
        last_valid_block_height: u64,
    ) -> Result<(), SweepError>;
}

/// 直连 RPC 的实现。跳过 preflight，交由 RPC 重发两次。
pub struct RpcChainSink {
    rpc: Arc<RpcClient>,
    poll_interval: Duration,
}

impl RpcChainSink {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self {
            rpc,
            poll_interval: CONFIRM_POLL_INTERVAL,
        }
    }
}

#[async_trait]
impl ChainSink for RpcChainSink {
    async fn send(&self, transaction: &VersionedTransaction) -> Result<Signature, SweepError> {
        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            max_retries: Some(2),
            ..Default::default()
        };
        let signature = self
            .rpc
            .send_transaction_with_config(transaction, config)
            .await
            .map_err(|err| SweepError::Broadcast(err.to_string()))?;
        debug!(target: "sweeper::chain", %signature, "交易已广播");
        Ok(signature)
    }

    async fn confirm(
        &self,
        signature: &Signature,
        last_valid_block_height: u64,
    ) -> Result<(), SweepError> {
        loop {
            let statuses = self
                .rpc
                .get_signature_statuses(&[*signature])
                .await
                .map_err(|err| SweepError::Confirmation(err.to_string()))?;

            if let Some(Some(status)) = statuses.value.into_iter().next() {
                if let Some(err) = status.err {
                    warn!(target: "sweeper::chain", %signature, error = %err, "交易链上失败");
                    return Err(SweepError::OnChain);
                }
                if status.confirmation_status.is_some() {
                    debug!(target: "sweeper::chain", %signature, "交易已确认");
                    return Ok(());
                }
            }

            let height = self
                .rpc
                .get_block_height()
                .await
                .map_err(|err| SweepError::Confirmation(err.to_string()))?;
            if height > last_valid_block_height {
                return Err(SweepError::Confirmation(format!(
                    "区块高度 {height} 已超过 {last_valid_block_height}，交易过期"
                )));
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
