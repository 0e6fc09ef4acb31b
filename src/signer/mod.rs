use async_trait::async_trait;
use solana_sdk::signature::Keypair;
use solana_sdk::transaction::VersionedTransaction;
use tracing::debug;

use crate::sweeper::SweepError;

/// 批量签名入口。整批一起进出：要么全部签好，要么一个不发。
#[async_trait]
pub trait BatchSigner: Send + Sync {
    async fn sign_all(
        &self,
        transactions: Vec<VersionedTransaction>,
    ) -> Result<Vec<VersionedTransaction>, SweepError>;
}

/// 本地 keypair 签名器。
pub struct KeypairSigner {
    keypair: Keypair,
}

impl KeypairSigner {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }
}

#[async_trait]
impl BatchSigner for KeypairSigner {
    async fn sign_all(
        &self,
        transactions: Vec<VersionedTransaction>,
    ) -> Result<Vec<VersionedTransaction>, SweepError> {
        let mut signed = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            let tx = VersionedTransaction::try_new(transaction.message, &[&self.keypair])
                .map_err(|err| SweepError::Signing(err.to_string()))?;
            signed.push(tx);
        }
        debug!(target: "signer", count = signed.len(), "批量签名完成");
        Ok(signed)
    }
}
