use thiserror::Error;

/// 回收流水线的错误分级。
///
/// Building / Sending 阶段的错误只影响单个代币；Signing 阶段的错误
/// 中止整批（一次签名请求覆盖全部交易）。编排器本身不做任何重试。
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("quote refresh failed: {0}")]
    QuoteRefresh(String),
    #[error("transaction build failed: {0}")]
    Build(String),
    #[error("batch signing failed: {0}")]
    Signing(String),
    #[error("broadcast failed: {0}")]
    Broadcast(String),
    #[error("transaction failed on chain")]
    OnChain,
    #[error("confirmation failed: {0}")]
    Confirmation(String),
}
