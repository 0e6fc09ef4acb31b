use std::sync::Arc;

use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::api::{AggregatorApiClient, QuotePayload};
use crate::signer::BatchSigner;
use crate::throttle::RateLimiter;

use super::builder::{PreparedSwap, SwapBuilder};
use super::chain::ChainSink;
use super::error::SweepError;
use super::quotes::{QuoteReply, QuoteService};
use super::types::{QuotedToken, SwapOutcome, SweepEvent, SweepPhase, lamports_to_sol};

/// 构建阶段的上游：重新报价 + 构建交易。缓存里的报价摘要
/// 不够新鲜也不完整，执行前必须重取。
#[async_trait]
pub trait SwapGateway: Send + Sync {
    async fn fresh_quote(&self, mint: Pubkey, amount: u64) -> Result<QuotePayload, SweepError>;

    async fn build_swap(
        &self,
        quote: &QuotePayload,
        user: &Pubkey,
    ) -> Result<PreparedSwap, SweepError>;
}

/// 真实流水线：绕过缓存的报价服务 + 聚合器 swap 构建。
pub struct PipelineGateway {
    quotes: QuoteService,
    limiter: Arc<RateLimiter>,
    builder: SwapBuilder<AggregatorApiClient>,
}

impl PipelineGateway {
    pub fn new(
        quotes: QuoteService,
        limiter: Arc<RateLimiter>,
        builder: SwapBuilder<AggregatorApiClient>,
    ) -> Self {
        Self {
            quotes,
            limiter,
            builder,
        }
    }
}

#[async_trait]
impl SwapGateway for PipelineGateway {
    async fn fresh_quote(&self, mint: Pubkey, amount: u64) -> Result<QuotePayload, SweepError> {
        let fetch = self.quotes.fetch(mint, amount, false).await;
        self.limiter.wait().await;

        match fetch.reply {
            QuoteReply::Quote {
                payload: Some(payload),
                ..
            } => Ok(payload),
            QuoteReply::Quote { payload: None, .. } => {
                // 绕过缓存时不该出现；出现说明服务端行为变了。
                Err(SweepError::QuoteRefresh(
                    "fresh quote carried no payload".to_string(),
                ))
            }
            QuoteReply::Rejected { code, message } => {
                Err(SweepError::QuoteRefresh(format!("{code}: {message}")))
            }
            QuoteReply::Unreachable { message } => Err(SweepError::QuoteRefresh(message)),
        }
    }

    async fn build_swap(
        &self,
        quote: &QuotePayload,
        user: &Pubkey,
    ) -> Result<PreparedSwap, SweepError> {
        self.limiter.wait().await;
        match self.builder.build(quote, user).await {
            Ok(Some(prepared)) => Ok(prepared),
            Ok(None) => Err(SweepError::Build("aggregator declined to build".to_string())),
            Err(err) => Err(SweepError::Build(err.to_string())),
        }
    }
}

struct BuiltItem {
    mint: String,
    out_amount: u64,
    prepared: PreparedSwap,
}

/// 批量执行器：构建 → 签名 → 逐笔广播并确认。
///
/// 单项失败只记入该项的结果，绝不中断整批；签名只发起一次，
/// 覆盖全部已构建的交易，被拒则整批零广播、全部记为取消。
/// 批量上限只在 CLI 层做提示，这里不切批。
pub struct SweepExecutor {
    gateway: Arc<dyn SwapGateway>,
    signer: Arc<dyn BatchSigner>,
    sink: Arc<dyn ChainSink>,
    events: Option<UnboundedSender<SweepEvent>>,
}

impl SweepExecutor {
    pub fn new(
        gateway: Arc<dyn SwapGateway>,
        signer: Arc<dyn BatchSigner>,
        sink: Arc<dyn ChainSink>,
    ) -> Self {
        Self {
            gateway,
            signer,
            sink,
            events: None,
        }
    }

    pub fn with_events(mut self, events: UnboundedSender<SweepEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, phase: SweepPhase, outcome: &SwapOutcome) {
        if let Some(events) = &self.events {
            let _ = events.send(SweepEvent {
                phase,
                outcome: outcome.clone(),
            });
        }
    }

    /// 只处理「选中且可交易」的项。返回值与入参一一对应外加
    /// 顺序保证：同一批内按入参顺序产出结果。
    pub async fn sweep(&self, user: &Pubkey, tokens: &[QuotedToken]) -> Vec<SwapOutcome> {
        let eligible: Vec<&QuotedToken> = tokens
            .iter()
            .filter(|token| token.selected && token.tradeable)
            .collect();
        info!(
            target: "sweeper::executor",
            eligible = eligible.len(),
            "开始批量回收"
        );

        let mut outcomes = Vec::with_capacity(eligible.len());

        // 阶段一：重新报价并构建。失败项就地出局。
        let mut built = Vec::with_capacity(eligible.len());
        for token in &eligible {
            let mint = token.token.mint.to_string();

            let quote = match self
                .gateway
                .fresh_quote(token.token.mint, token.token.amount)
                .await
            {
                Ok(quote) => quote,
                Err(err) => {
                    warn!(target: "sweeper::executor", %mint, error = %err, "重新报价失败");
                    let outcome = SwapOutcome::failure(&mint, "Failed to get quote");
                    self.emit(SweepPhase::Building, &outcome);
                    outcomes.push(outcome);
                    continue;
                }
            };

            match self.gateway.build_swap(&quote, user).await {
                Ok(prepared) => {
                    self.emit(SweepPhase::Building, &progress_ok(&mint));
                    built.push(BuiltItem {
                        mint,
                        out_amount: quote.out_amount,
                        prepared,
                    });
                }
                Err(err) => {
                    warn!(target: "sweeper::executor", %mint, error = %err, "构建交易失败");
                    let outcome = SwapOutcome::failure(&mint, "Failed to build transaction");
                    self.emit(SweepPhase::Building, &outcome);
                    outcomes.push(outcome);
                }
            }
        }

        if built.is_empty() {
            info!(target: "sweeper::executor", "没有可签名的交易");
            return outcomes;
        }

        // 阶段二：一次性签完全部交易。被拒等于整批取消，零广播。
        self.emit(SweepPhase::Signing, &progress_ok("all"));
        let unsigned = built
            .iter()
            .map(|item| item.prepared.transaction.clone())
            .collect::<Vec<_>>();
        let signed = match self.signer.sign_all(unsigned).await {
            Ok(signed) if signed.len() == built.len() => signed,
            Ok(signed) => {
                warn!(
                    target: "sweeper::executor",
                    expected = built.len(),
                    got = signed.len(),
                    "签名数量不符，取消整批"
                );
                self.cancel_batch(&built, &mut outcomes);
                return outcomes;
            }
            Err(err) => {
                warn!(target: "sweeper::executor", error = %err, "批量签名失败，取消整批");
                self.cancel_batch(&built, &mut outcomes);
                return outcomes;
            }
        };

        // 阶段三：逐笔广播并等确认。
        for (item, transaction) in built.into_iter().zip(signed) {
            let signature = match self.sink.send(&transaction).await {
                Ok(signature) => signature,
                Err(err) => {
                    warn!(target: "sweeper::executor", mint = %item.mint, error = %err, "广播失败");
                    let outcome = SwapOutcome::failure(&item.mint, "Failed to send transaction");
                    self.emit(SweepPhase::Sending, &outcome);
                    outcomes.push(outcome);
                    continue;
                }
            };

            let outcome = match self
                .sink
                .confirm(&signature, item.prepared.last_valid_block_height)
                .await
            {
                Ok(()) => SwapOutcome::success(
                    &item.mint,
                    signature.to_string(),
                    lamports_to_sol(item.out_amount),
                ),
                // 已上链但执行失败：签名要保留给用户去浏览器上查。
                Err(SweepError::OnChain) => SwapOutcome {
                    mint: item.mint.clone(),
                    success: false,
                    signature: Some(signature.to_string()),
                    amount_out: None,
                    error: Some("Transaction failed on chain".to_string()),
                },
                // 确认环节的传输错误：交易下落不明，不冒充已上链。
                Err(err) => SwapOutcome::failure(&item.mint, err.to_string()),
            };
            self.emit(SweepPhase::Sending, &outcome);
            outcomes.push(outcome);
        }

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        info!(
            target: "sweeper::executor",
            succeeded,
            failed = outcomes.len() - succeeded,
            "批量回收结束"
        );
        outcomes
    }

    fn cancel_batch(&self, built: &[BuiltItem], outcomes: &mut Vec<SwapOutcome>) {
        for item in built {
            let outcome = SwapOutcome::failure(&item.mint, "Signing cancelled");
            self.emit(SweepPhase::Signing, &outcome);
            outcomes.push(outcome);
        }
    }
}

/// 阶段推进标记，不是最终结果。
fn progress_ok(mint: &str) -> SwapOutcome {
    SwapOutcome {
        mint: mint.to_string(),
        success: true,
        signature: None,
        amount_out: None,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rust_decimal::Decimal;
    use serde_json::json;
    use solana_sdk::instruction::Instruction;
    use solana_sdk::message::{Message, VersionedMessage};
    use solana_sdk::signature::Signature;
    use solana_sdk::transaction::VersionedTransaction;

    use crate::sweeper::types::TokenBalance;
    use crate::wallet::WSOL_MINT;

    use super::*;

    fn quote_payload(input_mint: Pubkey, out_amount: u64) -> QuotePayload {
        QuotePayload::try_from_value(json!({
            "inputMint": input_mint.to_string(),
            "outputMint": WSOL_MINT.to_string(),
            "inAmount": "1000",
            "outAmount": out_amount.to_string(),
            "priceImpactPct": "0.1",
            "routePlan": []
        }))
        .expect("quote payload")
    }

    fn unsigned_transaction() -> VersionedTransaction {
        let payer = Pubkey::new_unique();
        let instruction = Instruction::new_with_bytes(Pubkey::new_unique(), &[1], vec![]);
        VersionedTransaction {
            signatures: vec![],
            message: VersionedMessage::Legacy(Message::new(&[instruction], Some(&payer))),
        }
    }

    fn quoted(mint: Pubkey) -> QuotedToken {
        QuotedToken::tradeable(
            TokenBalance {
                mint,
                account: Pubkey::new_unique(),
                amount: 1_000,
                decimals: 6,
                ui_amount: 0.001,
                symbol: None,
                name: None,
                logo_uri: None,
            },
            5_000_000,
            Decimal::ONE,
        )
    }

    #[derive(Default)]
    struct MockGateway {
        quote_failures: HashSet<Pubkey>,
        build_failures: HashSet<Pubkey>,
    }

    #[async_trait]
    impl SwapGateway for MockGateway {
        async fn fresh_quote(&self, mint: Pubkey, _amount: u64) -> Result<QuotePayload, SweepError> {
            if self.quote_failures.contains(&mint) {
                return Err(SweepError::QuoteRefresh("no route".to_string()));
            }
            Ok(quote_payload(mint, 5_000_000))
        }

        async fn build_swap(
            &self,
            quote: &QuotePayload,
            _user: &Pubkey,
        ) -> Result<PreparedSwap, SweepError> {
            if self.build_failures.contains(&quote.input_mint) {
                return Err(SweepError::Build("declined".to_string()));
            }
            Ok(PreparedSwap {
                transaction: unsigned_transaction(),
                last_valid_block_height: 100,
            })
        }
    }

    struct PassthroughSigner {
        fail: bool,
        truncate: bool,
        calls: AtomicUsize,
    }

    impl PassthroughSigner {
        fn approving() -> Self {
            Self {
                fail: false,
                truncate: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn rejecting() -> Self {
            Self {
                fail: true,
                truncate: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn truncating() -> Self {
            Self {
                fail: false,
                truncate: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BatchSigner for PassthroughSigner {
        async fn sign_all(
            &self,
            mut transactions: Vec<VersionedTransaction>,
        ) -> Result<Vec<VersionedTransaction>, SweepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SweepError::Signing("user rejected".to_string()));
            }
            if self.truncate {
                transactions.pop();
            }
            Ok(transactions)
        }
    }

    #[derive(Default)]
    struct MockSink {
        send_failures: AtomicUsize,
        confirm_errors: Mutex<HashMap<usize, SweepError>>,
        sent: AtomicUsize,
        confirmed: AtomicUsize,
    }

    impl MockSink {
        fn failing_send_first(n: usize) -> Self {
            Self {
                send_failures: AtomicUsize::new(n),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ChainSink for MockSink {
        async fn send(&self, _tx: &VersionedTransaction) -> Result<Signature, SweepError> {
            if self.send_failures.load(Ordering::SeqCst) > 0 {
                self.send_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(SweepError::Broadcast("rpc down".to_string()));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(Signature::new_unique())
        }

        async fn confirm(
            &self,
            _signature: &Signature,
            _last_valid_block_height: u64,
        ) -> Result<(), SweepError> {
            let index = self.confirmed.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.confirm_errors.lock().unwrap().remove(&index) {
                return Err(err);
            }
            Ok(())
        }
    }

    fn executor(gateway: MockGateway, signer: PassthroughSigner, sink: MockSink) -> SweepExecutor {
        SweepExecutor::new(Arc::new(gateway), Arc::new(signer), Arc::new(sink))
    }

    #[tokio::test]
    async fn partial_failures_never_abort_the_batch() {
        let bad_quote = Pubkey::new_unique();
        let bad_build = Pubkey::new_unique();
        let good = Pubkey::new_unique();

        let gateway = MockGateway {
            quote_failures: HashSet::from([bad_quote]),
            build_failures: HashSet::from([bad_build]),
        };
        let exec = executor(gateway, PassthroughSigner::approving(), MockSink::default());

        let outcomes = exec
            .sweep(
                &Pubkey::new_unique(),
                &[quoted(bad_quote), quoted(good), quoted(bad_build)],
            )
            .await;

        assert_eq!(outcomes.len(), 3);
        let by_mint: HashMap<_, _> = outcomes.iter().map(|o| (o.mint.clone(), o)).collect();

        let failed_quote = by_mint[&bad_quote.to_string()];
        assert!(!failed_quote.success);
        assert_eq!(failed_quote.error.as_deref(), Some("Failed to get quote"));
        assert!(failed_quote.signature.is_none());

        let failed_build = by_mint[&bad_build.to_string()];
        assert_eq!(
            failed_build.error.as_deref(),
            Some("Failed to build transaction")
        );

        let succeeded = by_mint[&good.to_string()];
        assert!(succeeded.success);
        assert!(succeeded.signature.is_some());
        assert_eq!(succeeded.amount_out, Some(0.005));
    }

    #[tokio::test]
    async fn signing_rejection_cancels_batch_with_zero_broadcasts() {
        let a = Pubkey::new_unique();
        let b = Pubkey::new_unique();
        let sink = Arc::new(MockSink::default());
        let signer = Arc::new(PassthroughSigner::rejecting());

        let exec = SweepExecutor::new(
            Arc::new(MockGateway::default()),
            signer.clone(),
            sink.clone(),
        );

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let exec = exec.with_events(tx);

        let outcomes = exec
            .sweep(&Pubkey::new_unique(), &[quoted(a), quoted(b)])
            .await;

        // 拒签后整批终止：只弹一次签名，零广播，两项都记取消。
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.sent.load(Ordering::SeqCst), 0);
        assert_eq!(outcomes.len(), 2);
        for outcome in &outcomes {
            assert!(!outcome.success);
            assert_eq!(outcome.error.as_deref(), Some("Signing cancelled"));
            assert!(outcome.signature.is_none());
        }

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        // 两次构建成功 + 签名开始 + 两项取消。
        assert_eq!(events.len(), 5);
        assert_eq!(events[2].phase, SweepPhase::Signing);
        assert_eq!(events[2].outcome.mint, "all");
        assert!(events[2].outcome.success);
        for event in &events[3..] {
            assert_eq!(event.phase, SweepPhase::Signing);
            assert_eq!(event.outcome.error.as_deref(), Some("Signing cancelled"));
        }
        assert!(events.iter().all(|e| e.phase != SweepPhase::Sending));
    }

    #[tokio::test]
    async fn on_chain_failure_keeps_the_signature() {
        let mint = Pubkey::new_unique();
        let sink = MockSink::default();
        sink.confirm_errors
            .lock()
            .unwrap()
            .insert(0, SweepError::OnChain);

        let exec = executor(MockGateway::default(), PassthroughSigner::approving(), sink);

        let outcomes = exec.sweep(&Pubkey::new_unique(), &[quoted(mint)]).await;
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].success);
        assert!(outcomes[0].signature.is_some());
        assert_eq!(
            outcomes[0].error.as_deref(),
            Some("Transaction failed on chain")
        );
    }

    #[tokio::test]
    async fn broadcast_failure_leaves_no_signature() {
        let mint = Pubkey::new_unique();
        let exec = executor(
            MockGateway::default(),
            PassthroughSigner::approving(),
            MockSink::failing_send_first(1),
        );

        let outcomes = exec.sweep(&Pubkey::new_unique(), &[quoted(mint)]).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].signature.is_none());
        assert_eq!(
            outcomes[0].error.as_deref(),
            Some("Failed to send transaction")
        );
    }

    #[tokio::test]
    async fn unselected_and_untradeable_tokens_are_skipped() {
        let selected = Pubkey::new_unique();
        let deselected = Pubkey::new_unique();
        let dead = Pubkey::new_unique();

        let mut opted_out = quoted(deselected);
        opted_out.selected = false;
        let untradeable = QuotedToken::untradeable(
            TokenBalance {
                mint: dead,
                account: Pubkey::new_unique(),
                amount: 1,
                decimals: 0,
                ui_amount: 1.0,
                symbol: None,
                name: None,
                logo_uri: None,
            },
            "No liquidity".to_string(),
        );

        let exec = executor(
            MockGateway::default(),
            PassthroughSigner::approving(),
            MockSink::default(),
        );

        let outcomes = exec
            .sweep(
                &Pubkey::new_unique(),
                &[quoted(selected), opted_out, untradeable],
            )
            .await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].mint, selected.to_string());
    }

    #[tokio::test]
    async fn all_built_transactions_share_one_signing_call() {
        let tokens: Vec<QuotedToken> = (0..5).map(|_| quoted(Pubkey::new_unique())).collect();
        let signer = Arc::new(PassthroughSigner::approving());
        let sink = Arc::new(MockSink::default());

        let exec = SweepExecutor::new(Arc::new(MockGateway::default()), signer.clone(), sink);

        let outcomes = exec.sweep(&Pubkey::new_unique(), &tokens).await;
        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|o| o.success));
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_signature_vector_cancels_everything() {
        let tokens: Vec<QuotedToken> = (0..3).map(|_| quoted(Pubkey::new_unique())).collect();
        let sink = Arc::new(MockSink::default());

        let exec = SweepExecutor::new(
            Arc::new(MockGateway::default()),
            Arc::new(PassthroughSigner::truncating()),
            sink.clone(),
        );

        let outcomes = exec.sweep(&Pubkey::new_unique(), &tokens).await;
        assert_eq!(sink.sent.load(Ordering::SeqCst), 0);
        assert_eq!(outcomes.len(), 3);
        for outcome in &outcomes {
            assert!(!outcome.success);
            assert_eq!(outcome.error.as_deref(), Some("Signing cancelled"));
        }
    }

    #[tokio::test]
    async fn events_track_every_phase_transition() {
        let bad = Pubkey::new_unique();
        let good = Pubkey::new_unique();
        let gateway = MockGateway {
            quote_failures: HashSet::from([bad]),
            build_failures: HashSet::new(),
        };

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let exec = executor(gateway, PassthroughSigner::approving(), MockSink::default())
            .with_events(tx);

        exec.sweep(&Pubkey::new_unique(), &[quoted(bad), quoted(good)])
            .await;

        let first = rx.try_recv().expect("building failure event");
        assert_eq!(first.phase, SweepPhase::Building);
        assert_eq!(first.outcome.mint, bad.to_string());
        assert!(!first.outcome.success);

        let second = rx.try_recv().expect("building success event");
        assert_eq!(second.phase, SweepPhase::Building);
        assert_eq!(second.outcome.mint, good.to_string());
        assert!(second.outcome.success);

        let third = rx.try_recv().expect("signing event");
        assert_eq!(third.phase, SweepPhase::Signing);
        assert_eq!(third.outcome.mint, "all");

        let fourth = rx.try_recv().expect("sending event");
        assert_eq!(fourth.phase, SweepPhase::Sending);
        assert_eq!(fourth.outcome.mint, good.to_string());
        assert!(fourth.outcome.success);

        assert!(rx.try_recv().is_err());
    }
}
