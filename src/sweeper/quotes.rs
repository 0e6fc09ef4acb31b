use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use solana_sdk::pubkey::Pubkey;
use tracing::{debug, warn};

use crate::api::{AggregatorApiClient, AggregatorError, QuoteOutcome, QuotePayload, QuoteRequest};
use crate::cache::{CacheStore, QuoteCacheData, quote_cache_key};
use crate::throttle::RateLimiter;

use super::types::{QuotedToken, TokenBalance, lamports_to_sol};

pub const SLIPPAGE_BPS: u16 = 50;
pub const PLATFORM_FEE_BPS: u16 = 100;
const MAX_ACCOUNTS: u16 = 64;

/// 报价来源抽象，便于在测试里替换聚合器。
#[async_trait]
pub trait QuoteApi: Send + Sync {
    async fn quote(&self, request: &QuoteRequest) -> Result<QuoteOutcome, AggregatorError>;
}

#[async_trait]
impl QuoteApi for AggregatorApiClient {
    async fn quote(&self, request: &QuoteRequest) -> Result<QuoteOutcome, AggregatorError> {
        AggregatorApiClient::quote(self, request).await
    }
}

/// 一次报价调用的回答。
#[derive(Debug, Clone)]
pub enum QuoteReply {
    Quote {
        out_amount: u64,
        price_impact_pct: Decimal,
        /// 仅新鲜报价携带原始 JSON；缓存命中只有摘要，不足以构建交易。
        payload: Option<QuotePayload>,
    },
    /// 聚合器明确拒绝。会进缓存，TTL 内重复询问直接回放。
    Rejected { code: String, message: String },
    /// 传输层失败，未拿到任何响应。不缓存，下次操作可重试。
    Unreachable { message: String },
}

#[derive(Debug, Clone)]
pub struct QuoteFetch {
    pub reply: QuoteReply,
    pub from_cache: bool,
}

/// 报价服务：缓存优先，miss 才打聚合器。
///
/// 限速由调用方负责：凡是未被缓存满足的调用，调用方恰好等待
/// 限速器一次；缓存命中完全绕开限速。
pub struct QuoteService {
    api: Arc<dyn QuoteApi>,
    cache: CacheStore,
    output_mint: Pubkey,
}

impl QuoteService {
    pub fn new(api: Arc<dyn QuoteApi>, cache: CacheStore, output_mint: Pubkey) -> Self {
        Self {
            api,
            cache,
            output_mint,
        }
    }

    pub async fn fetch(&self, mint: Pubkey, amount: u64, use_cache: bool) -> QuoteFetch {
        let key = quote_cache_key(&mint, amount);

        if use_cache {
            if let Some(cached) = self.cache.get::<QuoteCacheData>(&key) {
                let reply = if cached.is_error() {
                    QuoteReply::Rejected {
                        code: cached
                            .error_code
                            .unwrap_or_else(|| "CACHED_ERROR".to_string()),
                        message: cached.error.unwrap_or_default(),
                    }
                } else {
                    QuoteReply::Quote {
                        out_amount: cached.out_amount,
                        price_impact_pct: cached.price_impact_pct,
                        payload: None,
                    }
                };
                return QuoteFetch {
                    reply,
                    from_cache: true,
                };
            }
        }

        let mut request = QuoteRequest::new(mint, self.output_mint, amount, SLIPPAGE_BPS);
        request.platform_fee_bps = Some(PLATFORM_FEE_BPS);
        request.restrict_intermediate_tokens = Some(true);
        request.max_accounts = Some(MAX_ACCOUNTS);

        let reply = match self.api.quote(&request).await {
            Ok(QuoteOutcome::Quote(payload)) => {
                self.cache.set(
                    &key,
                    &QuoteCacheData {
                        out_amount: payload.out_amount,
                        price_impact_pct: payload.price_impact_pct,
                        error: None,
                        error_code: None,
                    },
                );
                QuoteReply::Quote {
                    out_amount: payload.out_amount,
                    price_impact_pct: payload.price_impact_pct,
                    payload: Some(payload),
                }
            }
            Ok(QuoteOutcome::Rejected(rejection)) => {
                self.cache.set(
                    &key,
                    &QuoteCacheData {
                        out_amount: 0,
                        price_impact_pct: Decimal::ZERO,
                        error: Some(rejection.error.clone()),
                        error_code: Some(rejection.error_code.clone()),
                    },
                );
                QuoteReply::Rejected {
                    code: rejection.error_code,
                    message: rejection.error,
                }
            }
            Err(err) => {
                warn!(target: "sweeper::quotes", %mint, error = %err, "报价请求失败");
                QuoteReply::Unreachable {
                    message: err.to_string(),
                }
            }
        };

        QuoteFetch {
            reply,
            from_cache: false,
        }
    }
}

/// 把聚合器错误码翻译成给用户看的原因。
/// 错误信息里的子串匹配优先于错误码表，未知错误码退回通用文案。
pub fn user_facing_reason(code: &str, message: &str) -> String {
    let lowered = message.to_lowercase();
    if lowered.contains("insufficient") {
        return "Insufficient balance".to_string();
    }
    if lowered.contains("too small") {
        return "Amount too small".to_string();
    }

    match code {
        "TOKEN_NOT_TRADABLE" => "Not tradeable",
        "COULD_NOT_FIND_ANY_ROUTE" => "No liquidity",
        "NO_ROUTES_FOUND" => "No route found",
        "AMOUNT_TOO_SMALL" => "Amount too small",
        _ => "Cannot swap",
    }
    .to_string()
}

/// 批量报价收集器。
///
/// 严格串行：定价端点档位很低，绝不允许并发在途请求。每次
/// **未命中缓存**的调用之后等待限速器一次，再处理下一个代币。
/// 进度回调在每次尝试之前触发，计数从 1 开始。
pub async fn collect_quotes(
    service: &QuoteService,
    limiter: &RateLimiter,
    tokens: Vec<TokenBalance>,
    min_dust_value_sol: f64,
    mut progress: impl FnMut(usize, usize),
) -> Vec<QuotedToken> {
    let total = tokens.len();
    let mut quoted = Vec::with_capacity(total);

    for (index, token) in tokens.into_iter().enumerate() {
        progress(index + 1, total);

        let fetch = service.fetch(token.mint, token.amount, true).await;
        if !fetch.from_cache {
            limiter.wait().await;
        }

        match fetch.reply {
            QuoteReply::Quote {
                out_amount,
                price_impact_pct,
                ..
            } => {
                let out_ui = lamports_to_sol(out_amount);
                if out_ui < min_dust_value_sol {
                    // 不够覆盖回收成本的粉尘直接丢弃，连列表都不进。
                    debug!(
                        target: "sweeper::quotes",
                        mint = %token.mint,
                        out_ui,
                        min_dust_value_sol,
                        "低于粉尘阈值，跳过"
                    );
                    continue;
                }
                quoted.push(QuotedToken::tradeable(token, out_amount, price_impact_pct));
            }
            QuoteReply::Rejected { code, message } => {
                let reason = user_facing_reason(&code, &message);
                quoted.push(QuotedToken::untradeable(token, reason));
            }
            QuoteReply::Unreachable { message } => {
                // 网络错误不缓存；本次按换不动列出，重扫会再试。
                debug!(target: "sweeper::quotes", mint = %token.mint, message, "报价网络错误");
                quoted.push(QuotedToken::untradeable(
                    token,
                    user_facing_reason("NETWORK_ERROR", ""),
                ));
            }
        }
    }

    // 可交易的按估值降序排前，换不动的垫底。
    quoted.sort_by(|a, b| {
        b.tradeable.cmp(&a.tradeable).then(
            b.quote_out_amount_ui
                .partial_cmp(&a.quote_out_amount_ui)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    quoted
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    use crate::api::RejectionPayload;
    use crate::cache::DEFAULT_TTL_SECS;
    use crate::wallet::WSOL_MINT;

    use super::*;

    enum Scripted {
        Quote(u64),
        Reject(&'static str, &'static str),
        Network,
    }

    struct ScriptedApi {
        script: HashMap<Pubkey, Scripted>,
        calls: Mutex<Vec<Pubkey>>,
    }

    impl ScriptedApi {
        fn new(script: HashMap<Pubkey, Scripted>) -> Self {
            Self {
                script,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl QuoteApi for ScriptedApi {
        async fn quote(&self, request: &QuoteRequest) -> Result<QuoteOutcome, AggregatorError> {
            self.calls.lock().unwrap().push(request.input_mint);
            match self.script.get(&request.input_mint) {
                Some(Scripted::Quote(out_amount)) => {
                    let payload = QuotePayload::try_from_value(json!({
                        "inputMint": request.input_mint.to_string(),
                        "outputMint": request.output_mint.to_string(),
                        "inAmount": request.amount.to_string(),
                        "outAmount": out_amount.to_string(),
                        "priceImpactPct": "0.1",
                        "routePlan": []
                    }))
                    .expect("scripted quote");
                    Ok(QuoteOutcome::Quote(payload))
                }
                Some(Scripted::Reject(code, message)) => {
                    Ok(QuoteOutcome::Rejected(RejectionPayload {
                        error: message.to_string(),
                        error_code: code.to_string(),
                    }))
                }
                Some(Scripted::Network) | None => Err(AggregatorError::Schema(
                    "scripted network failure".to_string(),
                )),
            }
        }
    }

    fn token(mint: Pubkey, amount: u64, decimals: u8) -> TokenBalance {
        TokenBalance {
            mint,
            account: Pubkey::new_unique(),
            amount,
            decimals,
            ui_amount: amount as f64 / 10f64.powi(decimals as i32),
            symbol: None,
            name: None,
            logo_uri: None,
        }
    }

    fn service_with(
        dir: &TempDir,
        script: HashMap<Pubkey, Scripted>,
    ) -> (QuoteService, Arc<ScriptedApi>) {
        let api = Arc::new(ScriptedApi::new(script));
        let cache = CacheStore::new(
            dir.path().join("quotes.json"),
            Duration::from_secs(DEFAULT_TTL_SECS),
        );
        (
            QuoteService::new(api.clone(), cache, WSOL_MINT),
            api,
        )
    }

    fn fast_limiter() -> RateLimiter {
        RateLimiter::new(Duration::ZERO)
    }

    #[tokio::test]
    async fn sub_threshold_tokens_are_dropped_entirely() {
        let dir = TempDir::new().expect("tempdir");
        let dust = Pubkey::new_unique();
        let keeper = Pubkey::new_unique();
        let (service, _) = service_with(
            &dir,
            HashMap::from([
                (dust, Scripted::Quote(1_000_000)),  // 0.001 SOL < 0.002
                (keeper, Scripted::Quote(5_000_000)), // 0.005 SOL
            ]),
        );

        let quoted = collect_quotes(
            &service,
            &fast_limiter(),
            vec![token(dust, 1_000, 6), token(keeper, 1_000_000, 6)],
            0.002,
            |_, _| {},
        )
        .await;

        assert_eq!(quoted.len(), 1);
        assert_eq!(quoted[0].token.mint, keeper);
        assert!(quoted[0].tradeable);
        assert_eq!(quoted[0].quote_out_amount_ui, 0.005);
    }

    #[tokio::test]
    async fn order_is_tradeable_desc_then_untradeable() {
        let dir = TempDir::new().expect("tempdir");
        let small = Pubkey::new_unique();
        let large = Pubkey::new_unique();
        let dead = Pubkey::new_unique();
        let (service, _) = service_with(
            &dir,
            HashMap::from([
                (small, Scripted::Quote(500_000_000)),   // 0.5 SOL
                (large, Scripted::Quote(2_000_000_000)), // 2.0 SOL
                (dead, Scripted::Reject("NO_ROUTES_FOUND", "")),
            ]),
        );

        let quoted = collect_quotes(
            &service,
            &fast_limiter(),
            vec![
                token(small, 1, 0),
                token(dead, 1, 0),
                token(large, 1, 0),
            ],
            0.002,
            |_, _| {},
        )
        .await;

        assert_eq!(quoted.len(), 3);
        assert_eq!(quoted[0].token.mint, large);
        assert_eq!(quoted[1].token.mint, small);
        assert_eq!(quoted[2].token.mint, dead);
        assert!(!quoted[2].tradeable);
        assert!(!quoted[2].selected);
    }

    #[tokio::test]
    async fn progress_is_one_based_and_covers_every_token() {
        let dir = TempDir::new().expect("tempdir");
        let a = Pubkey::new_unique();
        let b = Pubkey::new_unique();
        let (service, _) = service_with(
            &dir,
            HashMap::from([
                (a, Scripted::Quote(5_000_000)),
                (b, Scripted::Quote(5_000_000)),
            ]),
        );

        let mut seen = Vec::new();
        collect_quotes(
            &service,
            &fast_limiter(),
            vec![token(a, 1, 0), token(b, 1, 0)],
            0.002,
            |current, total| seen.push((current, total)),
        )
        .await;

        assert_eq!(seen, vec![(1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn rejection_is_cached_and_replayed_without_api_call() {
        let dir = TempDir::new().expect("tempdir");
        let mint = Pubkey::new_unique();
        let (service, api) = service_with(
            &dir,
            HashMap::from([(mint, Scripted::Reject("TOKEN_NOT_TRADABLE", ""))]),
        );

        let first = service.fetch(mint, 42, true).await;
        assert!(!first.from_cache);
        assert!(matches!(first.reply, QuoteReply::Rejected { .. }));

        let second = service.fetch(mint, 42, true).await;
        assert!(second.from_cache);
        assert!(matches!(second.reply, QuoteReply::Rejected { .. }));
        assert_eq!(api.call_count(), 1);
    }

    #[tokio::test]
    async fn network_failure_is_not_cached() {
        let dir = TempDir::new().expect("tempdir");
        let mint = Pubkey::new_unique();
        let (service, api) = service_with(&dir, HashMap::from([(mint, Scripted::Network)]));

        let first = service.fetch(mint, 42, true).await;
        assert!(matches!(first.reply, QuoteReply::Unreachable { .. }));

        let second = service.fetch(mint, 42, true).await;
        assert!(!second.from_cache);
        assert!(matches!(second.reply, QuoteReply::Unreachable { .. }));
        assert_eq!(api.call_count(), 2);
    }

    #[tokio::test]
    async fn cache_bypass_always_hits_the_api() {
        let dir = TempDir::new().expect("tempdir");
        let mint = Pubkey::new_unique();
        let (service, api) = service_with(&dir, HashMap::from([(mint, Scripted::Quote(5_000_000))]));

        let cached = service.fetch(mint, 42, true).await;
        assert!(!cached.from_cache);
        let fresh = service.fetch(mint, 42, false).await;
        assert!(!fresh.from_cache);
        match fresh.reply {
            QuoteReply::Quote { payload, .. } => assert!(payload.is_some()),
            other => panic!("expected quote, got {other:?}"),
        }
        assert_eq!(api.call_count(), 2);
    }

    #[test]
    fn reason_substring_matches_take_precedence() {
        assert_eq!(
            user_facing_reason("TOKEN_NOT_TRADABLE", "Insufficient funds for swap"),
            "Insufficient balance"
        );
        assert_eq!(
            user_facing_reason("COULD_NOT_FIND_ANY_ROUTE", "amount TOO SMALL to route"),
            "Amount too small"
        );
    }

    #[test]
    fn reason_table_and_fallback() {
        assert_eq!(user_facing_reason("TOKEN_NOT_TRADABLE", ""), "Not tradeable");
        assert_eq!(user_facing_reason("COULD_NOT_FIND_ANY_ROUTE", ""), "No liquidity");
        assert_eq!(user_facing_reason("NO_ROUTES_FOUND", ""), "No route found");
        assert_eq!(user_facing_reason("AMOUNT_TOO_SMALL", ""), "Amount too small");
        assert_eq!(user_facing_reason("SOMETHING_ELSE", ""), "Cannot swap");
    }

    #[tokio::test]
    async fn end_to_end_threshold_example() {
        // 1_000_000 原始单位 / 6 位小数，报价 5_000_000 lamports = 0.005 SOL。
        let dir = TempDir::new().expect("tempdir");
        let mint = Pubkey::new_unique();
        let (service, _) = service_with(&dir, HashMap::from([(mint, Scripted::Quote(5_000_000))]));

        let quoted = collect_quotes(
            &service,
            &fast_limiter(),
            vec![token(mint, 1_000_000, 6)],
            0.002,
            |_, _| {},
        )
        .await;

        assert_eq!(quoted.len(), 1);
        assert!(quoted[0].tradeable);
        assert!(quoted[0].selected);
        assert_eq!(quoted[0].quote_out_amount_ui, 0.005);
    }
}
