use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

pub mod error;
pub mod quote;
pub mod serde_helpers;
pub mod swap;

pub use error::AggregatorError;
pub use quote::{QuoteOutcome, QuotePayload, QuoteRequest, RejectionPayload};
pub use swap::{SwapRequest, SwapResponsePayload};

/// 聚合器 HTTP 客户端：`/quote` 走 GET 查询串，`/swap` 走 POST JSON。
#[derive(Clone, Debug)]
pub struct AggregatorApiClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl AggregatorApiClient {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            base_url,
            api_key,
            client,
            request_timeout,
        }
    }

    /// 请求一次报价。非成功状态码与显式错误负载都归为 `Rejected`，
    /// 只有传输层失败才以 `Err` 返回。
    pub async fn quote(&self, request: &QuoteRequest) -> Result<QuoteOutcome, AggregatorError> {
        let url = self.endpoint("/quote");
        let start = Instant::now();

        let response = self
            .with_headers(self.client.get(&url))
            .timeout(self.request_timeout)
            .query(&request.to_query_params())
            .send()
            .await?;

        let status = response.status();
        let value: Value = match response.json().await {
            Ok(value) => value,
            Err(err) if status.is_success() => {
                return Err(AggregatorError::Schema(format!("报价响应不是合法 JSON: {err}")));
            }
            // 非成功响应连 JSON 都不是：仍按拒绝处理，让上层缓存失败。
            Err(_) => {
                warn!(
                    target: "aggregator::quote",
                    input_mint = %request.input_mint,
                    %status,
                    "报价返回非 JSON 错误体"
                );
                return Ok(QuoteOutcome::Rejected(RejectionPayload {
                    error: format!("HTTP {status}"),
                    error_code: "HTTP_STATUS".to_string(),
                }));
            }
        };

        if !status.is_success() || value.get("error").is_some() {
            let rejection: RejectionPayload =
                serde_json::from_value(value.clone()).unwrap_or_else(|_| RejectionPayload {
                    error: format!("HTTP {status}"),
                    error_code: "HTTP_STATUS".to_string(),
                });
            warn!(
                target: "aggregator::quote",
                input_mint = %request.input_mint,
                code = %rejection.error_code,
                message = %rejection.error,
                "报价被聚合器拒绝"
            );
            return Ok(QuoteOutcome::Rejected(rejection));
        }

        let payload = QuotePayload::try_from_value(value)
            .map_err(|err| AggregatorError::Schema(format!("解析报价响应失败: {err}")))?;

        let elapsed_ms = start.elapsed().as_micros() as f64 / 1_000.0;
        debug!(
            target: "aggregator::quote",
            input_mint = %payload.input_mint,
            out_amount = payload.out_amount,
            price_impact_pct = %payload.price_impact_pct,
            elapsed_ms,
            "报价请求完成"
        );

        Ok(QuoteOutcome::Quote(payload))
    }

    /// 请求构建 swap 交易。非成功响应返回 `Ok(None)`，由调用方按
    /// 单项失败记录；传输层错误向上传播。
    pub async fn swap(
        &self,
        request: &SwapRequest,
    ) -> Result<Option<SwapResponsePayload>, AggregatorError> {
        let url = self.endpoint("/swap");
        let start = Instant::now();

        let response = self
            .with_headers(self.client.post(&url))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                target: "aggregator::swap",
                user = %request.user_public_key,
                %status,
                body,
                "swap 构建被拒绝"
            );
            return Ok(None);
        }

        let payload: SwapResponsePayload = response
            .json()
            .await
            .map_err(|err| AggregatorError::Schema(format!("解析 swap 响应失败: {err}")))?;

        let elapsed_ms = start.elapsed().as_micros() as f64 / 1_000.0;
        info!(
            target: "aggregator::swap",
            last_valid_block_height = payload.last_valid_block_height,
            elapsed_ms,
            "已获取 swap 交易"
        );

        Ok(Some(payload))
    }

    fn with_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => builder.header("x-api-key", key),
            _ => builder,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
