//! Stock/fetch facade used by the storefront HTTP layer.
//!
//! Every adapter failure degrades to the uniform empty answer (`{"sum": 0}` or `[]`);
//! storefront callers treat any non-2xx as an outage.
use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::ProviderConfig,
    core::adapter::{AdapterError, CallContext, Operation, ProviderAdapter},
    metrics,
    tracing_setup::create_resolve_span,
};

/// Storefront stock answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockResponse {
    pub sum: i64,
}

/// One delivered unit, opaque to the storefront.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedProduct {
    pub product: String,
}

pub struct StockService {
    adapter: Arc<ProviderAdapter>,
    call_deadline: Duration,
}

impl StockService {
    pub fn new(adapter: Arc<ProviderAdapter>, call_deadline: Duration) -> Self {
        Self {
            adapter,
            call_deadline,
        }
    }

    pub fn adapter(&self) -> &Arc<ProviderAdapter> {
        &self.adapter
    }

    pub async fn resolve_stock(&self, input_key: &str, cfg: &ProviderConfig) -> StockResponse {
        self.resolve_stock_with_token(input_key, cfg, CancellationToken::new())
            .await
    }

    /// Like [`resolve_stock`](Self::resolve_stock); cancelling `cancel` stops further
    /// upstream attempts.
    pub async fn resolve_stock_with_token(
        &self,
        input_key: &str,
        cfg: &ProviderConfig,
        cancel: CancellationToken,
    ) -> StockResponse {
        let ctx = CallContext::with_token(self.call_deadline, cancel);
        let span = resolve_span(Operation::Stock, input_key);

        async {
            let result = self.adapter.resolve_stock(cfg, &ctx).await;
            record_outcome(Operation::Stock, &result);
            // Negative supplier counts are reported as out of stock.
            let sum = result.map(|sum| sum.max(0)).unwrap_or(0);
            tracing::info!(sum, "Stock resolved");
            StockResponse { sum }
        }
        .instrument(span)
        .await
    }

    pub async fn resolve_fetch(
        &self,
        input_key: &str,
        cfg: &ProviderConfig,
        quantity: u32,
    ) -> Vec<FetchedProduct> {
        self.resolve_fetch_with_token(input_key, cfg, quantity, CancellationToken::new())
            .await
    }

    pub async fn resolve_fetch_with_token(
        &self,
        input_key: &str,
        cfg: &ProviderConfig,
        quantity: u32,
        cancel: CancellationToken,
    ) -> Vec<FetchedProduct> {
        let ctx = CallContext::with_token(self.call_deadline, cancel);
        let span = resolve_span(Operation::Fetch, input_key);

        async {
            let result = self.adapter.resolve_fetch(cfg, quantity, &ctx).await;
            record_outcome(Operation::Fetch, &result);
            let products: Vec<FetchedProduct> = result
                .unwrap_or_default()
                .into_iter()
                .map(|product| FetchedProduct { product })
                .collect();
            if products.len() != quantity as usize {
                tracing::warn!(
                    requested = quantity,
                    delivered = products.len(),
                    "Supplier delivered a different number of products than requested"
                );
            }
            tracing::info!(delivered = products.len(), "Fetch resolved");
            products
        }
        .instrument(span)
        .await
    }
}

fn resolve_span(operation: Operation, input_key: &str) -> tracing::Span {
    let request_id = Uuid::new_v4().to_string();
    create_resolve_span(operation.as_str(), input_key, &request_id)
}

fn record_outcome<T>(operation: Operation, result: &Result<T, AdapterError>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(AdapterError::Unreachable { .. }) => "unreachable",
        Err(AdapterError::DeadlineExceeded { .. }) => "deadline",
        Err(AdapterError::Cancelled { .. }) => "cancelled",
    };
    let span = tracing::Span::current();
    span.record("outcome", outcome);
    if let Err(error) = result {
        span.record("attempts", attempts_of(error));
        tracing::warn!("Resolve degraded to empty result: {}", error);
    }
    metrics::increment_resolve_total(operation.as_str(), outcome);
}

fn attempts_of(error: &AdapterError) -> usize {
    match error {
        AdapterError::Unreachable { attempts, .. }
        | AdapterError::DeadlineExceeded { attempts }
        | AdapterError::Cancelled { attempts } => *attempts,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        core::{
            proxy::{ProbeOutcome, ProxyAddress},
            proxy_pool::ProxyPool,
        },
        ports::http_client::{AttemptError, AttemptResult, HttpExecutor, UpstreamRequest},
    };

    /// Answers every attempt with the same result.
    struct FixedExecutor {
        result: AttemptResult,
        calls: Mutex<usize>,
        delay: Option<Duration>,
    }

    impl FixedExecutor {
        fn new(result: AttemptResult) -> Self {
            Self {
                result,
                calls: Mutex::new(0),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl HttpExecutor for FixedExecutor {
        async fn execute(&self, _request: &UpstreamRequest) -> AttemptResult {
            *self.calls.lock().unwrap() += 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.result.clone()
        }

        async fn probe_proxy(&self, _: &ProxyAddress, _: &str, _: Duration) -> ProbeOutcome {
            ProbeOutcome::Dead
        }
    }

    fn service(executor: FixedExecutor) -> StockService {
        let adapter = ProviderAdapter::new(Arc::new(executor), Arc::new(ProxyPool::new()));
        StockService::new(Arc::new(adapter), Duration::from_secs(5))
    }

    fn upstream_500() -> AttemptResult {
        Err(AttemptError::Upstream {
            url: "https://s.example/product.php".to_string(),
            status: Some(500),
            message: "Internal Server Error".to_string(),
        })
    }

    fn provider() -> ProviderConfig {
        ProviderConfig::new("https://s.example", "k", 9)
    }

    #[tokio::test]
    async fn test_stock_success() {
        let service = service(FixedExecutor::new(Ok(json!({"data": {"stock": "5,000"}}))));
        let response = service.resolve_stock("sku", &provider()).await;
        assert_eq!(response, StockResponse { sum: 5000 });
        assert_eq!(serde_json::to_value(response).unwrap(), json!({"sum": 5000}));
    }

    #[tokio::test]
    async fn test_stock_negative_is_clamped() {
        let service = service(FixedExecutor::new(Ok(json!({"stock": -3}))));
        assert_eq!(service.resolve_stock("sku", &provider()).await.sum, 0);
    }

    #[tokio::test]
    async fn test_unreachable_degrades_to_zero_and_empty() {
        let service = service(FixedExecutor::new(upstream_500()));
        assert_eq!(service.resolve_stock("sku", &provider()).await.sum, 0);
        assert!(service.resolve_fetch("sku", &provider(), 3).await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_scalar_is_replicated() {
        let service = service(FixedExecutor::new(Ok(
            json!({"status": "success", "data": "user:pass"}),
        )));
        let products = service.resolve_fetch("sku", &provider(), 3).await;
        assert_eq!(products.len(), 3);
        assert!(products.iter().all(|p| p.product == "user:pass"));
        assert_eq!(
            serde_json::to_value(&products[0]).unwrap(),
            json!({"product": "user:pass"})
        );
    }

    #[tokio::test]
    async fn test_fetch_rejected_by_success_marker_is_empty() {
        let service = service(FixedExecutor::new(Ok(
            json!({"status": "error", "data": ["a"]}),
        )));
        assert!(service.resolve_fetch("sku", &provider(), 1).await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_empty() {
        let service = service(FixedExecutor::new(Ok(Value::from(1))));
        let token = CancellationToken::new();
        token.cancel();
        let response = service
            .resolve_stock_with_token("sku", &provider(), token)
            .await;
        assert_eq!(response.sum, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_the_call() {
        let mut executor = FixedExecutor::new(Ok(json!({"stock": 5})));
        executor.delay = Some(Duration::from_secs(60));
        let service = service(executor);
        let response = service.resolve_stock("sku", &provider()).await;
        assert_eq!(response.sum, 0);
    }
}
