//! Provider adapter: the candidate/retry engine behind stock and fetch.
//!
//! For one provider record it renders the operation's parameter template, walks the
//! endpoint × credential-name candidates, and returns the first successful body run
//! through the operation's path expression. Per candidate:
//!
//! * success → done, remaining candidates are skipped
//! * proxy transport failure → the pool promotes another proxy and the same candidate
//!   is retried, at most [`MAX_ATTEMPTS_PER_CANDIDATE`] attempts in total
//! * any other failure → next candidate
//!
//! The loop stops issuing attempts once the call deadline passes or the caller
//! cancels, even mid-loop.
use std::{sync::Arc, time::Duration};

use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ProviderConfig, RequestTemplate, SuccessCheck},
    core::{
        candidates::candidates,
        path_extractor::{extract, extract_count},
        proxy_pool::ProxyPool,
        template::{CREDENTIAL, PRODUCT_ID, QUANTITY, Substitutions, param_to_string, render},
    },
    metrics,
    ports::http_client::{AttemptError, AttemptResult, HttpExecutor, UpstreamRequest},
};

/// One proxy failover per candidate.
pub const MAX_ATTEMPTS_PER_CANDIDATE: usize = 2;

/// Terminal failures of a resolve call.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum AdapterError {
    /// Every candidate failed
    #[error("Provider unreachable after {attempts} attempts: {last_error}")]
    Unreachable { attempts: usize, last_error: String },

    /// The call deadline passed before a candidate succeeded
    #[error("Call deadline exceeded after {attempts} attempts")]
    DeadlineExceeded { attempts: usize },

    /// The caller abandoned the call
    #[error("Call cancelled after {attempts} attempts")]
    Cancelled { attempts: usize },
}

/// The two normalized operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Stock,
    Fetch,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Stock => "stock",
            Operation::Fetch => "fetch",
        }
    }
}

/// Deadline and cancellation signal threaded through one resolve call.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(budget: Duration) -> Self {
        Self::with_token(budget, CancellationToken::new())
    }

    pub fn with_token(budget: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + budget,
            cancel,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn check(&self, attempts: usize) -> Result<(), AdapterError> {
        if self.cancel.is_cancelled() {
            return Err(AdapterError::Cancelled { attempts });
        }
        if Instant::now() >= self.deadline {
            return Err(AdapterError::DeadlineExceeded { attempts });
        }
        Ok(())
    }
}

/// Orchestrates candidates, attempts and proxy failover for one provider at a time.
pub struct ProviderAdapter {
    executor: Arc<dyn HttpExecutor>,
    pool: Arc<ProxyPool>,
}

impl ProviderAdapter {
    pub fn new(executor: Arc<dyn HttpExecutor>, pool: Arc<ProxyPool>) -> Self {
        Self { executor, pool }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Stock count for `cfg`. A successful response without a usable count is `0`.
    pub async fn resolve_stock(
        &self,
        cfg: &ProviderConfig,
        ctx: &CallContext,
    ) -> Result<i64, AdapterError> {
        let values = Self::substitutions(cfg, 1);
        let body = self
            .call(Operation::Stock, cfg, &cfg.stock_request, &values, ctx)
            .await?;
        Ok(extract_count(&body, &cfg.stock_path_expr).unwrap_or(0))
    }

    /// Buy `quantity` units and return one opaque payload per unit the supplier returned.
    pub async fn resolve_fetch(
        &self,
        cfg: &ProviderConfig,
        quantity: u32,
        ctx: &CallContext,
    ) -> Result<Vec<String>, AdapterError> {
        let values = Self::substitutions(cfg, quantity);
        let body = self
            .call(Operation::Fetch, cfg, &cfg.fetch_request, &values, ctx)
            .await?;
        Ok(products_from(
            extract(&body, &cfg.fetch_path_expr),
            quantity,
        ))
    }

    fn substitutions(cfg: &ProviderConfig, quantity: u32) -> Substitutions {
        Substitutions::new()
            .with(CREDENTIAL, cfg.credential_secret.expose_secret())
            .with(PRODUCT_ID, cfg.upstream_product_id)
            .with(QUANTITY, quantity)
    }

    async fn call(
        &self,
        operation: Operation,
        cfg: &ProviderConfig,
        template: &RequestTemplate,
        values: &Substitutions,
        ctx: &CallContext,
    ) -> Result<Value, AdapterError> {
        let params = render(&template.params, values);
        let mut attempts = 0;
        let mut last_error: Option<AttemptError> = None;

        for candidate in candidates(&cfg.base_url, cfg.preferred_credential_param.as_deref()) {
            let request = UpstreamRequest {
                method: template.method,
                url: candidate.url_for(&template.path),
                params: params.clone(),
                credential_param: candidate.credential_param.clone(),
                credential: cfg.credential_secret.clone(),
            };

            for attempt in 1..=MAX_ATTEMPTS_PER_CANDIDATE {
                ctx.check(attempts)?;
                attempts += 1;

                let outcome = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        return Err(AdapterError::Cancelled { attempts });
                    }
                    _ = tokio::time::sleep_until(ctx.deadline) => {
                        return Err(AdapterError::DeadlineExceeded { attempts });
                    }
                    outcome = self.executor.execute(&request) => outcome,
                };
                let outcome =
                    outcome.and_then(|body| check_success(template.success.as_ref(), body, &request.url));

                match outcome {
                    Ok(body) => {
                        metrics::increment_upstream_attempt(operation.as_str(), "success");
                        tracing::debug!(
                            url = %request.url,
                            credential_param = %request.credential_param,
                            attempts,
                            "Upstream attempt succeeded"
                        );
                        return Ok(body);
                    }
                    Err(AttemptError::ProxyTransport { proxy, message }) => {
                        metrics::increment_upstream_attempt(operation.as_str(), "proxy_transport");
                        metrics::increment_proxy_failover();
                        tracing::warn!(
                            url = %request.url,
                            proxy = %proxy,
                            attempt,
                            "Proxy transport failure, failing over: {}",
                            message
                        );
                        self.pool.promote_next_live(Some(&proxy));
                        last_error = Some(AttemptError::ProxyTransport { proxy, message });
                    }
                    Err(error) => {
                        metrics::increment_upstream_attempt(operation.as_str(), error.kind());
                        tracing::debug!(
                            url = %request.url,
                            credential_param = %request.credential_param,
                            "Upstream attempt failed: {}",
                            error
                        );
                        last_error = Some(error);
                        break;
                    }
                }
            }
        }

        let last_error = last_error
            .map(|error| error.to_string())
            .unwrap_or_else(|| "no candidates".to_string());
        tracing::warn!(
            operation = operation.as_str(),
            attempts,
            "All upstream candidates exhausted: {}",
            last_error
        );
        Err(AdapterError::Unreachable {
            attempts,
            last_error,
        })
    }
}

/// A 2xx body only counts when the configured success marker matches.
fn check_success(check: Option<&SuccessCheck>, body: Value, url: &str) -> AttemptResult {
    let Some(check) = check else {
        return Ok(body);
    };
    match extract(&body, &check.path) {
        Some(value) if param_to_string(&value) == check.equals => Ok(body),
        other => Err(AttemptError::Upstream {
            url: url.to_string(),
            status: None,
            message: format!(
                "supplier rejected request: {} = {}",
                check.path,
                other.map_or_else(|| "missing".to_string(), |value| value.to_string())
            ),
        }),
    }
}

/// Turn the extracted fetch value into product payloads.
///
/// A sequence yields one payload per non-null element. A single scalar or object is
/// the supplier's exemplar for the whole batch and is repeated `quantity` times.
pub fn products_from(extracted: Option<Value>, quantity: u32) -> Vec<String> {
    match extracted {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .filter(|item| !item.is_null())
            .map(product_payload)
            .collect(),
        Some(single) => {
            let payload = product_payload(&single);
            vec![payload; quantity as usize]
        }
    }
}

fn product_payload(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::core::proxy::{ProbeOutcome, ProxyAddress, ProxySelection};

    /// Replays scripted outcomes and records every request it sees.
    struct ScriptedExecutor {
        script: Mutex<VecDeque<AttemptResult>>,
        fallback: AttemptResult,
        seen: Mutex<Vec<(UpstreamRequest, String)>>,
        pool: Arc<ProxyPool>,
        delay: Option<Duration>,
    }

    impl ScriptedExecutor {
        fn new(pool: Arc<ProxyPool>, script: Vec<AttemptResult>, fallback: AttemptResult) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                seen: Mutex::new(Vec::new()),
                pool,
                delay: None,
            }
        }

        fn seen(&self) -> Vec<(UpstreamRequest, String)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpExecutor for ScriptedExecutor {
        async fn execute(&self, request: &UpstreamRequest) -> AttemptResult {
            let selection = self.pool.current_selection().to_string();
            self.seen.lock().unwrap().push((request.clone(), selection));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }

        async fn probe_proxy(&self, _: &ProxyAddress, _: &str, _: Duration) -> ProbeOutcome {
            ProbeOutcome::Dead
        }
    }

    fn upstream_500() -> AttemptResult {
        Err(AttemptError::Upstream {
            url: "http://supplier".to_string(),
            status: Some(500),
            message: "internal error".to_string(),
        })
    }

    fn provider() -> ProviderConfig {
        let mut cfg = ProviderConfig::new("http://supplier.test", "secret-key", 77);
        cfg.stock_path_expr = "data.stock||stock".to_string();
        cfg
    }

    fn adapter_with(executor: Arc<ScriptedExecutor>, pool: Arc<ProxyPool>) -> ProviderAdapter {
        ProviderAdapter::new(executor, pool)
    }

    fn ctx() -> CallContext {
        CallContext::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_stock_grouped_string_is_coerced() {
        let pool = Arc::new(ProxyPool::new());
        let executor = Arc::new(ScriptedExecutor::new(
            pool.clone(),
            vec![Ok(json!({"data": {"stock": "5,000"}}))],
            upstream_500(),
        ));
        let adapter = adapter_with(executor.clone(), pool);

        assert_eq!(adapter.resolve_stock(&provider(), &ctx()).await, Ok(5000));

        let seen = executor.seen();
        assert_eq!(seen.len(), 1);
        let request = &seen[0].0;
        assert_eq!(request.url, "http://supplier.test/product.php");
        assert_eq!(request.credential_param, "api_key");
        assert_eq!(request.params.get("id"), Some(&json!("77")));
    }

    #[tokio::test]
    async fn test_stock_extraction_miss_is_zero() {
        let pool = Arc::new(ProxyPool::new());
        let executor = Arc::new(ScriptedExecutor::new(
            pool.clone(),
            vec![Ok(json!({"message": "ok"}))],
            upstream_500(),
        ));
        let adapter = adapter_with(executor, pool);
        assert_eq!(adapter.resolve_stock(&provider(), &ctx()).await, Ok(0));
    }

    #[tokio::test]
    async fn test_all_candidates_failing_is_unreachable() {
        let pool = Arc::new(ProxyPool::new());
        let executor = Arc::new(ScriptedExecutor::new(pool.clone(), vec![], upstream_500()));
        let adapter = adapter_with(executor.clone(), pool);

        let result = adapter.resolve_stock(&provider(), &ctx()).await;
        let expected = candidates("http://supplier.test", None).len();
        assert!(matches!(
            result,
            Err(AdapterError::Unreachable { attempts, .. }) if attempts == expected
        ));
        // Non-proxy failures never retry the same candidate.
        assert_eq!(executor.seen().len(), expected);
    }

    #[tokio::test]
    async fn test_first_success_skips_remaining_candidates() {
        let pool = Arc::new(ProxyPool::new());
        let executor = Arc::new(ScriptedExecutor::new(
            pool.clone(),
            vec![upstream_500(), upstream_500(), Ok(json!({"stock": 3}))],
            upstream_500(),
        ));
        let adapter = adapter_with(executor.clone(), pool);

        assert_eq!(adapter.resolve_stock(&provider(), &ctx()).await, Ok(3));
        let params: Vec<String> = executor
            .seen()
            .into_iter()
            .map(|(request, _)| request.credential_param)
            .collect();
        assert_eq!(params, vec!["api_key", "apikey", "key"]);
    }

    #[tokio::test]
    async fn test_proxy_failure_fails_over_and_retries_same_candidate() {
        let pool = Arc::new(ProxyPool::from_addresses(&["1.1.1.1:80", "2.2.2.2:80"]).unwrap());
        for (address, millis) in [("1.1.1.1:80", 10), ("2.2.2.2:80", 20)] {
            pool.record_probe(
                &ProxyAddress::new(address).unwrap(),
                ProbeOutcome::Live(Duration::from_millis(millis)),
            );
        }
        pool.ensure_selection();

        let executor = Arc::new(ScriptedExecutor::new(
            pool.clone(),
            vec![
                Err(AttemptError::ProxyTransport {
                    proxy: "1.1.1.1:80".to_string(),
                    message: "CONNECT refused".to_string(),
                }),
                Ok(json!({"stock": 11})),
            ],
            upstream_500(),
        ));
        let adapter = adapter_with(executor.clone(), pool.clone());

        assert_eq!(adapter.resolve_stock(&provider(), &ctx()).await, Ok(11));

        let seen = executor.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0.url, seen[1].0.url);
        assert_eq!(seen[0].0.credential_param, seen[1].0.credential_param);
        assert_eq!(seen[0].1, "1.1.1.1:80");
        assert_eq!(seen[1].1, "2.2.2.2:80");
        assert_ne!(
            pool.current_selection().address().map(ProxyAddress::endpoint).as_deref(),
            Some("1.1.1.1:80")
        );
    }

    #[tokio::test]
    async fn test_proxy_failures_bounded_per_candidate() {
        let pool = Arc::new(ProxyPool::new());
        let proxy_error = Err(AttemptError::ProxyTransport {
            proxy: "1.1.1.1:80".to_string(),
            message: "tls handshake".to_string(),
        });
        let executor = Arc::new(ScriptedExecutor::new(pool.clone(), vec![], proxy_error));
        let mut cfg = provider();
        cfg.base_url = "http://supplier.test/api".to_string();
        cfg.preferred_credential_param = Some("token".to_string());
        let adapter = adapter_with(executor.clone(), pool.clone());

        let result = adapter.resolve_stock(&cfg, &ctx()).await;
        assert!(matches!(
            result,
            Err(AdapterError::Unreachable { attempts: MAX_ATTEMPTS_PER_CANDIDATE, .. })
        ));
        assert_eq!(*pool.current_selection(), ProxySelection::Direct);
    }

    #[tokio::test]
    async fn test_fetch_list_and_structured_items() {
        let pool = Arc::new(ProxyPool::new());
        let executor = Arc::new(ScriptedExecutor::new(
            pool.clone(),
            vec![Ok(json!({
                "status": "success",
                "data": ["a|b", {"user": "u1"}, null]
            }))],
            upstream_500(),
        ));
        let adapter = adapter_with(executor.clone(), pool);

        let products = adapter.resolve_fetch(&provider(), 2, &ctx()).await.unwrap();
        assert_eq!(products, vec![
            "a|b".to_string(),
            r#"{"user":"u1"}"#.to_string()
        ]);

        let request = &executor.seen()[0].0;
        assert_eq!(request.url, "http://supplier.test/buy_product");
        assert_eq!(request.params.get("amount"), Some(&json!("2")));
        assert_eq!(request.params.get("action"), Some(&json!("buyProduct")));
    }

    #[tokio::test]
    async fn test_fetch_scalar_is_replicated() {
        let pool = Arc::new(ProxyPool::new());
        let executor = Arc::new(ScriptedExecutor::new(
            pool.clone(),
            vec![Ok(json!({"status": "success", "data": "acc:pw"}))],
            upstream_500(),
        ));
        let adapter = adapter_with(executor, pool);

        let products = adapter.resolve_fetch(&provider(), 3, &ctx()).await.unwrap();
        assert_eq!(products, vec!["acc:pw"; 3]);
    }

    #[tokio::test]
    async fn test_fetch_rejected_by_supplier_moves_on() {
        let pool = Arc::new(ProxyPool::new());
        let executor = Arc::new(ScriptedExecutor::new(
            pool.clone(),
            vec![
                Ok(json!({"status": "error", "msg": "wrong key"})),
                Ok(json!({"status": "success", "data": ["x"]})),
            ],
            upstream_500(),
        ));
        let adapter = adapter_with(executor.clone(), pool);

        let products = adapter.resolve_fetch(&provider(), 1, &ctx()).await.unwrap();
        assert_eq!(products, vec!["x"]);
        assert_eq!(executor.seen()[1].0.credential_param, "apikey");
    }

    #[tokio::test]
    async fn test_cancelled_call_issues_no_attempts() {
        let pool = Arc::new(ProxyPool::new());
        let executor = Arc::new(ScriptedExecutor::new(pool.clone(), vec![], upstream_500()));
        let adapter = adapter_with(executor.clone(), pool);

        let token = CancellationToken::new();
        token.cancel();
        let ctx = CallContext::with_token(Duration::from_secs(5), token);

        let result = adapter.resolve_stock(&provider(), &ctx).await;
        assert_eq!(result, Err(AdapterError::Cancelled { attempts: 0 }));
        assert!(executor.seen().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons_in_flight_attempt() {
        let pool = Arc::new(ProxyPool::new());
        let mut executor = ScriptedExecutor::new(pool.clone(), vec![], upstream_500());
        executor.delay = Some(Duration::from_secs(3));
        let executor = Arc::new(executor);
        let adapter = adapter_with(executor.clone(), pool);

        let ctx = CallContext::new(Duration::from_secs(5));
        let result = adapter.resolve_stock(&provider(), &ctx).await;

        assert_eq!(result, Err(AdapterError::DeadlineExceeded { attempts: 2 }));
        assert_eq!(executor.seen().len(), 2);
    }

    #[test]
    fn test_products_from_edge_cases() {
        assert!(products_from(None, 5).is_empty());
        assert!(products_from(Some(Value::Null), 5).is_empty());
        assert_eq!(products_from(Some(json!(42)), 2), vec!["42", "42"]);
        assert_eq!(
            products_from(Some(json!({"k": "v"})), 2),
            vec![r#"{"k":"v"}"#, r#"{"k":"v"}"#]
        );
        assert!(products_from(Some(json!([])), 3).is_empty());
    }

    #[test]
    fn test_check_success_exact_match() {
        let check = SuccessCheck {
            path: "status".to_string(),
            equals: "success".to_string(),
        };
        assert!(check_success(Some(&check), json!({"status": "success"}), "u").is_ok());
        assert!(check_success(Some(&check), json!({"status": "SUCCESS"}), "u").is_err());
        assert!(check_success(Some(&check), json!({"status": " success"}), "u").is_err());

        let numeric = SuccessCheck {
            path: "code".to_string(),
            equals: "1".to_string(),
        };
        assert!(check_success(Some(&numeric), json!({"code": 1}), "u").is_ok());
        assert!(check_success(Some(&check), json!({"status": false}), "u").is_err());
        assert!(check_success(Some(&check), json!({}), "u").is_err());
        assert!(check_success(None, json!({}), "u").is_ok());
    }
}
