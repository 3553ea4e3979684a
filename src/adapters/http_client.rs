use std::{
    collections::HashMap,
    error::Error as StdError,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::Instrument;

use crate::{
    config::RequestMethod,
    core::{
        proxy::{ProbeOutcome, ProxyAddress, ProxySelection},
        proxy_pool::ProxyPool,
        template::param_to_string,
    },
    metrics::UpstreamRequestTimer,
    ports::http_client::{AttemptError, AttemptResult, HttpExecutor, UpstreamRequest},
};

/// HTTP call executor backed by `reqwest` (rustls).
///
/// Responsibilities:
/// * Reads the proxy pool's selection at call time and routes through it
/// * Keeps one client per egress route so connections are reused
/// * Classifies failures into proxy transport / upstream / network errors
/// * Normalizes bodies to JSON, accepting bare integers as `{"sum": n}`
///
/// Retrying and failover live in the provider adapter, not here.
pub struct ReqwestExecutor {
    pool: Arc<ProxyPool>,
    timeout: Duration,
    user_agent: String,
    clients: Mutex<HashMap<String, (ProxySelection, Client)>>,
}

impl ReqwestExecutor {
    pub fn new(pool: Arc<ProxyPool>, timeout: Duration, user_agent: impl Into<String>) -> Self {
        Self {
            pool,
            timeout,
            user_agent: user_agent.into(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn build_client(
        &self,
        proxy: Option<&ProxyAddress>,
        timeout: Duration,
    ) -> reqwest::Result<Client> {
        let builder = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(self.user_agent.clone());

        let builder = match proxy {
            Some(address) => {
                let mut proxy = reqwest::Proxy::all(address.proxy_url())?;
                if let Some((user, pass)) = address.credentials() {
                    proxy = proxy.basic_auth(user, pass);
                }
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };
        builder.build()
    }

    /// Cached client for the given route, rebuilt when the route's credentials change.
    /// Clients for proxies no longer in the pool are dropped.
    fn client_for(&self, selection: &ProxySelection) -> reqwest::Result<Client> {
        let key = selection.to_string();
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        // One slot per registered proxy plus direct.
        if clients.len() > self.pool.len() + 1 {
            let registered = self.pool.addresses();
            clients.retain(|_, (cached_for, _)| match cached_for.address() {
                Some(address) => registered.contains(address),
                None => true,
            });
        }
        if let Some((cached_for, client)) = clients.get(&key) {
            if cached_for == selection {
                return Ok(client.clone());
            }
        }
        let client = self.build_client(selection.address(), self.timeout)?;
        clients.insert(key, (selection.clone(), client.clone()));
        Ok(client)
    }

    async fn attempt(
        &self,
        request: &UpstreamRequest,
        selection: &ProxySelection,
        route: &str,
    ) -> AttemptResult {
        let proxy = selection.address();

        let client = self.client_for(selection).map_err(|e| match proxy {
            Some(address) => AttemptError::ProxyTransport {
                proxy: address.endpoint(),
                message: format!("cannot build proxied client: {}", error_chain(&e)),
            },
            None => AttemptError::GenericNetwork {
                url: request.url.clone(),
                message: format!("cannot build client: {}", error_chain(&e)),
            },
        })?;

        let params = Self::wire_params(request);
        let builder = match request.method {
            RequestMethod::Get => client.get(&request.url).query(&params),
            RequestMethod::Post => client.post(&request.url).form(&params),
            RequestMethod::Put => client.put(&request.url).form(&params),
        };

        let _timer = UpstreamRequestTimer::new(&request.method.to_string(), route);
        let response = builder
            .send()
            .await
            .map_err(|e| classify_send_error(e, proxy, &request.url))?;

        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());

        if let Some(address) = proxy {
            if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
                return Err(AttemptError::ProxyTransport {
                    proxy: address.endpoint(),
                    message: "proxy authentication required".to_string(),
                });
            }
        }
        if !status.is_success() {
            return Err(AttemptError::Upstream {
                url: request.url.clone(),
                status: Some(status.as_u16()),
                message: status
                    .canonical_reason()
                    .unwrap_or("non-success status")
                    .to_string(),
            });
        }

        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                AttemptError::GenericNetwork {
                    url: request.url.clone(),
                    message: "timed out reading body".to_string(),
                }
            } else {
                AttemptError::Upstream {
                    url: request.url.clone(),
                    status: Some(status.as_u16()),
                    message: format!("unreadable body: {}", error_chain(&e.without_url())),
                }
            }
        })?;

        decode_body(&text).map_err(|message| AttemptError::Upstream {
            url: request.url.clone(),
            status: Some(status.as_u16()),
            message,
        })
    }

    fn wire_params(request: &UpstreamRequest) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = request
            .params
            .iter()
            .filter(|(name, _)| **name != request.credential_param)
            .map(|(name, value)| (name.clone(), param_to_string(value)))
            .collect();
        params.push((
            request.credential_param.clone(),
            request.credential.expose_secret().to_string(),
        ));
        params
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: &UpstreamRequest) -> AttemptResult {
        let selection = self.pool.current_selection();
        let route = selection.to_string();

        let span = tracing::debug_span!(
            "upstream_attempt",
            http.method = %request.method,
            upstream.url = %request.url,
            credential_param = %request.credential_param,
            proxy = %route,
            http.status_code = tracing::field::Empty,
        );
        self.attempt(request, &selection, &route)
            .instrument(span)
            .await
    }

    async fn probe_proxy(
        &self,
        proxy: &ProxyAddress,
        probe_url: &str,
        timeout: Duration,
    ) -> ProbeOutcome {
        let client = match self.build_client(Some(proxy), timeout) {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!(proxy = %proxy, "Cannot build probe client: {}", error_chain(&e));
                return ProbeOutcome::Dead;
            }
        };

        let started = Instant::now();
        match client.get(probe_url).send().await {
            Ok(response) if response.status().is_success() => {
                let latency = started.elapsed();
                // Drain the body so the latency covers a full round trip.
                let _ = response.bytes().await;
                tracing::debug!(proxy = %proxy, latency_ms = latency.as_millis() as u64, "Proxy probe ok");
                ProbeOutcome::Live(latency)
            }
            Ok(response) => {
                tracing::debug!(proxy = %proxy, status = response.status().as_u16(), "Proxy probe rejected");
                ProbeOutcome::Dead
            }
            Err(e) => {
                tracing::debug!(proxy = %proxy, "Proxy probe failed: {}", error_chain(&e.without_url()));
                ProbeOutcome::Dead
            }
        }
    }
}

/// Map a transport-level `reqwest` failure onto the attempt taxonomy.
///
/// Only failures reaching the proxy itself blame it: refused or reset connections,
/// handshake failures and rejected proxy credentials. A CONNECT the proxy answered
/// with a non-2xx status means the supplier side is unreachable, so the candidate
/// fails instead. The URL is stripped from messages because GET query strings carry
/// the credential.
fn classify_send_error(
    error: reqwest::Error,
    proxy: Option<&ProxyAddress>,
    url: &str,
) -> AttemptError {
    let timed_out = error.is_timeout();
    let connect = error.is_connect();
    let message = error_chain(&error.without_url());

    match proxy {
        _ if timed_out => AttemptError::GenericNetwork {
            url: url.to_string(),
            message: format!("timed out: {message}"),
        },
        Some(_) if connect && is_rejected_tunnel(&message) => AttemptError::GenericNetwork {
            url: url.to_string(),
            message: format!("proxy could not reach supplier: {message}"),
        },
        Some(address) if connect => AttemptError::ProxyTransport {
            proxy: address.endpoint(),
            message,
        },
        _ => AttemptError::GenericNetwork {
            url: url.to_string(),
            message,
        },
    }
}

/// True when the proxy answered CONNECT with a non-2xx status (407 is reported apart).
fn is_rejected_tunnel(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("unsuccessful tunnel") || message.contains("tunnel unsuccessful")
}

fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Decode a 2xx body. A body that is only digits becomes `{"sum": n}`; anything else
/// must be JSON.
pub fn decode_body(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(sum) = trimmed.parse::<i64>() {
            return Ok(json!({ "sum": sum }));
        }
    }
    serde_json::from_str(trimmed).map_err(|e| format!("malformed response body: {e}"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::secret::SecretString;

    fn request(params: BTreeMap<String, Value>) -> UpstreamRequest {
        UpstreamRequest {
            method: RequestMethod::Get,
            url: "http://127.0.0.1:1/product.php".to_string(),
            params,
            credential_param: "api_key".to_string(),
            credential: SecretString::from("k"),
        }
    }

    #[test]
    fn test_decode_body_json() {
        assert_eq!(decode_body(r#"{"a":1}"#), Ok(json!({"a": 1})));
        assert_eq!(decode_body(" [1,2] "), Ok(json!([1, 2])));
    }

    #[test]
    fn test_decode_body_bare_digits() {
        assert_eq!(decode_body("123\n"), Ok(json!({"sum": 123})));
    }

    #[test]
    fn test_decode_body_malformed() {
        assert!(decode_body("").is_err());
        assert!(decode_body("<html>oops</html>").is_err());
        assert!(decode_body("5,000").is_err());
    }

    #[test]
    fn test_wire_params_credential_wins() {
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), json!("7"));
        params.insert("api_key".to_string(), json!("stale"));
        let wire = ReqwestExecutor::wire_params(&request(params));
        assert_eq!(
            wire,
            vec![
                ("id".to_string(), "7".to_string()),
                ("api_key".to_string(), "k".to_string())
            ]
        );
    }

    #[test]
    fn test_client_cache_reuses_route() {
        let executor = ReqwestExecutor::new(Arc::new(ProxyPool::new()), Duration::from_secs(1), "t");
        executor.client_for(&ProxySelection::Direct).unwrap();
        executor.client_for(&ProxySelection::Direct).unwrap();
        assert_eq!(executor.clients.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rejected_tunnel_detection() {
        assert!(is_rejected_tunnel(
            "error sending request: client error (Connect): unsuccessful tunnel"
        ));
        assert!(!is_rejected_tunnel(
            "error sending request: client error (Connect): tcp connect error: Connection refused (os error 111)"
        ));
        assert!(!is_rejected_tunnel(
            "client error (Connect): proxy authorization required"
        ));
    }

    #[test]
    fn test_client_cache_drops_removed_proxies() {
        let pool = Arc::new(ProxyPool::from_addresses(&["10.0.0.1:8080", "10.0.0.2:8080"]).unwrap());
        let executor = ReqwestExecutor::new(pool.clone(), Duration::from_secs(1), "t");
        for address in pool.addresses() {
            executor.client_for(&ProxySelection::Proxy(address)).unwrap();
        }
        executor.client_for(&ProxySelection::Direct).unwrap();
        assert_eq!(executor.clients.lock().unwrap().len(), 3);

        pool.remove("10.0.0.1:8080").unwrap();
        pool.remove("10.0.0.2:8080").unwrap();
        executor.client_for(&ProxySelection::Direct).unwrap();

        let clients = executor.clients.lock().unwrap();
        assert_eq!(clients.len(), 1);
        assert!(clients.contains_key("direct"));
    }

    #[tokio::test]
    async fn test_direct_connect_failure_is_network_error() {
        let executor = ReqwestExecutor::new(Arc::new(ProxyPool::new()), Duration::from_secs(2), "t");
        let result = executor.execute(&request(BTreeMap::new())).await;
        assert!(matches!(result, Err(AttemptError::GenericNetwork { .. })));
    }

    #[tokio::test]
    async fn test_probe_through_unreachable_proxy_is_dead() {
        let executor = ReqwestExecutor::new(Arc::new(ProxyPool::new()), Duration::from_secs(2), "t");
        let proxy = ProxyAddress::new("127.0.0.1:1").unwrap();
        let outcome = executor
            .probe_proxy(&proxy, "http://127.0.0.1:1/", Duration::from_secs(2))
            .await;
        assert_eq!(outcome, ProbeOutcome::Dead);
    }
}
