use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::{ParamTemplate, RequestMethod},
    core::{
        proxy::{ProbeOutcome, ProxyAddress},
        secret::SecretString,
    },
};

/// Failure of a single upstream attempt.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum AttemptError {
    /// Connection, CONNECT or TLS failure attributable to the egress proxy
    #[error("Proxy transport error via {proxy}: {message}")]
    ProxyTransport {
        /// `host:port` of the proxy that carried the attempt
        proxy: String,
        message: String,
    },

    /// Non-2xx status, malformed body, or a response the supplier marked as failed
    #[error("Upstream error from {url} (status {status:?}): {message}")]
    Upstream {
        url: String,
        status: Option<u16>,
        message: String,
    },

    /// Timeout, DNS or direct connection failure
    #[error("Network error reaching {url}: {message}")]
    GenericNetwork { url: String, message: String },
}

impl AttemptError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptError::ProxyTransport { .. } => "proxy_transport",
            AttemptError::Upstream { .. } => "upstream",
            AttemptError::GenericNetwork { .. } => "network",
        }
    }
}

/// Outcome of one attempt: the normalized body or the classified failure.
pub type AttemptResult = Result<Value, AttemptError>;

/// One fully-rendered supplier request.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: RequestMethod,
    /// Base URL variant joined with the template path, without query string.
    pub url: String,
    pub params: ParamTemplate,
    pub credential_param: String,
    pub credential: SecretString,
}

/// HttpExecutor is the port for talking to suppliers through the proxy pool.
#[async_trait]
pub trait HttpExecutor: Send + Sync + 'static {
    /// Perform one attempt using the pool's selection at call time.
    ///
    /// GET sends `params` (plus the credential) as the query string, POST/PUT as a
    /// form body. A successful body is decoded as JSON, or as `{"sum": n}` when it is
    /// a bare integer.
    async fn execute(&self, request: &UpstreamRequest) -> AttemptResult;

    /// Fetch `probe_url` through `proxy` and report liveness with latency.
    async fn probe_proxy(
        &self,
        proxy: &ProxyAddress,
        probe_url: &str,
        timeout: Duration,
    ) -> ProbeOutcome;
}
