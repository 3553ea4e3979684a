//! Configuration data structures for Stockgate.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde‑friendly and include defaults so that a minimal provider entry only needs a
//! base URL, an API key and a product id.
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::secret::SecretString;

/// Ordered parameter template: values are literals or strings with `{name}` tokens.
pub type ParamTemplate = BTreeMap<String, Value>;

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Shared secret for the proxy management endpoints. Management is disabled when unset.
    #[serde(default)]
    pub admin_secret: Option<SecretString>,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub proxy_pool: ProxyPoolConfig,
    /// Provider records keyed by the storefront input key.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_secret: None,
            upstream: UpstreamConfig::default(),
            proxy_pool: ProxyPoolConfig::default(),
            providers: HashMap::new(),
        }
    }
}

/// Outbound call budget.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Timeout of a single upstream attempt, e.g. "4s".
    pub request_timeout: String,
    /// Deadline for a whole resolve call across all candidates, e.g. "9s".
    pub call_deadline: String,
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout: "4s".to_string(),
            call_deadline: "9s".to_string(),
            user_agent: concat!("stockgate/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.request_timeout)
    }

    pub fn call_deadline(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.call_deadline)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ProxyPoolConfig {
    /// Egress proxies as `ip:port` or `ip:port:user:pass`.
    pub proxies: Vec<String>,
    pub health_check: ProxyHealthCheckConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyHealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// URL fetched through each proxy to measure liveness and latency.
    pub probe_url: String,
}

impl Default for ProxyHealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            timeout_secs: 5,
            probe_url: "https://api.ipify.org?format=json".to_string(),
        }
    }
}

/// HTTP method used for a supplier request.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    #[default]
    Get,
    Post,
    Put,
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestMethod::Get => f.write_str("GET"),
            RequestMethod::Post => f.write_str("POST"),
            RequestMethod::Put => f.write_str("PUT"),
        }
    }
}

/// A 2xx response only counts as a success when the value at `path` equals `equals`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SuccessCheck {
    pub path: String,
    pub equals: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RequestTemplate {
    /// Path appended to the base URL variant.
    pub path: String,
    #[serde(default)]
    pub method: RequestMethod,
    #[serde(default)]
    pub params: ParamTemplate,
    #[serde(default)]
    pub success: Option<SuccessCheck>,
}

impl RequestTemplate {
    /// `GET product.php?id={productId}`.
    pub fn default_stock() -> Self {
        let mut params = ParamTemplate::new();
        params.insert("id".to_string(), Value::from("{productId}"));
        Self {
            path: "product.php".to_string(),
            method: RequestMethod::Get,
            params,
            success: None,
        }
    }

    /// `POST buy_product` with `action=buyProduct`, requiring `status == "success"`.
    pub fn default_fetch() -> Self {
        let mut params = ParamTemplate::new();
        params.insert("action".to_string(), Value::from("buyProduct"));
        params.insert("id".to_string(), Value::from("{productId}"));
        params.insert("amount".to_string(), Value::from("{quantity}"));
        Self {
            path: "buy_product".to_string(),
            method: RequestMethod::Post,
            params,
            success: Some(SuccessCheck {
                path: "status".to_string(),
                equals: "success".to_string(),
            }),
        }
    }
}

fn default_stock_request() -> RequestTemplate {
    RequestTemplate::default_stock()
}

fn default_fetch_request() -> RequestTemplate {
    RequestTemplate::default_fetch()
}

fn default_stock_path() -> String {
    "data.stock||stock||sum".to_string()
}

fn default_fetch_path() -> String {
    "data||items".to_string()
}

/// One sellable credential/SKU at one upstream supplier. Read-only to the core.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(rename = "api_key")]
    pub credential_secret: SecretString,
    #[serde(rename = "product_id")]
    pub upstream_product_id: i64,
    /// Credential parameter name; every known convention is tried when absent.
    #[serde(default, rename = "credential_param")]
    pub preferred_credential_param: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_stock_request", rename = "stock")]
    pub stock_request: RequestTemplate,
    #[serde(default = "default_fetch_request", rename = "fetch")]
    pub fetch_request: RequestTemplate,
    #[serde(default = "default_stock_path", rename = "stock_path")]
    pub stock_path_expr: String,
    #[serde(default = "default_fetch_path", rename = "fetch_path")]
    pub fetch_path_expr: String,
}

impl ProviderConfig {
    /// A provider using the default supplier convention.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, product_id: i64) -> Self {
        Self {
            base_url: base_url.into(),
            credential_secret: SecretString::new(api_key.into()),
            upstream_product_id: product_id,
            preferred_credential_param: None,
            sku: None,
            active: true,
            stock_request: default_stock_request(),
            fetch_request: default_fetch_request(),
            stock_path_expr: default_stock_path(),
            fetch_path_expr: default_fetch_path(),
        }
    }
}
