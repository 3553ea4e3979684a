use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::metrics::set_proxy_live_status;

/// Errors related to proxy registration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProxyError {
    /// Error when the proxy string is malformed
    #[error("Invalid proxy address '{0}': expected ip:port or ip:port:user:pass")]
    InvalidAddress(String),

    /// Error when the proxy endpoint is already registered
    #[error("Proxy {0} is already registered")]
    AlreadyRegistered(String),

    /// Error when the proxy endpoint is not registered
    #[error("Proxy {0} is not registered")]
    NotRegistered(String),
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

/// A parsed egress proxy string (`ip:port` or `ip:port:user:pass`).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProxyAddress {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
}

impl ProxyAddress {
    pub fn new(address: &str) -> ProxyResult<Self> {
        let invalid = || ProxyError::InvalidAddress(address.to_string());
        let parts: Vec<&str> = address.trim().split(':').collect();

        let (host, port, credentials) = match parts.as_slice() {
            [host, port] => (*host, *port, None),
            [host, port, user, pass] => (*host, *port, Some((user.to_string(), pass.to_string()))),
            _ => return Err(invalid()),
        };

        if host.is_empty() || host.contains('/') {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        if credentials.as_ref().is_some_and(|(user, _)| user.is_empty()) {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
            credentials,
        })
    }

    /// `host:port`, the identity of a proxy inside the pool.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URL handed to the HTTP client (`http://host:port`).
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.credentials
            .as_ref()
            .map(|(user, pass)| (user.as_str(), pass.as_str()))
    }

    /// True when `address` names this proxy, either as `host:port` or as the full string.
    pub fn matches(&self, address: &str) -> bool {
        let address = address.trim();
        address == self.endpoint()
            || ProxyAddress::new(address).is_ok_and(|other| other.endpoint() == self.endpoint())
    }
}

impl FromStr for ProxyAddress {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProxyAddress::new(s)
    }
}

/// Never prints the password.
impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.credentials {
            Some((user, _)) => write!(f, "{}:{}:{}:***", self.host, self.port, user),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl fmt::Debug for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProxyAddress({self})")
    }
}

impl Serialize for ProxyAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Liveness of a proxy: Unknown → Live ⇄ Dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    Unknown,
    Live,
    Dead,
}

/// Result of one liveness probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Live(Duration),
    Dead,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyRecord {
    pub address: ProxyAddress,
    pub state: ProxyState,
    #[serde(serialize_with = "serialize_latency")]
    pub latency: Option<Duration>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

fn serialize_latency<S: Serializer>(
    latency: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match latency {
        Some(latency) => serializer.serialize_some(&latency.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

impl ProxyRecord {
    pub fn new(address: ProxyAddress) -> Self {
        Self {
            address,
            state: ProxyState::Unknown,
            latency: None,
            last_checked_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state == ProxyState::Live
    }

    pub fn apply_probe(&mut self, outcome: ProbeOutcome) {
        match outcome {
            ProbeOutcome::Live(latency) => {
                self.state = ProxyState::Live;
                self.latency = Some(latency);
            }
            ProbeOutcome::Dead => self.state = ProxyState::Dead,
        }
        self.last_checked_at = Some(Utc::now());
        set_proxy_live_status(&self.address.endpoint(), self.is_live());
    }

    /// In-band demotion after a proxy transport failure.
    pub fn mark_dead(&mut self) {
        self.state = ProxyState::Dead;
        self.last_checked_at = Some(Utc::now());
        set_proxy_live_status(&self.address.endpoint(), false);
    }

    /// Sort key for selection; unmeasured latency sorts last.
    pub fn latency_key(&self) -> Duration {
        self.latency.unwrap_or(Duration::MAX)
    }
}

/// The egress route every outbound call uses at a given moment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProxySelection {
    #[default]
    Direct,
    Proxy(ProxyAddress),
}

impl ProxySelection {
    pub fn address(&self) -> Option<&ProxyAddress> {
        match self {
            ProxySelection::Direct => None,
            ProxySelection::Proxy(address) => Some(address),
        }
    }
}

impl fmt::Display for ProxySelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxySelection::Direct => f.write_str("direct"),
            ProxySelection::Proxy(address) => write!(f, "{}", address.endpoint()),
        }
    }
}
