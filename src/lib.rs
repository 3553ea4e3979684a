//! Stockgate - a reseller gateway in front of heterogeneous supplier APIs.
//!
//! Storefronts speak one contract (`GET /stock?key=K` → `{"sum": n}`, `GET
//! /fetch?key=K&quantity=N` → `[{"product": ..}]`). Suppliers do not: base URLs,
//! credential parameter names, response shapes and success markers all differ. The
//! generic provider adapter bridges the two from per-key configuration alone:
//!
//! - request templates with `{credential}`, `{productId}` and `{quantity}` placeholders
//! - a `a.b[0]||c` path-with-fallback language over arbitrary JSON responses
//! - automatic fallback across credential parameter names and an `/api` root suffix
//! - a shared egress proxy pool with in-band failover and periodic health sweeps
//!
//! # Quick Example
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use stockgate::{
//!     adapters::ReqwestExecutor,
//!     config::ProviderConfig,
//!     core::{ProviderAdapter, ProxyPool, StockService},
//! };
//!
//! # #[tokio::main] async fn main() {
//! let pool = Arc::new(ProxyPool::new());
//! let executor = Arc::new(ReqwestExecutor::new(pool.clone(), Duration::from_secs(4), "stockgate"));
//! let service = StockService::new(
//!     Arc::new(ProviderAdapter::new(executor, pool)),
//!     Duration::from_secs(9),
//! );
//!
//! let provider = ProviderConfig::new("https://supplier.example", "api-key", 101);
//! let stock = service.resolve_stock("netflix-1m", &provider).await;
//! println!("{}", stock.sum);
//! # }
//! ```
//!
//! # Architecture
//! Ports (traits) live in `ports`, their implementations in `adapters`, and the engine
//! in `core`. The engine never performs I/O itself: every supplier call goes through
//! the [`HttpExecutor`] port.
//!
//! # Error Handling
//! Supplier failures never surface to the storefront; they degrade to `{"sum": 0}` or
//! `[]`. Startup and configuration paths return `eyre::Result` with context attached.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{FileConfigProvider, ProxyHealthChecker, ReqwestExecutor},
    core::{ProviderAdapter, ProviderCatalog, ProxyPool, StockService},
    ports::http_client::HttpExecutor,
    utils::GracefulShutdown,
};
