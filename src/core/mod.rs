pub mod adapter;
pub mod candidates;
pub mod catalog;
pub mod path_extractor;
pub mod proxy;
pub mod proxy_pool;
pub mod secret;
pub mod service;
pub mod template;

pub use adapter::{AdapterError, CallContext, ProviderAdapter};
pub use catalog::{CatalogError, ProviderCatalog};
pub use proxy_pool::ProxyPool;
pub use service::{FetchedProduct, StockResponse, StockService};
