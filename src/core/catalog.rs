//! Provider catalog: storefront input key → provider record.
//!
//! Built from configuration and replaced wholesale on reload; a running resolve call
//! keeps the snapshot it started with.
use std::collections::HashMap;

use thiserror::Error;

use crate::config::ProviderConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CatalogError {
    #[error("No product is configured for key '{0}'")]
    UnknownKey(String),

    #[error("Product '{0}' is not active")]
    Inactive(String),
}

#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    providers: HashMap<String, ProviderConfig>,
}

impl ProviderCatalog {
    pub fn new(providers: HashMap<String, ProviderConfig>) -> Self {
        Self { providers }
    }

    /// Find an active provider record for `input_key`.
    pub fn lookup(&self, input_key: &str) -> Result<&ProviderConfig, CatalogError> {
        match self.providers.get(input_key) {
            Some(provider) if provider.active => Ok(provider),
            Some(_) => Err(CatalogError::Inactive(input_key.to_string())),
            None => Err(CatalogError::UnknownKey(input_key.to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.providers.values().filter(|p| p.active).count()
    }
}
