use std::net::SocketAddr;

use crate::{
    config::models::{ProviderConfig, ProxyHealthCheckConfig, RequestTemplate, ServerConfig},
    core::{path_extractor::invalid_alternatives, proxy::ProxyAddress},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration, reporting every problem at once.
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        for (field, value) in [
            ("upstream.request_timeout", &config.upstream.request_timeout),
            ("upstream.call_deadline", &config.upstream.call_deadline),
        ] {
            match humantime::parse_duration(value) {
                Ok(duration) if duration.is_zero() => errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Must be greater than 0".to_string(),
                }),
                Ok(_) => {}
                Err(e) => errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: format!("Invalid duration '{value}': {e}"),
                }),
            }
        }

        if config
            .admin_secret
            .as_ref()
            .is_some_and(|secret| secret.is_empty())
        {
            errors.push(ValidationError::InvalidField {
                field: "admin_secret".to_string(),
                message: "Cannot be empty; omit it to disable proxy management".to_string(),
            });
        }

        for (i, proxy) in config.proxy_pool.proxies.iter().enumerate() {
            if let Err(e) = ProxyAddress::new(proxy) {
                errors.push(ValidationError::InvalidField {
                    field: format!("proxy_pool.proxies[{i}]"),
                    message: e.to_string(),
                });
            }
        }

        if let Err(mut health_check_errors) =
            Self::validate_health_check_config(&config.proxy_pool.health_check)
        {
            errors.append(&mut health_check_errors);
        }

        if config.providers.is_empty() {
            tracing::warn!("No providers configured; every storefront key will be rejected");
        }
        let mut keys: Vec<&String> = config.providers.keys().collect();
        keys.sort();
        for key in keys {
            if let Err(mut provider_errors) =
                Self::validate_provider(key, &config.providers[key.as_str()])
            {
                errors.append(&mut provider_errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:8000' or '0.0.0.0:8000')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_provider(key: &str, provider: &ProviderConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let field = |name: &str| format!("providers.{key}.{name}");

        if key.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "providers.<key>".to_string(),
            });
        }

        if let Err(e) = Self::validate_url(&provider.base_url, &field("base_url")) {
            errors.push(e);
        } else if provider.base_url.contains('?') {
            errors.push(ValidationError::InvalidField {
                field: field("base_url"),
                message: "Base URL cannot carry a query string".to_string(),
            });
        }

        if provider.credential_secret.is_empty() {
            errors.push(ValidationError::MissingField {
                field: field("api_key"),
            });
        }

        if provider
            .preferred_credential_param
            .as_deref()
            .is_some_and(|name| name.chars().any(char::is_whitespace))
        {
            errors.push(ValidationError::InvalidField {
                field: field("credential_param"),
                message: "Parameter names cannot contain whitespace".to_string(),
            });
        }

        for (name, template) in [
            ("stock", &provider.stock_request),
            ("fetch", &provider.fetch_request),
        ] {
            if let Err(e) = Self::validate_request_template(&field(name), template) {
                errors.push(e);
            }
        }

        for (name, expr) in [
            ("stock_path", &provider.stock_path_expr),
            ("fetch_path", &provider.fetch_path_expr),
        ] {
            if let Err(e) = Self::validate_path_expr(&field(name), expr) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_request_template(context: &str, template: &RequestTemplate) -> ValidationResult<()> {
        if template.path.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: format!("{context}.path"),
            });
        }
        if template.path.contains('?') {
            return Err(ValidationError::InvalidField {
                field: format!("{context}.path"),
                message: "Put query parameters in 'params', not in the path".to_string(),
            });
        }
        if let Some(success) = &template.success {
            Self::validate_path_expr(&format!("{context}.success.path"), &success.path)?;
        }
        Ok(())
    }

    /// Every alternative must parse.
    fn validate_path_expr(context: &str, expr: &str) -> ValidationResult<()> {
        if expr.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: context.to_string(),
            });
        }
        let invalid = invalid_alternatives(expr);
        if !invalid.is_empty() {
            return Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Malformed path alternatives: {}", invalid.join(", ")),
            });
        }
        Ok(())
    }

    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn validate_health_check_config(
        config: &ProxyHealthCheckConfig,
    ) -> Result<(), Vec<ValidationError>> {
        if !config.enabled {
            return Ok(());
        }

        let mut errors = Vec::new();

        if config.interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "proxy_pool.health_check.interval_secs".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "proxy_pool.health_check.timeout_secs".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if let Err(e) =
            Self::validate_url(&config.probe_url, "proxy_pool.health_check.probe_url")
        {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
