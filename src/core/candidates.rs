//! Endpoint × credential-parameter candidates.
//!
//! Suppliers disagree on whether the API lives under `/api` and on what the
//! credential query/form field is called. The adapter tries the Cartesian product
//! of base URL variants (outer) and parameter names (inner) in order.

/// API-root suffix appended when the configured base URL lacks it.
pub const API_ROOT_SUFFIX: &str = "/api";

/// Credential parameter names tried when a provider does not name one.
pub const FALLBACK_CREDENTIAL_PARAMS: &[&str] = &["api_key", "apikey", "key", "token"];

/// One (base URL variant, credential parameter name) combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub base_url: String,
    pub credential_param: String,
}

impl Candidate {
    /// Join the base URL variant with a request path.
    pub fn url_for(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

/// Base URL as given, then with the API-root suffix when missing.
pub fn base_url_variants(base_url: &str) -> Vec<String> {
    let base = base_url.trim().trim_end_matches('/').to_string();
    if base.ends_with(API_ROOT_SUFFIX) {
        vec![base]
    } else {
        let with_suffix = format!("{base}{API_ROOT_SUFFIX}");
        vec![base, with_suffix]
    }
}

/// Only the preferred name when one is set (and not `auto`), otherwise the fallback list.
pub fn credential_param_names(preferred: Option<&str>) -> Vec<String> {
    match preferred.map(str::trim) {
        Some(name) if !name.is_empty() && !name.eq_ignore_ascii_case("auto") => {
            vec![name.to_string()]
        }
        _ => FALLBACK_CREDENTIAL_PARAMS
            .iter()
            .map(|name| name.to_string())
            .collect(),
    }
}

/// Ordered candidate list: outer loop over base URL variants, inner over parameter names.
pub fn candidates(base_url: &str, preferred_param: Option<&str>) -> Vec<Candidate> {
    let names = credential_param_names(preferred_param);
    base_url_variants(base_url)
        .into_iter()
        .flat_map(|base| {
            names.iter().map(move |name| Candidate {
                base_url: base.clone(),
                credential_param: name.clone(),
            })
        })
        .collect()
}
