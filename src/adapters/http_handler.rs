//! Storefront and proxy-management HTTP surface.
//!
//! Storefront routes never fail because of a supplier: an unreachable supplier is
//! reported as `{"sum": 0}` or `[]`. Only malformed storefront input (400) and unknown
//! keys (404) produce error statuses.
use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use axum::{
    Json, Router,
    extract::{MatchedPath, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    core::{
        catalog::{CatalogError, ProviderCatalog},
        proxy::ProxyError,
        proxy_pool::{PoolStatus, ProxyPool},
        secret::SecretString,
        service::{FetchedProduct, StockResponse, StockService},
    },
    metrics::{RequestTimer, increment_request_total},
};

pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";
pub const MAX_FETCH_QUANTITY: u32 = 1000;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<StockService>,
    /// Swapped wholesale on config reload.
    pub catalog: Arc<ArcSwap<ProviderCatalog>>,
    pub pool: Arc<ProxyPool>,
    pub admin_secret: Option<SecretString>,
}

/// Error body shared by every non-2xx answer: `{"status":"error","msg":..}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    msg: String,
}

impl ApiError {
    fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            msg: msg.into(),
        }
    }

    fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "status": "error", "msg": self.msg })),
        )
            .into_response()
    }
}

impl From<CatalogError> for ApiError {
    fn from(error: CatalogError) -> Self {
        tracing::debug!("Catalog lookup failed: {}", error);
        Self::new(StatusCode::NOT_FOUND, "unknown key")
    }
}

impl From<ProxyError> for ApiError {
    fn from(error: ProxyError) -> Self {
        let status = match error {
            ProxyError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
            ProxyError::AlreadyRegistered(_) => StatusCode::CONFLICT,
            ProxyError::NotRegistered(_) => StatusCode::NOT_FOUND,
        };
        Self::new(status, error.to_string())
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/proxies", get(list_proxies).post(add_proxy))
        .route("/proxies/{address}", delete(remove_proxy))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/", get(|| async { "OK" }))
        .route("/stock", get(stock))
        .route("/fetch", get(fetch))
        .route("/health", get(health))
        .merge(admin)
        .layer(middleware::from_fn(track_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn required<'a>(params: &'a HashMap<String, String>, name: &str) -> Result<&'a str, ApiError> {
    params
        .get(name)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("missing {name}")))
}

fn parse_quantity(raw: &str) -> Result<u32, ApiError> {
    raw.parse::<u32>()
        .ok()
        .filter(|quantity| (1..=MAX_FETCH_QUANTITY).contains(quantity))
        .ok_or_else(|| ApiError::bad_request("invalid quantity"))
}

async fn stock(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<StockResponse>, ApiError> {
    let key = required(&params, "key")?;
    let catalog = state.catalog.load_full();
    let provider = catalog.lookup(key)?;
    Ok(Json(state.service.resolve_stock(key, provider).await))
}

async fn fetch(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<FetchedProduct>>, ApiError> {
    let key = required(&params, "key")?;
    let quantity = parse_quantity(required(&params, "quantity")?)?;
    if let Some(order_id) = params.get("order_id") {
        tracing::info!(order_id = %order_id, input_key = %key, quantity, "Fetch requested for order");
    }

    let catalog = state.catalog.load_full();
    let provider = catalog.lookup(key)?;
    Ok(Json(
        state.service.resolve_fetch(key, provider, quantity).await,
    ))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.pool.status();
    let catalog = state.catalog.load();
    Json(json!({
        "status": "healthy",
        "providers": {
            "total": catalog.len(),
            "active": catalog.active_count(),
        },
        "proxies": {
            "total": status.total,
            "live": status.live,
            "active": status.active,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
struct AddProxyRequest {
    address: String,
}

async fn list_proxies(State(state): State<AppState>) -> Json<PoolStatus> {
    Json(state.pool.status())
}

async fn add_proxy(
    State(state): State<AppState>,
    Json(request): Json<AddProxyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let address = state.pool.add(&request.address)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "ok", "address": address })),
    ))
}

async fn remove_proxy(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.pool.remove(&address)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Gate for the management routes: the configured secret must arrive in the
/// `x-admin-secret` header or the `admin_secret` query parameter.
async fn require_admin(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.admin_secret.as_ref() else {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "proxy management is disabled",
        ));
    };

    let presented = headers
        .get(ADMIN_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .or_else(|| params.get("admin_secret").map(String::as_str));

    match presented {
        Some(secret) if constant_time_eq(secret.as_bytes(), expected.expose_secret().as_bytes()) => {
            Ok(next.run(request).await)
        }
        _ => {
            tracing::warn!(path = %request.uri().path(), "Rejected proxy management request");
            Err(ApiError::new(StatusCode::FORBIDDEN, "forbidden"))
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Request counter and latency per matched route.
async fn track_request(request: Request, next: Next) -> Response {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = request.method().to_string();

    let _timer = RequestTimer::new(&path, &method);
    let response = next.run(request).await;
    increment_request_total(&path, &method, response.status().as_u16());
    response
}
