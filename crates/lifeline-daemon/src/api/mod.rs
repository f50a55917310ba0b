//! HTTP surface of the daemon.
//!
//! # Routes
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | POST | `/emergency` | create |
//! | POST | `/emergency/sos` | trigger SOS |
//! | GET | `/emergency/user/me` | own emergencies |
//! | GET | `/emergency/nearby/search` | nearby active emergencies |
//! | GET | `/emergency/stats` | statistics |
//! | GET, DELETE | `/emergency/{id}` | read, delete (admin) |
//! | POST | `/emergency/{id}/assign` | dispatch round |
//! | PUT | `/emergency/{id}/accept` | helper accepts |
//! | PUT | `/emergency/{id}/arriving` | helper on the way |
//! | PUT | `/emergency/{id}/arrived` | helper arrived |
//! | PUT | `/emergency/{id}/resolve` | resolve |
//! | POST | `/emergency/{id}/messages` | chat message |
//! | PUT | `/helpers/{id}/location` | helper position report |
//! | GET | `/health` | liveness |
//! | GET | `/metrics` | Prometheus text |
//!
//! The requester identity comes from the `x-requester-id` and
//! `x-requester-role` headers set by the upstream auth layer. Every
//! API route is rate limited per client address; `/health` and `/metrics`
//! are not.

pub mod error;
pub mod extract;
pub mod handlers;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use lifeline_core::geo::InMemoryGeoIndex;
use lifeline_core::rate_limit::RateLimiter;
use serde_json::json;

pub use self::error::{ApiError, ErrorBody};
use crate::metrics::SharedMetricsRegistry;
use crate::service::LifecycleService;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Lifecycle operations.
    pub service: Arc<LifecycleService>,
    /// Writable helper index behind `PUT /helpers/{id}/location`. `None`
    /// when positions are fed by an external index.
    pub helper_locations: Option<Arc<InMemoryGeoIndex>>,
    /// Metrics registry; `None` disables `/metrics` and request counting.
    pub metrics: Option<SharedMetricsRegistry>,
    /// Per-client limiter; `None` disables limiting.
    pub rate_limiter: Option<Arc<RateLimiter<IpAddr>>>,
}

impl AppState {
    /// State with only the service wired.
    #[must_use]
    pub const fn new(service: Arc<LifecycleService>) -> Self {
        Self {
            service,
            helper_locations: None,
            metrics: None,
            rate_limiter: None,
        }
    }

    /// Enables helper position reports against `index`.
    #[must_use]
    pub fn with_helper_locations(mut self, index: Arc<InMemoryGeoIndex>) -> Self {
        self.helper_locations = Some(index);
        self
    }

    /// Enables `/metrics` and per-route request counting.
    #[must_use]
    pub fn with_metrics(mut self, metrics: SharedMetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Enables per-client rate limiting.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter<IpAddr>>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/emergency", post(handlers::create_emergency))
        .route("/emergency/sos", post(handlers::trigger_sos))
        .route("/emergency/user/me", get(handlers::list_my_emergencies))
        .route("/emergency/nearby/search", get(handlers::find_nearby))
        .route("/emergency/stats", get(handlers::statistics))
        .route(
            "/emergency/{id}",
            get(handlers::get_emergency).delete(handlers::delete_emergency),
        )
        .route("/emergency/{id}/assign", post(handlers::assign_helpers))
        .route("/emergency/{id}/accept", put(handlers::accept))
        .route("/emergency/{id}/arriving", put(handlers::arriving))
        .route("/emergency/{id}/arrived", put(handlers::arrived))
        .route("/emergency/{id}/resolve", put(handlers::resolve))
        .route("/emergency/{id}/messages", post(handlers::add_message))
        .route(
            "/helpers/{id}/location",
            put(handlers::update_helper_location),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        // Outermost, so rate-limited responses are counted too.
        .route_layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Rejects clients over their request budget with `429`.
async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(limiter) = &state.rate_limiter {
        // Without connection info (in-process callers) all traffic shares one key.
        let client = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |info| info.0.ip());
        limiter.check(&client)?;
    }
    Ok(next.run(request).await)
}

/// Counts responses by matched route and status.
async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());
    let method = request.method().clone();
    let response = next.run(request).await;
    if let Some(registry) = &state.metrics {
        registry
            .lifeline_metrics()
            .http_request(&format!("{method} {endpoint}"), response.status().as_u16());
    }
    response
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    let Some(registry) = &state.metrics else {
        return ApiError::Unavailable("metrics").into_response();
    };
    match registry.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => ApiError::Internal(e.to_string()).into_response(),
    }
}
