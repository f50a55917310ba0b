//! Route handlers.
//!
//! Handlers only translate between HTTP and [`LifecycleService`] calls;
//! authorization and state rules live in the service.
//!
//! [`LifecycleService`]: crate::service::LifecycleService

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use lifeline_core::access::Role;
use lifeline_core::emergency::{
    Assignment, Emergency, EmergencyDraft, EmergencyStatus, EmergencyType, GeoPoint, LogEntry,
    ResolutionData, SosDraft,
};
use lifeline_core::store::{DateRange, EmergencyFilter, EmergencyStatistics, Page};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::AppState;
use super::error::ApiError;
use super::extract::{ApiJson, ApiQuery, Caller};
use crate::service::{NearbyEmergency, SosOutcome};

type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// Bodies and query strings
// =============================================================================

/// `GET /emergency/user/me` query.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    pub status: Option<EmergencyStatus>,
    #[serde(rename = "type")]
    pub kind: Option<EmergencyType>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

/// `GET /emergency/nearby/search` query.
#[derive(Debug, Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
    pub radius: Option<u32>,
}

/// `GET /emergency/stats` query.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StatsQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// `POST /emergency/{id}/messages` body.
#[derive(Debug, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

/// `PUT /helpers/{id}/location` body.
#[derive(Debug, Deserialize)]
pub struct LocationUpdate {
    pub lat: f64,
    pub lng: f64,
    pub available: Option<bool>,
}

/// Response of `PUT /helpers/{id}/location`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationAck {
    pub helper_id: String,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Emergency routes
// =============================================================================

/// `POST /emergency`
pub async fn create_emergency(
    State(state): State<AppState>,
    Caller(requester): Caller,
    ApiJson(draft): ApiJson<EmergencyDraft>,
) -> ApiResult<(StatusCode, Json<Emergency>)> {
    let emergency = state.service.create_emergency(draft, &requester).await?;
    Ok((StatusCode::CREATED, Json(emergency)))
}

/// `POST /emergency/sos`
pub async fn trigger_sos(
    State(state): State<AppState>,
    Caller(requester): Caller,
    ApiJson(sos): ApiJson<SosDraft>,
) -> ApiResult<(StatusCode, Json<SosOutcome>)> {
    let outcome = state.service.trigger_sos(sos, &requester).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// `GET /emergency/{id}`
pub async fn get_emergency(
    State(state): State<AppState>,
    Caller(requester): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Emergency>> {
    Ok(Json(state.service.get_emergency(&id, &requester).await?))
}

/// `GET /emergency/user/me`
pub async fn list_my_emergencies(
    State(state): State<AppState>,
    Caller(requester): Caller,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<Json<Vec<Emergency>>> {
    let defaults = Page::default();
    let page = Page::new(
        query.page.unwrap_or(defaults.page),
        query.limit.unwrap_or(defaults.limit),
    );
    let filter = EmergencyFilter {
        status: query.status,
        kind: query.kind,
    };
    let emergencies = state
        .service
        .list_my_emergencies(&requester, filter, page)
        .await?;
    Ok(Json(emergencies))
}

/// `GET /emergency/nearby/search?lat=..&lng=..&radius=..`
pub async fn find_nearby(
    State(state): State<AppState>,
    Caller(requester): Caller,
    ApiQuery(query): ApiQuery<NearbyQuery>,
) -> ApiResult<Json<Vec<NearbyEmergency>>> {
    let point = GeoPoint::new(query.lng, query.lat);
    let nearby = state
        .service
        .find_nearby_emergencies(point, query.radius, &requester)
        .await?;
    Ok(Json(nearby))
}

/// `GET /emergency/stats`
pub async fn statistics(
    State(state): State<AppState>,
    Caller(_requester): Caller,
    ApiQuery(query): ApiQuery<StatsQuery>,
) -> ApiResult<Json<EmergencyStatistics>> {
    let range = (query.from.is_some() || query.to.is_some()).then_some(DateRange {
        from: query.from,
        to: query.to,
    });
    Ok(Json(state.service.statistics(range).await?))
}

/// `POST /emergency/{id}/assign`
///
/// Runs a dispatch round on behalf of someone who can see the emergency.
pub async fn assign_helpers(
    State(state): State<AppState>,
    Caller(requester): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Assignment>>> {
    state.service.get_emergency(&id, &requester).await?;
    Ok(Json(state.service.assign_nearby_helpers(&id).await?))
}

/// `PUT /emergency/{id}/accept`
pub async fn accept(
    State(state): State<AppState>,
    Caller(requester): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Assignment>> {
    Ok(Json(
        state.service.accept_helper_request(&id, &requester).await?,
    ))
}

/// `PUT /emergency/{id}/arriving`
pub async fn arriving(
    State(state): State<AppState>,
    Caller(requester): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Assignment>> {
    Ok(Json(state.service.mark_helper_arriving(&id, &requester).await?))
}

/// `PUT /emergency/{id}/arrived`
pub async fn arrived(
    State(state): State<AppState>,
    Caller(requester): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Assignment>> {
    Ok(Json(state.service.mark_helper_arrived(&id, &requester).await?))
}

/// `PUT /emergency/{id}/resolve`
pub async fn resolve(
    State(state): State<AppState>,
    Caller(requester): Caller,
    Path(id): Path<String>,
    ApiJson(data): ApiJson<ResolutionData>,
) -> ApiResult<Json<Emergency>> {
    Ok(Json(
        state
            .service
            .resolve_emergency(&id, data, &requester)
            .await?,
    ))
}

/// `POST /emergency/{id}/messages`
pub async fn add_message(
    State(state): State<AppState>,
    Caller(requester): Caller,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<MessageBody>,
) -> ApiResult<(StatusCode, Json<LogEntry>)> {
    let entry = state
        .service
        .add_message(&id, &requester, &body.message)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// `DELETE /emergency/{id}` (admin)
pub async fn delete_emergency(
    State(state): State<AppState>,
    Caller(requester): Caller,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.delete_emergency(&id, &requester).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Helper positions
// =============================================================================

/// `PUT /helpers/{id}/location`
///
/// Helpers report their own position; admins may move anyone.
pub async fn update_helper_location(
    State(state): State<AppState>,
    Caller(requester): Caller,
    Path(helper_id): Path<String>,
    ApiJson(update): ApiJson<LocationUpdate>,
) -> ApiResult<Json<LocationAck>> {
    let allowed = requester.is_admin()
        || (requester.role == Role::Helper && requester.id == helper_id);
    if !allowed {
        return Err(ApiError::Forbidden(format!(
            "{} may not update the position of {helper_id}",
            requester.id
        )));
    }
    let index = state
        .helper_locations
        .as_ref()
        .ok_or(ApiError::Unavailable("helper location index"))?;

    let updated_at = state.service.now();
    index
        .upsert_helper(&helper_id, GeoPoint::new(update.lng, update.lat), updated_at)
        .await?;
    if let Some(available) = update.available {
        index.set_available(&helper_id, available).await;
    }
    info!(helper_id = %helper_id, available = ?update.available, "helper position reported");
    Ok(Json(LocationAck {
        helper_id,
        updated_at,
    }))
}
