//! REST handlers for ad serving, tracking and operational endpoints.

use adserve_core::context::GeoLocation;
use adserve_core::types::{CampaignId, EventType, PlacementId};
use adserve_core::{AdServeError, RequestMeta};
use adserve_engine::{EligibleAd, ServeOutcome, ServeRequest, ServedAd, ServingEngine};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ServingEngine>,
    pub node_id: String,
    pub start_time: Instant,
}

// ─── Error envelope ─────────────────────────────────────────────────────────

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Always `"error"`.
    pub status: String,
    pub message: String,
}

/// Handler error carrying its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn no_eligible_ad() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "No eligible ad available".to_string(),
        }
    }
}

impl From<AdServeError> for ApiError {
    fn from(e: AdServeError) -> Self {
        let status = match &e {
            AdServeError::NotFound(_) => StatusCode::NOT_FOUND,
            AdServeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AdServeError::StoreUnavailable(_) | AdServeError::CacheUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AdServeError::Config(_) | AdServeError::Serialization(_) | AdServeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            let infrastructure = e.is_infrastructure();
            error!(error = %e, infrastructure = infrastructure, "Request failed");
            metrics::counter!("api.errors").increment(1);
            let message = if infrastructure {
                "Service temporarily unavailable"
            } else {
                "Internal server error"
            };
            return Self {
                status,
                message: message.to_string(),
            };
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            status: "error".to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

// ─── Request meta ───────────────────────────────────────────────────────────

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Client IP: first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| header_str(headers, "x-real-ip").and_then(|v| v.parse().ok()))
        .or_else(|| peer.map(|addr| addr.ip()))
}

pub fn request_meta(headers: &HeaderMap, peer: Option<SocketAddr>) -> RequestMeta {
    // Cloudflare reports unknown/Tor as XX/T1.
    let cdn_country = header_str(headers, "cf-ipcountry")
        .filter(|c| !matches!(*c, "XX" | "T1"))
        .or_else(|| header_str(headers, "x-geo-country"));

    RequestMeta {
        user_agent: header_str(headers, "user-agent").map(str::to_string),
        ip: client_ip(headers, peer),
        accept_language: header_str(headers, "accept-language").map(str::to_string),
        geo_hint: GeoLocation {
            country: cdn_country.map(str::to_string),
            region: header_str(headers, "x-geo-region").map(str::to_string),
            city: header_str(headers, "x-geo-city").map(str::to_string),
        },
    }
}

// ─── Serve ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ServeQuery {
    /// Placement id.
    pub position: Option<String>,
}

/// Optional JSON body of a serve call.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ServeBody {
    /// Overrides the `position` query parameter.
    pub position_id: Option<PlacementId>,
    /// Client context (`device`, `os`, `browser`, `country`, `region`,
    /// `city`, `language`) overriding the derived visitor context.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub context: HashMap<String, serde_json::Value>,
}

#[derive(Serialize, ToSchema)]
pub struct PositionData {
    pub id: PlacementId,
    pub width: u32,
    pub height: u32,
}

#[derive(Serialize, ToSchema)]
pub struct ServeData {
    /// Campaign id.
    pub id: CampaignId,
    pub impression_id: Uuid,
    /// Creative kind: image, html, text or video.
    #[serde(rename = "type")]
    pub kind: String,
    #[schema(value_type = Object)]
    pub content: serde_json::Value,
    pub position: PositionData,
    pub click_url: String,
}

#[derive(Serialize, ToSchema)]
pub struct ServeResponse {
    pub status: String,
    pub data: ServeData,
}

impl From<ServedAd> for ServeData {
    fn from(ad: ServedAd) -> Self {
        Self {
            id: ad.campaign_id,
            impression_id: ad.impression_id,
            kind: ad.creative.kind().to_string(),
            content: ad.creative.content(),
            position: PositionData {
                id: ad.placement.id,
                width: ad.placement.width,
                height: ad.placement.height,
            },
            click_url: ad.click_url,
        }
    }
}

fn parse_body(body: &Bytes) -> Result<ServeBody, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ServeBody::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))
}

fn context_overrides(context: HashMap<String, serde_json::Value>) -> HashMap<String, String> {
    context
        .into_iter()
        .filter_map(|(key, value)| match value {
            serde_json::Value::String(s) => Some((key, s)),
            serde_json::Value::Number(n) => Some((key, n.to_string())),
            serde_json::Value::Bool(b) => Some((key, b.to_string())),
            _ => None,
        })
        .collect()
}

fn parse_placement(raw: Option<&str>) -> Result<PlacementId, ApiError> {
    let raw = raw
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing placement id"))?;
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid placement id '{raw}'")))
}

/// GET|POST /v1/serve: Select, record and return one ad for a placement.
#[utoipa::path(
    post,
    path = "/v1/serve",
    tag = "Serving",
    params(ServeQuery),
    request_body(content = ServeBody, description = "Optional placement override and client context"),
    responses(
        (status = 200, description = "Ad served", body = ServeResponse),
        (status = 400, description = "Missing or invalid placement id", body = ErrorResponse),
        (status = 404, description = "Unknown placement or no eligible ad", body = ErrorResponse),
        (status = 503, description = "Durable store unavailable", body = ErrorResponse),
    )
)]
pub async fn handle_serve(
    State(state): State<AppState>,
    Query(query): Query<ServeQuery>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ServeResponse>, ApiError> {
    let body = parse_body(&body)?;
    let placement_id = match body.position_id {
        Some(id) => id,
        None => parse_placement(query.position.as_deref())?,
    };

    let request = ServeRequest {
        placement_id,
        meta: request_meta(&headers, peer.map(|ConnectInfo(addr)| addr)),
        overrides: context_overrides(body.context),
    };

    match state.engine.serve(&request).await? {
        ServeOutcome::Served(ad) => Ok(Json(ServeResponse {
            status: "success".to_string(),
            data: ad.into(),
        })),
        ServeOutcome::NoEligibleAd => Err(ApiError::no_eligible_ad()),
    }
}

// ─── Eligible-ad query ──────────────────────────────────────────────────────

#[derive(Serialize, ToSchema)]
pub struct EligibleData {
    pub id: CampaignId,
    #[serde(rename = "type")]
    pub kind: String,
    #[schema(value_type = Object)]
    pub content: serde_json::Value,
    pub score: f64,
    pub cost: f64,
    pub position: PositionData,
}

#[derive(Serialize, ToSchema)]
pub struct EligibleResponse {
    pub status: String,
    pub data: EligibleData,
}

impl From<EligibleAd> for EligibleData {
    fn from(ad: EligibleAd) -> Self {
        Self {
            id: ad.campaign_id,
            kind: ad.creative.kind().to_string(),
            content: ad.creative.content(),
            score: ad.score,
            cost: ad.cost,
            position: PositionData {
                id: ad.placement.id,
                width: ad.placement.width,
                height: ad.placement.height,
            },
        }
    }
}

/// GET /v1/placements/{id}/eligible: The ad a serve would pick, without
/// recording or charging.
#[utoipa::path(
    get,
    path = "/v1/placements/{id}/eligible",
    tag = "Serving",
    params(("id" = i64, Path, description = "Placement id")),
    responses(
        (status = 200, description = "Eligible ad", body = EligibleResponse),
        (status = 404, description = "Unknown placement or no eligible ad", body = ErrorResponse),
    )
)]
pub async fn handle_eligible(
    State(state): State<AppState>,
    Path(placement_id): Path<PlacementId>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<EligibleResponse>, ApiError> {
    let request = ServeRequest {
        placement_id,
        meta: request_meta(&headers, peer.map(|ConnectInfo(addr)| addr)),
        overrides: HashMap::new(),
    };
    let ad = state
        .engine
        .eligible_ad(&request)
        .await?
        .ok_or_else(ApiError::no_eligible_ad)?;
    Ok(Json(EligibleResponse {
        status: "success".to_string(),
        data: ad.into(),
    }))
}

// ─── Tracking ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TrackQuery {
    /// Campaign id.
    pub ad_id: Option<String>,
    /// Impression event id; required for click and conversion.
    pub impression_id: Option<String>,
    /// `impression`, `click` (default) or `conversion`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Placement id, informational.
    pub position: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct TrackData {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub ad_id: CampaignId,
}

#[derive(Serialize, ToSchema)]
pub struct TrackResponse {
    pub status: String,
    pub data: TrackData,
}

fn parse_ad_id(raw: Option<&str>) -> Result<Option<CampaignId>, ApiError> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse()
                .map_err(|_| ApiError::bad_request(format!("invalid ad id '{v}'")))
        })
        .transpose()
}

fn parse_impression_id(raw: Option<&str>) -> Result<Option<Uuid>, ApiError> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            Uuid::parse_str(v)
                .map_err(|_| ApiError::bad_request(format!("invalid impression id '{v}'")))
        })
        .transpose()
}

/// GET /v1/track: Click redirect, conversion and impression beacons.
#[utoipa::path(
    get,
    path = "/v1/track",
    tag = "Tracking",
    params(TrackQuery),
    responses(
        (status = 303, description = "Click: redirect to the campaign destination"),
        (status = 200, description = "Conversion or impression acknowledged", body = TrackResponse),
        (status = 400, description = "Missing or invalid parameters", body = ErrorResponse),
        (status = 404, description = "Unknown campaign or impression", body = ErrorResponse),
    )
)]
pub async fn handle_track(
    State(state): State<AppState>,
    Query(query): Query<TrackQuery>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let kind: EventType = query
        .kind
        .as_deref()
        .unwrap_or("click")
        .parse()
        .map_err(ApiError::bad_request)?;
    let ad_id = parse_ad_id(query.ad_id.as_deref())?;
    let impression_id = parse_impression_id(query.impression_id.as_deref())?;
    let meta = request_meta(&headers, peer.map(|ConnectInfo(addr)| addr));

    match kind {
        EventType::Click => {
            let ad_id = ad_id.ok_or_else(|| ApiError::bad_request("missing ad id"))?;
            let outcome = state.engine.track_click(ad_id, impression_id, &meta).await?;
            if !outcome.recorded {
                warn!(
                    ad_id = ad_id,
                    position = query.position.as_deref().unwrap_or_default(),
                    "Redirecting untracked click"
                );
            }
            Ok(Redirect::to(outcome.destination.as_str()).into_response())
        }
        EventType::Conversion => {
            let impression_id =
                impression_id.ok_or_else(|| ApiError::bad_request("missing impression id"))?;
            let event = state
                .engine
                .track_conversion(ad_id, impression_id, &meta)
                .await?;
            Ok(track_ack(event.id, kind, event.campaign_id))
        }
        EventType::Impression => {
            let impression_id =
                impression_id.ok_or_else(|| ApiError::bad_request("missing impression id"))?;
            let event = state.engine.track_impression(ad_id, impression_id).await?;
            Ok(track_ack(event.id, kind, event.campaign_id))
        }
    }
}

fn track_ack(event_id: Uuid, kind: EventType, ad_id: CampaignId) -> Response {
    Json(TrackResponse {
        status: "success".to_string(),
        data: TrackData {
            event_id,
            kind: kind.to_string(),
            ad_id,
        },
    })
    .into_response()
}

// ─── Operations ─────────────────────────────────────────────────────────────

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

/// GET /health: Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Operations",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready: Readiness probe. The engine is fully wired before the
/// router exists, so reaching this handler means ready.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Operations",
    responses((status = 200, description = "Ready to accept traffic"))
)]
pub async fn readiness() -> StatusCode {
    StatusCode::OK
}

/// GET /live: Liveness probe.
#[utoipa::path(
    get,
    path = "/live",
    tag = "Operations",
    responses((status = 200, description = "Process is alive"))
)]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
