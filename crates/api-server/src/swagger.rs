//! OpenAPI document, served as JSON.

use axum::Json;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "AdServe API",
        version = "0.1.0",
        description = "Ad selection and budget enforcement.\n\nServes one ad per placement request, tracks clicks and conversions, and enforces total and daily campaign budgets.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Serving", description = "Ad selection for a placement"),
        (name = "Tracking", description = "Click redirects and conversion/impression beacons"),
        (name = "Operations", description = "Health, readiness, and liveness probes"),
    ),
    paths(
        crate::rest::handle_serve,
        crate::rest::handle_eligible,
        crate::rest::handle_track,
        crate::rest::health_check,
        crate::rest::readiness,
        crate::rest::liveness,
    ),
    components(schemas(
        crate::rest::ServeBody,
        crate::rest::ServeResponse,
        crate::rest::ServeData,
        crate::rest::PositionData,
        crate::rest::EligibleResponse,
        crate::rest::EligibleData,
        crate::rest::TrackResponse,
        crate::rest::TrackData,
        crate::rest::ErrorResponse,
        crate::rest::HealthResponse,
    ))
)]
pub struct ApiDoc;

/// GET /api-docs/openapi.json
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
