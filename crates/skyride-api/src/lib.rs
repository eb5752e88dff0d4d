// Skyride HTTP API
//
// POST /rides books a ride under an idempotency key; GET /health and
// GET /openapi.json are unauthenticated.

pub mod config;
pub mod error;
pub mod rides;
pub mod services;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

pub use config::{AppConfig, StorageBackend};
pub use rides::AppState;
pub use services::RideService;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(rides::create_ride),
    components(schemas(
        rides::CreateRideRequest,
        error::MessageResponse,
        error::ErrorResponse,
    )),
    tags((name = "rides", description = "Idempotent ride booking")),
    info(
        title = "Skyride API",
        description = "Book rides exactly once per idempotency key",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/openapi.json", get(openapi))
        .merge(rides::routes(state))
        .layer(TraceLayer::new_for_http())
}
