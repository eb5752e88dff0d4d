// Rides API routes
// Decision: the idempotency key and the caller come from headers; the body is the ride only

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use skyride_core::{Caller, Context, IdempotencyKeyDraft, RideDraft, MAX_KEY_LENGTH};

use crate::error::{cached_into_response, ApiError};
use crate::services::RideService;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

const DEFAULT_ORIGIN_IP: &str = "127.0.0.1";

/// App state for rides routes
#[derive(Clone)]
pub struct AppState {
    pub rides: Arc<dyn RideService>,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(rides: Arc<dyn RideService>, request_timeout: Duration) -> Self {
        Self {
            rides,
            request_timeout,
        }
    }
}

/// Request to book a ride
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct CreateRideRequest {
    #[schema(example = 37.7749)]
    pub origin_lat: f64,
    #[schema(example = -122.4194)]
    pub origin_lon: f64,
    #[schema(example = 37.8044)]
    pub target_lat: f64,
    #[schema(example = -122.2712)]
    pub target_lon: f64,
}

impl From<CreateRideRequest> for RideDraft {
    fn from(req: CreateRideRequest) -> Self {
        RideDraft::new(req.origin_lat, req.origin_lon, req.target_lat, req.target_lon)
    }
}

/// Create rides routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/rides", post(create_ride))
        .with_state(state)
}

/// POST /rides - Book a ride
///
/// Repeating a request with the same `Idempotency-Key` returns the stored
/// response of the first one without charging again.
#[utoipa::path(
    post,
    path = "/rides",
    params(
        ("Idempotency-Key" = String, Header, description = "Client-chosen key, at most 100 characters"),
        ("Authorization" = String, Header, description = "Email of the booking user")
    ),
    request_body = CreateRideRequest,
    responses(
        (status = 200, description = "Ride booked", body = crate::error::MessageResponse),
        (status = 400, description = "Invalid request", body = crate::error::ErrorResponse),
        (status = 401, description = "Unknown user", body = crate::error::ErrorResponse),
        (status = 402, description = "Card declined", body = crate::error::MessageResponse),
        (status = 409, description = "Key reused with other parameters, or still in progress", body = crate::error::ErrorResponse),
        (status = 503, description = "Payment provider unavailable", body = crate::error::ErrorResponse),
        (status = 500, description = "Internal server error", body = crate::error::ErrorResponse)
    ),
    tag = "rides"
)]
pub async fn create_ride(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<CreateRideRequest>,
) -> Result<Response, ApiError> {
    let key = idempotency_key(&headers)?;
    let email = header_str(&headers, axum::http::header::AUTHORIZATION.as_str())
        .ok_or_else(|| ApiError::bad_request("Authorization header is required"))?;

    let ctx = Context::background().with_timeout(state.request_timeout);

    let user = state
        .rides
        .find_user(&ctx, email)
        .await?
        .ok_or_else(|| ApiError::unauthorized("permission denied"))?;

    let caller = Caller::new(user, origin_ip(&headers, connect_info.as_ref()));
    let draft = IdempotencyKeyDraft::new(key, method.as_str(), uri.path());

    let finished = state
        .rides
        .create_ride(&ctx, &caller, draft, body.into())
        .await?;

    debug!(key_id = %finished.id, "returning stored response");
    let response = finished
        .response
        .ok_or_else(|| ApiError::internal("finished key has no response"))?;
    Ok(cached_into_response(response))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn idempotency_key(headers: &HeaderMap) -> Result<String, ApiError> {
    let key = header_str(headers, IDEMPOTENCY_KEY_HEADER)
        .ok_or_else(|| ApiError::bad_request("Idempotency-Key header is required"))?;
    if key.chars().count() > MAX_KEY_LENGTH {
        return Err(ApiError::bad_request(format!(
            "Idempotency-Key must be at most {MAX_KEY_LENGTH} characters"
        )));
    }
    Ok(key.to_string())
}

/// Client address: first X-Forwarded-For hop, then X-Real-IP, then the peer
fn origin_ip(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> String {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return first.to_string();
        }
    }
    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return real_ip.to_string();
    }
    peer.map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| DEFAULT_ORIGIN_IP.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_origin_ip_prefers_forwarded_for() {
        let h = headers(&[
            ("x-forwarded-for", "203.0.113.9, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(origin_ip(&h, None), "203.0.113.9");
    }

    #[test]
    fn test_origin_ip_falls_back_to_peer_then_default() {
        let h = headers(&[("x-real-ip", "198.51.100.2")]);
        assert_eq!(origin_ip(&h, None), "198.51.100.2");

        let peer = ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000)));
        assert_eq!(origin_ip(&HeaderMap::new(), Some(&peer)), "192.0.2.1");
        assert_eq!(origin_ip(&HeaderMap::new(), None), "127.0.0.1");
    }

    #[test]
    fn test_idempotency_key_length_limit() {
        let ok = "k".repeat(MAX_KEY_LENGTH);
        assert_eq!(idempotency_key(&headers(&[("idempotency-key", &ok)])).unwrap(), ok);

        let long = "k".repeat(MAX_KEY_LENGTH + 1);
        assert!(idempotency_key(&headers(&[("idempotency-key", &long)])).is_err());
        assert!(idempotency_key(&HeaderMap::new()).is_err());
    }
}
