//! Rides, the billable resource created by the workflow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ride request as submitted by the client.
///
/// These are the fields that make up the request fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RideDraft {
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub target_lat: f64,
    pub target_lon: f64,
}

/// Coordinates outside the valid range
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid {field}: {value}")]
pub struct InvalidRide {
    pub field: &'static str,
    pub value: f64,
}

impl RideDraft {
    pub fn new(origin_lat: f64, origin_lon: f64, target_lat: f64, target_lon: f64) -> Self {
        Self {
            origin_lat,
            origin_lon,
            target_lat,
            target_lon,
        }
    }

    /// Check latitudes are within [-90, 90] and longitudes within [-180, 180]
    pub fn validate(&self) -> Result<(), InvalidRide> {
        let checks = [
            ("origin_lat", self.origin_lat, 90.0),
            ("origin_lon", self.origin_lon, 180.0),
            ("target_lat", self.target_lat, 90.0),
            ("target_lon", self.target_lon, 180.0),
        ];
        for (field, value, bound) in checks {
            if !(-bound..=bound).contains(&value) {
                return Err(InvalidRide { field, value });
            }
        }
        Ok(())
    }

    /// Attach the owning key and user
    pub fn stamp(&self, idempotency_key_id: Uuid, user_id: i64) -> NewRide {
        NewRide {
            idempotency_key_id,
            user_id,
            origin_lat: self.origin_lat,
            origin_lon: self.origin_lon,
            target_lat: self.target_lat,
            target_lon: self.target_lon,
        }
    }
}

/// Insert payload for a ride
#[derive(Debug, Clone, PartialEq)]
pub struct NewRide {
    pub idempotency_key_id: Uuid,
    pub user_id: i64,
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub target_lat: f64,
    pub target_lon: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ride {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub idempotency_key_id: Option<Uuid>,
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub target_lat: f64,
    pub target_lon: f64,
    pub stripe_charge_id: Option<String>,
    pub user_id: i64,
}
