// Database rows (internal, converted into the domain types of skyride-core)

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use skyride_core::{
    AuditRecord, CachedResponse, Fingerprint, IdempotencyKey, ResponseBody, Ride, StagedJob, User,
};

use crate::store::StoreError;

// ============================================
// Idempotency keys
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct IdempotencyKeyRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub idempotency_key: String,
    pub last_run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub request_method: String,
    pub request_params: serde_json::Value,
    pub request_path: String,
    pub response_code: Option<i32>,
    pub response_body: Option<serde_json::Value>,
    pub recovery_point: String,
    pub user_id: i64,
}

impl TryFrom<IdempotencyKeyRow> for IdempotencyKey {
    type Error = StoreError;

    fn try_from(row: IdempotencyKeyRow) -> Result<Self, Self::Error> {
        let response = match (row.response_code, row.response_body) {
            (Some(code), Some(body)) => Some(CachedResponse {
                status: u16::try_from(code)
                    .map_err(|_| StoreError::Serialization(format!("response code {code}")))?,
                body: serde_json::from_value::<ResponseBody>(body)?,
            }),
            _ => None,
        };

        Ok(IdempotencyKey {
            id: row.id,
            created_at: row.created_at,
            key: row.idempotency_key,
            user_id: row.user_id,
            last_run_at: row.last_run_at,
            locked_at: row.locked_at,
            request_method: row.request_method,
            request_path: row.request_path,
            request_params: Fingerprint::from_value(row.request_params),
            recovery_point: row.recovery_point.parse()?,
            response,
        })
    }
}

// ============================================
// Rides
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct RideRow {
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

impl From<RideRow> for Ride {
    fn from(row: RideRow) -> Self {
        Ride {
            id: row.id,
            created_at: row.created_at,
            idempotency_key_id: row.idempotency_key_id,
            origin_lat: row.origin_lat,
            origin_lon: row.origin_lon,
            target_lat: row.target_lat,
            target_lon: row.target_lon,
            stripe_charge_id: row.stripe_charge_id,
            user_id: row.user_id,
        }
    }
}

// ============================================
// Audit records
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct AuditRecordRow {
    pub id: Uuid,
    pub action: String,
    pub created_at: DateTime<Utc>,
    pub data: serde_json::Value,
    pub origin_ip: String,
    pub resource_id: Uuid,
    pub resource_type: String,
    pub user_id: i64,
    pub idempotency_key_id: Option<Uuid>,
}

impl TryFrom<AuditRecordRow> for AuditRecord {
    type Error = StoreError;

    fn try_from(row: AuditRecordRow) -> Result<Self, Self::Error> {
        Ok(AuditRecord {
            id: row.id,
            action: row.action.parse()?,
            resource_type: row.resource_type.parse()?,
            resource_id: row.resource_id,
            origin_ip: row.origin_ip,
            data: row.data,
            user_id: row.user_id,
            idempotency_key_id: row.idempotency_key_id,
            created_at: row.created_at,
        })
    }
}

// ============================================
// Staged jobs
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct StagedJobRow {
    pub id: Uuid,
    pub job_name: String,
    pub job_args: serde_json::Value,
    pub idempotency_key_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<StagedJobRow> for StagedJob {
    type Error = StoreError;

    fn try_from(row: StagedJobRow) -> Result<Self, Self::Error> {
        Ok(StagedJob {
            id: row.id,
            job_name: row.job_name.parse()?,
            job_args: row.job_args,
            idempotency_key_id: row.idempotency_key_id,
            created_at: row.created_at,
        })
    }
}

// ============================================
// Users
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: i64,
    pub email: String,
    pub stripe_customer_id: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            stripe_customer_id: row.stripe_customer_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skyride_core::RecoveryPoint;

    fn key_row(recovery_point: &str) -> IdempotencyKeyRow {
        let now = Utc::now();
        IdempotencyKeyRow {
            id: Uuid::now_v7(),
            created_at: now,
            idempotency_key: "k1".to_string(),
            last_run_at: now,
            locked_at: None,
            request_method: "POST".to_string(),
            request_params: json!({"origin_lat": 0.0}),
            request_path: "/rides".to_string(),
            response_code: Some(200),
            response_body: Some(json!({"message": "OK"})),
            recovery_point: recovery_point.to_string(),
            user_id: 42,
        }
    }

    #[test]
    fn test_key_row_converts() {
        let key = IdempotencyKey::try_from(key_row("FINISHED")).unwrap();
        assert_eq!(key.recovery_point, RecoveryPoint::Finished);
        assert_eq!(key.response, Some(CachedResponse::ok()));
        assert_eq!(key.key, "k1");
    }

    #[test]
    fn test_unknown_recovery_point_is_reported() {
        let err = IdempotencyKey::try_from(key_row("REFUNDED")).unwrap_err();
        assert!(matches!(err, StoreError::UnknownRecoveryPoint(p) if p.0 == "REFUNDED"));
    }

    #[test]
    fn test_partial_response_is_ignored() {
        let mut row = key_row("CREATED");
        row.response_body = None;
        let key = IdempotencyKey::try_from(row).unwrap();
        assert!(key.response.is_none());
    }
}
