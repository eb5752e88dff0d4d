//! Record store traits
//!
//! One trait per record kind. A transaction handed out by a
//! [`UnitOfWork`](crate::UnitOfWork) implements all of them, so a workflow
//! step sees every table through the same transaction.

use async_trait::async_trait;
use uuid::Uuid;

use skyride_core::{
    AuditRecord, ContextError, IdempotencyKey, JobName, NewAuditRecord, NewIdempotencyKey,
    NewRide, NewStagedJob, Ride, StagedJob, UnknownRecoveryPoint, UnknownVariant, User,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Row to update does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Another transaction won a race (serialization failure, unique violation)
    #[error("conflicting concurrent write: {0}")]
    Conflict(String),

    /// A conditional write found the row changed since it was read
    #[error("{kind} {id} was changed by another attempt")]
    Stale { kind: &'static str, id: String },

    /// A key row holds a recovery point this build does not know
    #[error(transparent)]
    UnknownRecoveryPoint(#[from] UnknownRecoveryPoint),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The request context finished before the transaction did
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Failure planted by a test
    #[error("injected failure in {0}")]
    Injected(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn stale(kind: &'static str, id: impl ToString) -> Self {
        Self::Stale {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether repeating the whole operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::Database(_) | Self::Context(_) | Self::Injected(_)
        )
    }
}

impl From<UnknownVariant> for StoreError {
    fn from(e: UnknownVariant) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Isolation {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

// ============================================
// Criteria
// ============================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdempotencyKeyFilter {
    pub id: Option<Uuid>,
    pub key: Option<String>,
    pub user_id: Option<i64>,
}

impl IdempotencyKeyFilter {
    /// The one row for a client key of a given user
    pub fn by_key(key: impl Into<String>, user_id: i64) -> Self {
        Self {
            id: None,
            key: Some(key.into()),
            user_id: Some(user_id),
        }
    }

    pub fn by_id(id: Uuid) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RideFilter {
    pub id: Option<Uuid>,
    pub idempotency_key_id: Option<Uuid>,
    pub user_id: Option<i64>,
}

impl RideFilter {
    pub fn by_idempotency_key(idempotency_key_id: Uuid) -> Self {
        Self {
            idempotency_key_id: Some(idempotency_key_id),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditRecordFilter {
    pub resource_id: Option<Uuid>,
    pub idempotency_key_id: Option<Uuid>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedJobFilter {
    pub job_name: Option<JobName>,
    pub idempotency_key_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFilter {
    pub id: Option<i64>,
    pub email: Option<String>,
}

impl UserFilter {
    pub fn by_email(email: impl Into<String>) -> Self {
        Self {
            id: None,
            email: Some(email.into()),
        }
    }
}

/// Insert payload for a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub stripe_customer_id: String,
}

// ============================================
// Record access
// ============================================

#[async_trait]
pub trait IdempotencyKeyRecords: Send {
    async fn find_idempotency_key(
        &mut self,
        filter: &IdempotencyKeyFilter,
    ) -> Result<Option<IdempotencyKey>, StoreError>;

    async fn list_idempotency_keys(
        &mut self,
        filter: &IdempotencyKeyFilter,
    ) -> Result<Vec<IdempotencyKey>, StoreError>;

    /// Insert a key; a duplicate (key, user) pair is a [`StoreError::Conflict`]
    async fn save_idempotency_key(
        &mut self,
        key: NewIdempotencyKey,
    ) -> Result<IdempotencyKey, StoreError>;

    /// Persist the mutable columns: run/lock times, recovery point, response.
    /// The request fingerprint is never rewritten.
    async fn update_idempotency_key(&mut self, key: &IdempotencyKey) -> Result<(), StoreError>;

    /// Like [`update_idempotency_key`](Self::update_idempotency_key), but only
    /// while the stored row still has `expected`'s recovery point and lock
    /// timestamp. Otherwise nothing is written and the call fails with
    /// [`StoreError::Stale`].
    async fn update_idempotency_key_from(
        &mut self,
        expected: &IdempotencyKey,
        key: &IdempotencyKey,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RideRecords: Send {
    async fn find_ride(&mut self, filter: &RideFilter) -> Result<Option<Ride>, StoreError>;

    async fn list_rides(&mut self, filter: &RideFilter) -> Result<Vec<Ride>, StoreError>;

    async fn save_ride(&mut self, ride: NewRide) -> Result<Ride, StoreError>;

    /// Persist the charge reference
    async fn update_ride(&mut self, ride: &Ride) -> Result<(), StoreError>;
}

/// Audit records are append-only: there is no update
#[async_trait]
pub trait AuditRecords: Send {
    async fn list_audit_records(
        &mut self,
        filter: &AuditRecordFilter,
    ) -> Result<Vec<AuditRecord>, StoreError>;

    async fn save_audit_record(&mut self, record: NewAuditRecord)
        -> Result<AuditRecord, StoreError>;
}

#[async_trait]
pub trait StagedJobRecords: Send {
    async fn list_staged_jobs(
        &mut self,
        filter: &StagedJobFilter,
    ) -> Result<Vec<StagedJob>, StoreError>;

    async fn save_staged_job(&mut self, job: NewStagedJob) -> Result<StagedJob, StoreError>;
}

#[async_trait]
pub trait UserRecords: Send {
    async fn find_user(&mut self, filter: &UserFilter) -> Result<Option<User>, StoreError>;

    async fn save_user(&mut self, user: NewUser) -> Result<User, StoreError>;
}

/// Every record kind, bound to one transaction
pub trait Records:
    IdempotencyKeyRecords + RideRecords + AuditRecords + StagedJobRecords + UserRecords
{
}

impl<T> Records for T where
    T: IdempotencyKeyRecords + RideRecords + AuditRecords + StagedJobRecords + UserRecords
{
}
