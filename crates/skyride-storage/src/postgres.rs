//! PostgreSQL implementation of the record store
//!
//! Every handle works against one `sqlx` transaction. Serialization
//! failures and unique violations are reported as [`StoreError::Conflict`]
//! so callers can tell a lost race from a broken database.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use skyride_core::{
    AuditRecord, IdempotencyKey, NewAuditRecord, NewIdempotencyKey, NewRide, NewStagedJob, Ride,
    StagedJob, User,
};

use crate::models::{AuditRecordRow, IdempotencyKeyRow, RideRow, StagedJobRow, UserRow};
use crate::store::*;
use crate::uow::{Transaction, UnitOfWork};

/// SQLSTATE codes that mean "another transaction got there first"
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let Some(db_err) = e.as_database_error() {
            if let Some(code) = db_err.code() {
                if matches!(
                    code.as_ref(),
                    SERIALIZATION_FAILURE | DEADLOCK_DETECTED | UNIQUE_VIOLATION
                ) {
                    return StoreError::Conflict(db_err.message().to_string());
                }
            }
        }
        StoreError::Database(e.to_string())
    }
}

const KEY_COLUMNS: &str = "id, created_at, idempotency_key, last_run_at, locked_at, \
     request_method, request_params, request_path, response_code, response_body, \
     recovery_point, user_id";

const RIDE_COLUMNS: &str = "id, created_at, idempotency_key_id, origin_lat, origin_lon, \
     target_lat, target_lon, stripe_charge_id, user_id";

const AUDIT_COLUMNS: &str = "id, action, created_at, data, origin_ip, resource_id, \
     resource_type, user_id, idempotency_key_id";

const JOB_COLUMNS: &str = "id, job_name, job_args, idempotency_key_id, created_at";

/// Unit of work backed by a PostgreSQL connection pool
///
/// # Example
///
/// ```ignore
/// use skyride_storage::PgUnitOfWork;
///
/// let uow = PgUnitOfWork::connect("postgres://localhost/skyride").await?;
/// uow.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PgUnitOfWork {
    pool: PgPool,
}

impl PgUnitOfWork {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a pool from a database URL
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    type Tx = PgTransaction;

    #[instrument(skip(self))]
    async fn begin(&self, isolation: Isolation) -> Result<PgTransaction, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            StoreError::from(e)
        })?;

        if isolation != Isolation::ReadCommitted {
            sqlx::query(&format!(
                "SET TRANSACTION ISOLATION LEVEL {}",
                isolation.as_sql()
            ))
            .execute(&mut *tx)
            .await?;
        }

        Ok(PgTransaction { tx })
    }
}

/// One open PostgreSQL transaction
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn push_key_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &IdempotencyKeyFilter) {
    if let Some(id) = filter.id {
        qb.push(" AND id = ").push_bind(id);
    }
    if let Some(key) = &filter.key {
        qb.push(" AND idempotency_key = ").push_bind(key.clone());
    }
    if let Some(user_id) = filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id);
    }
}

fn push_ride_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &RideFilter) {
    if let Some(id) = filter.id {
        qb.push(" AND id = ").push_bind(id);
    }
    if let Some(key_id) = filter.idempotency_key_id {
        qb.push(" AND idempotency_key_id = ").push_bind(key_id);
    }
    if let Some(user_id) = filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id);
    }
}

#[async_trait]
impl IdempotencyKeyRecords for PgTransaction {
    #[instrument(skip(self))]
    async fn find_idempotency_key(
        &mut self,
        filter: &IdempotencyKeyFilter,
    ) -> Result<Option<IdempotencyKey>, StoreError> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT {KEY_COLUMNS} FROM idempotency_keys WHERE TRUE"
        ));
        push_key_filter(&mut qb, filter);
        qb.push(" LIMIT 1");

        qb.build_query_as::<IdempotencyKeyRow>()
            .fetch_optional(&mut *self.tx)
            .await?
            .map(IdempotencyKey::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn list_idempotency_keys(
        &mut self,
        filter: &IdempotencyKeyFilter,
    ) -> Result<Vec<IdempotencyKey>, StoreError> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT {KEY_COLUMNS} FROM idempotency_keys WHERE TRUE"
        ));
        push_key_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at, id");

        qb.build_query_as::<IdempotencyKeyRow>()
            .fetch_all(&mut *self.tx)
            .await?
            .into_iter()
            .map(IdempotencyKey::try_from)
            .collect()
    }

    #[instrument(skip(self, key), fields(key = %key.key, user_id = key.user_id))]
    async fn save_idempotency_key(
        &mut self,
        key: NewIdempotencyKey,
    ) -> Result<IdempotencyKey, StoreError> {
        let row = sqlx::query_as::<_, IdempotencyKeyRow>(&format!(
            r#"
            INSERT INTO idempotency_keys
                (id, idempotency_key, last_run_at, locked_at, request_method,
                 request_params, request_path, recovery_point, user_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {KEY_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(&key.key)
        .bind(key.last_run_at)
        .bind(key.locked_at)
        .bind(&key.request_method)
        .bind(key.request_params.as_value())
        .bind(&key.request_path)
        .bind(key.recovery_point.as_str())
        .bind(key.user_id)
        .fetch_one(&mut *self.tx)
        .await?;

        debug!(id = %row.id, "saved idempotency key");
        row.try_into()
    }

    #[instrument(skip(self, key), fields(id = %key.id, recovery_point = %key.recovery_point))]
    async fn update_idempotency_key(&mut self, key: &IdempotencyKey) -> Result<(), StoreError> {
        let (response_code, response_body) = match &key.response {
            Some(response) => (
                Some(i32::from(response.status)),
                Some(serde_json::to_value(&response.body)?),
            ),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET last_run_at = $2,
                locked_at = $3,
                recovery_point = $4,
                response_code = $5,
                response_body = $6
            WHERE id = $1
            "#,
        )
        .bind(key.id)
        .bind(key.last_run_at)
        .bind(key.locked_at)
        .bind(key.recovery_point.as_str())
        .bind(response_code)
        .bind(response_body)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("idempotency key", key.id));
        }
        Ok(())
    }

    #[instrument(
        skip(self, expected, key),
        fields(id = %key.id, from = %expected.recovery_point, to = %key.recovery_point)
    )]
    async fn update_idempotency_key_from(
        &mut self,
        expected: &IdempotencyKey,
        key: &IdempotencyKey,
    ) -> Result<(), StoreError> {
        let (response_code, response_body) = match &key.response {
            Some(response) => (
                Some(i32::from(response.status)),
                Some(serde_json::to_value(&response.body)?),
            ),
            None => (None, None),
        };

        // Under READ COMMITTED a blocked UPDATE re-evaluates its WHERE clause
        // against the row the other transaction committed.
        let result = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET last_run_at = $2,
                locked_at = $3,
                recovery_point = $4,
                response_code = $5,
                response_body = $6
            WHERE id = $1
              AND recovery_point = $7
              AND locked_at IS NOT DISTINCT FROM $8
            "#,
        )
        .bind(key.id)
        .bind(key.last_run_at)
        .bind(key.locked_at)
        .bind(key.recovery_point.as_str())
        .bind(response_code)
        .bind(response_body)
        .bind(expected.recovery_point.as_str())
        .bind(expected.locked_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            warn!("idempotency key changed by another attempt");
            return Err(StoreError::stale("idempotency key", key.id));
        }
        Ok(())
    }
}

#[async_trait]
impl RideRecords for PgTransaction {
    #[instrument(skip(self))]
    async fn find_ride(&mut self, filter: &RideFilter) -> Result<Option<Ride>, StoreError> {
        let mut qb = QueryBuilder::new(format!("SELECT {RIDE_COLUMNS} FROM rides WHERE TRUE"));
        push_ride_filter(&mut qb, filter);
        qb.push(" LIMIT 1");

        let row = qb
            .build_query_as::<RideRow>()
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(Ride::from))
    }

    #[instrument(skip(self))]
    async fn list_rides(&mut self, filter: &RideFilter) -> Result<Vec<Ride>, StoreError> {
        let mut qb = QueryBuilder::new(format!("SELECT {RIDE_COLUMNS} FROM rides WHERE TRUE"));
        push_ride_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at, id");

        let rows = qb.build_query_as::<RideRow>().fetch_all(&mut *self.tx).await?;
        Ok(rows.into_iter().map(Ride::from).collect())
    }

    #[instrument(skip(self, ride), fields(idempotency_key_id = %ride.idempotency_key_id))]
    async fn save_ride(&mut self, ride: NewRide) -> Result<Ride, StoreError> {
        let row = sqlx::query_as::<_, RideRow>(&format!(
            r#"
            INSERT INTO rides
                (id, idempotency_key_id, origin_lat, origin_lon, target_lat, target_lon, user_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {RIDE_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(ride.idempotency_key_id)
        .bind(ride.origin_lat)
        .bind(ride.origin_lon)
        .bind(ride.target_lat)
        .bind(ride.target_lon)
        .bind(ride.user_id)
        .fetch_one(&mut *self.tx)
        .await?;

        debug!(id = %row.id, "saved ride");
        Ok(row.into())
    }

    #[instrument(skip(self, ride), fields(id = %ride.id))]
    async fn update_ride(&mut self, ride: &Ride) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE rides SET stripe_charge_id = $2 WHERE id = $1")
            .bind(ride.id)
            .bind(&ride.stripe_charge_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("ride", ride.id));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditRecords for PgTransaction {
    #[instrument(skip(self))]
    async fn list_audit_records(
        &mut self,
        filter: &AuditRecordFilter,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        let mut qb =
            QueryBuilder::new(format!("SELECT {AUDIT_COLUMNS} FROM audit_records WHERE TRUE"));
        if let Some(resource_id) = filter.resource_id {
            qb.push(" AND resource_id = ").push_bind(resource_id);
        }
        if let Some(key_id) = filter.idempotency_key_id {
            qb.push(" AND idempotency_key_id = ").push_bind(key_id);
        }
        if let Some(user_id) = filter.user_id {
            qb.push(" AND user_id = ").push_bind(user_id);
        }
        qb.push(" ORDER BY created_at, id");

        qb.build_query_as::<AuditRecordRow>()
            .fetch_all(&mut *self.tx)
            .await?
            .into_iter()
            .map(AuditRecord::try_from)
            .collect()
    }

    #[instrument(skip(self, record), fields(resource_id = %record.resource_id))]
    async fn save_audit_record(
        &mut self,
        record: NewAuditRecord,
    ) -> Result<AuditRecord, StoreError> {
        let row = sqlx::query_as::<_, AuditRecordRow>(&format!(
            r#"
            INSERT INTO audit_records
                (id, action, created_at, data, origin_ip, resource_id, resource_type,
                 user_id, idempotency_key_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {AUDIT_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(record.action.as_str())
        .bind(record.created_at)
        .bind(&record.data)
        .bind(&record.origin_ip)
        .bind(record.resource_id)
        .bind(record.resource_type.as_str())
        .bind(record.user_id)
        .bind(record.idempotency_key_id)
        .fetch_one(&mut *self.tx)
        .await?;

        row.try_into()
    }
}

#[async_trait]
impl StagedJobRecords for PgTransaction {
    #[instrument(skip(self))]
    async fn list_staged_jobs(
        &mut self,
        filter: &StagedJobFilter,
    ) -> Result<Vec<StagedJob>, StoreError> {
        let mut qb = QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM staged_jobs WHERE TRUE"));
        if let Some(job_name) = filter.job_name {
            qb.push(" AND job_name = ").push_bind(job_name.as_str());
        }
        if let Some(key_id) = filter.idempotency_key_id {
            qb.push(" AND idempotency_key_id = ").push_bind(key_id);
        }
        qb.push(" ORDER BY created_at, id");

        qb.build_query_as::<StagedJobRow>()
            .fetch_all(&mut *self.tx)
            .await?
            .into_iter()
            .map(StagedJob::try_from)
            .collect()
    }

    #[instrument(skip(self, job), fields(job_name = %job.job_name))]
    async fn save_staged_job(&mut self, job: NewStagedJob) -> Result<StagedJob, StoreError> {
        let row = sqlx::query_as::<_, StagedJobRow>(&format!(
            r#"
            INSERT INTO staged_jobs (id, job_name, job_args, idempotency_key_id)
            VALUES ($1, $2, $3, $4)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(job.job_name.as_str())
        .bind(&job.job_args)
        .bind(job.idempotency_key_id)
        .fetch_one(&mut *self.tx)
        .await?;

        debug!(id = %row.id, "staged job");
        row.try_into()
    }
}

#[async_trait]
impl UserRecords for PgTransaction {
    #[instrument(skip(self))]
    async fn find_user(&mut self, filter: &UserFilter) -> Result<Option<User>, StoreError> {
        let mut qb = QueryBuilder::new("SELECT id, email, stripe_customer_id FROM users WHERE TRUE");
        if let Some(id) = filter.id {
            qb.push(" AND id = ").push_bind(id);
        }
        if let Some(email) = &filter.email {
            qb.push(" AND email = ").push_bind(email.clone());
        }
        qb.push(" LIMIT 1");

        let row = qb
            .build_query_as::<UserRow>()
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(User::from))
    }

    #[instrument(skip(self, user), fields(email = %user.email))]
    async fn save_user(&mut self, user: NewUser) -> Result<User, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (email, stripe_customer_id)
            VALUES ($1, $2)
            RETURNING id, email, stripe_customer_id
            "#,
        )
        .bind(&user.email)
        .bind(&user.stripe_customer_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(row.into())
    }
}
