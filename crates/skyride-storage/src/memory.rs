//! In-memory implementation of the record store
//!
//! Transactions are fully serialized: `begin` waits for the single gate, takes
//! a snapshot of every table, and `commit` writes the snapshot back. A
//! rollback just drops it. That gives the same observable semantics as a
//! serializable PostgreSQL transaction for the access patterns the engine uses.
//!
//! Tests can plant one-shot failures with [`InMemoryUnitOfWork::fail_next`]
//! and inspect commit counters with [`InMemoryUnitOfWork::stats`].
//!
//! # Example
//!
//! ```
//! use skyride_storage::{InMemoryUnitOfWork, Operation};
//!
//! let uow = InMemoryUnitOfWork::new();
//! uow.fail_next(Operation::SaveStagedJob);
//! assert_eq!(uow.stats().commits, 0);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use uuid::Uuid;

use skyride_core::{
    AuditRecord, IdempotencyKey, NewAuditRecord, NewIdempotencyKey, NewRide, NewStagedJob, Ride,
    StagedJob, UnknownRecoveryPoint, User,
};

use crate::store::*;
use crate::uow::{Transaction, UnitOfWork};

/// Store operations a test can make fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Begin,
    Commit,
    FindIdempotencyKey,
    ListIdempotencyKeys,
    SaveIdempotencyKey,
    UpdateIdempotencyKey,
    FindRide,
    ListRides,
    SaveRide,
    UpdateRide,
    ListAuditRecords,
    SaveAuditRecord,
    ListStagedJobs,
    SaveStagedJob,
    FindUser,
    SaveUser,
}

/// Transaction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub commits: u64,
    pub rollbacks: u64,
    /// Inserts and updates made by committed transactions
    pub writes: u64,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    keys: Vec<IdempotencyKey>,
    /// Raw recovery point values that no longer parse, by key id
    corrupt_points: HashMap<Uuid, String>,
    rides: Vec<Ride>,
    audit_records: Vec<AuditRecord>,
    staged_jobs: Vec<StagedJob>,
    users: Vec<User>,
    next_user_id: i64,
}

impl Tables {
    fn check_key_ref(&self, key_id: Option<Uuid>) -> Result<(), StoreError> {
        match key_id {
            Some(id) if !self.keys.iter().any(|k| k.id == id) => Err(StoreError::Database(
                format!("foreign key violation: idempotency key {id} does not exist"),
            )),
            _ => Ok(()),
        }
    }

    fn readable(&self, key: &IdempotencyKey) -> Result<IdempotencyKey, StoreError> {
        match self.corrupt_points.get(&key.id) {
            Some(raw) => Err(UnknownRecoveryPoint(raw.clone()).into()),
            None => Ok(key.clone()),
        }
    }
}

struct Shared {
    gate: Arc<tokio::sync::Mutex<()>>,
    tables: Mutex<Tables>,
    /// Planted failures with the number of calls to let through first
    faults: Mutex<Vec<(Operation, usize)>>,
    stats: Mutex<Stats>,
}

impl Shared {
    fn check(&self, op: Operation) -> Result<(), StoreError> {
        let mut faults = self.faults.lock();
        let Some(pos) = faults.iter().position(|(f, _)| *f == op) else {
            return Ok(());
        };
        if faults[pos].1 > 0 {
            faults[pos].1 -= 1;
            return Ok(());
        }
        faults.remove(pos);
        debug!(?op, "injecting failure");
        Err(StoreError::Injected(format!("{op:?}")))
    }
}

/// In-memory unit of work, cheap to clone
#[derive(Clone)]
pub struct InMemoryUnitOfWork {
    shared: Arc<Shared>,
}

impl InMemoryUnitOfWork {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                gate: Arc::new(tokio::sync::Mutex::new(())),
                tables: Mutex::new(Tables {
                    next_user_id: 1,
                    ..Default::default()
                }),
                faults: Mutex::new(Vec::new()),
                stats: Mutex::new(Stats::default()),
            }),
        }
    }

    /// Make the next call of `op` fail with [`StoreError::Injected`]
    pub fn fail_next(&self, op: Operation) {
        self.fail_after(op, 0);
    }

    /// Let `skip` calls of `op` succeed, then fail the next one
    pub fn fail_after(&self, op: Operation, skip: usize) {
        self.shared.faults.lock().push((op, skip));
    }

    pub fn stats(&self) -> Stats {
        *self.shared.stats.lock()
    }

    /// Insert a user outside any transaction, keeping its id
    pub fn insert_user(&self, user: User) {
        let mut tables = self.shared.tables.lock();
        tables.next_user_id = tables.next_user_id.max(user.id + 1);
        tables.users.retain(|u| u.id != user.id);
        tables.users.push(user);
    }

    /// Insert or replace a key row outside any transaction
    pub fn put_idempotency_key(&self, key: IdempotencyKey) {
        let mut tables = self.shared.tables.lock();
        tables.corrupt_points.remove(&key.id);
        match tables.keys.iter_mut().find(|k| k.id == key.id) {
            Some(existing) => *existing = key,
            None => tables.keys.push(key),
        }
    }

    /// Overwrite the stored recovery point of a key with a raw value
    pub fn corrupt_recovery_point(&self, key_id: Uuid, raw: impl Into<String>) {
        self.shared
            .tables
            .lock()
            .corrupt_points
            .insert(key_id, raw.into());
    }

    pub fn idempotency_keys(&self) -> Vec<IdempotencyKey> {
        self.shared.tables.lock().keys.clone()
    }

    pub fn rides(&self) -> Vec<Ride> {
        self.shared.tables.lock().rides.clone()
    }

    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.shared.tables.lock().audit_records.clone()
    }

    pub fn staged_jobs(&self) -> Vec<StagedJob> {
        self.shared.tables.lock().staged_jobs.clone()
    }

    pub fn users(&self) -> Vec<User> {
        self.shared.tables.lock().users.clone()
    }
}

impl Default for InMemoryUnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    type Tx = InMemoryTransaction;

    async fn begin(&self, _isolation: Isolation) -> Result<InMemoryTransaction, StoreError> {
        self.shared.check(Operation::Begin)?;
        let guard = self.shared.gate.clone().lock_owned().await;
        let tables = self.shared.tables.lock().clone();
        Ok(InMemoryTransaction {
            _guard: guard,
            shared: self.shared.clone(),
            tables,
            writes: 0,
        })
    }
}

/// Snapshot of every table, private to one transaction
pub struct InMemoryTransaction {
    _guard: OwnedMutexGuard<()>,
    shared: Arc<Shared>,
    tables: Tables,
    writes: u64,
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        if let Err(e) = self.shared.check(Operation::Commit) {
            self.shared.stats.lock().rollbacks += 1;
            return Err(e);
        }
        *self.shared.tables.lock() = self.tables;
        let mut stats = self.shared.stats.lock();
        stats.commits += 1;
        stats.writes += self.writes;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.shared.stats.lock().rollbacks += 1;
        Ok(())
    }
}

fn key_matches(key: &IdempotencyKey, filter: &IdempotencyKeyFilter) -> bool {
    filter.id.is_none_or(|id| key.id == id)
        && filter.key.as_ref().is_none_or(|k| &key.key == k)
        && filter.user_id.is_none_or(|u| key.user_id == u)
}

fn ride_matches(ride: &Ride, filter: &RideFilter) -> bool {
    filter.id.is_none_or(|id| ride.id == id)
        && filter
            .idempotency_key_id
            .is_none_or(|k| ride.idempotency_key_id == Some(k))
        && filter.user_id.is_none_or(|u| ride.user_id == u)
}

#[async_trait]
impl IdempotencyKeyRecords for InMemoryTransaction {
    async fn find_idempotency_key(
        &mut self,
        filter: &IdempotencyKeyFilter,
    ) -> Result<Option<IdempotencyKey>, StoreError> {
        self.shared.check(Operation::FindIdempotencyKey)?;
        self.tables
            .keys
            .iter()
            .find(|k| key_matches(k, filter))
            .map(|k| self.tables.readable(k))
            .transpose()
    }

    async fn list_idempotency_keys(
        &mut self,
        filter: &IdempotencyKeyFilter,
    ) -> Result<Vec<IdempotencyKey>, StoreError> {
        self.shared.check(Operation::ListIdempotencyKeys)?;
        self.tables
            .keys
            .iter()
            .filter(|k| key_matches(k, filter))
            .map(|k| self.tables.readable(k))
            .collect()
    }

    async fn save_idempotency_key(
        &mut self,
        key: NewIdempotencyKey,
    ) -> Result<IdempotencyKey, StoreError> {
        self.shared.check(Operation::SaveIdempotencyKey)?;
        if self
            .tables
            .keys
            .iter()
            .any(|k| k.key == key.key && k.user_id == key.user_id)
        {
            return Err(StoreError::Conflict(format!(
                "duplicate idempotency key {} for user {}",
                key.key, key.user_id
            )));
        }

        let saved = IdempotencyKey {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            key: key.key,
            user_id: key.user_id,
            last_run_at: key.last_run_at,
            locked_at: key.locked_at,
            request_method: key.request_method,
            request_path: key.request_path,
            request_params: key.request_params,
            recovery_point: key.recovery_point,
            response: None,
        };
        self.tables.keys.push(saved.clone());
        self.writes += 1;
        Ok(saved)
    }

    async fn update_idempotency_key(&mut self, key: &IdempotencyKey) -> Result<(), StoreError> {
        self.shared.check(Operation::UpdateIdempotencyKey)?;
        let stored = self
            .tables
            .keys
            .iter_mut()
            .find(|k| k.id == key.id)
            .ok_or_else(|| StoreError::not_found("idempotency key", key.id))?;

        stored.last_run_at = key.last_run_at;
        stored.locked_at = key.locked_at;
        stored.recovery_point = key.recovery_point;
        stored.response = key.response.clone();
        self.tables.corrupt_points.remove(&key.id);
        self.writes += 1;
        Ok(())
    }

    async fn update_idempotency_key_from(
        &mut self,
        expected: &IdempotencyKey,
        key: &IdempotencyKey,
    ) -> Result<(), StoreError> {
        self.shared.check(Operation::UpdateIdempotencyKey)?;
        let unchanged = !self.tables.corrupt_points.contains_key(&key.id)
            && self.tables.keys.iter().any(|k| {
                k.id == key.id
                    && k.recovery_point == expected.recovery_point
                    && k.locked_at == expected.locked_at
            });
        if !unchanged {
            debug!(id = %key.id, "idempotency key changed by another attempt");
            return Err(StoreError::stale("idempotency key", key.id));
        }

        let stored = self
            .tables
            .keys
            .iter_mut()
            .find(|k| k.id == key.id)
            .ok_or_else(|| StoreError::not_found("idempotency key", key.id))?;
        stored.last_run_at = key.last_run_at;
        stored.locked_at = key.locked_at;
        stored.recovery_point = key.recovery_point;
        stored.response = key.response.clone();
        self.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl RideRecords for InMemoryTransaction {
    async fn find_ride(&mut self, filter: &RideFilter) -> Result<Option<Ride>, StoreError> {
        self.shared.check(Operation::FindRide)?;
        Ok(self
            .tables
            .rides
            .iter()
            .find(|r| ride_matches(r, filter))
            .cloned())
    }

    async fn list_rides(&mut self, filter: &RideFilter) -> Result<Vec<Ride>, StoreError> {
        self.shared.check(Operation::ListRides)?;
        Ok(self
            .tables
            .rides
            .iter()
            .filter(|r| ride_matches(r, filter))
            .cloned()
            .collect())
    }

    async fn save_ride(&mut self, ride: NewRide) -> Result<Ride, StoreError> {
        self.shared.check(Operation::SaveRide)?;
        self.tables.check_key_ref(Some(ride.idempotency_key_id))?;

        let saved = Ride {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            idempotency_key_id: Some(ride.idempotency_key_id),
            origin_lat: ride.origin_lat,
            origin_lon: ride.origin_lon,
            target_lat: ride.target_lat,
            target_lon: ride.target_lon,
            stripe_charge_id: None,
            user_id: ride.user_id,
        };
        self.tables.rides.push(saved.clone());
        self.writes += 1;
        Ok(saved)
    }

    async fn update_ride(&mut self, ride: &Ride) -> Result<(), StoreError> {
        self.shared.check(Operation::UpdateRide)?;
        let stored = self
            .tables
            .rides
            .iter_mut()
            .find(|r| r.id == ride.id)
            .ok_or_else(|| StoreError::not_found("ride", ride.id))?;

        stored.stripe_charge_id = ride.stripe_charge_id.clone();
        self.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl AuditRecords for InMemoryTransaction {
    async fn list_audit_records(
        &mut self,
        filter: &AuditRecordFilter,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        self.shared.check(Operation::ListAuditRecords)?;
        Ok(self
            .tables
            .audit_records
            .iter()
            .filter(|a| {
                filter.resource_id.is_none_or(|id| a.resource_id == id)
                    && filter
                        .idempotency_key_id
                        .is_none_or(|k| a.idempotency_key_id == Some(k))
                    && filter.user_id.is_none_or(|u| a.user_id == u)
            })
            .cloned()
            .collect())
    }

    async fn save_audit_record(
        &mut self,
        record: NewAuditRecord,
    ) -> Result<AuditRecord, StoreError> {
        self.shared.check(Operation::SaveAuditRecord)?;
        self.tables.check_key_ref(record.idempotency_key_id)?;

        let saved = AuditRecord {
            id: Uuid::now_v7(),
            action: record.action,
            resource_type: record.resource_type,
            resource_id: record.resource_id,
            origin_ip: record.origin_ip,
            data: record.data,
            user_id: record.user_id,
            idempotency_key_id: record.idempotency_key_id,
            created_at: record.created_at,
        };
        self.tables.audit_records.push(saved.clone());
        self.writes += 1;
        Ok(saved)
    }
}

#[async_trait]
impl StagedJobRecords for InMemoryTransaction {
    async fn list_staged_jobs(
        &mut self,
        filter: &StagedJobFilter,
    ) -> Result<Vec<StagedJob>, StoreError> {
        self.shared.check(Operation::ListStagedJobs)?;
        Ok(self
            .tables
            .staged_jobs
            .iter()
            .filter(|j| {
                filter.job_name.is_none_or(|n| j.job_name == n)
                    && filter
                        .idempotency_key_id
                        .is_none_or(|k| j.idempotency_key_id == Some(k))
            })
            .cloned()
            .collect())
    }

    async fn save_staged_job(&mut self, job: NewStagedJob) -> Result<StagedJob, StoreError> {
        self.shared.check(Operation::SaveStagedJob)?;
        self.tables.check_key_ref(job.idempotency_key_id)?;

        let saved = StagedJob {
            id: Uuid::now_v7(),
            job_name: job.job_name,
            job_args: job.job_args,
            idempotency_key_id: job.idempotency_key_id,
            created_at: Utc::now(),
        };
        self.tables.staged_jobs.push(saved.clone());
        self.writes += 1;
        Ok(saved)
    }
}

#[async_trait]
impl UserRecords for InMemoryTransaction {
    async fn find_user(&mut self, filter: &UserFilter) -> Result<Option<User>, StoreError> {
        self.shared.check(Operation::FindUser)?;
        Ok(self
            .tables
            .users
            .iter()
            .find(|u| {
                filter.id.is_none_or(|id| u.id == id)
                    && filter.email.as_ref().is_none_or(|e| &u.email == e)
            })
            .cloned())
    }

    async fn save_user(&mut self, user: NewUser) -> Result<User, StoreError> {
        self.shared.check(Operation::SaveUser)?;
        if self.tables.users.iter().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict(format!("duplicate email {}", user.email)));
        }

        let saved = User {
            id: self.tables.next_user_id,
            email: user.email,
            stripe_customer_id: user.stripe_customer_id,
        };
        self.tables.next_user_id += 1;
        self.tables.users.push(saved.clone());
        self.writes += 1;
        Ok(saved)
    }
}
