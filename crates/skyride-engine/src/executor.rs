//! Workflow executor
//!
//! `create` books a ride exactly once per idempotency key:
//!
//! 1. acquire the key in one SERIALIZABLE transaction (insert, replay or
//!    take over a stale lock)
//! 2. drive the recovery-point state machine, one transaction per step
//! 3. on failure, release the lock so the client can retry right away
//!
//! Every step commits its side effects together with the next recovery
//! point, so a crash at any moment leaves the key resumable from the last
//! committed point.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, info, instrument, warn};

use skyride_core::{
    Caller, Clock, Context, Fingerprint, IdempotencyKey, IdempotencyKeyDraft, NewIdempotencyKey,
    PaymentGateway, RecoveryPoint, Ride, RideDraft, SystemClock,
};
use skyride_storage::{
    transaction, IdempotencyKeyFilter, IdempotencyKeyRecords, Isolation, UnitOfWork,
};

use crate::config::EngineConfig;
use crate::error::WorkflowError;
use crate::steps::ChargeOutcome;

/// Workflow executor
///
/// # Example
///
/// ```ignore
/// use skyride_engine::{EngineConfig, WorkflowExecutor};
/// use skyride_storage::InMemoryUnitOfWork;
///
/// let executor = WorkflowExecutor::new(InMemoryUnitOfWork::new(), gateway, EngineConfig::default());
/// let key = executor
///     .create(&ctx, &caller, IdempotencyKeyDraft::new("k1", "POST", "/rides"), ride)
///     .await?;
/// assert_eq!(key.response.unwrap().status, 200);
/// ```
pub struct WorkflowExecutor<U: UnitOfWork> {
    pub(crate) uow: U,
    pub(crate) gateway: Arc<dyn PaymentGateway>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
}

impl<U: UnitOfWork> WorkflowExecutor<U> {
    pub fn new(uow: U, gateway: Arc<dyn PaymentGateway>, config: EngineConfig) -> Self {
        Self {
            uow,
            gateway,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Replace the wall clock used for lock timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn uow(&self) -> &U {
        &self.uow
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current time at the precision the database stores
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(6)
    }

    /// Book a ride for `caller` under the given idempotency key.
    ///
    /// Returns the finished key; its cached response is what the client
    /// should see. Repeating the call with the same key and ride replays
    /// that response without any new side effects.
    #[instrument(skip_all, fields(key = %key_draft.key, user_id = caller.user.id))]
    pub async fn create(
        &self,
        ctx: &Context,
        caller: &Caller,
        key_draft: IdempotencyKeyDraft,
        ride: RideDraft,
    ) -> Result<IdempotencyKey, WorkflowError> {
        ride.validate()
            .map_err(|e| WorkflowError::InvalidRequest(e.to_string()))?;
        let fingerprint = Fingerprint::of(&ride)?;

        let mut key = self
            .acquire(ctx, caller.user.id, key_draft, fingerprint)
            .await?;

        if let Err(err) = self.drive(ctx, caller, &mut key, ride).await {
            warn!(
                key_id = %key.id,
                recovery_point = %key.recovery_point,
                error = %err,
                "workflow step failed"
            );
            self.unlock(&key).await;
            return Err(err);
        }

        Ok(key)
    }

    /// Find or create the key row and take its lock.
    #[instrument(skip_all, fields(key = %draft.key))]
    async fn acquire(
        &self,
        ctx: &Context,
        user_id: i64,
        draft: IdempotencyKeyDraft,
        fingerprint: Fingerprint,
    ) -> Result<IdempotencyKey, WorkflowError> {
        let now = self.now();
        let lock_timeout = self.config.lock_timeout;

        let key = transaction(&self.uow, ctx, Isolation::Serializable, move |tx| {
            Box::pin(async move {
                let filter = IdempotencyKeyFilter::by_key(draft.key.clone(), user_id);
                let Some(mut key) = tx.find_idempotency_key(&filter).await? else {
                    let new = NewIdempotencyKey::started(&draft, user_id, fingerprint, now);
                    return Ok(tx.save_idempotency_key(new).await?);
                };

                if !key.request_params.matches(&fingerprint) {
                    return Err(WorkflowError::ParamsMismatch);
                }
                if key.is_locked(now, lock_timeout) {
                    return Err(WorkflowError::RequestInProgress);
                }
                if !key.is_finished() {
                    key.lock(now);
                    tx.update_idempotency_key(&key).await?;
                }
                Ok::<_, WorkflowError>(key)
            })
        })
        .await?;

        debug!(key_id = %key.id, recovery_point = %key.recovery_point, "acquired key");
        Ok(key)
    }

    /// Run steps until the key is finished. `key` always mirrors the last
    /// committed state of the row.
    async fn drive(
        &self,
        ctx: &Context,
        caller: &Caller,
        key: &mut IdempotencyKey,
        draft: RideDraft,
    ) -> Result<(), WorkflowError> {
        let mut ride: Option<Ride> = None;

        loop {
            match key.recovery_point {
                RecoveryPoint::Started => {
                    let (next, created) = self.create_ride(ctx, caller, key, draft).await?;
                    *key = next;
                    ride = Some(created);
                }
                RecoveryPoint::Created => {
                    match self.charge(ctx, caller, key, ride.take()).await? {
                        ChargeOutcome::Charged(next) => *key = next,
                        ChargeOutcome::Rejected(next, err) => {
                            *key = next;
                            return Err(err);
                        }
                    }
                }
                RecoveryPoint::Charged => {
                    *key = self.send_receipt(ctx, key).await?;
                }
                RecoveryPoint::Finished => {
                    info!(key_id = %key.id, "workflow finished");
                    return Ok(());
                }
            }
        }
    }

    /// Best-effort release of the lock taken by `acquire`.
    ///
    /// Runs outside the caller's context so that a cancelled request still
    /// unlocks. The lock is only cleared if it is still ours; an attempt that
    /// took over a stale lock is left alone.
    async fn unlock(&self, key: &IdempotencyKey) {
        let Some(locked_at) = key.locked_at else {
            return;
        };
        let key_id = key.id;

        let result = transaction(
            &self.uow,
            &Context::background(),
            Isolation::ReadCommitted,
            move |tx| {
                Box::pin(async move {
                    let filter = IdempotencyKeyFilter::by_id(key_id);
                    match tx.find_idempotency_key(&filter).await? {
                        Some(mut stored) if stored.locked_at == Some(locked_at) => {
                            stored.unlock();
                            tx.update_idempotency_key(&stored).await?;
                            Ok(true)
                        }
                        _ => Ok::<_, WorkflowError>(false),
                    }
                })
            },
        )
        .await;

        match result {
            Ok(true) => debug!(%key_id, "unlocked key"),
            Ok(false) => debug!(%key_id, "lock no longer held, skipping unlock"),
            Err(e) => warn!(%key_id, error = %e, "failed to unlock key"),
        }
    }
}
