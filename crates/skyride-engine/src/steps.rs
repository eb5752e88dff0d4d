// Workflow steps
//
// Each step takes the committed key, does its work in one transaction and
// returns the key as committed by that transaction. A step that fails
// leaves the row untouched.
//
// The key is written first and only if the row still holds the recovery
// point and lock this attempt last committed. An attempt whose lock was
// taken over stops there without writing.

use tracing::{debug, error, info, instrument, warn};

use skyride_core::{
    AuditAction, CachedResponse, Caller, ChargeRequest, Context, IdempotencyKey, NewAuditRecord,
    NewStagedJob, PaymentError, ReceiptArgs, RecoveryPoint, ResourceType, Ride, RideDraft,
};
use skyride_storage::{
    transaction, AuditRecords, IdempotencyKeyRecords, Isolation, RideFilter, RideRecords,
    StagedJobRecords, StoreError, UnitOfWork,
};

use crate::error::WorkflowError;
use crate::executor::WorkflowExecutor;

const MSG_PAYMENT_DECLINED: &str = "payment provider error";
const MSG_PAYMENT_UNAVAILABLE: &str = "generic payment provider error";

/// Result of the charge step that reached the database
pub(crate) enum ChargeOutcome {
    /// Charge succeeded; key is at CHARGED
    Charged(IdempotencyKey),
    /// Gateway refused for good; key is FINISHED with the error cached
    Rejected(IdempotencyKey, WorkflowError),
}

impl<U: UnitOfWork> WorkflowExecutor<U> {
    /// STARTED -> CREATED: insert the ride and its audit record.
    #[instrument(skip_all, fields(key_id = %key.id))]
    pub(crate) async fn create_ride(
        &self,
        ctx: &Context,
        caller: &Caller,
        key: &IdempotencyKey,
        draft: RideDraft,
    ) -> Result<(IdempotencyKey, Ride), WorkflowError> {
        let current = key.clone();
        let mut next = key.clone();
        next.advance(RecoveryPoint::Created);
        let origin_ip = caller.origin_ip.clone();
        let now = self.now();

        let (next, ride) = transaction(&self.uow, ctx, Isolation::ReadCommitted, move |tx| {
            Box::pin(async move {
                tx.update_idempotency_key_from(&current, &next).await?;
                let ride = tx.save_ride(draft.stamp(next.id, next.user_id)).await?;

                tx.save_audit_record(NewAuditRecord {
                    action: AuditAction::CreateRide,
                    resource_type: ResourceType::Ride,
                    resource_id: ride.id,
                    origin_ip,
                    data: next.request_params.as_value().clone(),
                    user_id: next.user_id,
                    idempotency_key_id: Some(next.id),
                    created_at: now,
                })
                .await?;

                Ok::<_, StoreError>((next, ride))
            })
        })
        .await?;

        info!(ride_id = %ride.id, "ride created");
        Ok((next, ride))
    }

    /// CREATED -> CHARGED: charge the rider and record the charge on the ride.
    ///
    /// `ride` is the ride created earlier in the same run, or `None` when
    /// resuming, in which case it is looked up by key.
    #[instrument(skip_all, fields(key_id = %key.id))]
    pub(crate) async fn charge(
        &self,
        ctx: &Context,
        caller: &Caller,
        key: &IdempotencyKey,
        ride: Option<Ride>,
    ) -> Result<ChargeOutcome, WorkflowError> {
        let ride = match ride {
            Some(ride) => ride,
            None => self.find_ride(ctx, key).await?,
        };

        let request = ChargeRequest {
            amount: self.config.ride_price_cents,
            currency: self.config.currency.clone(),
            customer: caller.user.stripe_customer_id.clone(),
            idempotency_token: key.gateway_token(&self.config.gateway_token_prefix),
            description: format!("Charge for ride {}", ride.id),
        };

        let result = ctx.run(self.gateway.charge(ctx, request)).await?;

        let mut next = key.clone();
        let charge = match result {
            Ok(charge) => charge,
            Err(PaymentError::Transport(message)) => {
                warn!(%message, "payment gateway unreachable");
                return Err(WorkflowError::Gateway(PaymentError::Transport(message)));
            }
            Err(err) => {
                let (response, rejection) = match &err {
                    PaymentError::CardDeclined { .. } => {
                        let response = CachedResponse::payment_required(MSG_PAYMENT_DECLINED);
                        let rejection = WorkflowError::PaymentDeclined {
                            response: response.clone(),
                        };
                        (response, rejection)
                    }
                    _ => {
                        let response = CachedResponse::service_unavailable(MSG_PAYMENT_UNAVAILABLE);
                        let rejection = WorkflowError::PaymentUnavailable {
                            response: response.clone(),
                        };
                        (response, rejection)
                    }
                };
                error!(error = %err, status = response.status, "charge rejected");

                next.finish(response);
                let (current, update) = (key.clone(), next.clone());
                transaction(&self.uow, ctx, Isolation::ReadCommitted, move |tx| {
                    Box::pin(async move {
                        tx.update_idempotency_key_from(&current, &update).await
                    })
                })
                .await?;
                return Ok(ChargeOutcome::Rejected(next, rejection));
            }
        };
        debug!(charge_id = %charge.id, "charge succeeded");

        let mut ride = ride;
        ride.stripe_charge_id = Some(charge.id);
        next.advance(RecoveryPoint::Charged);
        let current = key.clone();
        let next = transaction(&self.uow, ctx, Isolation::ReadCommitted, move |tx| {
            Box::pin(async move {
                tx.update_idempotency_key_from(&current, &next).await?;
                tx.update_ride(&ride).await?;
                Ok::<_, StoreError>(next)
            })
        })
        .await?;

        Ok(ChargeOutcome::Charged(next))
    }

    /// CHARGED -> FINISHED: stage the receipt job and cache the response.
    #[instrument(skip_all, fields(key_id = %key.id))]
    pub(crate) async fn send_receipt(
        &self,
        ctx: &Context,
        key: &IdempotencyKey,
    ) -> Result<IdempotencyKey, WorkflowError> {
        let args = ReceiptArgs {
            amount: self.config.receipt_amount(),
            currency: self.config.currency.clone(),
            user_id: key.user_id,
        };
        let job = NewStagedJob::receipt(&args, key.id)?;
        let current = key.clone();
        let mut next = key.clone();
        next.finish(CachedResponse::ok());

        let next = transaction(&self.uow, ctx, Isolation::ReadCommitted, move |tx| {
            Box::pin(async move {
                tx.update_idempotency_key_from(&current, &next).await?;
                tx.save_staged_job(job).await?;
                Ok::<_, StoreError>(next)
            })
        })
        .await?;

        info!("receipt staged");
        Ok(next)
    }

    async fn find_ride(&self, ctx: &Context, key: &IdempotencyKey) -> Result<Ride, WorkflowError> {
        let key_id = key.id;
        let ride = transaction(&self.uow, ctx, Isolation::ReadCommitted, move |tx| {
            Box::pin(async move { tx.find_ride(&RideFilter::by_idempotency_key(key_id)).await })
        })
        .await?;

        ride.ok_or_else(|| StoreError::not_found("ride for idempotency key", key_id).into())
    }
}
