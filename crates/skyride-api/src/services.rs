// Booking service used by the HTTP handlers
//
// Decision: handlers depend on this trait, not on a concrete storage backend,
// so one router serves both the postgres and the in-memory store.

use async_trait::async_trait;

use skyride_core::{Caller, Context, IdempotencyKey, IdempotencyKeyDraft, RideDraft, User};
use skyride_engine::{WorkflowError, WorkflowExecutor};
use skyride_storage::{transaction, Isolation, UnitOfWork, UserFilter, UserRecords};

#[async_trait]
pub trait RideService: Send + Sync {
    /// Look up the account a request claims to come from
    async fn find_user(&self, ctx: &Context, email: &str) -> Result<Option<User>, WorkflowError>;

    /// Run the booking workflow for one request
    async fn create_ride(
        &self,
        ctx: &Context,
        caller: &Caller,
        key: IdempotencyKeyDraft,
        ride: RideDraft,
    ) -> Result<IdempotencyKey, WorkflowError>;
}

#[async_trait]
impl<U> RideService for WorkflowExecutor<U>
where
    U: UnitOfWork + 'static,
{
    async fn find_user(&self, ctx: &Context, email: &str) -> Result<Option<User>, WorkflowError> {
        let filter = UserFilter::by_email(email);
        let user = transaction(self.uow(), ctx, Isolation::ReadCommitted, move |tx| {
            Box::pin(async move { tx.find_user(&filter).await })
        })
        .await?;
        Ok(user)
    }

    async fn create_ride(
        &self,
        ctx: &Context,
        caller: &Caller,
        key: IdempotencyKeyDraft,
        ride: RideDraft,
    ) -> Result<IdempotencyKey, WorkflowError> {
        self.create(ctx, caller, key, ride).await
    }
}
