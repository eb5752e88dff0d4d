//! Unit of work
//!
//! [`transaction`] opens one transaction, hands the caller the record
//! handles bound to it, and commits only if the caller returns `Ok`.
//!
//! ```ignore
//! let ride = transaction(&uow, &ctx, Isolation::ReadCommitted, move |tx| {
//!     Box::pin(async move {
//!         let ride = tx.save_ride(new_ride).await?;
//!         tx.save_audit_record(audit).await?;
//!         Ok::<_, StoreError>(ride)
//!     })
//! })
//! .await?;
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::warn;

use skyride_core::{Context, ContextError};

use crate::store::{Isolation, Records, StoreError};

/// An open transaction exposing every record kind
#[async_trait]
pub trait Transaction: Records + Sized + Send {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Source of transactions
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    type Tx: Transaction;

    async fn begin(&self, isolation: Isolation) -> Result<Self::Tx, StoreError>;
}

enum Outcome<T, E> {
    Completed(Result<T, E>),
    Interrupted(ContextError),
    Panicked(Box<dyn Any + Send>),
}

/// Run `f` inside one transaction.
///
/// - `Ok` commits, `Err` rolls back and returns the error unchanged.
/// - A panic whose payload is an `E` or a [`StoreError`] rolls back and is
///   returned as an error. Any other panic rolls back and is resumed.
/// - If `ctx` finishes while `f` runs, `f` is dropped, the transaction is
///   rolled back and the context error is returned. A context that is
///   already done when `f` returns prevents the commit.
pub async fn transaction<U, T, E, F>(
    uow: &U,
    ctx: &Context,
    isolation: Isolation,
    f: F,
) -> Result<T, E>
where
    U: UnitOfWork + ?Sized,
    F: for<'t> FnOnce(&'t mut U::Tx) -> BoxFuture<'t, Result<T, E>> + Send,
    T: Send,
    E: From<StoreError> + Send + 'static,
{
    let mut tx = ctx
        .run(uow.begin(isolation))
        .await
        .map_err(StoreError::from)??;

    let outcome = {
        let work = AssertUnwindSafe(f(&mut tx)).catch_unwind();
        tokio::select! {
            biased;
            cause = ctx.done() => Outcome::Interrupted(cause),
            result = work => match result {
                Ok(result) => Outcome::Completed(result),
                Err(payload) => Outcome::Panicked(payload),
            },
        }
    };

    match outcome {
        Outcome::Completed(Ok(value)) => {
            if let Some(cause) = ctx.err() {
                rollback_quietly(tx).await;
                return Err(StoreError::from(cause).into());
            }
            tx.commit().await?;
            Ok(value)
        }
        Outcome::Completed(Err(err)) => {
            rollback_quietly(tx).await;
            Err(err)
        }
        Outcome::Interrupted(cause) => {
            rollback_quietly(tx).await;
            Err(StoreError::from(cause).into())
        }
        Outcome::Panicked(payload) => {
            rollback_quietly(tx).await;
            let payload = match payload.downcast::<E>() {
                Ok(err) => return Err(*err),
                Err(payload) => payload,
            };
            match payload.downcast::<StoreError>() {
                Ok(err) => Err((*err).into()),
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }
    }
}

async fn rollback_quietly<T: Transaction>(tx: T) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "rollback failed");
    }
}
