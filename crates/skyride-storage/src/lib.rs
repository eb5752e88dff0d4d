// Record store, unit of work and storage backends
//
// - store: record access traits, filters, StoreError
// - uow: UnitOfWork / Transaction traits and the `transaction` runner
// - postgres: sqlx-backed implementation
// - memory: in-memory implementation with fault injection for tests

mod models;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod uow;

pub use memory::{InMemoryTransaction, InMemoryUnitOfWork, Operation, Stats};
pub use postgres::{PgTransaction, PgUnitOfWork};
pub use store::*;
pub use uow::{transaction, Transaction, UnitOfWork};
