//! # Skyride core
//!
//! Domain types for the idempotent ride-booking workflow.
//!
//! A client submits a ride request together with an idempotency key. The
//! engine (see `skyride-engine`) walks the key through a persisted state
//! machine:
//!
//! ```text
//!   STARTED ──create ride──▶ CREATED ──charge──▶ CHARGED ──stage receipt──▶ FINISHED
//!      │                        │
//!      │                        └── card declined / provider error ──────────▶ FINISHED
//!      └── (resumes here after a crash, from the last committed point)
//! ```
//!
//! This crate holds the records that the state machine reads and writes, the
//! request fingerprint used to detect key reuse, and the ports the engine
//! depends on: [`PaymentGateway`], [`Clock`] and the request [`Context`].

pub mod audit;
pub mod clock;
pub mod context;
pub mod fingerprint;
pub mod idempotency;
pub mod payment;
pub mod ride;
pub mod staged_job;
pub mod user;

pub use audit::{AuditAction, AuditRecord, NewAuditRecord, ResourceType};
pub use clock::{Clock, FixedClock, SystemClock};
pub use context::{Context, ContextError};
pub use fingerprint::Fingerprint;
pub use idempotency::{
    CachedResponse, IdempotencyKey, IdempotencyKeyDraft, NewIdempotencyKey, RecoveryPoint,
    ResponseBody, UnknownRecoveryPoint, MAX_KEY_LENGTH,
};
pub use payment::{Charge, ChargeRequest, PaymentError, PaymentGateway};
pub use ride::{InvalidRide, NewRide, Ride, RideDraft};
pub use staged_job::{JobName, NewStagedJob, ReceiptArgs, StagedJob};
pub use user::{Caller, User};

/// Error returned when a persisted enum column holds a value this build
/// does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}
