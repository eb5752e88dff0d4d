//! Idempotent ride-booking workflow
//!
//! ```text
//!   acquire ──> STARTED ──create_ride──> CREATED ──charge──> CHARGED ──send_receipt──> FINISHED
//!                                           │                                            ▲
//!                                           └────── card declined / provider error ──────┘
//! ```
//!
//! [`WorkflowExecutor::create`] is the single entry point.

pub mod config;
pub mod error;
pub mod executor;
mod steps;
pub mod stripe;

pub use config::{ConfigError, EngineConfig};
pub use error::{ErrorClass, WorkflowError};
pub use executor::WorkflowExecutor;
pub use stripe::{StripeConfig, StripeGateway};
