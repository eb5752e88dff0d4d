//! Idempotency keys and their recovery points

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fingerprint::Fingerprint;

/// Longest idempotency key a client may send
pub const MAX_KEY_LENGTH: usize = 100;

/// Status code cached for a completed ride
pub const STATUS_OK: u16 = 200;
/// Status code cached when the card was declined
pub const STATUS_PAYMENT_REQUIRED: u16 = 402;
/// Status code cached when the payment provider failed the charge
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

/// Last step of the workflow that committed for a key.
///
/// Ordering follows the workflow: a key only ever moves to a greater point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPoint {
    /// Key acquired, nothing else done yet
    Started,
    /// Ride and audit record committed
    Created,
    /// Payment gateway charge recorded on the ride
    Charged,
    /// Terminal: a response is cached and will be replayed
    Finished,
}

impl RecoveryPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Created => "CREATED",
            Self::Charged => "CHARGED",
            Self::Finished => "FINISHED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl fmt::Display for RecoveryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored recovery point this build does not recognise
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown recovery point: {0}")]
pub struct UnknownRecoveryPoint(pub String);

impl FromStr for RecoveryPoint {
    type Err = UnknownRecoveryPoint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTED" => Ok(Self::Started),
            "CREATED" => Ok(Self::Created),
            "CHARGED" => Ok(Self::Charged),
            "FINISHED" => Ok(Self::Finished),
            other => Err(UnknownRecoveryPoint(other.to_string())),
        }
    }
}

/// Body of a cached response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub message: String,
}

/// HTTP-shaped response stored on a finished key and replayed to every
/// subsequent request carrying the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl CachedResponse {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ResponseBody {
                message: message.into(),
            },
        }
    }

    /// Response for a ride that went through every step
    pub fn ok() -> Self {
        Self::new(STATUS_OK, "OK")
    }

    pub fn payment_required(message: impl Into<String>) -> Self {
        Self::new(STATUS_PAYMENT_REQUIRED, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(STATUS_SERVICE_UNAVAILABLE, message)
    }
}

/// What the caller knows about a key before the engine has looked it up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKeyDraft {
    pub key: String,
    pub request_method: String,
    pub request_path: String,
}

impl IdempotencyKeyDraft {
    pub fn new(
        key: impl Into<String>,
        request_method: impl Into<String>,
        request_path: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            request_method: request_method.into(),
            request_path: request_path.into(),
        }
    }
}

/// Insert payload for a key seen for the first time
#[derive(Debug, Clone)]
pub struct NewIdempotencyKey {
    pub key: String,
    pub user_id: i64,
    pub request_method: String,
    pub request_path: String,
    pub request_params: Fingerprint,
    pub last_run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub recovery_point: RecoveryPoint,
}

impl NewIdempotencyKey {
    /// A fresh key, locked by the attempt that is creating it
    pub fn started(
        draft: &IdempotencyKeyDraft,
        user_id: i64,
        request_params: Fingerprint,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: draft.key.clone(),
            user_id,
            request_method: draft.request_method.clone(),
            request_path: draft.request_path.clone(),
            request_params,
            last_run_at: now,
            locked_at: Some(now),
            recovery_point: RecoveryPoint::Started,
        }
    }
}

/// One row per (user, client-supplied key)
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyKey {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub key: String,
    pub user_id: i64,
    pub last_run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub request_method: String,
    pub request_path: String,
    pub request_params: Fingerprint,
    pub recovery_point: RecoveryPoint,
    pub response: Option<CachedResponse>,
}

impl IdempotencyKey {
    pub fn is_finished(&self) -> bool {
        self.recovery_point.is_terminal()
    }

    /// Whether another attempt holds a lock that has not yet gone stale
    pub fn is_locked(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        match self.locked_at {
            Some(locked_at) => match now.checked_sub_signed(timeout) {
                Some(horizon) => locked_at > horizon,
                None => true,
            },
            None => false,
        }
    }

    /// Take the lock for the current attempt
    pub fn lock(&mut self, now: DateTime<Utc>) {
        self.last_run_at = now;
        self.locked_at = Some(now);
    }

    pub fn unlock(&mut self) {
        self.locked_at = None;
    }

    /// Move to `next` if it lies ahead of the current point.
    ///
    /// Returns `false` (and leaves the key untouched) for a backwards move.
    pub fn advance(&mut self, next: RecoveryPoint) -> bool {
        if next <= self.recovery_point {
            return false;
        }
        self.recovery_point = next;
        true
    }

    /// Terminal transition: cache the response and release the lock
    pub fn finish(&mut self, response: CachedResponse) {
        self.locked_at = None;
        self.response = Some(response);
        self.recovery_point = RecoveryPoint::Finished;
    }

    /// Token handed to the payment gateway for this key.
    ///
    /// Built from our own row id rather than the client's string so it is
    /// unique across all users.
    pub fn gateway_token(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.id)
    }
}
