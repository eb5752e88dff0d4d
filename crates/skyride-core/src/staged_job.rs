//! Outbox of jobs staged for an external worker
//!
//! Rows are written in the same transaction as the workflow step that
//! produces them. Draining the table is someone else's job.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobName {
    SendRideReceipt,
}

impl JobName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendRideReceipt => "send_ride_receipt",
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobName {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send_ride_receipt" => Ok(Self::SendRideReceipt),
            other => Err(UnknownVariant::new("job name", other)),
        }
    }
}

/// Arguments of a `send_ride_receipt` job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptArgs {
    pub amount: i64,
    pub currency: String,
    pub user_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewStagedJob {
    pub job_name: JobName,
    pub job_args: serde_json::Value,
    pub idempotency_key_id: Option<Uuid>,
}

impl NewStagedJob {
    pub fn receipt(args: &ReceiptArgs, idempotency_key_id: Uuid) -> Result<Self, serde_json::Error> {
        Ok(Self {
            job_name: JobName::SendRideReceipt,
            job_args: serde_json::to_value(args)?,
            idempotency_key_id: Some(idempotency_key_id),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedJob {
    pub id: Uuid,
    pub job_name: JobName,
    pub job_args: serde_json::Value,
    pub idempotency_key_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
