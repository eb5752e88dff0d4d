//! Append-only audit trail

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    CreateRide,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateRide => "CREATE_RIDE",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE_RIDE" => Ok(Self::CreateRide),
            other => Err(UnknownVariant::new("audit action", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Ride,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ride => "RIDE",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RIDE" => Ok(Self::Ride),
            other => Err(UnknownVariant::new("resource type", other)),
        }
    }
}

/// Insert payload for an audit record
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditRecord {
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub origin_ip: String,
    /// Raw request payload that led to the action
    pub data: serde_json::Value,
    pub user_id: i64,
    pub idempotency_key_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A fact recorded in the same transaction as the resource it documents.
/// Never updated or deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub id: Uuid,
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub origin_ip: String,
    pub data: serde_json::Value,
    pub user_id: i64,
    pub idempotency_key_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
