//! Users and the per-request caller

use serde::{Deserialize, Serialize};

/// Account on whose behalf rides are booked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    /// Customer reference at the payment gateway
    pub stripe_customer_id: String,
}

/// Who is calling and from where, resolved upstream of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: User,
    pub origin_ip: String,
}

impl Caller {
    pub fn new(user: User, origin_ip: impl Into<String>) -> Self {
        Self {
            user,
            origin_ip: origin_ip.into(),
        }
    }
}
