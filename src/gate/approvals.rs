//! Operator approvals consulted by the gate.
//!
//! An approval is a standing grant for one action, recorded out of band
//! (CLI or HTTP) and looked up when an incident is routed. The gate never
//! waits for one.

use crate::action::ActionName;
use crate::storage::StoreError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalToken {
    pub action: ActionName,
    pub approved_by: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApprovalToken {
    pub fn new(action: ActionName, approved_by: impl Into<String>, ttl: Option<Duration>) -> Self {
        let granted_at = Utc::now();
        Self {
            action,
            approved_by: approved_by.into(),
            granted_at,
            expires_at: ttl.map(|d| granted_at + d),
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// Where approval grants live.
#[async_trait::async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn grant(&self, token: ApprovalToken) -> Result<(), StoreError>;

    /// Most recent grant for `action` still valid at `now`.
    async fn lookup(
        &self,
        action: ActionName,
        now: DateTime<Utc>,
    ) -> Result<Option<ApprovalToken>, StoreError>;
}
