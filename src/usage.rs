//! Usage metering
//!
//! Monthly conversational-turn counter against the user's plan limit. A
//! limit of [`UNLIMITED_QUOTA`] never exhausts. One increment per turn
//! that reaches the reasoning service, regardless of how many tool calls
//! the turn triggers.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::models::{UsageSnapshot, UNLIMITED_QUOTA};
use crate::store::UsageStore;
use crate::Result;

pub struct UsageMeter {
    store: Arc<dyn UsageStore>,
}

/// Period key for a monthly window, e.g. "2025-07".
pub fn period_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

impl UsageMeter {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    pub async fn snapshot(&self, user_id: Uuid, plan_limit: i64) -> Result<UsageSnapshot> {
        let used = self.store.usage_count(user_id, &period_key(Utc::now())).await?;
        Ok(UsageSnapshot::new(used, plan_limit))
    }

    /// Record one consumed turn and return the updated snapshot.
    pub async fn record_turn(&self, user_id: Uuid, plan_limit: i64) -> Result<UsageSnapshot> {
        let period = period_key(Utc::now());
        let used = self.store.increment_usage(user_id, &period).await?;
        debug!(user_id = %user_id, period = %period, used, "Recorded conversational turn");
        Ok(UsageSnapshot::new(used, plan_limit))
    }
}
