//! Persistence seams
//!
//! Traits for the record, category, profile, and usage stores plus the
//! in-memory implementation used for development and tests. The Postgres
//! implementation lives in `postgres.rs`.

use crate::category::fold;
use crate::models::{
    Budget, Category, EntryKind, OnboardingData, SavingsGoal, Transaction, UserProfile,
    UNLIMITED_QUOTA,
};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub mod postgres;
pub use postgres::PgStore;

/// Transaction/budget/goal persistence. Listings are user-scoped and
/// ordered newest-first; criteria matching runs over that ordering.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_transaction(&self, record: Transaction) -> Result<()>;
    async fn update_transaction(&self, record: &Transaction) -> Result<()>;
    async fn delete_transaction(&self, user_id: Uuid, id: Uuid) -> Result<()>;
    async fn transactions_for_user(&self, user_id: Uuid) -> Result<Vec<Transaction>>;

    async fn insert_budget(&self, record: Budget) -> Result<()>;
    async fn update_budget(&self, record: &Budget) -> Result<()>;
    async fn delete_budget(&self, user_id: Uuid, id: Uuid) -> Result<()>;
    async fn budgets_for_user(&self, user_id: Uuid) -> Result<Vec<Budget>>;

    async fn insert_goal(&self, record: SavingsGoal) -> Result<()>;
    async fn update_goal(&self, record: &SavingsGoal) -> Result<()>;
    async fn delete_goal(&self, user_id: Uuid, id: Uuid) -> Result<()>;
    async fn goals_for_user(&self, user_id: Uuid) -> Result<Vec<SavingsGoal>>;
}

/// Authoritative category list.
#[async_trait::async_trait]
pub trait CategoryStore: Send + Sync {
    async fn list_categories(&self, kind: Option<EntryKind>) -> Result<Vec<Category>>;
    async fn find_by_folded_name(&self, folded: &str, kind: EntryKind)
        -> Result<Option<Category>>;
}

/// User display name, onboarding flag, and plan limit.
#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    async fn profile(&self, user_id: Uuid) -> Result<UserProfile>;
    async fn save_onboarding(&self, user_id: Uuid, data: &OnboardingData) -> Result<()>;
}

/// Per-user, per-period conversational-turn counter.
#[async_trait::async_trait]
pub trait UsageStore: Send + Sync {
    async fn usage_count(&self, user_id: Uuid, period: &str) -> Result<i64>;
    async fn increment_usage(&self, user_id: Uuid, period: &str) -> Result<i64>;
}

/// Outbound gamification collaborator. Fire-and-forget; failures are
/// logged by the caller and never fail the primary mutation.
#[async_trait::async_trait]
pub trait GamificationSink: Send + Sync {
    async fn record_event(
        &self,
        user_id: Uuid,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<()>;
}

/// Default sink: logs the event and does nothing else.
pub struct LoggingGamificationSink;

#[async_trait::async_trait]
impl GamificationSink for LoggingGamificationSink {
    async fn record_event(
        &self,
        user_id: Uuid,
        event: &str,
        _payload: &serde_json::Value,
    ) -> Result<()> {
        debug!(user_id = %user_id, event = %event, "Gamification event recorded");
        Ok(())
    }
}

/// In-memory store for development and tests. Implements every seam so a
/// full engine can run without Postgres.
pub struct InMemoryStore {
    transactions: Arc<RwLock<Vec<Transaction>>>,
    budgets: Arc<RwLock<Vec<Budget>>>,
    goals: Arc<RwLock<Vec<SavingsGoal>>>,
    categories: Arc<RwLock<Vec<Category>>>,
    profiles: Arc<RwLock<HashMap<Uuid, UserProfile>>>,
    usage: Arc<RwLock<HashMap<(Uuid, String), i64>>>,
    onboarding: Arc<RwLock<HashMap<Uuid, OnboardingData>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            transactions: Arc::new(RwLock::new(Vec::new())),
            budgets: Arc::new(RwLock::new(Vec::new())),
            goals: Arc::new(RwLock::new(Vec::new())),
            categories: Arc::new(RwLock::new(Vec::new())),
            profiles: Arc::new(RwLock::new(HashMap::new())),
            usage: Arc::new(RwLock::new(HashMap::new())),
            onboarding: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn seed_category(&self, name: &str, kind: EntryKind) -> Uuid {
        let category = Category {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind,
            icon: None,
        };
        let id = category.id;
        self.categories.write().await.push(category);
        id
    }

    pub async fn set_profile(&self, profile: UserProfile) {
        self.profiles.write().await.insert(profile.user_id, profile);
    }

    pub async fn captured_onboarding(&self, user_id: Uuid) -> Option<OnboardingData> {
        self.onboarding.read().await.get(&user_id).cloned()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RecordStore for InMemoryStore {
    async fn insert_transaction(&self, record: Transaction) -> Result<()> {
        self.transactions.write().await.push(record);
        Ok(())
    }

    async fn update_transaction(&self, record: &Transaction) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        if let Some(slot) = transactions
            .iter_mut()
            .find(|t| t.id == record.id && t.user_id == record.user_id)
        {
            *slot = record.clone();
        }
        Ok(())
    }

    async fn delete_transaction(&self, user_id: Uuid, id: Uuid) -> Result<()> {
        self.transactions
            .write()
            .await
            .retain(|t| !(t.id == id && t.user_id == user_id));
        Ok(())
    }

    async fn transactions_for_user(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        let mut records: Vec<Transaction> = self
            .transactions
            .read()
            .await
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn insert_budget(&self, record: Budget) -> Result<()> {
        self.budgets.write().await.push(record);
        Ok(())
    }

    async fn update_budget(&self, record: &Budget) -> Result<()> {
        let mut budgets = self.budgets.write().await;
        if let Some(slot) = budgets
            .iter_mut()
            .find(|b| b.id == record.id && b.user_id == record.user_id)
        {
            *slot = record.clone();
        }
        Ok(())
    }

    async fn delete_budget(&self, user_id: Uuid, id: Uuid) -> Result<()> {
        self.budgets
            .write()
            .await
            .retain(|b| !(b.id == id && b.user_id == user_id));
        Ok(())
    }

    async fn budgets_for_user(&self, user_id: Uuid) -> Result<Vec<Budget>> {
        let mut records: Vec<Budget> = self
            .budgets
            .read()
            .await
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn insert_goal(&self, record: SavingsGoal) -> Result<()> {
        self.goals.write().await.push(record);
        Ok(())
    }

    async fn update_goal(&self, record: &SavingsGoal) -> Result<()> {
        let mut goals = self.goals.write().await;
        if let Some(slot) = goals
            .iter_mut()
            .find(|g| g.id == record.id && g.user_id == record.user_id)
        {
            *slot = record.clone();
        }
        Ok(())
    }

    async fn delete_goal(&self, user_id: Uuid, id: Uuid) -> Result<()> {
        self.goals
            .write()
            .await
            .retain(|g| !(g.id == id && g.user_id == user_id));
        Ok(())
    }

    async fn goals_for_user(&self, user_id: Uuid) -> Result<Vec<SavingsGoal>> {
        let mut records: Vec<SavingsGoal> = self
            .goals
            .read()
            .await
            .iter()
            .filter(|g| g.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

#[async_trait::async_trait]
impl CategoryStore for InMemoryStore {
    async fn list_categories(&self, kind: Option<EntryKind>) -> Result<Vec<Category>> {
        Ok(self
            .categories
            .read()
            .await
            .iter()
            .filter(|c| kind.map_or(true, |k| c.kind == k))
            .cloned()
            .collect())
    }

    async fn find_by_folded_name(
        &self,
        folded: &str,
        kind: EntryKind,
    ) -> Result<Option<Category>> {
        Ok(self
            .categories
            .read()
            .await
            .iter()
            .find(|c| c.kind == kind && fold(&c.name) == folded)
            .cloned())
    }
}

#[async_trait::async_trait]
impl ProfileStore for InMemoryStore {
    async fn profile(&self, user_id: Uuid) -> Result<UserProfile> {
        Ok(self
            .profiles
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or(UserProfile {
                user_id,
                display_name: "amigo".to_string(),
                onboarding_complete: false,
                plan_limit: UNLIMITED_QUOTA,
            }))
    }

    async fn save_onboarding(&self, user_id: Uuid, data: &OnboardingData) -> Result<()> {
        self.onboarding.write().await.insert(user_id, data.clone());

        let mut profiles = self.profiles.write().await;
        profiles
            .entry(user_id)
            .and_modify(|p| p.onboarding_complete = true)
            .or_insert(UserProfile {
                user_id,
                display_name: "amigo".to_string(),
                onboarding_complete: true,
                plan_limit: UNLIMITED_QUOTA,
            });
        Ok(())
    }
}

#[async_trait::async_trait]
impl UsageStore for InMemoryStore {
    async fn usage_count(&self, user_id: Uuid, period: &str) -> Result<i64> {
        Ok(self
            .usage
            .read()
            .await
            .get(&(user_id, period.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn increment_usage(&self, user_id: Uuid, period: &str) -> Result<i64> {
        let mut usage = self.usage.write().await;
        let counter = usage.entry((user_id, period.to_string())).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn transaction(user_id: Uuid, amount: f64) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            user_id,
            amount,
            kind: EntryKind::Expense,
            category_id: Uuid::new_v4(),
            category_name: "Comida".to_string(),
            description: None,
            date: NaiveDate::from_ymd_opt(2025, 7, 19).unwrap(),
            occurred_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn listings_are_user_scoped() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();

        store.insert_transaction(transaction(user, 100.0)).await.unwrap();
        store.insert_transaction(transaction(other, 200.0)).await.unwrap();

        let records = store.transactions_for_user(user).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount, 100.0);
    }

    #[tokio::test]
    async fn usage_counter_increments_per_period() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();

        assert_eq!(store.usage_count(user, "2025-07").await.unwrap(), 0);
        assert_eq!(store.increment_usage(user, "2025-07").await.unwrap(), 1);
        assert_eq!(store.increment_usage(user, "2025-07").await.unwrap(), 2);
        assert_eq!(store.usage_count(user, "2025-08").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn onboarding_marks_profile_complete() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();

        assert!(!store.profile(user).await.unwrap().onboarding_complete);

        let data = OnboardingData {
            monthly_income: Some(25000.0),
            savings_target: Some(5000.0),
            currency: Some("MXN".to_string()),
        };
        store.save_onboarding(user, &data).await.unwrap();

        assert!(store.profile(user).await.unwrap().onboarding_complete);
        assert_eq!(
            store.captured_onboarding(user).await.unwrap().monthly_income,
            Some(25000.0)
        );
    }
}
