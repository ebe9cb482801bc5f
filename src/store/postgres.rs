//! Postgres-backed store
//!
//! Schema is created lazily on first use. Diacritic-sensitive matching
//! (category names) is folded in Rust so both backends share one rule.

use crate::category::fold;
use crate::error::EngineError;
use crate::models::{
    Budget, Category, EntryKind, MonthlyTarget, MonthlyTargetMode, OnboardingData, Recurrence,
    SavingsGoal, Transaction, UserProfile, UNLIMITED_QUOTA,
};
use crate::store::{CategoryStore, ProfileStore, RecordStore, UsageStore};
use crate::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

pub struct PgStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

fn db_err(context: &str, e: sqlx::Error) -> EngineError {
    EngineError::Store(format!("{}: {}", context, e))
}

impl PgStore {
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| db_err("Failed to build Postgres pool", e))?;

        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS transactions (
                      id UUID PRIMARY KEY,
                      user_id UUID NOT NULL,
                      amount DOUBLE PRECISION NOT NULL,
                      kind TEXT NOT NULL,
                      category_id UUID NOT NULL,
                      category_name TEXT NOT NULL,
                      description TEXT,
                      date DATE NOT NULL,
                      occurred_at TIMESTAMPTZ,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_transactions_user_created
                    ON transactions (user_id, created_at DESC);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS budgets (
                      id UUID PRIMARY KEY,
                      user_id UUID NOT NULL,
                      amount DOUBLE PRECISION NOT NULL,
                      category_id UUID NOT NULL,
                      category_name TEXT NOT NULL,
                      recurrence TEXT NOT NULL,
                      period_start DATE NOT NULL,
                      period_end DATE NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS savings_goals (
                      id UUID PRIMARY KEY,
                      user_id UUID NOT NULL,
                      name TEXT NOT NULL,
                      target_amount DOUBLE PRECISION NOT NULL,
                      category_id UUID NOT NULL,
                      category_name TEXT NOT NULL,
                      target_mode TEXT,
                      target_value DOUBLE PRECISION,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS categories (
                      id UUID PRIMARY KEY,
                      name TEXT NOT NULL,
                      kind TEXT NOT NULL,
                      icon TEXT
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS user_profiles (
                      user_id UUID PRIMARY KEY,
                      display_name TEXT NOT NULL,
                      onboarding_complete BOOLEAN NOT NULL DEFAULT FALSE,
                      plan_limit BIGINT NOT NULL DEFAULT -1,
                      monthly_income DOUBLE PRECISION,
                      savings_target DOUBLE PRECISION,
                      currency TEXT
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS usage_counters (
                      user_id UUID NOT NULL,
                      period TEXT NOT NULL,
                      used BIGINT NOT NULL DEFAULT 0,
                      PRIMARY KEY (user_id, period)
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| db_err("Failed to initialize engine schema", e))?;

        Ok(())
    }
}

fn transaction_from_row(row: &sqlx::postgres::PgRow) -> Result<Transaction> {
    let kind: String = row
        .try_get("kind")
        .map_err(|e| db_err("transactions.kind", e))?;

    Ok(Transaction {
        id: row.try_get("id").map_err(|e| db_err("transactions.id", e))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| db_err("transactions.user_id", e))?,
        amount: row
            .try_get("amount")
            .map_err(|e| db_err("transactions.amount", e))?,
        kind: EntryKind::parse(&kind)
            .ok_or_else(|| EngineError::Store(format!("Unknown transaction kind: {}", kind)))?,
        category_id: row
            .try_get("category_id")
            .map_err(|e| db_err("transactions.category_id", e))?,
        category_name: row
            .try_get("category_name")
            .map_err(|e| db_err("transactions.category_name", e))?,
        description: row.try_get("description").ok(),
        date: row
            .try_get("date")
            .map_err(|e| db_err("transactions.date", e))?,
        occurred_at: row.try_get("occurred_at").ok(),
        created_at: row
            .try_get("created_at")
            .map_err(|e| db_err("transactions.created_at", e))?,
    })
}

fn budget_from_row(row: &sqlx::postgres::PgRow) -> Result<Budget> {
    let recurrence: String = row
        .try_get("recurrence")
        .map_err(|e| db_err("budgets.recurrence", e))?;

    Ok(Budget {
        id: row.try_get("id").map_err(|e| db_err("budgets.id", e))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| db_err("budgets.user_id", e))?,
        amount: row
            .try_get("amount")
            .map_err(|e| db_err("budgets.amount", e))?,
        category_id: row
            .try_get("category_id")
            .map_err(|e| db_err("budgets.category_id", e))?,
        category_name: row
            .try_get("category_name")
            .map_err(|e| db_err("budgets.category_name", e))?,
        recurrence: Recurrence::parse(&recurrence).ok_or_else(|| {
            EngineError::Store(format!("Unknown budget recurrence: {}", recurrence))
        })?,
        period_start: row
            .try_get("period_start")
            .map_err(|e| db_err("budgets.period_start", e))?,
        period_end: row
            .try_get("period_end")
            .map_err(|e| db_err("budgets.period_end", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| db_err("budgets.created_at", e))?,
    })
}

fn goal_from_row(row: &sqlx::postgres::PgRow) -> Result<SavingsGoal> {
    let target_mode: Option<String> = row.try_get("target_mode").ok();
    let target_value: Option<f64> = row.try_get("target_value").ok();

    let monthly_target = match (target_mode.as_deref(), target_value) {
        (Some("percentage"), Some(value)) => Some(MonthlyTarget {
            mode: MonthlyTargetMode::Percentage,
            value,
        }),
        (Some("fixed"), Some(value)) => Some(MonthlyTarget {
            mode: MonthlyTargetMode::Fixed,
            value,
        }),
        _ => None,
    };

    Ok(SavingsGoal {
        id: row.try_get("id").map_err(|e| db_err("savings_goals.id", e))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| db_err("savings_goals.user_id", e))?,
        name: row
            .try_get("name")
            .map_err(|e| db_err("savings_goals.name", e))?,
        target_amount: row
            .try_get("target_amount")
            .map_err(|e| db_err("savings_goals.target_amount", e))?,
        category_id: row
            .try_get("category_id")
            .map_err(|e| db_err("savings_goals.category_id", e))?,
        category_name: row
            .try_get("category_name")
            .map_err(|e| db_err("savings_goals.category_name", e))?,
        monthly_target,
        created_at: row
            .try_get("created_at")
            .map_err(|e| db_err("savings_goals.created_at", e))?,
    })
}

fn target_columns(goal: &SavingsGoal) -> (Option<&'static str>, Option<f64>) {
    match &goal.monthly_target {
        Some(target) => {
            let mode = match target.mode {
                MonthlyTargetMode::Percentage => "percentage",
                MonthlyTargetMode::Fixed => "fixed",
            };
            (Some(mode), Some(target.value))
        }
        None => (None, None),
    }
}

#[async_trait::async_trait]
impl RecordStore for PgStore {
    async fn insert_transaction(&self, record: Transaction) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO transactions
              (id, user_id, amount, kind, category_id, category_name, description, date, occurred_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.amount)
        .bind(record.kind.to_string())
        .bind(record.category_id)
        .bind(&record.category_name)
        .bind(&record.description)
        .bind(record.date)
        .bind(record.occurred_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to insert transaction", e))?;
        Ok(())
    }

    async fn update_transaction(&self, record: &Transaction) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            UPDATE transactions
            SET amount = $3, kind = $4, category_id = $5, category_name = $6,
                description = $7, date = $8
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.amount)
        .bind(record.kind.to_string())
        .bind(record.category_id)
        .bind(&record.category_name)
        .bind(&record.description)
        .bind(record.date)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to update transaction", e))?;
        Ok(())
    }

    async fn delete_transaction(&self, user_id: Uuid, id: Uuid) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query("DELETE FROM transactions WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("Failed to delete transaction", e))?;
        Ok(())
    }

    async fn transactions_for_user(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to load transactions", e))?;

        rows.iter().map(transaction_from_row).collect()
    }

    async fn insert_budget(&self, record: Budget) -> Result<()> {
        self.ensure_schema().await?;
        let recurrence = match record.recurrence {
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
            Recurrence::Yearly => "yearly",
        };
        sqlx::query(
            r#"
            INSERT INTO budgets
              (id, user_id, amount, category_id, category_name, recurrence, period_start, period_end, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.amount)
        .bind(record.category_id)
        .bind(&record.category_name)
        .bind(recurrence)
        .bind(record.period_start)
        .bind(record.period_end)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to insert budget", e))?;
        Ok(())
    }

    async fn update_budget(&self, record: &Budget) -> Result<()> {
        self.ensure_schema().await?;
        let recurrence = match record.recurrence {
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
            Recurrence::Yearly => "yearly",
        };
        sqlx::query(
            r#"
            UPDATE budgets
            SET amount = $3, category_id = $4, category_name = $5, recurrence = $6,
                period_start = $7, period_end = $8
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.amount)
        .bind(record.category_id)
        .bind(&record.category_name)
        .bind(recurrence)
        .bind(record.period_start)
        .bind(record.period_end)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to update budget", e))?;
        Ok(())
    }

    async fn delete_budget(&self, user_id: Uuid, id: Uuid) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query("DELETE FROM budgets WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("Failed to delete budget", e))?;
        Ok(())
    }

    async fn budgets_for_user(&self, user_id: Uuid) -> Result<Vec<Budget>> {
        self.ensure_schema().await?;
        let rows =
            sqlx::query("SELECT * FROM budgets WHERE user_id = $1 ORDER BY created_at DESC")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_err("Failed to load budgets", e))?;

        rows.iter().map(budget_from_row).collect()
    }

    async fn insert_goal(&self, record: SavingsGoal) -> Result<()> {
        self.ensure_schema().await?;
        let (target_mode, target_value) = target_columns(&record);
        sqlx::query(
            r#"
            INSERT INTO savings_goals
              (id, user_id, name, target_amount, category_id, category_name, target_mode, target_value, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(&record.name)
        .bind(record.target_amount)
        .bind(record.category_id)
        .bind(&record.category_name)
        .bind(target_mode)
        .bind(target_value)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to insert goal", e))?;
        Ok(())
    }

    async fn update_goal(&self, record: &SavingsGoal) -> Result<()> {
        self.ensure_schema().await?;
        let (target_mode, target_value) = target_columns(record);
        sqlx::query(
            r#"
            UPDATE savings_goals
            SET name = $3, target_amount = $4, category_id = $5, category_name = $6,
                target_mode = $7, target_value = $8
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(&record.name)
        .bind(record.target_amount)
        .bind(record.category_id)
        .bind(&record.category_name)
        .bind(target_mode)
        .bind(target_value)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to update goal", e))?;
        Ok(())
    }

    async fn delete_goal(&self, user_id: Uuid, id: Uuid) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query("DELETE FROM savings_goals WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("Failed to delete goal", e))?;
        Ok(())
    }

    async fn goals_for_user(&self, user_id: Uuid) -> Result<Vec<SavingsGoal>> {
        self.ensure_schema().await?;
        let rows =
            sqlx::query("SELECT * FROM savings_goals WHERE user_id = $1 ORDER BY created_at DESC")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_err("Failed to load goals", e))?;

        rows.iter().map(goal_from_row).collect()
    }
}

#[async_trait::async_trait]
impl CategoryStore for PgStore {
    async fn list_categories(&self, kind: Option<EntryKind>) -> Result<Vec<Category>> {
        self.ensure_schema().await?;
        let rows = match kind {
            Some(k) => sqlx::query("SELECT * FROM categories WHERE kind = $1 ORDER BY name")
                .bind(k.to_string())
                .fetch_all(&self.pool)
                .await,
            None => {
                sqlx::query("SELECT * FROM categories ORDER BY name")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| db_err("Failed to load categories", e))?;

        rows.iter()
            .map(|row| {
                let kind: String = row
                    .try_get("kind")
                    .map_err(|e| db_err("categories.kind", e))?;
                Ok(Category {
                    id: row.try_get("id").map_err(|e| db_err("categories.id", e))?,
                    name: row
                        .try_get("name")
                        .map_err(|e| db_err("categories.name", e))?,
                    kind: EntryKind::parse(&kind).ok_or_else(|| {
                        EngineError::Store(format!("Unknown category kind: {}", kind))
                    })?,
                    icon: row.try_get("icon").ok(),
                })
            })
            .collect()
    }

    async fn find_by_folded_name(
        &self,
        folded: &str,
        kind: EntryKind,
    ) -> Result<Option<Category>> {
        // Diacritic folding has no portable SQL equivalent here, so scan
        // the (small) per-kind list in Rust.
        let categories = self.list_categories(Some(kind)).await?;
        Ok(categories.into_iter().find(|c| fold(&c.name) == folded))
    }
}

#[async_trait::async_trait]
impl ProfileStore for PgStore {
    async fn profile(&self, user_id: Uuid) -> Result<UserProfile> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM user_profiles WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("Failed to load profile", e))?;

        Ok(match row {
            Some(row) => UserProfile {
                user_id,
                display_name: row
                    .try_get("display_name")
                    .unwrap_or_else(|_| "amigo".to_string()),
                onboarding_complete: row.try_get("onboarding_complete").unwrap_or(false),
                plan_limit: row.try_get("plan_limit").unwrap_or(UNLIMITED_QUOTA),
            },
            None => UserProfile {
                user_id,
                display_name: "amigo".to_string(),
                onboarding_complete: false,
                plan_limit: UNLIMITED_QUOTA,
            },
        })
    }

    async fn save_onboarding(&self, user_id: Uuid, data: &OnboardingData) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO user_profiles
              (user_id, display_name, onboarding_complete, monthly_income, savings_target, currency)
            VALUES ($1, 'amigo', TRUE, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET onboarding_complete = TRUE,
                monthly_income = COALESCE($2, user_profiles.monthly_income),
                savings_target = COALESCE($3, user_profiles.savings_target),
                currency = COALESCE($4, user_profiles.currency)
            "#,
        )
        .bind(user_id)
        .bind(data.monthly_income)
        .bind(data.savings_target)
        .bind(&data.currency)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to save onboarding data", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl UsageStore for PgStore {
    async fn usage_count(&self, user_id: Uuid, period: &str) -> Result<i64> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT used FROM usage_counters WHERE user_id = $1 AND period = $2")
            .bind(user_id)
            .bind(period)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("Failed to load usage counter", e))?;

        Ok(row
            .and_then(|r| r.try_get::<i64, _>("used").ok())
            .unwrap_or(0))
    }

    async fn increment_usage(&self, user_id: Uuid, period: &str) -> Result<i64> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO usage_counters (user_id, period, used)
            VALUES ($1, $2, 1)
            ON CONFLICT (user_id, period) DO UPDATE
            SET used = usage_counters.used + 1
            RETURNING used
            "#,
        )
        .bind(user_id)
        .bind(period)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("Failed to increment usage counter", e))?;

        row.try_get("used")
            .map_err(|e| db_err("usage_counters.used", e))
    }
}
