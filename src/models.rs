//! Core data models for the conversational finance engine

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryKind {
    Expense,
    Income,
}

impl EntryKind {
    /// Lenient parse for values coming from the reasoning service.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "expense" | "gasto" | "egreso" => Some(EntryKind::Expense),
            "income" | "ingreso" => Some(EntryKind::Income),
            _ => None,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryKind::Expense => "EXPENSE",
            EntryKind::Income => "INCOME",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    Weekly,
    Monthly,
    Yearly,
}

impl Recurrence {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "weekly" | "semanal" => Some(Recurrence::Weekly),
            "monthly" | "mensual" => Some(Recurrence::Monthly),
            "yearly" | "annual" | "anual" => Some(Recurrence::Yearly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MonthlyTargetMode {
    Percentage,
    Fixed,
}

//
// ================= Records =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: f64,
    pub kind: EntryKind,
    pub category_id: Uuid,
    pub category_name: String,
    pub description: Option<String>,
    pub date: NaiveDate,
    /// Local midnight in the caller's timezone; only set on insert.
    pub occurred_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: f64,
    pub category_id: Uuid,
    pub category_name: String,
    pub recurrence: Recurrence,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyTarget {
    pub mode: MonthlyTargetMode,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavingsGoal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub target_amount: f64,
    pub category_id: Uuid,
    pub category_name: String,
    pub monthly_target: Option<MonthlyTarget>,
    pub created_at: DateTime<Utc>,
}

//
// ================= Categories =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub kind: EntryKind,
    pub icon: Option<String>,
}

/// Caller-supplied category candidate. The inbound list may be plain names
/// or full objects; both deserialize into this shape.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryCandidate {
    pub id: Option<Uuid>,
    pub name: String,
    pub kind: Option<EntryKind>,
    pub icon: Option<String>,
}

impl<'de> Deserialize<'de> for CategoryCandidate {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Name(String),
            Object {
                id: Option<Uuid>,
                name: String,
                #[serde(rename = "type")]
                kind: Option<EntryKind>,
                icon: Option<String>,
            },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Name(name) => CategoryCandidate {
                id: None,
                name,
                kind: None,
                icon: None,
            },
            Raw::Object {
                id,
                name,
                kind,
                icon,
            } => CategoryCandidate {
                id,
                name,
                kind,
                icon,
            },
        })
    }
}

//
// ================= Assistant Protocol =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Completed,
    Failed,
    Expired,
    Cancelling,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function_name: String,
    /// Raw JSON argument payload as emitted by the run.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub last_error: Option<RunError>,
}

impl Run {
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            RunStatus::Queued | RunStatus::InProgress | RunStatus::RequiresAction
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutputEntry {
    pub tool_call_id: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub role: String,
    pub content: String,
}

//
// ================= Executed Actions =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    TransactionCreated,
    TransactionUpdated,
    TransactionDeleted,
    TransactionsListed,
    BudgetCreated,
    BudgetUpdated,
    BudgetDeleted,
    BudgetsListed,
    GoalCreated,
    GoalUpdated,
    GoalDeleted,
    GoalsListed,
    CategoriesListed,
    OnboardingCaptured,
    SpendingAnalyzed,
}

/// One entry per processed tool call, returned to the caller for UI side
/// effects. Conversational declines (category miss, ambiguous criteria)
/// still produce an entry; its payload carries the decline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub kind: ActionKind,
    pub payload: serde_json::Value,
}

//
// ================= Usage =================
//

/// Unlimited plans use a negative limit sentinel.
pub const UNLIMITED_QUOTA: i64 = -1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
}

impl UsageSnapshot {
    pub fn new(used: i64, limit: i64) -> Self {
        let remaining = if limit < 0 {
            UNLIMITED_QUOTA
        } else {
            (limit - used).max(0)
        };
        Self {
            used,
            limit,
            remaining,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.limit >= 0 && self.used >= self.limit
    }
}

//
// ================= Profiles =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub display_name: String,
    pub onboarding_complete: bool,
    /// Monthly conversational-turn allowance; negative means unlimited.
    pub plan_limit: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnboardingData {
    pub monthly_income: Option<f64>,
    pub savings_target: Option<f64>,
    pub currency: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_kind_parses_spanish_aliases() {
        assert_eq!(EntryKind::parse("gasto"), Some(EntryKind::Expense));
        assert_eq!(EntryKind::parse("INGRESO"), Some(EntryKind::Income));
        assert_eq!(EntryKind::parse("EXPENSE"), Some(EntryKind::Expense));
        assert_eq!(EntryKind::parse("other"), None);
    }

    #[test]
    fn category_candidates_accept_both_shapes() {
        let plain: Vec<CategoryCandidate> =
            serde_json::from_str(r#"["Comida", "Transporte"]"#).unwrap();
        assert_eq!(plain.len(), 2);
        assert!(plain[0].id.is_none());

        let objects: Vec<CategoryCandidate> = serde_json::from_str(
            r#"[{"id":"7b5e2b9c-4f2a-4f5f-8a3e-2a1b9c8d7e6f","name":"Comida","type":"EXPENSE","icon":"🍔"}]"#,
        )
        .unwrap();
        assert_eq!(objects[0].name, "Comida");
        assert_eq!(objects[0].kind, Some(EntryKind::Expense));
        assert!(objects[0].id.is_some());
    }

    #[test]
    fn usage_snapshot_unlimited_sentinel() {
        let snap = UsageSnapshot::new(42, UNLIMITED_QUOTA);
        assert!(!snap.exhausted());
        assert_eq!(snap.remaining, UNLIMITED_QUOTA);

        let capped = UsageSnapshot::new(10, 10);
        assert!(capped.exhausted());
        assert_eq!(capped.remaining, 0);
    }
}
