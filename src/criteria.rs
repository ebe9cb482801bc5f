//! Entity criteria matcher
//!
//! Locates exactly one record from partial identifying fields. Zero matches
//! and multiple matches are conversational failures, never a silent pick of
//! the newest candidate.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::category::fold;
use crate::error::EngineError;
use crate::models::{Budget, EntryKind, SavingsGoal, Transaction};
use crate::temporal;
use crate::Result;

/// Structured failure relayed back through the tool output so the
/// assistant can ask the user for more detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum MatchFailure {
    NotFound,
    Ambiguous { candidates: usize },
}

impl MatchFailure {
    pub fn to_payload(&self, entity: &str) -> serde_json::Value {
        match self {
            MatchFailure::NotFound => json!({
                "status": "declined",
                "reason": "not_found",
                "message": format!("No {} matches the given criteria", entity),
            }),
            MatchFailure::Ambiguous { candidates } => json!({
                "status": "declined",
                "reason": "ambiguous",
                "candidates": candidates,
                "message": format!(
                    "{} {}s match the given criteria, provide more detail",
                    candidates, entity
                ),
            }),
        }
    }
}

//
// ================= Criteria Shapes =================
//

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransactionCriteria {
    pub id: Option<Uuid>,
    pub amount: Option<f64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub category: Option<String>,
    pub date: Option<String>,
    pub description: Option<String>,
}

impl TransactionCriteria {
    pub fn field_count(&self) -> usize {
        [
            self.id.is_some(),
            self.amount.is_some(),
            self.kind.is_some(),
            self.category.is_some(),
            self.date.is_some(),
            self.description.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    /// Transactions need at least two fields to bound ambiguity.
    pub fn validate(&self) -> Result<()> {
        if self.field_count() < 2 {
            return Err(EngineError::Validation(
                "Transaction criteria requires at least 2 identifying fields".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BudgetCriteria {
    pub id: Option<Uuid>,
    pub amount: Option<f64>,
    pub category: Option<String>,
    pub recurrence: Option<String>,
}

impl BudgetCriteria {
    pub fn field_count(&self) -> usize {
        [
            self.id.is_some(),
            self.amount.is_some(),
            self.category.is_some(),
            self.recurrence.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    pub fn validate(&self) -> Result<()> {
        if self.field_count() < 1 {
            return Err(EngineError::Validation(
                "Budget criteria requires at least 1 identifying field".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GoalCriteria {
    pub id: Option<Uuid>,
    pub name: Option<String>,
    pub category: Option<String>,
}

impl GoalCriteria {
    pub fn field_count(&self) -> usize {
        [
            self.id.is_some(),
            self.name.is_some(),
            self.category.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    pub fn validate(&self) -> Result<()> {
        if self.field_count() < 1 {
            return Err(EngineError::Validation(
                "Goal criteria requires at least 1 identifying field".to_string(),
            ));
        }
        Ok(())
    }
}

//
// ================= Matching =================
//

fn amount_matches(record: f64, wanted: f64) -> bool {
    (record - wanted).abs() < 1e-9
}

/// Category predicate: resolved id when the resolver found one, with a
/// folded-name fallback scan when the indexed lookup missed.
fn category_matches(
    record_category_id: Uuid,
    record_category_name: &str,
    resolved_id: Option<Uuid>,
    label: &str,
) -> bool {
    if let Some(id) = resolved_id {
        if record_category_id == id {
            return true;
        }
    }
    fold(record_category_name) == fold(label)
}

fn settle<'a, T>(matches: Vec<&'a T>) -> std::result::Result<&'a T, MatchFailure> {
    match matches.len() {
        0 => Err(MatchFailure::NotFound),
        1 => Ok(matches[0]),
        n => Err(MatchFailure::Ambiguous { candidates: n }),
    }
}

/// Pure matcher over a user-scoped, newest-first record list. Both store
/// backends share this so the ambiguity policy lives in one place.
pub fn match_transaction<'a>(
    records: &'a [Transaction],
    criteria: &TransactionCriteria,
    resolved_category: Option<Uuid>,
    today: NaiveDate,
) -> std::result::Result<&'a Transaction, MatchFailure> {
    let wanted_kind = criteria.kind.as_deref().and_then(EntryKind::parse);
    let wanted_date = criteria
        .date
        .as_deref()
        .and_then(|d| temporal::normalize_date(d, today))
        .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok());

    let matches: Vec<&Transaction> = records
        .iter()
        .filter(|t| criteria.id.map_or(true, |id| t.id == id))
        .filter(|t| criteria.amount.map_or(true, |a| amount_matches(t.amount, a)))
        .filter(|t| wanted_kind.map_or(true, |k| t.kind == k))
        .filter(|t| {
            criteria.category.as_deref().map_or(true, |label| {
                category_matches(t.category_id, &t.category_name, resolved_category, label)
            })
        })
        .filter(|t| wanted_date.map_or(true, |d| t.date == d))
        .filter(|t| {
            criteria.description.as_deref().map_or(true, |needle| {
                t.description
                    .as_deref()
                    .map_or(false, |d| d.to_lowercase().contains(&needle.to_lowercase()))
            })
        })
        .collect();

    settle(matches)
}

pub fn match_budget<'a>(
    records: &'a [Budget],
    criteria: &BudgetCriteria,
    resolved_category: Option<Uuid>,
) -> std::result::Result<&'a Budget, MatchFailure> {
    let wanted_recurrence = criteria
        .recurrence
        .as_deref()
        .and_then(crate::models::Recurrence::parse);

    let matches: Vec<&Budget> = records
        .iter()
        .filter(|b| criteria.id.map_or(true, |id| b.id == id))
        .filter(|b| criteria.amount.map_or(true, |a| amount_matches(b.amount, a)))
        .filter(|b| {
            criteria.category.as_deref().map_or(true, |label| {
                category_matches(b.category_id, &b.category_name, resolved_category, label)
            })
        })
        .filter(|b| wanted_recurrence.map_or(true, |r| b.recurrence == r))
        .collect();

    settle(matches)
}

pub fn match_goal<'a>(
    records: &'a [SavingsGoal],
    criteria: &GoalCriteria,
    resolved_category: Option<Uuid>,
) -> std::result::Result<&'a SavingsGoal, MatchFailure> {
    let matches: Vec<&SavingsGoal> = records
        .iter()
        .filter(|g| criteria.id.map_or(true, |id| g.id == id))
        .filter(|g| {
            criteria
                .name
                .as_deref()
                .map_or(true, |name| fold(&g.name).contains(&fold(name)))
        })
        .filter(|g| {
            criteria.category.as_deref().map_or(true, |label| {
                category_matches(g.category_id, &g.category_name, resolved_category, label)
            })
        })
        .collect();

    settle(matches)
}
