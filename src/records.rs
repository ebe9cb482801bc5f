//! Record mutator
//!
//! Insert/update/delete/list over transactions, budgets, and savings goals.
//! Every operation validates before touching the store; category misses and
//! criteria ambiguity come back as conversational declines, not errors.

use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::category::{resolve_category, CategoryMatch, CategoryResolution};
use crate::criteria::{
    match_budget, match_goal, match_transaction, BudgetCriteria, GoalCriteria, TransactionCriteria,
};
use crate::error::EngineError;
use crate::models::{
    ActionKind, ActionResult, Budget, CategoryCandidate, EntryKind, MonthlyTarget,
    MonthlyTargetMode, Recurrence, SavingsGoal, Transaction,
};
use crate::store::{CategoryStore, GamificationSink, RecordStore};
use crate::temporal;
use crate::Result;

//
// ================= Tool Payload Shapes =================
//

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransactionInput {
    pub amount: Option<f64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub category: Option<String>,
    pub date: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BudgetInput {
    pub amount: Option<f64>,
    pub category: Option<String>,
    pub recurrence: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GoalInput {
    pub name: Option<String>,
    pub target_amount: Option<f64>,
    pub category: Option<String>,
    pub monthly_target_mode: Option<String>,
    pub monthly_target_value: Option<f64>,
}

/// List filters, parsed leniently: the reasoning service sometimes sends a
/// free-form filter object and sometimes a legacy single-entity shape with
/// an exact `date` field.
#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub kind: Option<EntryKind>,
    pub category: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub limit: usize,
}

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

impl ListFilters {
    pub fn parse(value: Option<&Value>, today: NaiveDate) -> Self {
        let mut filters = ListFilters {
            limit: DEFAULT_LIST_LIMIT,
            ..Default::default()
        };

        let Some(obj) = value.and_then(Value::as_object) else {
            return filters;
        };

        filters.kind = obj
            .get("type")
            .or_else(|| obj.get("kind"))
            .and_then(Value::as_str)
            .and_then(EntryKind::parse);

        filters.category = obj
            .get("category")
            .and_then(Value::as_str)
            .map(str::to_string);

        let parse_date = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .and_then(|d| temporal::normalize_date(d, today))
                .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok())
        };

        filters.date_from = parse_date("startDate").or_else(|| parse_date("from"));
        filters.date_to = parse_date("endDate").or_else(|| parse_date("to"));

        // Legacy single-entity shape: an exact date bounds both ends.
        if filters.date_from.is_none() && filters.date_to.is_none() {
            if let Some(exact) = parse_date("date") {
                filters.date_from = Some(exact);
                filters.date_to = Some(exact);
            }
        }

        if let Some(limit) = obj.get("limit").and_then(Value::as_u64) {
            filters.limit = (limit as usize).clamp(1, MAX_LIST_LIMIT);
        }

        filters
    }
}

//
// ================= Mutator =================
//

/// Per-turn context threaded into every operation.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub user_id: Uuid,
    pub timezone: Option<String>,
    pub provided_categories: Option<Vec<CategoryCandidate>>,
    pub today: NaiveDate,
}

impl TurnContext {
    pub fn new(user_id: Uuid, timezone: Option<String>) -> Self {
        let today = temporal::today_in_zone(timezone.as_deref());
        Self {
            user_id,
            timezone,
            provided_categories: None,
            today,
        }
    }
}

pub struct RecordMutator {
    records: Arc<dyn RecordStore>,
    categories: Arc<dyn CategoryStore>,
    gamification: Arc<dyn GamificationSink>,
}

fn ok(kind: ActionKind, mut payload: Value) -> ActionResult {
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("status".to_string(), json!("ok"));
    }
    ActionResult { kind, payload }
}

fn declined(kind: ActionKind, payload: Value) -> ActionResult {
    ActionResult { kind, payload }
}

fn suggestions_payload(suggestions: &crate::category::CategorySuggestions) -> Value {
    json!({
        "status": "declined",
        "reason": "category_not_found",
        "requested": suggestions.requested,
        "suggestions": suggestions.suggestions,
        "message": format!(
            "Category '{}' was not found. Closest options: {}",
            suggestions.requested,
            suggestions.suggestions.join(", ")
        ),
    })
}

impl RecordMutator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        categories: Arc<dyn CategoryStore>,
        gamification: Arc<dyn GamificationSink>,
    ) -> Self {
        Self {
            records,
            categories,
            gamification,
        }
    }

    async fn resolve(
        &self,
        label: &str,
        kind: EntryKind,
        ctx: &TurnContext,
    ) -> Result<CategoryResolution> {
        resolve_category(
            label,
            kind,
            ctx.provided_categories.as_deref(),
            self.categories.as_ref(),
        )
        .await
    }

    /// Best-effort id for a criteria category label; a miss is fine, the
    /// matcher falls back to a folded-name scan.
    async fn criteria_category_id(
        &self,
        label: Option<&str>,
        kind: EntryKind,
        ctx: &TurnContext,
    ) -> Result<Option<Uuid>> {
        // kind comes from the criteria when stated, Expense otherwise.
        let Some(label) = label else {
            return Ok(None);
        };
        match self.resolve(label, kind, ctx).await? {
            CategoryResolution::Matched(m) => Ok(Some(m.id)),
            CategoryResolution::Suggestions(_) => Ok(None),
        }
    }

    fn fire_gamification(&self, user_id: Uuid, event: &'static str, payload: Value) {
        let sink = Arc::clone(&self.gamification);
        tokio::spawn(async move {
            if let Err(error) = sink.record_event(user_id, event, &payload).await {
                warn!(event, "Gamification dispatch failed: {}", error);
            }
        });
    }

    //
    // ================= Transactions =================
    //

    pub async fn insert_transaction(
        &self,
        ctx: &TurnContext,
        input: &TransactionInput,
    ) -> Result<ActionResult> {
        let amount = input
            .amount
            .filter(|a| *a > 0.0)
            .ok_or_else(|| EngineError::Validation("Transaction amount must be > 0".to_string()))?;

        let kind = input
            .kind
            .as_deref()
            .and_then(EntryKind::parse)
            .ok_or_else(|| {
                EngineError::Validation("Transaction type must be EXPENSE or INCOME".to_string())
            })?;

        let label = input.category.as_deref().ok_or_else(|| {
            EngineError::Validation("Transaction category is required".to_string())
        })?;

        let category = match self.resolve(label, kind, ctx).await? {
            CategoryResolution::Matched(m) => m,
            CategoryResolution::Suggestions(s) => {
                return Ok(declined(
                    ActionKind::TransactionCreated,
                    suggestions_payload(&s),
                ));
            }
        };

        let date = self.normalized_date(input.date.as_deref(), ctx)?;

        let record = Transaction {
            id: Uuid::new_v4(),
            user_id: ctx.user_id,
            amount,
            kind,
            category_id: category.id,
            category_name: category.name.clone(),
            description: input.description.clone(),
            date,
            occurred_at: Some(temporal::local_midnight_instant(
                date,
                ctx.timezone.as_deref(),
            )),
            created_at: Utc::now(),
        };

        let snapshot = serde_json::to_value(&record)?;
        self.records.insert_transaction(record).await?;
        self.fire_gamification(ctx.user_id, "transaction_created", snapshot.clone());

        Ok(ok(
            ActionKind::TransactionCreated,
            json!({ "transaction": snapshot }),
        ))
    }

    pub async fn update_transaction(
        &self,
        ctx: &TurnContext,
        criteria: &TransactionCriteria,
        updates: &TransactionInput,
    ) -> Result<ActionResult> {
        criteria.validate()?;

        let criteria_kind = criteria
            .kind
            .as_deref()
            .and_then(EntryKind::parse)
            .unwrap_or(EntryKind::Expense);
        let resolved = self
            .criteria_category_id(criteria.category.as_deref(), criteria_kind, ctx)
            .await?;

        let records = self.records.transactions_for_user(ctx.user_id).await?;
        let target = match match_transaction(&records, criteria, resolved, ctx.today) {
            Ok(t) => t.clone(),
            Err(failure) => {
                return Ok(declined(
                    ActionKind::TransactionUpdated,
                    failure.to_payload("transaction"),
                ));
            }
        };

        let mut updated = target.clone();

        if let Some(amount) = updates.amount {
            if amount <= 0.0 {
                return Err(EngineError::Validation(
                    "Transaction amount must be > 0".to_string(),
                ));
            }
            updated.amount = amount;
        }

        if let Some(kind) = updates.kind.as_deref() {
            updated.kind = EntryKind::parse(kind).ok_or_else(|| {
                EngineError::Validation("Transaction type must be EXPENSE or INCOME".to_string())
            })?;
        }

        if let Some(label) = updates.category.as_deref() {
            match self.resolve(label, updated.kind, ctx).await? {
                CategoryResolution::Matched(CategoryMatch { id, name }) => {
                    updated.category_id = id;
                    updated.category_name = name;
                }
                CategoryResolution::Suggestions(s) => {
                    return Ok(declined(
                        ActionKind::TransactionUpdated,
                        suggestions_payload(&s),
                    ));
                }
            }
        }

        if let Some(date) = updates.date.as_deref() {
            updated.date = self.normalized_date(Some(date), ctx)?;
        }

        if updates.description.is_some() {
            updated.description = updates.description.clone();
        }

        self.records.update_transaction(&updated).await?;

        Ok(ok(
            ActionKind::TransactionUpdated,
            json!({ "transaction": serde_json::to_value(&updated)? }),
        ))
    }

    pub async fn delete_transaction(
        &self,
        ctx: &TurnContext,
        criteria: &TransactionCriteria,
    ) -> Result<ActionResult> {
        criteria.validate()?;

        let criteria_kind = criteria
            .kind
            .as_deref()
            .and_then(EntryKind::parse)
            .unwrap_or(EntryKind::Expense);
        let resolved = self
            .criteria_category_id(criteria.category.as_deref(), criteria_kind, ctx)
            .await?;

        let records = self.records.transactions_for_user(ctx.user_id).await?;
        let target = match match_transaction(&records, criteria, resolved, ctx.today) {
            Ok(t) => t.clone(),
            Err(failure) => {
                return Ok(declined(
                    ActionKind::TransactionDeleted,
                    failure.to_payload("transaction"),
                ));
            }
        };

        self.records
            .delete_transaction(ctx.user_id, target.id)
            .await?;

        Ok(ok(
            ActionKind::TransactionDeleted,
            json!({ "deleted": serde_json::to_value(&target)? }),
        ))
    }

    pub async fn list_transactions(
        &self,
        ctx: &TurnContext,
        filters: &ListFilters,
    ) -> Result<ActionResult> {
        let records = self.records.transactions_for_user(ctx.user_id).await?;

        let category_folded = filters.category.as_deref().map(crate::category::fold);
        let selected: Vec<&Transaction> = records
            .iter()
            .filter(|t| filters.kind.map_or(true, |k| t.kind == k))
            .filter(|t| {
                category_folded
                    .as_deref()
                    .map_or(true, |c| crate::category::fold(&t.category_name) == c)
            })
            .filter(|t| filters.date_from.map_or(true, |d| t.date >= d))
            .filter(|t| filters.date_to.map_or(true, |d| t.date <= d))
            .take(filters.limit)
            .collect();

        let total: f64 = selected.iter().map(|t| t.amount).sum();
        let summary = format!(
            "{} transaction(s), total: {:.2}",
            selected.len(),
            total
        );

        Ok(ok(
            ActionKind::TransactionsListed,
            json!({
                "transactions": selected,
                "count": selected.len(),
                "summary": summary,
            }),
        ))
    }

    //
    // ================= Budgets =================
    //

    pub async fn insert_budget(
        &self,
        ctx: &TurnContext,
        input: &BudgetInput,
    ) -> Result<ActionResult> {
        let amount = input
            .amount
            .filter(|a| *a > 0.0)
            .ok_or_else(|| EngineError::Validation("Budget amount must be > 0".to_string()))?;

        let recurrence = input
            .recurrence
            .as_deref()
            .and_then(Recurrence::parse)
            .ok_or_else(|| {
                EngineError::Validation(
                    "Budget recurrence must be weekly, monthly, or yearly".to_string(),
                )
            })?;

        let label = input
            .category
            .as_deref()
            .ok_or_else(|| EngineError::Validation("Budget category is required".to_string()))?;

        let category = match self.resolve(label, EntryKind::Expense, ctx).await? {
            CategoryResolution::Matched(m) => m,
            CategoryResolution::Suggestions(s) => {
                return Ok(declined(ActionKind::BudgetCreated, suggestions_payload(&s)));
            }
        };

        let (period_start, period_end) = period_bounds(recurrence, ctx.today);

        let record = Budget {
            id: Uuid::new_v4(),
            user_id: ctx.user_id,
            amount,
            category_id: category.id,
            category_name: category.name,
            recurrence,
            period_start,
            period_end,
            created_at: Utc::now(),
        };

        let snapshot = serde_json::to_value(&record)?;
        self.records.insert_budget(record).await?;
        self.fire_gamification(ctx.user_id, "budget_created", snapshot.clone());

        Ok(ok(ActionKind::BudgetCreated, json!({ "budget": snapshot })))
    }

    pub async fn update_budget(
        &self,
        ctx: &TurnContext,
        criteria: &BudgetCriteria,
        updates: &BudgetInput,
    ) -> Result<ActionResult> {
        criteria.validate()?;

        let resolved = self
            .criteria_category_id(criteria.category.as_deref(), EntryKind::Expense, ctx)
            .await?;

        let records = self.records.budgets_for_user(ctx.user_id).await?;
        let target = match match_budget(&records, criteria, resolved) {
            Ok(b) => b.clone(),
            Err(failure) => {
                return Ok(declined(
                    ActionKind::BudgetUpdated,
                    failure.to_payload("budget"),
                ));
            }
        };

        let mut updated = target.clone();

        if let Some(amount) = updates.amount {
            if amount <= 0.0 {
                return Err(EngineError::Validation(
                    "Budget amount must be > 0".to_string(),
                ));
            }
            updated.amount = amount;
        }

        if let Some(label) = updates.category.as_deref() {
            match self.resolve(label, EntryKind::Expense, ctx).await? {
                CategoryResolution::Matched(CategoryMatch { id, name }) => {
                    updated.category_id = id;
                    updated.category_name = name;
                }
                CategoryResolution::Suggestions(s) => {
                    return Ok(declined(ActionKind::BudgetUpdated, suggestions_payload(&s)));
                }
            }
        }

        if let Some(recurrence) = updates.recurrence.as_deref() {
            updated.recurrence = Recurrence::parse(recurrence).ok_or_else(|| {
                EngineError::Validation(
                    "Budget recurrence must be weekly, monthly, or yearly".to_string(),
                )
            })?;
            let (start, end) = period_bounds(updated.recurrence, ctx.today);
            updated.period_start = start;
            updated.period_end = end;
        }

        self.records.update_budget(&updated).await?;

        Ok(ok(
            ActionKind::BudgetUpdated,
            json!({ "budget": serde_json::to_value(&updated)? }),
        ))
    }

    pub async fn delete_budget(
        &self,
        ctx: &TurnContext,
        criteria: &BudgetCriteria,
    ) -> Result<ActionResult> {
        criteria.validate()?;

        let resolved = self
            .criteria_category_id(criteria.category.as_deref(), EntryKind::Expense, ctx)
            .await?;

        let records = self.records.budgets_for_user(ctx.user_id).await?;
        let target = match match_budget(&records, criteria, resolved) {
            Ok(b) => b.clone(),
            Err(failure) => {
                return Ok(declined(
                    ActionKind::BudgetDeleted,
                    failure.to_payload("budget"),
                ));
            }
        };

        self.records.delete_budget(ctx.user_id, target.id).await?;

        Ok(ok(
            ActionKind::BudgetDeleted,
            json!({ "deleted": serde_json::to_value(&target)? }),
        ))
    }

    pub async fn list_budgets(
        &self,
        ctx: &TurnContext,
        filters: &ListFilters,
    ) -> Result<ActionResult> {
        let records = self.records.budgets_for_user(ctx.user_id).await?;

        let category_folded = filters.category.as_deref().map(crate::category::fold);
        let selected: Vec<&Budget> = records
            .iter()
            .filter(|b| {
                category_folded
                    .as_deref()
                    .map_or(true, |c| crate::category::fold(&b.category_name) == c)
            })
            .take(filters.limit)
            .collect();

        let summary = format!("{} budget(s)", selected.len());

        Ok(ok(
            ActionKind::BudgetsListed,
            json!({
                "budgets": selected,
                "count": selected.len(),
                "summary": summary,
            }),
        ))
    }

    //
    // ================= Goals =================
    //

    pub async fn insert_goal(&self, ctx: &TurnContext, input: &GoalInput) -> Result<ActionResult> {
        let name = input
            .name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| EngineError::Validation("Goal name is required".to_string()))?;

        let target_amount = input
            .target_amount
            .filter(|a| *a > 0.0)
            .ok_or_else(|| EngineError::Validation("Goal target amount must be > 0".to_string()))?;

        let label = input
            .category
            .as_deref()
            .ok_or_else(|| EngineError::Validation("Goal category is required".to_string()))?;

        let category = match self.resolve(label, EntryKind::Expense, ctx).await? {
            CategoryResolution::Matched(m) => m,
            CategoryResolution::Suggestions(s) => {
                return Ok(declined(ActionKind::GoalCreated, suggestions_payload(&s)));
            }
        };

        let monthly_target = parse_monthly_target(
            input.monthly_target_mode.as_deref(),
            input.monthly_target_value,
        )?;

        let record = SavingsGoal {
            id: Uuid::new_v4(),
            user_id: ctx.user_id,
            name: name.to_string(),
            target_amount,
            category_id: category.id,
            category_name: category.name,
            monthly_target,
            created_at: Utc::now(),
        };

        let snapshot = serde_json::to_value(&record)?;
        self.records.insert_goal(record).await?;
        self.fire_gamification(ctx.user_id, "goal_created", snapshot.clone());

        Ok(ok(ActionKind::GoalCreated, json!({ "goal": snapshot })))
    }

    pub async fn update_goal(
        &self,
        ctx: &TurnContext,
        criteria: &GoalCriteria,
        updates: &GoalInput,
    ) -> Result<ActionResult> {
        criteria.validate()?;

        let resolved = self
            .criteria_category_id(criteria.category.as_deref(), EntryKind::Expense, ctx)
            .await?;

        let records = self.records.goals_for_user(ctx.user_id).await?;
        let target = match match_goal(&records, criteria, resolved) {
            Ok(g) => g.clone(),
            Err(failure) => {
                return Ok(declined(ActionKind::GoalUpdated, failure.to_payload("goal")));
            }
        };

        let mut updated = target.clone();

        if let Some(name) = updates.name.as_deref() {
            if name.trim().is_empty() {
                return Err(EngineError::Validation("Goal name is required".to_string()));
            }
            updated.name = name.to_string();
        }

        if let Some(amount) = updates.target_amount {
            if amount <= 0.0 {
                return Err(EngineError::Validation(
                    "Goal target amount must be > 0".to_string(),
                ));
            }
            updated.target_amount = amount;
        }

        if let Some(label) = updates.category.as_deref() {
            match self.resolve(label, EntryKind::Expense, ctx).await? {
                CategoryResolution::Matched(CategoryMatch { id, name }) => {
                    updated.category_id = id;
                    updated.category_name = name;
                }
                CategoryResolution::Suggestions(s) => {
                    return Ok(declined(ActionKind::GoalUpdated, suggestions_payload(&s)));
                }
            }
        }

        if updates.monthly_target_mode.is_some() || updates.monthly_target_value.is_some() {
            updated.monthly_target = parse_monthly_target(
                updates.monthly_target_mode.as_deref(),
                updates.monthly_target_value,
            )?;
        }

        self.records.update_goal(&updated).await?;

        Ok(ok(
            ActionKind::GoalUpdated,
            json!({ "goal": serde_json::to_value(&updated)? }),
        ))
    }

    pub async fn delete_goal(
        &self,
        ctx: &TurnContext,
        criteria: &GoalCriteria,
    ) -> Result<ActionResult> {
        criteria.validate()?;

        let resolved = self
            .criteria_category_id(criteria.category.as_deref(), EntryKind::Expense, ctx)
            .await?;

        let records = self.records.goals_for_user(ctx.user_id).await?;
        let target = match match_goal(&records, criteria, resolved) {
            Ok(g) => g.clone(),
            Err(failure) => {
                return Ok(declined(ActionKind::GoalDeleted, failure.to_payload("goal")));
            }
        };

        self.records.delete_goal(ctx.user_id, target.id).await?;

        Ok(ok(
            ActionKind::GoalDeleted,
            json!({ "deleted": serde_json::to_value(&target)? }),
        ))
    }

    pub async fn list_goals(
        &self,
        ctx: &TurnContext,
        filters: &ListFilters,
    ) -> Result<ActionResult> {
        let records = self.records.goals_for_user(ctx.user_id).await?;

        let category_folded = filters.category.as_deref().map(crate::category::fold);
        let selected: Vec<&SavingsGoal> = records
            .iter()
            .filter(|g| {
                category_folded
                    .as_deref()
                    .map_or(true, |c| crate::category::fold(&g.category_name) == c)
            })
            .take(filters.limit)
            .collect();

        let summary = format!("{} goal(s)", selected.len());

        Ok(ok(
            ActionKind::GoalsListed,
            json!({
                "goals": selected,
                "count": selected.len(),
                "summary": summary,
            }),
        ))
    }

    fn normalized_date(&self, raw: Option<&str>, ctx: &TurnContext) -> Result<NaiveDate> {
        match raw {
            None => Ok(ctx.today),
            Some(raw) => {
                let canonical = temporal::normalize_date(raw, ctx.today).ok_or_else(|| {
                    EngineError::Validation(format!("Unparseable date: {}", raw))
                })?;
                NaiveDate::parse_from_str(&canonical, "%Y-%m-%d")
                    .map_err(|e| EngineError::Validation(format!("Invalid date {}: {}", raw, e)))
            }
        }
    }
}

fn parse_monthly_target(
    mode: Option<&str>,
    value: Option<f64>,
) -> Result<Option<MonthlyTarget>> {
    let Some(mode) = mode else {
        return Ok(None);
    };
    let value = value.filter(|v| *v > 0.0).ok_or_else(|| {
        EngineError::Validation("Monthly target value must be > 0".to_string())
    })?;

    match mode.trim().to_lowercase().as_str() {
        "percentage" => {
            if value > 100.0 {
                return Err(EngineError::Validation(
                    "Percentage monthly target cannot exceed 100".to_string(),
                ));
            }
            Ok(Some(MonthlyTarget {
                mode: MonthlyTargetMode::Percentage,
                value,
            }))
        }
        "fixed" | "fixed_amount" => Ok(Some(MonthlyTarget {
            mode: MonthlyTargetMode::Fixed,
            value,
        })),
        other => Err(EngineError::Validation(format!(
            "Unknown monthly target mode: {}",
            other
        ))),
    }
}

/// Period bounds derived from the current date: ISO week for weekly,
/// calendar month for monthly, calendar year for yearly.
fn period_bounds(recurrence: Recurrence, today: NaiveDate) -> (NaiveDate, NaiveDate) {
    match recurrence {
        Recurrence::Weekly => {
            let start =
                today - Duration::days(today.weekday().num_days_from_monday() as i64);
            (start, start + Duration::days(6))
        }
        Recurrence::Monthly => {
            let start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
                .unwrap_or(today);
            let end = if today.month() == 12 {
                NaiveDate::from_ymd_opt(today.year() + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(today.year(), today.month() + 1, 1)
            }
            .map(|next| next - Duration::days(1))
            .unwrap_or(today);
            (start, end)
        }
        Recurrence::Yearly => (
            NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today),
            NaiveDate::from_ymd_opt(today.year(), 12, 31).unwrap_or(today),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, LoggingGamificationSink};

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 20).unwrap()
    }

    fn context(user_id: Uuid) -> TurnContext {
        TurnContext {
            user_id,
            timezone: Some("America/Mexico_City".to_string()),
            provided_categories: None,
            today: reference(),
        }
    }

    fn mutator(store: &Arc<InMemoryStore>) -> RecordMutator {
        RecordMutator::new(
            Arc::clone(store) as Arc<dyn RecordStore>,
            Arc::clone(store) as Arc<dyn CategoryStore>,
            Arc::new(LoggingGamificationSink),
        )
    }

    #[tokio::test]
    async fn insert_requires_positive_amount() {
        let store = Arc::new(InMemoryStore::new());
        let mutator = mutator(&store);
        let ctx = context(Uuid::new_v4());

        let input = TransactionInput {
            amount: Some(-10.0),
            kind: Some("EXPENSE".to_string()),
            category: Some("Comida".to_string()),
            ..Default::default()
        };

        let result = mutator.insert_transaction(&ctx, &input).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn insert_with_unknown_category_returns_suggestions() {
        let store = Arc::new(InMemoryStore::new());
        store
            .seed_category("Transporte y Movilidad", EntryKind::Expense)
            .await;
        let mutator = mutator(&store);
        let user = Uuid::new_v4();
        let ctx = context(user);

        let input = TransactionInput {
            amount: Some(200.0),
            kind: Some("EXPENSE".to_string()),
            category: Some("Transporte".to_string()),
            date: Some("2025-07-19".to_string()),
            ..Default::default()
        };

        let action = mutator.insert_transaction(&ctx, &input).await.unwrap();
        assert_eq!(action.payload["status"], "declined");
        assert_eq!(action.payload["reason"], "category_not_found");
        assert!(action.payload["suggestions"]
            .as_array()
            .unwrap()
            .iter()
            .any(|s| s == "Transporte y Movilidad"));

        // No record was created.
        assert!(store.transactions_for_user(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_projects_local_midnight_instant() {
        let store = Arc::new(InMemoryStore::new());
        store
            .seed_category("Comida y restaurantes", EntryKind::Expense)
            .await;
        let mutator = mutator(&store);
        let user = Uuid::new_v4();
        let ctx = context(user);

        let input = TransactionInput {
            amount: Some(500.0),
            kind: Some("EXPENSE".to_string()),
            category: Some("comida y restaurantes".to_string()),
            date: Some("2025-07-19".to_string()),
            ..Default::default()
        };

        let action = mutator.insert_transaction(&ctx, &input).await.unwrap();
        assert_eq!(action.kind, ActionKind::TransactionCreated);

        let records = store.transactions_for_user(user).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount, 500.0);
        assert_eq!(records[0].category_name, "Comida y restaurantes");
        // Mexico City midnight is 06:00 UTC.
        assert_eq!(
            records[0].occurred_at.unwrap().to_rfc3339(),
            "2025-07-19T06:00:00+00:00"
        );
    }

    #[tokio::test]
    async fn ambiguous_update_declines_without_mutation() {
        let store = Arc::new(InMemoryStore::new());
        let category = store.seed_category("Transporte", EntryKind::Expense).await;
        let mutator = mutator(&store);
        let user = Uuid::new_v4();
        let ctx = context(user);

        for amount in [120.0, 80.0] {
            store
                .insert_transaction(Transaction {
                    id: Uuid::new_v4(),
                    user_id: user,
                    amount,
                    kind: EntryKind::Expense,
                    category_id: category,
                    category_name: "Transporte".to_string(),
                    description: None,
                    date: reference(),
                    occurred_at: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let criteria = TransactionCriteria {
            category: Some("transporte".to_string()),
            date: Some("2025-07-20".to_string()),
            ..Default::default()
        };
        let updates = TransactionInput {
            amount: Some(999.0),
            ..Default::default()
        };

        let action = mutator
            .update_transaction(&ctx, &criteria, &updates)
            .await
            .unwrap();
        assert_eq!(action.payload["status"], "declined");
        assert_eq!(action.payload["reason"], "ambiguous");

        let records = store.transactions_for_user(user).await.unwrap();
        assert!(records.iter().all(|t| t.amount != 999.0));
    }

    #[tokio::test]
    async fn delete_returns_removed_snapshot() {
        let store = Arc::new(InMemoryStore::new());
        let category = store.seed_category("Comida", EntryKind::Expense).await;
        let mutator = mutator(&store);
        let user = Uuid::new_v4();
        let ctx = context(user);

        store
            .insert_transaction(Transaction {
                id: Uuid::new_v4(),
                user_id: user,
                amount: 55.0,
                kind: EntryKind::Expense,
                category_id: category,
                category_name: "Comida".to_string(),
                description: Some("tacos".to_string()),
                date: reference(),
                occurred_at: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let criteria = TransactionCriteria {
            amount: Some(55.0),
            category: Some("comida".to_string()),
            ..Default::default()
        };

        let action = mutator.delete_transaction(&ctx, &criteria).await.unwrap();
        assert_eq!(action.kind, ActionKind::TransactionDeleted);
        assert_eq!(action.payload["deleted"]["amount"], 55.0);
        assert!(store.transactions_for_user(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn budget_insert_derives_monthly_period_bounds() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_category("Comida", EntryKind::Expense).await;
        let mutator = mutator(&store);
        let user = Uuid::new_v4();
        let ctx = context(user);

        let input = BudgetInput {
            amount: Some(3000.0),
            category: Some("comida".to_string()),
            recurrence: Some("monthly".to_string()),
        };

        let action = mutator.insert_budget(&ctx, &input).await.unwrap();
        assert_eq!(action.kind, ActionKind::BudgetCreated);

        let budgets = store.budgets_for_user(user).await.unwrap();
        assert_eq!(budgets[0].period_start, NaiveDate::from_ymd_opt(2025, 7, 1).unwrap());
        assert_eq!(budgets[0].period_end, NaiveDate::from_ymd_opt(2025, 7, 31).unwrap());
    }

    #[tokio::test]
    async fn budget_requires_known_recurrence() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_category("Comida", EntryKind::Expense).await;
        let mutator = mutator(&store);
        let ctx = context(Uuid::new_v4());

        let input = BudgetInput {
            amount: Some(3000.0),
            category: Some("comida".to_string()),
            recurrence: Some("daily".to_string()),
        };

        assert!(matches!(
            mutator.insert_budget(&ctx, &input).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn goal_percentage_target_is_capped() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_category("Viajes", EntryKind::Expense).await;
        let mutator = mutator(&store);
        let ctx = context(Uuid::new_v4());

        let input = GoalInput {
            name: Some("Vacaciones".to_string()),
            target_amount: Some(20000.0),
            category: Some("viajes".to_string()),
            monthly_target_mode: Some("percentage".to_string()),
            monthly_target_value: Some(150.0),
        };

        assert!(matches!(
            mutator.insert_goal(&ctx, &input).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn list_applies_filters_and_limit() {
        let store = Arc::new(InMemoryStore::new());
        let comida = store.seed_category("Comida", EntryKind::Expense).await;
        let mutator = mutator(&store);
        let user = Uuid::new_v4();
        let ctx = context(user);

        for day in 15..=19 {
            store
                .insert_transaction(Transaction {
                    id: Uuid::new_v4(),
                    user_id: user,
                    amount: 10.0 * day as f64,
                    kind: EntryKind::Expense,
                    category_id: comida,
                    category_name: "Comida".to_string(),
                    description: None,
                    date: NaiveDate::from_ymd_opt(2025, 7, day).unwrap(),
                    occurred_at: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let filters = ListFilters::parse(
            Some(&json!({
                "type": "EXPENSE",
                "category": "comida",
                "startDate": "2025-07-17",
                "limit": 2
            })),
            reference(),
        );

        let action = mutator.list_transactions(&ctx, &filters).await.unwrap();
        assert_eq!(action.payload["count"], 2);
        assert!(action.payload["summary"]
            .as_str()
            .unwrap()
            .starts_with("2 transaction(s)"));
    }

    #[test]
    fn legacy_single_entity_filter_bounds_both_ends() {
        let filters = ListFilters::parse(Some(&json!({ "date": "19/07/2025" })), reference());
        let expected = NaiveDate::from_ymd_opt(2025, 7, 19).unwrap();
        assert_eq!(filters.date_from, Some(expected));
        assert_eq!(filters.date_to, Some(expected));
        assert_eq!(filters.limit, DEFAULT_LIST_LIMIT);
    }

    #[test]
    fn weekly_period_bounds_start_monday() {
        // 2025-07-20 is a Sunday.
        let (start, end) = period_bounds(Recurrence::Weekly, reference());
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 7, 14).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2025, 7, 20).unwrap());
    }
}
