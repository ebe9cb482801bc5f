//! Tool-call dispatcher
//!
//! Routes each tool call emitted by a `requires_action` run to exactly one
//! handler. Argument payloads are schema-validated before dispatch; every
//! per-call failure becomes a structured `{success:false}` output so one
//! bad call never blocks its siblings.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::criteria::{BudgetCriteria, GoalCriteria, TransactionCriteria};
use crate::error::EngineError;
use crate::models::{
    ActionKind, ActionResult, EntryKind, OnboardingData, ToolCall, ToolOutputEntry,
};
use crate::records::{
    BudgetInput, GoalInput, ListFilters, RecordMutator, TransactionInput, TurnContext,
};
use crate::store::{CategoryStore, ProfileStore, RecordStore};
use crate::Result;

/// Closed set of functions the reasoning service may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    CaptureOnboarding,
    ManageTransaction,
    ManageBudget,
    ManageGoal,
    ListCategories,
    AnalyzeSpending,
}

impl ToolKind {
    pub fn parse(function_name: &str) -> Option<Self> {
        match function_name {
            "capture_onboarding_data" => Some(ToolKind::CaptureOnboarding),
            "manage_transaction" => Some(ToolKind::ManageTransaction),
            "manage_budget" => Some(ToolKind::ManageBudget),
            "manage_goal" => Some(ToolKind::ManageGoal),
            "list_categories" => Some(ToolKind::ListCategories),
            "analyze_spending" => Some(ToolKind::AnalyzeSpending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[serde(alias = "create", alias = "add")]
    Insert,
    #[serde(alias = "edit")]
    Update,
    #[serde(alias = "remove")]
    Delete,
    #[serde(alias = "get")]
    List,
}

//
// ================= Argument Schemas =================
//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ManageTransactionArgs {
    operation: Operation,
    data: Option<TransactionInput>,
    criteria: Option<TransactionCriteria>,
    updates: Option<TransactionInput>,
    filters: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ManageBudgetArgs {
    operation: Operation,
    data: Option<BudgetInput>,
    criteria: Option<BudgetCriteria>,
    updates: Option<BudgetInput>,
    filters: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ManageGoalArgs {
    operation: Operation,
    data: Option<GoalInput>,
    criteria: Option<GoalCriteria>,
    updates: Option<GoalInput>,
    filters: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ListCategoriesArgs {
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CaptureOnboardingArgs {
    monthly_income: Option<f64>,
    savings_target: Option<f64>,
    currency: Option<String>,
}

fn parse_args<T: serde::de::DeserializeOwned>(call: &ToolCall) -> Result<T> {
    serde_json::from_str(&call.arguments).map_err(|e| {
        EngineError::Validation(format!(
            "Malformed arguments for {}: {}",
            call.function_name, e
        ))
    })
}

//
// ================= Dispatcher =================
//

pub struct ToolDispatcher {
    mutator: RecordMutator,
    records: Arc<dyn RecordStore>,
    categories: Arc<dyn CategoryStore>,
    profiles: Arc<dyn ProfileStore>,
}

impl ToolDispatcher {
    pub fn new(
        mutator: RecordMutator,
        records: Arc<dyn RecordStore>,
        categories: Arc<dyn CategoryStore>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        Self {
            mutator,
            records,
            categories,
            profiles,
        }
    }

    /// Execute a full batch. N calls always produce N outputs; handler
    /// errors are encoded per call, successful and conversationally
    /// declined calls additionally yield an [`ActionResult`].
    pub async fn execute_batch(
        &self,
        ctx: &TurnContext,
        calls: &[ToolCall],
    ) -> (Vec<ToolOutputEntry>, Vec<ActionResult>) {
        let mut outputs = Vec::with_capacity(calls.len());
        let mut actions = Vec::new();

        for call in calls {
            let output = match self.handle_call(ctx, call).await {
                Ok(action) => {
                    let success = action.payload.get("status").map_or(false, |s| s == "ok");
                    let mut body = action.payload.clone();
                    if let Some(obj) = body.as_object_mut() {
                        obj.insert("success".to_string(), json!(success));
                        obj.insert("action".to_string(), serde_json::to_value(action.kind)
                            .unwrap_or(Value::Null));
                    }
                    actions.push(action);
                    body
                }
                Err(error) => {
                    warn!(
                        function = %call.function_name,
                        tool_call_id = %call.id,
                        "Tool call failed: {}",
                        error
                    );
                    json!({ "success": false, "error": error.to_string() })
                }
            };

            outputs.push(ToolOutputEntry {
                tool_call_id: call.id.clone(),
                output: output.to_string(),
            });
        }

        (outputs, actions)
    }

    async fn handle_call(&self, ctx: &TurnContext, call: &ToolCall) -> Result<ActionResult> {
        let kind = ToolKind::parse(&call.function_name).ok_or_else(|| {
            EngineError::Validation(format!("Unknown function: {}", call.function_name))
        })?;

        info!(function = %call.function_name, tool_call_id = %call.id, "Dispatching tool call");

        match kind {
            ToolKind::ManageTransaction => self.manage_transaction(ctx, call).await,
            ToolKind::ManageBudget => self.manage_budget(ctx, call).await,
            ToolKind::ManageGoal => self.manage_goal(ctx, call).await,
            ToolKind::ListCategories => self.list_categories(call).await,
            ToolKind::CaptureOnboarding => self.capture_onboarding(ctx, call).await,
            ToolKind::AnalyzeSpending => self.analyze_spending(ctx).await,
        }
    }

    async fn manage_transaction(&self, ctx: &TurnContext, call: &ToolCall) -> Result<ActionResult> {
        let args: ManageTransactionArgs = parse_args(call)?;
        match args.operation {
            Operation::Insert => {
                let data = args.data.ok_or_else(|| {
                    EngineError::Validation("Insert requires a data payload".to_string())
                })?;
                self.mutator.insert_transaction(ctx, &data).await
            }
            Operation::Update => {
                let criteria = args.criteria.ok_or_else(|| {
                    EngineError::Validation("Update requires criteria".to_string())
                })?;
                let updates = args.updates.or(args.data).ok_or_else(|| {
                    EngineError::Validation("Update requires an updates payload".to_string())
                })?;
                self.mutator.update_transaction(ctx, &criteria, &updates).await
            }
            Operation::Delete => {
                let criteria = args.criteria.ok_or_else(|| {
                    EngineError::Validation("Delete requires criteria".to_string())
                })?;
                self.mutator.delete_transaction(ctx, &criteria).await
            }
            Operation::List => {
                let filters = ListFilters::parse(args.filters.as_ref(), ctx.today);
                self.mutator.list_transactions(ctx, &filters).await
            }
        }
    }

    async fn manage_budget(&self, ctx: &TurnContext, call: &ToolCall) -> Result<ActionResult> {
        let args: ManageBudgetArgs = parse_args(call)?;
        match args.operation {
            Operation::Insert => {
                let data = args.data.ok_or_else(|| {
                    EngineError::Validation("Insert requires a data payload".to_string())
                })?;
                self.mutator.insert_budget(ctx, &data).await
            }
            Operation::Update => {
                let criteria = args.criteria.ok_or_else(|| {
                    EngineError::Validation("Update requires criteria".to_string())
                })?;
                let updates = args.updates.or(args.data).ok_or_else(|| {
                    EngineError::Validation("Update requires an updates payload".to_string())
                })?;
                self.mutator.update_budget(ctx, &criteria, &updates).await
            }
            Operation::Delete => {
                let criteria = args.criteria.ok_or_else(|| {
                    EngineError::Validation("Delete requires criteria".to_string())
                })?;
                self.mutator.delete_budget(ctx, &criteria).await
            }
            Operation::List => {
                let filters = ListFilters::parse(args.filters.as_ref(), ctx.today);
                self.mutator.list_budgets(ctx, &filters).await
            }
        }
    }

    async fn manage_goal(&self, ctx: &TurnContext, call: &ToolCall) -> Result<ActionResult> {
        let args: ManageGoalArgs = parse_args(call)?;
        match args.operation {
            Operation::Insert => {
                let data = args.data.ok_or_else(|| {
                    EngineError::Validation("Insert requires a data payload".to_string())
                })?;
                self.mutator.insert_goal(ctx, &data).await
            }
            Operation::Update => {
                let criteria = args.criteria.ok_or_else(|| {
                    EngineError::Validation("Update requires criteria".to_string())
                })?;
                let updates = args.updates.or(args.data).ok_or_else(|| {
                    EngineError::Validation("Update requires an updates payload".to_string())
                })?;
                self.mutator.update_goal(ctx, &criteria, &updates).await
            }
            Operation::Delete => {
                let criteria = args.criteria.ok_or_else(|| {
                    EngineError::Validation("Delete requires criteria".to_string())
                })?;
                self.mutator.delete_goal(ctx, &criteria).await
            }
            Operation::List => {
                let filters = ListFilters::parse(args.filters.as_ref(), ctx.today);
                self.mutator.list_goals(ctx, &filters).await
            }
        }
    }

    async fn list_categories(&self, call: &ToolCall) -> Result<ActionResult> {
        let args: ListCategoriesArgs = parse_args(call)?;
        let kind = args.kind.as_deref().and_then(EntryKind::parse);

        let categories = self.categories.list_categories(kind).await?;
        let listed: Vec<Value> = categories
            .iter()
            .map(|c| json!({ "id": c.id, "name": c.name, "type": c.kind }))
            .collect();

        Ok(ActionResult {
            kind: ActionKind::CategoriesListed,
            payload: json!({
                "status": "ok",
                "categories": listed,
                "count": listed.len(),
            }),
        })
    }

    async fn capture_onboarding(&self, ctx: &TurnContext, call: &ToolCall) -> Result<ActionResult> {
        let args: CaptureOnboardingArgs = parse_args(call)?;
        let data = OnboardingData {
            monthly_income: args.monthly_income,
            savings_target: args.savings_target,
            currency: args.currency,
        };

        self.profiles.save_onboarding(ctx.user_id, &data).await?;

        Ok(ActionResult {
            kind: ActionKind::OnboardingCaptured,
            payload: json!({
                "status": "ok",
                "captured": serde_json::to_value(&data)?,
            }),
        })
    }

    /// Domain-analysis hand-off: summarize recent expense activity so the
    /// assistant can narrate it.
    async fn analyze_spending(&self, ctx: &TurnContext) -> Result<ActionResult> {
        let records = self.records.transactions_for_user(ctx.user_id).await?;
        let window_start = ctx.today - chrono::Duration::days(30);

        let expenses: Vec<_> = records
            .iter()
            .filter(|t| t.kind == EntryKind::Expense && t.date >= window_start)
            .collect();

        let total: f64 = expenses.iter().map(|t| t.amount).sum();

        let mut by_category: std::collections::HashMap<&str, f64> = std::collections::HashMap::new();
        for t in &expenses {
            *by_category.entry(t.category_name.as_str()).or_insert(0.0) += t.amount;
        }
        let top_category = by_category
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(name, amount)| json!({ "name": name, "total": amount }));

        Ok(ActionResult {
            kind: ActionKind::SpendingAnalyzed,
            payload: json!({
                "status": "ok",
                "windowDays": 30,
                "expenseCount": expenses.len(),
                "total": total,
                "topCategory": top_category,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, LoggingGamificationSink};
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 20).unwrap()
    }

    fn dispatcher(store: &Arc<InMemoryStore>) -> ToolDispatcher {
        let mutator = RecordMutator::new(
            Arc::clone(store) as Arc<dyn RecordStore>,
            Arc::clone(store) as Arc<dyn CategoryStore>,
            Arc::new(LoggingGamificationSink),
        );
        ToolDispatcher::new(
            mutator,
            Arc::clone(store) as Arc<dyn RecordStore>,
            Arc::clone(store) as Arc<dyn CategoryStore>,
            Arc::clone(store) as Arc<dyn ProfileStore>,
        )
    }

    fn context(user_id: Uuid) -> TurnContext {
        TurnContext {
            user_id,
            timezone: None,
            provided_categories: None,
            today: reference(),
        }
    }

    fn call(id: &str, function: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            function_name: function.to_string(),
            arguments: arguments.to_string(),
        }
    }

    #[tokio::test]
    async fn failing_call_does_not_block_siblings() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_category("Comida", EntryKind::Expense).await;
        let dispatcher = dispatcher(&store);
        let user = Uuid::new_v4();
        let ctx = context(user);

        let calls = vec![
            call(
                "call_1",
                "manage_transaction",
                json!({
                    "operation": "insert",
                    "data": { "amount": 100.0, "type": "EXPENSE", "category": "comida" }
                }),
            ),
            call("call_2", "totally_unknown_function", json!({})),
            call("call_3", "list_categories", json!({ "type": "EXPENSE" })),
        ];

        let (outputs, actions) = dispatcher.execute_batch(&ctx, &calls).await;

        assert_eq!(outputs.len(), 3);
        let parsed: Vec<Value> = outputs
            .iter()
            .map(|o| serde_json::from_str(&o.output).unwrap())
            .collect();
        assert_eq!(parsed[0]["success"], true);
        assert_eq!(parsed[1]["success"], false);
        assert!(parsed[1]["error"].as_str().unwrap().contains("Unknown function"));
        assert_eq!(parsed[2]["success"], true);

        // Only the two handled calls produced executed actions.
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].kind, ActionKind::TransactionCreated);
        assert_eq!(actions[1].kind, ActionKind::CategoriesListed);
    }

    #[tokio::test]
    async fn malformed_payloads_are_rejected_before_dispatch() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = dispatcher(&store);
        let ctx = context(Uuid::new_v4());

        let calls = vec![call(
            "call_1",
            "manage_transaction",
            json!({ "operation": "insert", "bogusField": 1 }),
        )];

        let (outputs, actions) = dispatcher.execute_batch(&ctx, &calls).await;
        let parsed: Value = serde_json::from_str(&outputs[0].output).unwrap();
        assert_eq!(parsed["success"], false);
        assert!(parsed["error"].as_str().unwrap().contains("Malformed arguments"));
        assert!(actions.is_empty());
    }

    #[tokio::test]
    async fn declined_mutation_is_relayed_not_errored() {
        let store = Arc::new(InMemoryStore::new());
        store
            .seed_category("Transporte y Movilidad", EntryKind::Expense)
            .await;
        let dispatcher = dispatcher(&store);
        let ctx = context(Uuid::new_v4());

        let calls = vec![call(
            "call_1",
            "manage_transaction",
            json!({
                "operation": "insert",
                "data": { "amount": 50.0, "type": "EXPENSE", "category": "Transporte" }
            }),
        )];

        let (outputs, actions) = dispatcher.execute_batch(&ctx, &calls).await;
        let parsed: Value = serde_json::from_str(&outputs[0].output).unwrap();
        assert_eq!(parsed["success"], false);
        assert_eq!(parsed["reason"], "category_not_found");
        assert!(parsed["suggestions"]
            .as_array()
            .unwrap()
            .contains(&json!("Transporte y Movilidad")));

        // The decline is still an executed action for the caller's UI.
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].payload["status"], "declined");
    }

    #[tokio::test]
    async fn onboarding_capture_persists_profile_fields() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = dispatcher(&store);
        let user = Uuid::new_v4();
        let ctx = context(user);

        let calls = vec![call(
            "call_1",
            "capture_onboarding_data",
            json!({ "monthlyIncome": 28000.0, "savingsTarget": 4000.0, "currency": "MXN" }),
        )];

        let (outputs, actions) = dispatcher.execute_batch(&ctx, &calls).await;
        let parsed: Value = serde_json::from_str(&outputs[0].output).unwrap();
        assert_eq!(parsed["success"], true);
        assert_eq!(actions[0].kind, ActionKind::OnboardingCaptured);

        let captured = store.captured_onboarding(user).await.unwrap();
        assert_eq!(captured.monthly_income, Some(28000.0));
        assert!(store.profile(user).await.unwrap().onboarding_complete);
    }
}
