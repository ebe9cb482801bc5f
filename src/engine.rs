//! Chat engine
//!
//! One conversational turn end to end: quota gate, session preparation,
//! relative-date preprocessing, run creation, polling, tool dispatch, and
//! the final assistant reply. The caller gets back every executed action
//! plus the updated usage snapshot.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::assistant::ReasoningService;
use crate::dispatcher::ToolDispatcher;
use crate::error::EngineError;
use crate::models::{ActionResult, CategoryCandidate, RunStatus, UsageSnapshot};
use crate::poller::{poll_until_settled, BackoffConfig};
use crate::records::TurnContext;
use crate::session::SessionManager;
use crate::store::ProfileStore;
use crate::temporal;
use crate::usage::UsageMeter;
use crate::Result;

/// Tool-dispatch rounds allowed within a single turn. The reasoning
/// service occasionally chains follow-up calls; a runaway chain gets cut
/// here with a warning instead of looping forever.
const MAX_TOOL_ITERATIONS: usize = 10;

pub struct TurnRequest {
    pub user_id: Uuid,
    pub message: String,
    pub thread_id: Option<String>,
    pub is_onboarding: bool,
    pub categories: Option<Vec<CategoryCandidate>>,
    pub timezone: Option<String>,
}

pub struct TurnOutcome {
    pub message: String,
    pub thread_id: String,
    pub executed_actions: Vec<ActionResult>,
    pub usage: UsageSnapshot,
    pub warning: Option<String>,
}

pub struct ChatEngine {
    service: Arc<dyn ReasoningService>,
    profiles: Arc<dyn ProfileStore>,
    dispatcher: ToolDispatcher,
    usage: UsageMeter,
    agent_id: String,
    backoff: BackoffConfig,
}

impl ChatEngine {
    pub fn new(
        service: Arc<dyn ReasoningService>,
        profiles: Arc<dyn ProfileStore>,
        dispatcher: ToolDispatcher,
        usage: UsageMeter,
        agent_id: String,
    ) -> Self {
        Self {
            service,
            profiles,
            dispatcher,
            usage,
            agent_id,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
        let profile = self.profiles.profile(request.user_id).await?;

        let snapshot = self
            .usage
            .snapshot(request.user_id, profile.plan_limit)
            .await?;
        if snapshot.exhausted() {
            return Err(EngineError::QuotaExceeded {
                used: snapshot.used,
                limit: snapshot.limit,
            });
        }

        let mut ctx = TurnContext::new(request.user_id, request.timezone.clone());
        ctx.provided_categories = request.categories.clone();

        // Relative expressions resolve against the user's local calendar
        // before the message ever reaches the reasoning service.
        let message = temporal::replace_relative_dates(&request.message, ctx.today);

        let session = SessionManager::new(self.service.as_ref())
            .prepare(
                request.thread_id.as_deref(),
                &profile,
                request.is_onboarding,
                &message,
            )
            .await?;

        let run_id = self
            .service
            .create_run(&session.thread_id, &self.agent_id, None)
            .await?;
        info!(thread_id = %session.thread_id, run_id = %run_id, "Run started");

        // The turn reached the reasoning service; it counts from here on,
        // whatever the run does next.
        let usage = self
            .usage
            .record_turn(request.user_id, profile.plan_limit)
            .await?;

        let mut executed_actions: Vec<ActionResult> = Vec::new();
        let mut warning = None;

        for iteration in 0..=MAX_TOOL_ITERATIONS {
            let run =
                poll_until_settled(self.service.as_ref(), &session.thread_id, &run_id, &self.backoff)
                    .await?;

            if run.status == RunStatus::Completed {
                break;
            }

            // requires_action
            if iteration == MAX_TOOL_ITERATIONS {
                warn!(run_id = %run_id, "Tool iteration budget exhausted, abandoning run");
                warning = Some("Some requested actions could not be completed".to_string());
                if let Err(error) = self.service.cancel_run(&session.thread_id, &run_id).await {
                    warn!(run_id = %run_id, "Runaway run cancel failed: {}", error);
                }
                break;
            }

            let (outputs, actions) = self.dispatcher.execute_batch(&ctx, &run.tool_calls).await;
            executed_actions.extend(actions);

            self.service
                .submit_tool_outputs(&session.thread_id, &run_id, &outputs)
                .await?;
        }

        let message = self.final_reply(&session.thread_id).await?;

        Ok(TurnOutcome {
            message,
            thread_id: session.thread_id,
            executed_actions,
            usage,
            warning,
        })
    }

    /// Newest assistant message on the thread; the listing comes back
    /// newest-first.
    async fn final_reply(&self, thread_id: &str) -> Result<String> {
        let messages = self.service.list_messages(thread_id).await?;
        Ok(messages
            .into_iter()
            .find(|m| m.role == "assistant")
            .map(|m| m.content)
            .unwrap_or_else(|| "Listo.".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        EntryKind, Run, RunError, ThreadMessage, ToolCall, ToolOutputEntry, UserProfile,
    };
    use crate::records::RecordMutator;
    use crate::store::{
        CategoryStore, InMemoryStore, LoggingGamificationSink, RecordStore, UsageStore,
    };
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted reasoning service: a queue of run states, each either a
    /// completion or a batch of tool calls to hand out.
    struct ScriptedService {
        script: Mutex<Vec<Run>>,
        submitted: Mutex<Vec<Vec<ToolOutputEntry>>>,
        reply: String,
        cancelled: Mutex<Vec<String>>,
    }

    impl ScriptedService {
        fn new(script: Vec<Run>, reply: &str) -> Self {
            Self {
                script: Mutex::new(script),
                submitted: Mutex::new(Vec::new()),
                reply: reply.to_string(),
                cancelled: Mutex::new(Vec::new()),
            }
        }

        fn requires_action(calls: Vec<ToolCall>) -> Run {
            Run {
                id: "run_1".to_string(),
                status: RunStatus::RequiresAction,
                tool_calls: calls,
                last_error: None,
            }
        }

        fn completed() -> Run {
            Run {
                id: "run_1".to_string(),
                status: RunStatus::Completed,
                tool_calls: vec![],
                last_error: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl ReasoningService for ScriptedService {
        async fn create_thread(&self) -> crate::Result<String> {
            Ok("thread_scripted".to_string())
        }
        async fn post_message(&self, _: &str, _: &str, _: &str) -> crate::Result<()> {
            Ok(())
        }
        async fn create_run(&self, _: &str, _: &str, _: Option<&str>) -> crate::Result<String> {
            Ok("run_1".to_string())
        }
        async fn get_run(&self, _: &str, run_id: &str) -> crate::Result<Run> {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                Ok(script.remove(0))
            } else if let Some(last) = script.first() {
                Ok(last.clone())
            } else {
                Ok(Run {
                    id: run_id.to_string(),
                    status: RunStatus::Completed,
                    tool_calls: vec![],
                    last_error: None,
                })
            }
        }
        async fn list_runs(&self, _: &str) -> crate::Result<Vec<Run>> {
            Ok(vec![])
        }
        async fn cancel_run(&self, _: &str, run_id: &str) -> crate::Result<()> {
            self.cancelled.lock().unwrap().push(run_id.to_string());
            Ok(())
        }
        async fn submit_tool_outputs(
            &self,
            _: &str,
            _: &str,
            outputs: &[ToolOutputEntry],
        ) -> crate::Result<()> {
            self.submitted.lock().unwrap().push(outputs.to_vec());
            Ok(())
        }
        async fn list_messages(&self, _: &str) -> crate::Result<Vec<ThreadMessage>> {
            Ok(vec![ThreadMessage {
                role: "assistant".to_string(),
                content: self.reply.clone(),
            }])
        }
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            seed: Duration::from_millis(1),
            factor: 1.4,
            cap: Duration::from_millis(2),
            max_attempts: 5,
            throttle_delay: Duration::from_millis(1),
        }
    }

    fn engine(store: &Arc<InMemoryStore>, service: Arc<ScriptedService>) -> ChatEngine {
        let mutator = RecordMutator::new(
            Arc::clone(store) as Arc<dyn RecordStore>,
            Arc::clone(store) as Arc<dyn CategoryStore>,
            Arc::new(LoggingGamificationSink),
        );
        let dispatcher = ToolDispatcher::new(
            mutator,
            Arc::clone(store) as Arc<dyn RecordStore>,
            Arc::clone(store) as Arc<dyn CategoryStore>,
            Arc::clone(store) as Arc<dyn ProfileStore>,
        );
        ChatEngine::new(
            service,
            Arc::clone(store) as Arc<dyn ProfileStore>,
            dispatcher,
            UsageMeter::new(Arc::clone(store) as Arc<dyn UsageStore>),
            "agent_fin".to_string(),
        )
        .with_backoff(fast_backoff())
    }

    fn call(function: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            function_name: function.to_string(),
            arguments: arguments.to_string(),
        }
    }

    fn request(user: Uuid, message: &str) -> TurnRequest {
        TurnRequest {
            user_id: user,
            message: message.to_string(),
            thread_id: None,
            is_onboarding: false,
            categories: None,
            timezone: Some("America/Mexico_City".to_string()),
        }
    }

    #[tokio::test]
    async fn expense_turn_creates_transaction_and_meters_usage() {
        let store = Arc::new(InMemoryStore::new());
        store
            .seed_category("Comida y restaurantes", EntryKind::Expense)
            .await;
        let user = Uuid::new_v4();

        let service = Arc::new(ScriptedService::new(
            vec![
                ScriptedService::requires_action(vec![call(
                    "manage_transaction",
                    json!({
                        "operation": "insert",
                        "data": {
                            "amount": 500.0,
                            "type": "EXPENSE",
                            "category": "comida y restaurantes",
                            "date": "2025-07-19"
                        }
                    }),
                )]),
                ScriptedService::completed(),
            ],
            "Registré tu gasto de $500 en Comida y restaurantes.",
        ));

        let engine = engine(&store, Arc::clone(&service));
        let outcome = engine
            .handle_turn(request(user, "gasté 500 en comida ayer"))
            .await
            .unwrap();

        assert_eq!(outcome.thread_id, "thread_scripted");
        assert!(outcome.message.contains("Registré"));
        assert_eq!(outcome.executed_actions.len(), 1);
        assert_eq!(outcome.usage.used, 1);
        assert!(outcome.warning.is_none());

        let records = store.transactions_for_user(user).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount, 500.0);
        assert_eq!(records[0].category_name, "Comida y restaurantes");
    }

    #[tokio::test]
    async fn ambiguous_update_leaves_records_untouched() {
        let store = Arc::new(InMemoryStore::new());
        let category = store.seed_category("Transporte", EntryKind::Expense).await;
        let user = Uuid::new_v4();

        for amount in [120.0, 80.0] {
            store
                .insert_transaction(crate::models::Transaction {
                    id: Uuid::new_v4(),
                    user_id: user,
                    amount,
                    kind: EntryKind::Expense,
                    category_id: category,
                    category_name: "Transporte".to_string(),
                    description: None,
                    date: chrono::NaiveDate::from_ymd_opt(2025, 7, 20).unwrap(),
                    occurred_at: None,
                    created_at: chrono::Utc::now(),
                })
                .await
                .unwrap();
        }

        let service = Arc::new(ScriptedService::new(
            vec![
                ScriptedService::requires_action(vec![call(
                    "manage_transaction",
                    json!({
                        "operation": "update",
                        "criteria": { "category": "transporte", "date": "2025-07-20" },
                        "updates": { "amount": 999.0 }
                    }),
                )]),
                ScriptedService::completed(),
            ],
            "Encontré varios movimientos, ¿cuál quieres cambiar?",
        ));

        let engine = engine(&store, Arc::clone(&service));
        let outcome = engine
            .handle_turn(request(user, "cámbialo a 999"))
            .await
            .unwrap();

        assert_eq!(outcome.executed_actions.len(), 1);
        assert_eq!(outcome.executed_actions[0].payload["reason"], "ambiguous");

        let records = store.transactions_for_user(user).await.unwrap();
        assert!(records.iter().all(|t| t.amount != 999.0));

        // The decline went back through tool outputs, not an error path.
        let submitted = service.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        let output: Value = serde_json::from_str(&submitted[0][0].output).unwrap();
        assert_eq!(output["success"], false);
    }

    #[tokio::test]
    async fn exhausted_quota_rejects_before_any_protocol_traffic() {
        let store = Arc::new(InMemoryStore::new());
        let user = Uuid::new_v4();
        store
            .set_profile(UserProfile {
                user_id: user,
                display_name: "Mariana".to_string(),
                onboarding_complete: true,
                plan_limit: 2,
            })
            .await;
        store.increment_usage(user, &crate::usage::period_key(chrono::Utc::now())).await.unwrap();
        store.increment_usage(user, &crate::usage::period_key(chrono::Utc::now())).await.unwrap();

        let service = Arc::new(ScriptedService::new(vec![], "nunca"));
        let engine = engine(&store, Arc::clone(&service));

        let result = engine.handle_turn(request(user, "hola")).await;
        assert!(matches!(
            result,
            Err(EngineError::QuotaExceeded { used: 2, limit: 2 })
        ));
    }

    #[tokio::test]
    async fn failed_run_still_consumes_a_turn() {
        let store = Arc::new(InMemoryStore::new());
        let user = Uuid::new_v4();

        let failed = Run {
            id: "run_1".to_string(),
            status: RunStatus::Failed,
            tool_calls: vec![],
            last_error: Some(RunError {
                code: Some("server_error".to_string()),
                message: "model crashed".to_string(),
            }),
        };
        let service = Arc::new(ScriptedService::new(vec![failed], "nunca"));

        let engine = engine(&store, Arc::clone(&service));
        let result = engine.handle_turn(request(user, "gasté 500 en comida")).await;
        assert!(matches!(result, Err(EngineError::AssistantUnavailable(_))));

        // The message was posted and the run created, so the turn counts.
        let period = crate::usage::period_key(chrono::Utc::now());
        assert_eq!(store.usage_count(user, &period).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn runaway_tool_chain_is_cut_with_a_warning() {
        let store = Arc::new(InMemoryStore::new());
        let user = Uuid::new_v4();

        // Script never completes: every poll demands another round.
        let service = Arc::new(ScriptedService::new(
            vec![ScriptedService::requires_action(vec![call(
                "list_categories",
                json!({}),
            )])],
            "Me quedé a medias.",
        ));

        let engine = engine(&store, Arc::clone(&service));
        let outcome = engine
            .handle_turn(request(user, "haz algo raro"))
            .await
            .unwrap();

        assert!(outcome.warning.is_some());
        assert_eq!(service.submitted.lock().unwrap().len(), MAX_TOOL_ITERATIONS);
        assert_eq!(*service.cancelled.lock().unwrap(), vec!["run_1"]);
    }

    #[tokio::test]
    async fn relative_dates_resolve_before_posting() {
        let store = Arc::new(InMemoryStore::new());
        let user = Uuid::new_v4();

        struct CapturingService {
            posted: Mutex<Vec<String>>,
        }

        #[async_trait::async_trait]
        impl ReasoningService for CapturingService {
            async fn create_thread(&self) -> crate::Result<String> {
                Ok("thread_x".to_string())
            }
            async fn post_message(&self, _: &str, _: &str, content: &str) -> crate::Result<()> {
                self.posted.lock().unwrap().push(content.to_string());
                Ok(())
            }
            async fn create_run(&self, _: &str, _: &str, _: Option<&str>) -> crate::Result<String> {
                Ok("run_1".to_string())
            }
            async fn get_run(&self, _: &str, run_id: &str) -> crate::Result<Run> {
                Ok(Run {
                    id: run_id.to_string(),
                    status: RunStatus::Completed,
                    tool_calls: vec![],
                    last_error: None,
                })
            }
            async fn list_runs(&self, _: &str) -> crate::Result<Vec<Run>> {
                Ok(vec![])
            }
            async fn cancel_run(&self, _: &str, _: &str) -> crate::Result<()> {
                Ok(())
            }
            async fn submit_tool_outputs(
                &self,
                _: &str,
                _: &str,
                _: &[ToolOutputEntry],
            ) -> crate::Result<()> {
                Ok(())
            }
            async fn list_messages(&self, _: &str) -> crate::Result<Vec<ThreadMessage>> {
                Ok(vec![])
            }
        }

        let service = Arc::new(CapturingService {
            posted: Mutex::new(Vec::new()),
        });

        let mutator = RecordMutator::new(
            Arc::clone(&store) as Arc<dyn RecordStore>,
            Arc::clone(&store) as Arc<dyn CategoryStore>,
            Arc::new(LoggingGamificationSink),
        );
        let dispatcher = ToolDispatcher::new(
            mutator,
            Arc::clone(&store) as Arc<dyn RecordStore>,
            Arc::clone(&store) as Arc<dyn CategoryStore>,
            Arc::clone(&store) as Arc<dyn ProfileStore>,
        );
        let engine = ChatEngine::new(
            Arc::clone(&service) as Arc<dyn ReasoningService>,
            Arc::clone(&store) as Arc<dyn ProfileStore>,
            dispatcher,
            UsageMeter::new(Arc::clone(&store) as Arc<dyn UsageStore>),
            "agent_fin".to_string(),
        )
        .with_backoff(fast_backoff());

        engine
            .handle_turn(request(user, "gasté 500 en comida ayer"))
            .await
            .unwrap();

        let posted = service.posted.lock().unwrap();
        // Seed message plus the user message with "ayer" replaced.
        let user_message = posted.last().unwrap();
        assert!(!user_message.contains("ayer"));
        assert!(user_message.contains("gasté 500 en comida"));

        let today = temporal::today_in_zone(Some("America/Mexico_City"));
        let yesterday = (today - chrono::Duration::days(1)).format("%Y-%m-%d").to_string();
        assert!(user_message.contains(&yesterday));
    }
}
