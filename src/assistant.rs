//! Reasoning-service protocol client
//!
//! Thread/run/tool-output operations against the external assistant API.
//! The trait keeps the engine testable with a scripted mock; the HTTP
//! implementation uses a long-lived reqwest::Client for connection pooling.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::EngineError;
use crate::models::{Run, RunError, RunStatus, ThreadMessage, ToolCall, ToolOutputEntry};
use crate::Result;

#[async_trait::async_trait]
pub trait ReasoningService: Send + Sync {
    async fn create_thread(&self) -> Result<String>;
    async fn post_message(&self, thread_id: &str, role: &str, content: &str) -> Result<()>;
    async fn create_run(
        &self,
        thread_id: &str,
        agent_id: &str,
        extra_instructions: Option<&str>,
    ) -> Result<String>;
    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run>;
    async fn list_runs(&self, thread_id: &str) -> Result<Vec<Run>>;
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<()>;
    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutputEntry],
    ) -> Result<()>;
    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>>;
}

/// HTTP client against the assistant threads/runs API.
pub struct HttpAssistantClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl HttpAssistantClient {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<T> {
        let response = builder.send().await.map_err(|e| {
            error!("Assistant API request failed ({}): {}", context, e);
            EngineError::Protocol(format!("{}: {}", context, e))
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Throttled(format!("{}: {}", context, body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Assistant API error response ({}): {} {}", context, status, body);
            return Err(EngineError::Protocol(format!(
                "{} returned {}: {}",
                context, status, body
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| EngineError::Protocol(format!("{}: invalid response: {}", context, e)))
    }
}

//
// ================= Wire Shapes =================
//

#[derive(Debug, Deserialize)]
struct ApiObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiSubmitToolOutputs {
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Debug, Deserialize)]
struct ApiRequiredAction {
    submit_tool_outputs: ApiSubmitToolOutputs,
}

#[derive(Debug, Deserialize)]
struct ApiRunError {
    code: Option<String>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiRun {
    id: String,
    status: RunStatus,
    required_action: Option<ApiRequiredAction>,
    last_error: Option<ApiRunError>,
}

impl From<ApiRun> for Run {
    fn from(run: ApiRun) -> Self {
        Run {
            id: run.id,
            status: run.status,
            tool_calls: run
                .required_action
                .map(|action| {
                    action
                        .submit_tool_outputs
                        .tool_calls
                        .into_iter()
                        .map(|call| ToolCall {
                            id: call.id,
                            function_name: call.function.name,
                            arguments: call.function.arguments,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            last_error: run.last_error.map(|e| RunError {
                code: e.code,
                message: e.message,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessageText {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ApiMessageContent {
    text: Option<ApiMessageText>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    role: String,
    content: Vec<ApiMessageContent>,
}

#[derive(Debug, Serialize)]
struct ApiToolOutput<'a> {
    tool_call_id: &'a str,
    output: &'a str,
}

#[async_trait::async_trait]
impl ReasoningService for HttpAssistantClient {
    async fn create_thread(&self) -> Result<String> {
        let created: ApiObject = self
            .send_json(
                self.request(reqwest::Method::POST, "/threads").json(&json!({})),
                "create_thread",
            )
            .await?;
        debug!(thread_id = %created.id, "Created assistant thread");
        Ok(created.id)
    }

    async fn post_message(&self, thread_id: &str, role: &str, content: &str) -> Result<()> {
        let _: ApiObject = self
            .send_json(
                self.request(
                    reqwest::Method::POST,
                    &format!("/threads/{}/messages", thread_id),
                )
                .json(&json!({ "role": role, "content": content })),
                "post_message",
            )
            .await?;
        Ok(())
    }

    async fn create_run(
        &self,
        thread_id: &str,
        agent_id: &str,
        extra_instructions: Option<&str>,
    ) -> Result<String> {
        let mut body = json!({ "assistant_id": agent_id });
        if let Some(instructions) = extra_instructions {
            body["additional_instructions"] = json!(instructions);
        }

        let created: ApiObject = self
            .send_json(
                self.request(reqwest::Method::POST, &format!("/threads/{}/runs", thread_id))
                    .json(&body),
                "create_run",
            )
            .await?;
        Ok(created.id)
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run> {
        let run: ApiRun = self
            .send_json(
                self.request(
                    reqwest::Method::GET,
                    &format!("/threads/{}/runs/{}", thread_id, run_id),
                ),
                "get_run",
            )
            .await?;
        Ok(run.into())
    }

    async fn list_runs(&self, thread_id: &str) -> Result<Vec<Run>> {
        let runs: ApiList<ApiRun> = self
            .send_json(
                self.request(reqwest::Method::GET, &format!("/threads/{}/runs", thread_id)),
                "list_runs",
            )
            .await?;
        Ok(runs.data.into_iter().map(Run::from).collect())
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<()> {
        let _: ApiRun = self
            .send_json(
                self.request(
                    reqwest::Method::POST,
                    &format!("/threads/{}/runs/{}/cancel", thread_id, run_id),
                )
                .json(&json!({})),
                "cancel_run",
            )
            .await?;
        Ok(())
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutputEntry],
    ) -> Result<()> {
        let wire: Vec<ApiToolOutput> = outputs
            .iter()
            .map(|o| ApiToolOutput {
                tool_call_id: &o.tool_call_id,
                output: &o.output,
            })
            .collect();

        let _: ApiRun = self
            .send_json(
                self.request(
                    reqwest::Method::POST,
                    &format!("/threads/{}/runs/{}/submit_tool_outputs", thread_id, run_id),
                )
                .json(&json!({ "tool_outputs": wire })),
                "submit_tool_outputs",
            )
            .await?;
        Ok(())
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>> {
        let messages: ApiList<ApiMessage> = self
            .send_json(
                self.request(
                    reqwest::Method::GET,
                    &format!("/threads/{}/messages", thread_id),
                ),
                "list_messages",
            )
            .await?;

        Ok(messages
            .data
            .into_iter()
            .map(|m| ThreadMessage {
                role: m.role,
                content: m
                    .content
                    .into_iter()
                    .filter_map(|c| c.text.map(|t| t.value))
                    .collect::<Vec<_>>()
                    .join("\n"),
            })
            .collect())
    }
}
