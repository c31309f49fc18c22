//! Language-model orchestration: the contract the pipeline drives and an
//! OpenAI-compatible chat-completions implementation (OpenAI and Ollama `/v1`).

use std::time::Duration;

use async_trait::async_trait;
use crmpilot_core::config::{LlmConfig, LlmProvider};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::tools::{ToolDescriptor, ToolInvocation, ToolInvoker};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub const CRM_SYSTEM_PROMPT: &str = "You are an expert CRM assistant. Use the provided tools to \
look up or change contacts, companies, addresses, relationships, and field definitions in the \
user's CRM. Never invent records: if a tool fails, say what failed. When presenting data, give a \
clear, well-structured answer with the relevant fields, and summarise large lists.";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("language model request failed: {0}")]
    Transport(String),
    #[error("language model returned status {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("language model response could not be understood: {0}")]
    MalformedResponse(String),
    #[error("no final answer after {0} rounds")]
    RoundLimit(u32),
    #[error("tool call budget of {limit} exhausted before a final answer")]
    BudgetExhausted { limit: u32 },
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn run(&self, prompt: &str, tools: &dyn ToolInvoker) -> Result<String, OrchestratorError>;
}

pub struct ChatCompletionsOrchestrator {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    max_rounds: u32,
}

impl std::fmt::Debug for ChatCompletionsOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsOrchestrator")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("max_rounds", &self.max_rounds)
            .finish_non_exhaustive()
    }
}

impl ChatCompletionsOrchestrator {
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        model: impl Into<String>,
        timeout: Duration,
        max_rounds: u32,
    ) -> Result<Self, OrchestratorError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| OrchestratorError::Transport(error.to_string()))?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model: model.into(),
            max_rounds: max_rounds.max(1),
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, OrchestratorError> {
        let base_url = match (&config.base_url, config.provider) {
            (Some(url), _) => url.as_str(),
            (None, LlmProvider::OpenAi) => OPENAI_BASE_URL,
            (None, LlmProvider::Ollama) => "http://localhost:11434/v1",
        };

        Self::new(
            base_url,
            config.api_key.clone(),
            config.model.clone(),
            Duration::from_secs(config.timeout_secs),
            config.max_rounds,
        )
    }

    async fn complete(
        &self,
        messages: &[Value],
        tool_specs: &[Value],
    ) -> Result<AssistantMessage, OrchestratorError> {
        let mut body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": messages,
        });
        if !tool_specs.is_empty() {
            body["tools"] = json!(tool_specs);
            body["tool_choice"] = json!("auto");
        }

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response =
            request.send().await.map_err(|error| OrchestratorError::Transport(error.to_string()))?;
        let status = response.status();
        let text =
            response.text().await.map_err(|error| OrchestratorError::Transport(error.to_string()))?;

        if !status.is_success() {
            return Err(OrchestratorError::Provider {
                status: status.as_u16(),
                message: text.chars().take(200).collect(),
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|error| OrchestratorError::MalformedResponse(error.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| OrchestratorError::MalformedResponse("response had no choices".to_string()))
    }
}

#[async_trait]
impl Orchestrator for ChatCompletionsOrchestrator {
    async fn run(&self, prompt: &str, tools: &dyn ToolInvoker) -> Result<String, OrchestratorError> {
        let tool_specs: Vec<Value> = tools.list().iter().map(function_spec).collect();
        let mut messages = vec![
            json!({"role": "system", "content": CRM_SYSTEM_PROMPT}),
            json!({"role": "user", "content": prompt}),
        ];

        for round in 1..=self.max_rounds {
            let reply = self.complete(&messages, &tool_specs).await?;

            let tool_calls = reply.tool_calls.unwrap_or_default();
            if tool_calls.is_empty() {
                let answer = reply.content.unwrap_or_default();
                if answer.trim().is_empty() {
                    return Err(OrchestratorError::MalformedResponse(
                        "model returned neither tool calls nor an answer".to_string(),
                    ));
                }
                info!(event_name = "llm.answer", round, "model produced final answer");
                return Ok(answer);
            }

            let calls: Vec<(String, String, Value)> = tool_calls
                .into_iter()
                .enumerate()
                .map(|(index, call)| {
                    let id = if call.id.is_empty() { format!("call_{round}_{index}") } else { call.id };
                    (id, call.function.name, call.function.arguments)
                })
                .collect();

            messages.push(json!({
                "role": "assistant",
                "content": reply.content,
                "tool_calls": calls.iter().map(|(id, name, arguments)| json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": arguments_text(arguments)},
                })).collect::<Vec<_>>(),
            }));

            for (id, name, arguments) in calls {
                debug!(event_name = "llm.tool_call", round, tool = %name, "model requested tool");
                let result = tools.invoke(ToolInvocation::new(name, decode_arguments(arguments))).await;
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": id,
                    "content": result.to_model_json().to_string(),
                }));
            }
        }

        Err(OrchestratorError::RoundLimit(self.max_rounds))
    }
}

fn function_spec(descriptor: &ToolDescriptor) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": descriptor.name,
            "description": descriptor.description,
            "parameters": descriptor.input_schema(),
        }
    })
}

/// OpenAI sends arguments as a JSON string, Ollama as an object. Unparseable text
/// is passed through as a string so the dispatcher rejects it.
fn decode_arguments(raw: Value) -> Value {
    match raw {
        Value::String(text) if text.trim().is_empty() => json!({}),
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        Value::Null => json!({}),
        other => other,
    }
}

fn arguments_text(raw: &Value) -> String {
    match raw {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
    // Some compatible servers send `null` rather than omitting the field.
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    #[serde(default)]
    id: String,
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::{decode_arguments, ChatCompletionsOrchestrator, Orchestrator, OrchestratorError};
    use crate::tools::{
        FailureKind, ParamKind, ParamSpec, ToolDescriptor, ToolInvocation, ToolInvoker, ToolResult,
    };

    #[derive(Default)]
    struct RecordingTools {
        calls: Mutex<Vec<ToolInvocation>>,
    }

    #[async_trait]
    impl ToolInvoker for RecordingTools {
        fn list(&self) -> Vec<ToolDescriptor> {
            vec![ToolDescriptor::read("search_contacts", "Search")
                .with_param(ParamSpec::required("query", ParamKind::String, "Text"))]
        }

        async fn invoke(&self, invocation: ToolInvocation) -> ToolResult {
            let valid = invocation.arguments.is_object();
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(invocation);
            }
            if valid {
                ToolResult::Success(json!([{"name": "Ada Lovelace"}]))
            } else {
                ToolResult::failure(FailureKind::InvalidArguments, "arguments must be an object")
            }
        }
    }

    #[derive(Clone, Default)]
    struct FakeModel {
        requests: Arc<Mutex<Vec<Value>>>,
        script: Arc<Mutex<Vec<Value>>>,
        authorization: Arc<Mutex<Option<String>>>,
    }

    async fn chat(
        State(model): State<FakeModel>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        if let Ok(mut auth) = model.authorization.lock() {
            *auth = headers.get("authorization").and_then(|v| v.to_str().ok()).map(str::to_string);
        }
        if let Ok(mut requests) = model.requests.lock() {
            requests.push(body);
        }
        let next = model.script.lock().ok().and_then(|mut script| {
            if script.is_empty() {
                None
            } else {
                Some(script.remove(0))
            }
        });
        match next {
            Some(reply) => (StatusCode::OK, Json(reply)),
            None => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "script exhausted"}))),
        }
    }

    async fn spawn_model(script: Vec<Value>) -> Result<(String, FakeModel), std::io::Error> {
        let model = FakeModel { script: Arc::new(Mutex::new(script)), ..FakeModel::default() };
        let app = Router::new().route("/v1/chat/completions", post(chat)).with_state(model.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok((format!("http://{address}/v1"), model))
    }

    fn tool_call_reply(arguments: Value) -> Value {
        json!({"choices": [{"message": {
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "search_contacts", "arguments": arguments}
            }]
        }}]})
    }

    fn answer_reply(text: &str) -> Value {
        json!({"choices": [{"message": {"role": "assistant", "content": text}}]})
    }

    #[tokio::test]
    async fn tool_loop_feeds_results_back_and_returns_final_answer(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (url, model) = spawn_model(vec![
            tool_call_reply(json!("{\"query\":\"ada\"}")),
            answer_reply("Found Ada Lovelace."),
        ])
        .await?;
        let orchestrator = ChatCompletionsOrchestrator::new(
            &url,
            Some("sk-test".to_string().into()),
            "gpt-test",
            Duration::from_secs(5),
            4,
        )?;
        let tools = RecordingTools::default();

        let answer = orchestrator.run("find ada", &tools).await?;

        assert_eq!(answer, "Found Ada Lovelace.");
        let calls = tools.calls.lock().map(|calls| calls.clone()).unwrap_or_default();
        assert_eq!(calls, vec![ToolInvocation::new("search_contacts", json!({"query": "ada"}))]);

        let requests = model.requests.lock().map(|r| r.clone()).unwrap_or_default();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0]["temperature"], 0);
        assert_eq!(requests[0]["tools"][0]["function"]["name"], "search_contacts");
        let tool_message = &requests[1]["messages"][3];
        assert_eq!(tool_message["role"], "tool");
        assert_eq!(tool_message["tool_call_id"], "call_1");
        assert!(tool_message["content"].as_str().unwrap_or_default().contains("\"success\":true"));
        assert_eq!(
            model.authorization.lock().ok().and_then(|auth| auth.clone()).as_deref(),
            Some("Bearer sk-test")
        );
        Ok(())
    }

    #[tokio::test]
    async fn malformed_arguments_reach_dispatcher_as_non_object(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (url, model) =
            spawn_model(vec![tool_call_reply(json!("{query: ada")), answer_reply("Sorry.")]).await?;
        let orchestrator =
            ChatCompletionsOrchestrator::new(&url, None, "llama", Duration::from_secs(5), 4)?;
        let tools = RecordingTools::default();

        orchestrator.run("find ada", &tools).await?;

        let calls = tools.calls.lock().map(|calls| calls.clone()).unwrap_or_default();
        assert_eq!(calls[0].arguments, Value::String("{query: ada".to_string()));
        let requests = model.requests.lock().map(|r| r.clone()).unwrap_or_default();
        let content = requests[1]["messages"][3]["content"].as_str().unwrap_or_default().to_string();
        assert!(content.contains("invalid_arguments"));
        Ok(())
    }

    #[tokio::test]
    async fn round_limit_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let (url, _model) = spawn_model(vec![
            tool_call_reply(json!({"query": "a"})),
            tool_call_reply(json!({"query": "b"})),
        ])
        .await?;
        let orchestrator =
            ChatCompletionsOrchestrator::new(&url, None, "llama", Duration::from_secs(5), 2)?;

        let result = orchestrator.run("loop forever", &RecordingTools::default()).await;

        assert!(matches!(result, Err(OrchestratorError::RoundLimit(2))));
        Ok(())
    }

    #[tokio::test]
    async fn provider_error_status_is_surfaced() -> Result<(), Box<dyn std::error::Error>> {
        let (url, _model) = spawn_model(Vec::new()).await?;
        let orchestrator =
            ChatCompletionsOrchestrator::new(&url, None, "llama", Duration::from_secs(5), 2)?;

        let result = orchestrator.run("hello", &RecordingTools::default()).await;

        assert!(matches!(result, Err(OrchestratorError::Provider { status: 503, .. })));
        Ok(())
    }

    #[test]
    fn object_and_empty_arguments_are_normalised() {
        assert_eq!(decode_arguments(json!({"a": 1})), json!({"a": 1}));
        assert_eq!(decode_arguments(json!("")), json!({}));
        assert_eq!(decode_arguments(Value::Null), json!({}));
        assert_eq!(decode_arguments(json!("{\"a\":1}")), json!({"a": 1}));
    }

    #[tokio::test]
    async fn null_tool_calls_is_read_as_final_answer() -> Result<(), Box<dyn std::error::Error>> {
        let (url, _model) = spawn_model(vec![json!({"choices": [{"message": {
            "role": "assistant",
            "content": "Found Ada.",
            "tool_calls": null
        }}]})])
        .await?;
        let orchestrator =
            ChatCompletionsOrchestrator::new(&url, None, "llama", Duration::from_secs(5), 2)?;

        let answer = orchestrator.run("who is ada", &RecordingTools::default()).await?;

        assert_eq!(answer, "Found Ada.");
        Ok(())
    }
}
