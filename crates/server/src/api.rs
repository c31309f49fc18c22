//! JSON routes for querying, tool discovery, and cache administration.
//!
//! - `GET  /`               service banner
//! - `GET  /health`         readiness (service + cache backend)
//! - `GET  /docs`           endpoint reference
//! - `GET  /tools`          tool catalog with input schemas
//! - `GET  /mcp/tools/list` catalog in JSON-RPC listing shape
//! - `GET  /cache/stats`    answer cache statistics
//! - `POST /cache/clear`    drop every cached answer
//! - `POST /query`          synchronous cache-first query
//!
//! Streaming (`/sse`, `/messages`) lives in [`crate::stream`], MCP JSON-RPC in
//! [`crate::mcp`].

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use crmpilot_agent::pipeline::QueryRequest;
use crmpilot_core::cache::CacheStats;
use crmpilot_core::errors::{ApplicationError, InterfaceError};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bootstrap::AppState;
use crate::{health, mcp, stream};

pub const SERVICE_NAME: &str = "crmpilot";

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health::health))
        .route("/docs", get(docs))
        .route("/tools", get(list_tools))
        .route("/mcp/tools/list", get(mcp_tools_listing))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(clear_cache))
        .route("/query", post(query))
        .merge(stream::routes())
        .merge(mcp::routes())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct QueryBody {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub instance_url: Option<String>,
    #[serde(default)]
    pub instance_api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CredentialParams {
    pub instance_url: Option<String>,
    pub instance_api_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
    pub prompt: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub correlation_id: String,
}

#[derive(Debug, Serialize)]
pub struct ToolListing {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

#[derive(Debug, Serialize)]
pub struct ToolsResponse {
    pub success: bool,
    pub total_tools: usize,
    pub tools: Vec<ToolListing>,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub success: bool,
    pub cleared: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn banner(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "timestamp": Utc::now().to_rfc3339(),
        "message": "Server is running and ready",
    }))
}

async fn docs() -> Json<Value> {
    Json(json!({
        "endpoints": {
            "GET /": "Service banner",
            "GET /health": "Readiness including the cache backend",
            "GET /docs": "This endpoint reference",
            "GET /tools": "Tool catalog with input schemas",
            "GET /mcp/tools/list": "Tool catalog in JSON-RPC listing shape",
            "POST /mcp": "MCP JSON-RPC 2.0 (initialize, tools/list, tools/call)",
            "GET /cache/stats": "Answer cache statistics",
            "POST /cache/clear": "Drop every cached answer",
            "POST /query": "Synchronous query, cache first",
            "GET /sse": "Server-Sent Events stream for a session",
            "POST /messages": "Submit a prompt whose answer is streamed to a session",
        },
        "usage": {
            "POST /query": {
                "url": "/query?instance_url={instance_url}&instance_api_key={instance_api_key}",
                "body": {"prompt": "Your CRM query here"},
                "note": "Credentials may also be sent in the body",
            },
            "POST /messages": {
                "url": "/messages?session_id={session_id}&instance_url={instance_url}&instance_api_key={instance_api_key}",
                "body": {"prompt": "Your CRM query here"},
                "note": "Open GET /sse?session_id={session_id} first to receive the answer",
            },
            "GET /sse": {
                "url": "/sse?session_id={session_id}",
                "description": "data: CONNECTED, then the answer, then data: END_STREAM",
            },
        },
        "parameters": {
            "session_id": "Identifier shared by /sse and /messages",
            "instance_url": "Base URL of the CRM instance",
            "instance_api_key": "API key for the CRM instance",
        },
    }))
}

async fn list_tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    let tools: Vec<ToolListing> = state
        .registry
        .list()
        .into_iter()
        .map(|descriptor| ToolListing {
            schema: descriptor.input_schema(),
            name: descriptor.name,
            description: descriptor.description,
        })
        .collect();

    Json(ToolsResponse { success: true, total_tools: tools.len(), tools })
}

async fn mcp_tools_listing(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": {
            "tools": mcp::tool_definitions(&state.registry),
            "nextCursor": null,
        },
    }))
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats().await)
}

async fn clear_cache(State(state): State<AppState>) -> Json<ClearResponse> {
    let cleared = state.cache.clear().await;
    Json(ClearResponse { success: true, cleared })
}

async fn query(
    State(state): State<AppState>,
    Query(params): Query<CredentialParams>,
    body: Result<Json<QueryBody>, JsonRejection>,
) -> (StatusCode, Json<QueryResponse>) {
    let correlation_id = Uuid::new_v4().to_string();
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            let interface = ApplicationError::Validation(rejection.body_text())
                .into_interface(&correlation_id);
            return failure(StatusCode::BAD_REQUEST, String::new(), &interface);
        }
    };
    let prompt = body.prompt.unwrap_or_default();
    let instance_url = body.instance_url.or(params.instance_url).unwrap_or_default();
    let api_key = body.instance_api_key.or(params.instance_api_key).unwrap_or_default();

    let request =
        QueryRequest::new(prompt.clone(), instance_url, SecretString::from(api_key), &correlation_id);

    info!(
        event_name = "server.query.received",
        correlation_id = %correlation_id,
        prompt_len = prompt.len(),
        "query received"
    );

    if let Err(error) = request.validate() {
        let interface = ApplicationError::from(error).into_interface(&correlation_id);
        return failure(StatusCode::BAD_REQUEST, prompt, &interface);
    }

    match state.pipeline.run(&request).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(QueryResponse {
                success: true,
                answer: Some(outcome.answer),
                cached: outcome.cached,
                cached_at: outcome.cached_at,
                prompt,
                timestamp: Utc::now(),
                error: None,
                correlation_id,
            }),
        ),
        Err(error) => {
            let interface = ApplicationError::from(error).into_interface(&correlation_id);
            let status = match interface {
                InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
                _ => StatusCode::OK,
            };
            failure(status, prompt, &interface)
        }
    }
}

fn failure(
    status: StatusCode,
    prompt: String,
    error: &InterfaceError,
) -> (StatusCode, Json<QueryResponse>) {
    warn!(
        event_name = "server.query.failed",
        correlation_id = error.correlation_id(),
        status = status.as_u16(),
        error = error.detail(),
        "query failed"
    );

    (
        status,
        Json(QueryResponse {
            success: false,
            answer: None,
            cached: false,
            cached_at: None,
            prompt,
            timestamp: Utc::now(),
            error: Some(error.detail().to_string()),
            correlation_id: error.correlation_id().to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use crmpilot_agent::llm::{Orchestrator, OrchestratorError};
    use crmpilot_agent::tools::ToolInvoker;
    use crmpilot_core::cache::BackendKind;
    use crmpilot_core::config::AppConfig;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::app;
    use crate::bootstrap::tests::{test_state, EchoOrchestrator};
    use crate::bootstrap::{build_state, AppState};

    struct Broken;

    #[async_trait]
    impl Orchestrator for Broken {
        async fn run(&self, _: &str, _: &dyn ToolInvoker) -> Result<String, OrchestratorError> {
            Err(OrchestratorError::MalformedResponse("no choices".to_string()))
        }
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.expect("router should respond");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let body = serde_json::from_slice(&bytes).expect("body should be json");
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request should build")
    }

    fn state() -> AppState {
        test_state().expect("state should build")
    }

    #[tokio::test]
    async fn query_answers_then_serves_identical_answer_from_cache() {
        let state = state();
        let body = json!({
            "prompt": "List my contacts",
            "instance_url": "https://crm.example.test",
            "instance_api_key": "key-1",
        });

        let (status, first) = send(app(state.clone()), post_json("/query", body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["success"], json!(true));
        assert_eq!(first["cached"], json!(false));
        assert!(first.get("cached_at").is_none());
        assert_eq!(first["prompt"], json!("List my contacts"));

        let (_, second) = send(app(state), post_json("/query", body)).await;
        assert_eq!(second["cached"], json!(true));
        assert_eq!(second["answer"], first["answer"]);
        assert!(second["cached_at"].is_string());
    }

    #[tokio::test]
    async fn query_accepts_credentials_from_query_string() {
        let (status, body) = send(
            app(state()),
            post_json(
                "/query?instance_url=https%3A%2F%2Fcrm.example.test&instance_api_key=k",
                json!({"prompt": "hello"}),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["answer"], json!("echo: hello\nsecond line"));
    }

    #[tokio::test]
    async fn query_without_credentials_is_rejected_with_bad_request() {
        let (status, body) =
            send(app(state()), post_json("/query", json!({"prompt": "hello"}))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("instance_url is required"));
        assert!(body["correlation_id"].is_string());
    }

    #[tokio::test]
    async fn malformed_query_body_still_gets_json_envelope() {
        let request = Request::builder()
            .method("POST")
            .uri("/query")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .expect("request should build");

        let (status, body) = send(app(state()), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].is_string());
        assert!(body["correlation_id"].is_string());
    }

    #[tokio::test]
    async fn query_without_content_type_still_gets_json_envelope() {
        let request = Request::builder()
            .method("POST")
            .uri("/query")
            .body(Body::from(json!({"prompt": "hello"}).to_string()))
            .expect("request should build");

        let (status, body) = send(app(state()), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().is_some_and(|error| error.contains("Content-Type")));
    }

    #[tokio::test]
    async fn query_over_unreachable_shared_cache_still_answers() {
        let mut config = AppConfig::default();
        config.cache.backend = BackendKind::Shared;
        config.cache.shared_url = Some("redis://127.0.0.1:1/".to_string());
        config.cache.operation_timeout_ms = 200;
        let state = build_state(config, Arc::new(EchoOrchestrator)).expect("state");
        let body = json!({
            "prompt": "hello",
            "instance_url": "https://crm.example.test",
            "instance_api_key": "k",
        });

        for _ in 0..2 {
            let (status, reply) = send(app(state.clone()), post_json("/query", body.clone())).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(reply["success"], json!(true));
            assert_eq!(reply["cached"], json!(false));
        }
        assert!(state.cache.stats().await.degraded);
    }

    #[tokio::test]
    async fn orchestrator_failure_is_reported_in_envelope() {
        let state = build_state(AppConfig::default(), Arc::new(Broken)).expect("state");
        let (status, body) = send(
            app(state.clone()),
            post_json(
                "/query",
                json!({
                    "prompt": "hello",
                    "instance_url": "https://crm.example.test",
                    "instance_api_key": "k",
                }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().is_some_and(|error| error.contains("no choices")));
        assert_eq!(state.cache.stats().await.entry_count, 0);
    }

    #[tokio::test]
    async fn tools_lists_full_catalog_with_schemas() {
        let (status, body) = send(app(state()), get("/tools")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_tools"], json!(14));
        let tools = body["tools"].as_array().expect("tools array");
        assert_eq!(tools[0]["name"], json!("get_contacts"));
        assert!(tools
            .iter()
            .any(|tool| tool["name"] == json!("save_contact")
                && tool["schema"]["type"] == json!("object")));
    }

    #[tokio::test]
    async fn mcp_listing_uses_jsonrpc_shape() {
        let (_, body) = send(app(state()), get("/mcp/tools/list")).await;

        assert_eq!(body["jsonrpc"], json!("2.0"));
        assert!(body["result"]["nextCursor"].is_null());
        assert!(body["result"]["tools"][0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn cache_clear_empties_stats() {
        let state = state();
        send(
            app(state.clone()),
            post_json(
                "/query",
                json!({
                    "prompt": "hello",
                    "instance_url": "https://crm.example.test",
                    "instance_api_key": "k",
                }),
            ),
        )
        .await;

        let (_, stats) = send(app(state.clone()), get("/cache/stats")).await;
        assert_eq!(stats["entry_count"], json!(1));
        assert_eq!(stats["backend_kind"], json!("memory"));

        let (_, cleared) = send(
            app(state.clone()),
            Request::builder()
                .method("POST")
                .uri("/cache/clear")
                .body(Body::empty())
                .expect("request should build"),
        )
        .await;
        assert_eq!(cleared, json!({"success": true, "cleared": 1}));

        let (_, stats) = send(app(state), get("/cache/stats")).await;
        assert_eq!(stats["entry_count"], json!(0));
    }

    #[tokio::test]
    async fn banner_and_docs_respond() {
        let (status, banner) = send(app(state()), get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(banner["service"], json!("crmpilot"));

        let (_, docs) = send(app(state()), get("/docs")).await;
        assert!(docs["endpoints"]["POST /query"].is_string());
    }
}
