//! MCP JSON-RPC 2.0 endpoint for external assistants.
//!
//! - `POST    /mcp`         `initialize`, `tools/list`, `tools/call`
//! - `OPTIONS /mcp`         preflight
//! - `GET     /mcp/health`  protocol and configuration summary
//!
//! When `mcp.api_key` is configured every `POST /mcp` must carry it as a bearer
//! token. `tools/call` dispatches straight to the registry against the default CRM
//! instance from `mcp.instance_url` / `mcp.instance_api_key`; no model is involved.

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use crmpilot_agent::crm::CrmSession;
use crmpilot_agent::tools::{ToolInvocation, ToolRegistry, ToolResult};
use crmpilot_core::config::McpConfig;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::bootstrap::AppState;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/mcp", post(handle).options(preflight))
        .route("/mcp/health", get(mcp_health))
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    fn result(id: Value, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(RpcError { code, message: message.into() }) }
    }
}

pub fn tool_definitions(registry: &ToolRegistry<CrmSession>) -> Vec<Value> {
    registry
        .list()
        .into_iter()
        .map(|descriptor| {
            json!({
                "name": descriptor.name,
                "description": descriptor.description,
                "inputSchema": descriptor.input_schema(),
            })
        })
        .collect()
}

async fn preflight() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn mcp_health(State(state): State<AppState>) -> Json<Value> {
    let mcp = &state.config.mcp;
    Json(json!({
        "status": "healthy",
        "protocol": "MCP",
        "version": PROTOCOL_VERSION,
        "authenticated": mcp.api_key.is_some(),
        "crm_configured": mcp.instance_url.is_some() && mcp.instance_api_key.is_some(),
    }))
}

fn authorize(config: &McpConfig, headers: &HeaderMap) -> Result<(), &'static str> {
    let Some(expected) = config.api_key.as_ref() else {
        return Ok(());
    };

    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or("Authorization header required")?;

    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .unwrap_or(header);

    if token == expected.expose_secret() {
        Ok(())
    } else {
        Err("Invalid API key")
    }
}

async fn handle(State(state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    if let Err(reason) = authorize(&state.config.mcp, &headers) {
        warn!(event_name = "server.mcp.unauthorized", reason, "MCP request rejected");
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": reason}))).into_response();
    }

    Json(dispatch(&state, &body).await).into_response()
}

async fn dispatch(state: &AppState, body: &str) -> RpcResponse {
    let request: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(error) => {
            return RpcResponse::error(Value::Null, PARSE_ERROR, format!("Parse error: {error}"))
        }
    };

    let raw_id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return RpcResponse::error(raw_id, INVALID_REQUEST, "Invalid Request: method is required");
    };
    let id = if raw_id.is_null() { json!(1) } else { raw_id };
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

    info!(event_name = "server.mcp.request", method, "MCP request received");

    match method {
        "initialize" => RpcResponse::result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {"name": "crmpilot", "version": env!("CARGO_PKG_VERSION")},
                "capabilities": {"tools": {}},
            }),
        ),
        "tools/list" => {
            RpcResponse::result(id, json!({"tools": tool_definitions(&state.registry)}))
        }
        "tools/call" => {
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return RpcResponse::error(id, INVALID_PARAMS, "Missing 'name' parameter");
            };
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            RpcResponse::result(id, call_tool(state, name, arguments).await)
        }
        other => RpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {other}")),
    }
}

async fn call_tool(state: &AppState, name: &str, arguments: Value) -> Value {
    let mcp = &state.config.mcp;
    let (Some(url), Some(key)) = (mcp.instance_url.as_ref(), mcp.instance_api_key.as_ref()) else {
        return tool_content(
            format!(
                "Error executing tool '{name}': mcp.instance_url and mcp.instance_api_key must be configured"
            ),
            true,
        );
    };

    let session = CrmSession::new(state.crm.clone(), url.clone(), key.clone());
    let result = state.registry.invoke(&ToolInvocation::new(name, arguments), &session).await;

    match result {
        ToolResult::Success(value) => {
            let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
            tool_content(text, false)
        }
        ToolResult::Failure { message, .. } => {
            tool_content(format!("Error executing tool '{name}': {message}"), true)
        }
    }
}

fn tool_content(text: String, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": text}],
        "isError": is_error,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        extract::Request as AxumRequest,
        http::{Request, StatusCode},
        routing::any,
        Router,
    };
    use crmpilot_core::config::AppConfig;
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::api::app;
    use crate::bootstrap::{build_state, tests::EchoOrchestrator, AppState};

    fn state_with(configure: impl FnOnce(&mut AppConfig)) -> AppState {
        let mut config = AppConfig::default();
        configure(&mut config);
        build_state(config, Arc::new(EchoOrchestrator)).expect("state should build")
    }

    async fn rpc(state: AppState, body: &str, token: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method("POST").uri("/mcp");
        if let Some(token) = token {
            builder = builder.header("authorization", token);
        }
        let response = app(state)
            .oneshot(builder.body(Body::from(body.to_string())).expect("request"))
            .await
            .expect("router should respond");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&bytes).expect("json"))
    }

    #[tokio::test]
    async fn initialize_reports_protocol_and_defaults_id() {
        let (status, body) =
            rpc(state_with(|_| {}), r#"{"jsonrpc":"2.0","method":"initialize"}"#, None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], json!(1));
        assert_eq!(body["result"]["protocolVersion"], json!("2024-11-05"));
        assert!(body["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn tools_list_echoes_request_id() {
        let (_, body) = rpc(
            state_with(|_| {}),
            r#"{"jsonrpc":"2.0","id":"abc","method":"tools/list"}"#,
            None,
        )
        .await;

        assert_eq!(body["id"], json!("abc"));
        assert_eq!(body["result"]["tools"].as_array().map(Vec::len), Some(14));
    }

    #[tokio::test]
    async fn protocol_errors_use_jsonrpc_codes() {
        let state = state_with(|_| {});

        let (_, parse) = rpc(state.clone(), "{not json", None).await;
        assert_eq!(parse["error"]["code"], json!(-32700));
        assert!(parse["error"]["message"].as_str().is_some_and(|m| m.starts_with("Parse error")));

        let (_, invalid) = rpc(state.clone(), r#"{"id":4}"#, None).await;
        assert_eq!(invalid["error"]["code"], json!(-32600));
        assert_eq!(invalid["id"], json!(4));

        let (_, unknown) = rpc(state.clone(), r#"{"id":5,"method":"resources/list"}"#, None).await;
        assert_eq!(unknown["error"]["code"], json!(-32601));
        assert_eq!(unknown["error"]["message"], json!("Method not found: resources/list"));

        let (_, missing) = rpc(state, r#"{"id":6,"method":"tools/call","params":{}}"#, None).await;
        assert_eq!(missing["error"]["code"], json!(-32602));
    }

    #[tokio::test]
    async fn bearer_token_is_enforced_when_configured() {
        let state = state_with(|config| {
            config.mcp.api_key = Some(SecretString::from("sesame".to_string()));
        });
        let body = r#"{"id":1,"method":"tools/list"}"#;

        let (status, error) = rpc(state.clone(), body, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error["error"], json!("Authorization header required"));

        let (status, error) = rpc(state.clone(), body, Some("Bearer wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error["error"], json!("Invalid API key"));

        let (status, _) = rpc(state.clone(), body, Some("bearer sesame")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = rpc(state, body, Some("sesame")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn tools_call_without_default_instance_is_tool_error() {
        let (_, body) = rpc(
            state_with(|_| {}),
            r#"{"id":2,"method":"tools/call","params":{"name":"get_contacts"}}"#,
            None,
        )
        .await;

        assert_eq!(body["result"]["isError"], json!(true));
        let text = body["result"]["content"][0]["text"].as_str().expect("text");
        assert!(text.starts_with("Error executing tool 'get_contacts'"));
    }

    #[tokio::test]
    async fn tools_call_dispatches_to_default_instance() {
        async fn fake_crm(request: AxumRequest) -> axum::Json<Value> {
            axum::Json(json!({"content": [{"path": request.uri().path(), "name": "Ada"}]}))
        }
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, Router::new().route("/{*rest}", any(fake_crm))).await;
        });

        let state = state_with(|config| {
            config.mcp.instance_url = Some(format!("http://{address}"));
            config.mcp.instance_api_key = Some(SecretString::from("crm-key".to_string()));
        });

        let (_, found) = rpc(
            state.clone(),
            r#"{"id":3,"method":"tools/call","params":{"name":"search_contacts","arguments":{"query":"ada"}}}"#,
            None,
        )
        .await;
        assert_eq!(found["result"]["isError"], json!(false));
        let text = found["result"]["content"][0]["text"].as_str().expect("text");
        let records: Value = serde_json::from_str(text).expect("pretty json");
        assert_eq!(records[0]["name"], json!("Ada"));

        let (_, unknown) = rpc(
            state,
            r#"{"id":4,"method":"tools/call","params":{"name":"drop_tables"}}"#,
            None,
        )
        .await;
        assert_eq!(unknown["result"]["isError"], json!(true));
    }

    #[tokio::test]
    async fn preflight_and_health_respond() {
        let state = state_with(|_| {});
        let response = app(state.clone())
            .oneshot(Request::builder().method("OPTIONS").uri("/mcp").body(Body::empty()).expect("request"))
            .await
            .expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(state)
            .oneshot(Request::builder().uri("/mcp/health").body(Body::empty()).expect("request"))
            .await
            .expect("router should respond");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["authenticated"], json!(false));
        assert_eq!(body["crm_configured"], json!(false));
    }
}
