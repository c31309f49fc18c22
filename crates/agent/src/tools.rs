//! Tool descriptors, argument validation, and the name-keyed dispatcher.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAccess {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Uuid,
}

impl ParamKind {
    fn json_type(self) -> &'static str {
        match self {
            Self::String | Self::Uuid => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Uuid => {
                value.as_str().map(|raw| uuid::Uuid::parse_str(raw).is_ok()).unwrap_or(false)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self { name: name.to_string(), kind, description: description.to_string(), required: true }
    }

    pub fn optional(name: &str, kind: ParamKind, description: &str) -> Self {
        Self { required: false, ..Self::required(name, kind, description) }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub access: ToolAccess,
}

impl ToolDescriptor {
    pub fn read(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params: Vec::new(),
            access: ToolAccess::Read,
        }
    }

    pub fn write(name: &str, description: &str) -> Self {
        Self { access: ToolAccess::Write, ..Self::read(name, description) }
    }

    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// JSON Schema object describing the tool's arguments.
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.params {
            let mut property = json!({
                "type": param.kind.json_type(),
                "description": param.description,
            });
            if param.kind == ParamKind::Uuid {
                property["format"] = json!("uuid");
            }
            properties.insert(param.name.clone(), property);
        }

        let required: Vec<&str> =
            self.params.iter().filter(|param| param.required).map(|param| param.name.as_str()).collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Checks `arguments` against the parameter list. Unknown keys are tolerated.
    pub fn validate(&self, arguments: &Value) -> Result<(), String> {
        let object = match arguments {
            Value::Object(object) => object,
            Value::Null if self.params.iter().all(|param| !param.required) => return Ok(()),
            other => return Err(format!("arguments must be a JSON object, got {}", kind_of(other))),
        };

        for param in &self.params {
            match object.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(format!("missing required parameter `{}`", param.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !param.kind.accepts(value) => {
                    let expected = match param.kind {
                        ParamKind::Uuid => "uuid string",
                        kind => kind.json_type(),
                    };
                    return Err(format!(
                        "parameter `{}` must be a {expected}, got {}",
                        param.name,
                        kind_of(value)
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self { name: name.into(), arguments }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownTool,
    InvalidArguments,
    UpstreamError,
    BudgetExhausted,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTool => "unknown_tool",
            Self::InvalidArguments => "invalid_arguments",
            Self::UpstreamError => "upstream_error",
            Self::BudgetExhausted => "budget_exhausted",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ToolResult {
    Success(Value),
    Failure { kind: FailureKind, message: String },
}

impl ToolResult {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure { kind, message: message.into() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success(_) => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Shape handed back to the language model as the tool message content.
    pub fn to_model_json(&self) -> Value {
        match self {
            Self::Success(payload) => json!({ "success": true, "result": payload }),
            Self::Failure { kind, message } => json!({
                "success": false,
                "error_kind": kind.as_str(),
                "error": message,
            }),
        }
    }
}

/// Failure raised by a handler. Defaults to an upstream failure; handlers that
/// find a semantic problem in their arguments use [`ToolError::invalid_arguments`].
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
    pub status: Option<u16>,
    pub kind: FailureKind,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), status: None, kind: FailureKind::UpstreamError }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self { status: Some(status), ..Self::new(message) }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::InvalidArguments, ..Self::new(message) }
    }
}

#[async_trait]
pub trait ToolHandler<Ctx>: Send + Sync {
    async fn call(&self, arguments: Value, ctx: &Ctx) -> Result<Value, ToolError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),
}

struct RegisteredTool<Ctx> {
    descriptor: ToolDescriptor,
    handler: Arc<dyn ToolHandler<Ctx>>,
}

/// Tools in registration order, looked up by name.
pub struct ToolRegistry<Ctx> {
    tools: Vec<RegisteredTool<Ctx>>,
    index: HashMap<String, usize>,
}

impl<Ctx> Default for ToolRegistry<Ctx> {
    fn default() -> Self {
        Self { tools: Vec::new(), index: HashMap::new() }
    }
}

impl<Ctx> fmt::Debug for ToolRegistry<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.iter().map(|tool| &tool.descriptor.name).collect::<Vec<_>>())
            .finish()
    }
}

impl<Ctx> ToolRegistry<Ctx>
where
    Ctx: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        descriptor: ToolDescriptor,
        handler: impl ToolHandler<Ctx> + 'static,
    ) -> Result<&mut Self, RegistryError> {
        if self.index.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateTool(descriptor.name));
        }

        self.index.insert(descriptor.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool { descriptor, handler: Arc::new(handler) });
        Ok(self)
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|tool| tool.descriptor.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|position| &self.tools[*position].descriptor)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validates and runs one invocation. Never panics and never returns an error:
    /// every outcome is a [`ToolResult`].
    pub async fn invoke(&self, invocation: &ToolInvocation, ctx: &Ctx) -> ToolResult {
        let Some(tool) = self.index.get(&invocation.name).map(|position| &self.tools[*position])
        else {
            warn!(event_name = "tool.invoke.unknown", tool = %invocation.name, "unknown tool requested");
            return ToolResult::failure(
                FailureKind::UnknownTool,
                format!("unknown tool `{}`", invocation.name),
            );
        };

        if let Err(message) = tool.descriptor.validate(&invocation.arguments) {
            warn!(
                event_name = "tool.invoke.invalid_arguments",
                tool = %invocation.name,
                reason = %message,
                "tool arguments rejected"
            );
            return ToolResult::failure(FailureKind::InvalidArguments, message);
        }

        let outcome = match tool.descriptor.access {
            ToolAccess::Read => tool.handler.call(invocation.arguments.clone(), ctx).await,
            ToolAccess::Write => {
                // Detached so an abandoned request cannot cancel a CRM write mid-flight.
                let handler = Arc::clone(&tool.handler);
                let arguments = invocation.arguments.clone();
                let ctx = ctx.clone();
                match tokio::spawn(async move { handler.call(arguments, &ctx).await }).await {
                    Ok(outcome) => outcome,
                    Err(join_error) => Err(ToolError::new(format!("tool task failed: {join_error}"))),
                }
            }
        };

        match outcome {
            Ok(payload) => {
                info!(event_name = "tool.invoke.success", tool = %invocation.name, "tool call succeeded");
                ToolResult::Success(payload)
            }
            Err(error) => {
                warn!(
                    event_name = "tool.invoke.failed",
                    tool = %invocation.name,
                    failure_kind = error.kind.as_str(),
                    status = error.status,
                    error = %error,
                    "tool call failed"
                );
                ToolResult::failure(error.kind, error.message)
            }
        }
    }
}

/// The view of a tool set an orchestrator drives: listing plus invocation with the
/// request context already bound.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    fn list(&self) -> Vec<ToolDescriptor>;
    async fn invoke(&self, invocation: ToolInvocation) -> ToolResult;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::{
        FailureKind, ParamKind, ParamSpec, RegistryError, ToolDescriptor, ToolError, ToolHandler,
        ToolInvocation, ToolRegistry, ToolResult,
    };

    #[derive(Clone, Default)]
    struct Counter(Arc<AtomicUsize>);

    struct Echo;

    #[async_trait]
    impl ToolHandler<Counter> for Echo {
        async fn call(&self, arguments: Value, ctx: &Counter) -> Result<Value, ToolError> {
            ctx.0.fetch_add(1, Ordering::SeqCst);
            Ok(arguments)
        }
    }

    struct Broken;

    #[async_trait]
    impl ToolHandler<Counter> for Broken {
        async fn call(&self, _arguments: Value, ctx: &Counter) -> Result<Value, ToolError> {
            ctx.0.fetch_add(1, Ordering::SeqCst);
            Err(ToolError::with_status(502, "CRM request failed with status 502: bad gateway"))
        }
    }

    struct SlowWrite;

    #[async_trait]
    impl ToolHandler<Counter> for SlowWrite {
        async fn call(&self, _arguments: Value, ctx: &Counter) -> Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.0.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"saved": true}))
        }
    }

    fn registry() -> Result<ToolRegistry<Counter>, RegistryError> {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDescriptor::read("get_contact_by_uuid", "Fetch one contact").with_param(
                    ParamSpec::required("contact_uuid", ParamKind::Uuid, "UUID of the contact"),
                ),
                Echo,
            )?
            .register(
                ToolDescriptor::read("search_contacts", "Search contacts")
                    .with_param(ParamSpec::required("query", ParamKind::String, "Search text"))
                    .with_param(ParamSpec::optional("limit", ParamKind::Integer, "Max rows")),
                Echo,
            )?
            .register(ToolDescriptor::read("get_companies", "List companies"), Broken)?;
        Ok(registry)
    }

    #[test]
    fn duplicate_names_are_rejected() -> Result<(), RegistryError> {
        let mut registry = registry()?;
        let result = registry.register(ToolDescriptor::read("get_companies", "again"), Echo);

        assert_eq!(result.err(), Some(RegistryError::DuplicateTool("get_companies".to_string())));
        assert_eq!(registry.len(), 3);
        Ok(())
    }

    #[test]
    fn list_preserves_registration_order() -> Result<(), RegistryError> {
        let names: Vec<String> = registry()?.list().into_iter().map(|tool| tool.name).collect();

        assert_eq!(names, vec!["get_contact_by_uuid", "search_contacts", "get_companies"]);
        Ok(())
    }

    #[test]
    fn input_schema_lists_properties_and_required() -> Result<(), RegistryError> {
        let registry = registry()?;
        let schema = registry.get("search_contacts").map(ToolDescriptor::input_schema);

        assert_eq!(
            schema,
            Some(json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search text"},
                    "limit": {"type": "integer", "description": "Max rows"},
                },
                "required": ["query"],
            }))
        );
        Ok(())
    }

    #[tokio::test]
    async fn unknown_tool_never_reaches_a_handler() -> Result<(), RegistryError> {
        let registry = registry()?;
        let ctx = Counter::default();

        let result = registry.invoke(&ToolInvocation::new("delete_everything", json!({})), &ctx).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::UnknownTool));
        assert_eq!(ctx.0.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_the_handler() -> Result<(), RegistryError> {
        let registry = registry()?;
        let ctx = Counter::default();

        let cases = [
            ToolInvocation::new("get_contact_by_uuid", json!({})),
            ToolInvocation::new("get_contact_by_uuid", json!({"contact_uuid": null})),
            ToolInvocation::new("get_contact_by_uuid", json!({"contact_uuid": "not-a-uuid"})),
            ToolInvocation::new("search_contacts", json!({"query": 42})),
            ToolInvocation::new("search_contacts", json!({"query": "x", "limit": "ten"})),
            ToolInvocation::new("search_contacts", Value::String("{broken json".into())),
        ];

        for invocation in &cases {
            let result = registry.invoke(invocation, &ctx).await;
            assert_eq!(result.failure_kind(), Some(FailureKind::InvalidArguments), "{invocation:?}");
        }
        assert_eq!(ctx.0.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn valid_call_returns_handler_payload() -> Result<(), RegistryError> {
        let registry = registry()?;
        let ctx = Counter::default();
        let arguments = json!({"contact_uuid": "0b5c3a1e-8d6f-4b8e-9a51-6f1f2d3c4b5a"});

        let result =
            registry.invoke(&ToolInvocation::new("get_contact_by_uuid", arguments.clone()), &ctx).await;

        assert_eq!(result, ToolResult::Success(arguments));
        assert_eq!(ctx.0.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn tools_without_params_accept_missing_arguments() -> Result<(), RegistryError> {
        let registry = registry()?;
        let ctx = Counter::default();

        let result = registry.invoke(&ToolInvocation::new("get_companies", Value::Null), &ctx).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::UpstreamError));
        assert_eq!(ctx.0.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn handler_failure_becomes_upstream_error_with_detail() -> Result<(), RegistryError> {
        let registry = registry()?;
        let result =
            registry.invoke(&ToolInvocation::new("get_companies", json!({})), &Counter::default()).await;

        match result {
            ToolResult::Failure { kind, message } => {
                assert_eq!(kind, FailureKind::UpstreamError);
                assert!(message.contains("502"));
            }
            ToolResult::Success(_) => panic!("expected failure"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn write_tool_finishes_after_caller_abandons() -> Result<(), RegistryError> {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDescriptor::write("save_contact", "Save a contact")
                .with_param(ParamSpec::required("contact_data", ParamKind::Object, "Contact")),
            SlowWrite,
        )?;
        let registry = Arc::new(registry);
        let ctx = Counter::default();

        let caller = {
            let registry = Arc::clone(&registry);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                registry
                    .invoke(&ToolInvocation::new("save_contact", json!({"contact_data": {}})), &ctx)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.0.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn model_json_distinguishes_outcomes() {
        let success = ToolResult::Success(json!([1, 2])).to_model_json();
        let failure = ToolResult::failure(FailureKind::BudgetExhausted, "limit reached").to_model_json();

        assert_eq!(success, json!({"success": true, "result": [1, 2]}));
        assert_eq!(failure["error_kind"], "budget_exhausted");
        assert_eq!(failure["success"], false);
    }
}
