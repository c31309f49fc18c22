//! Agent side of crmpilot: turns a prompt into CRM calls and an answer.
//!
//! # Architecture
//!
//! 1. **Tools** (`tools`) - descriptors, argument validation, name-keyed dispatch
//! 2. **CRM catalog** (`crm`) - REST client and one handler per CRM operation
//! 3. **Orchestration** (`llm`) - the model-driven tool loop
//! 4. **Budget** (`runtime`) - per-request cap on tool calls
//! 5. **Pipeline** (`pipeline`) - cache lookup, orchestration, cache write, streaming relay
//!
//! The model never talks to the CRM directly. Every call goes through the registry,
//! which validates arguments before a handler runs.

pub mod crm;
pub mod llm;
pub mod pipeline;
pub mod runtime;
pub mod tools;

pub use crm::{crm_registry, register_crm_tools, CrmClient, CrmSession};
pub use llm::{ChatCompletionsOrchestrator, Orchestrator, OrchestratorError};
pub use pipeline::{PipelineError, QueryOutcome, QueryPipeline, QueryRequest};
pub use tools::{
    FailureKind, ToolAccess, ToolDescriptor, ToolInvocation, ToolInvoker, ToolRegistry, ToolResult,
};
