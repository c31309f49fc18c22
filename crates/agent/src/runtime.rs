use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tracing::warn;

use crate::tools::{
    FailureKind, ToolDescriptor, ToolInvocation, ToolInvoker, ToolRegistry, ToolResult,
};

/// A registry bound to one request's context, with a cap on how many calls the
/// orchestrator may make. Calls past the cap are refused without reaching the registry.
pub struct BoundTools<'a, Ctx> {
    registry: &'a ToolRegistry<Ctx>,
    ctx: &'a Ctx,
    budget: u32,
    attempted: AtomicU32,
    exhausted: AtomicBool,
    upstream_failures: AtomicU32,
}

impl<'a, Ctx> BoundTools<'a, Ctx>
where
    Ctx: Clone + Send + Sync + 'static,
{
    pub fn new(registry: &'a ToolRegistry<Ctx>, ctx: &'a Ctx, budget: u32) -> Self {
        Self {
            registry,
            ctx,
            budget,
            attempted: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
            upstream_failures: AtomicU32::new(0),
        }
    }

    pub fn calls_attempted(&self) -> u32 {
        self.attempted.load(Ordering::SeqCst)
    }

    pub fn exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn upstream_failures(&self) -> u32 {
        self.upstream_failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<'a, Ctx> ToolInvoker for BoundTools<'a, Ctx>
where
    Ctx: Clone + Send + Sync + 'static,
{
    fn list(&self) -> Vec<ToolDescriptor> {
        self.registry.list()
    }

    async fn invoke(&self, invocation: ToolInvocation) -> ToolResult {
        let attempt = self.attempted.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.budget {
            self.exhausted.store(true, Ordering::SeqCst);
            warn!(
                event_name = "tool.budget.exhausted",
                tool = %invocation.name,
                budget = self.budget,
                "tool call refused; per-request budget spent"
            );
            return ToolResult::failure(
                FailureKind::BudgetExhausted,
                format!("tool call budget of {} exhausted", self.budget),
            );
        }

        let result = self.registry.invoke(&invocation, self.ctx).await;
        if result.failure_kind() == Some(FailureKind::UpstreamError) {
            self.upstream_failures.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}
