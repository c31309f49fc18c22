//! Cache-first query coordinator.
//!
//! ```text
//! Start -> CacheLookup -> CacheHit -> Respond
//!                      \-> CacheMiss -> Invoking -> CacheWrite -> Respond
//! any stage -> Failed
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crmpilot_core::cache::{credential_fingerprint, CacheKey, CacheStore};
use crmpilot_core::config::PipelineConfig;
use crmpilot_core::errors::ApplicationError;
use crmpilot_core::stream::{SessionBroker, StreamEvent};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::crm::{CrmClient, CrmSession};
use crate::llm::{Orchestrator, OrchestratorError};
use crate::runtime::BoundTools;
use crate::tools::ToolRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStage {
    Start,
    CacheLookup,
    CacheHit,
    CacheMiss,
    Invoking,
    CacheWrite,
    Respond,
    Failed,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::CacheLookup => "cache_lookup",
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::Invoking => "invoking",
            Self::CacheWrite => "cache_write",
            Self::Respond => "respond",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone)]
pub struct QueryRequest {
    pub prompt: String,
    pub instance_url: String,
    pub api_key: SecretString,
    pub correlation_id: String,
}

impl std::fmt::Debug for QueryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRequest")
            .field("prompt", &self.prompt)
            .field("instance_url", &self.instance_url)
            .field("credential", &credential_fingerprint(self.api_key.expose_secret()))
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

impl QueryRequest {
    pub fn new(
        prompt: impl Into<String>,
        instance_url: impl Into<String>,
        api_key: SecretString,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            instance_url: instance_url.into(),
            api_key,
            correlation_id: correlation_id.into(),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.prompt.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("prompt is required".to_string()));
        }
        if self.instance_url.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("instance_url is required".to_string()));
        }
        if !self.instance_url.starts_with("http://") && !self.instance_url.starts_with("https://") {
            return Err(PipelineError::InvalidRequest(
                "instance_url must start with http:// or https://".to_string(),
            ));
        }
        if self.api_key.expose_secret().trim().is_empty() {
            return Err(PipelineError::InvalidRequest("instance_api_key is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueryOutcome {
    pub answer: String,
    pub cached: bool,
    pub cached_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

impl PipelineError {
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }
}

impl From<PipelineError> for ApplicationError {
    fn from(value: PipelineError) -> Self {
        match value {
            PipelineError::InvalidRequest(message) => Self::Validation(message),
            PipelineError::Orchestrator(
                error @ (OrchestratorError::Transport(_) | OrchestratorError::Provider { .. }),
            ) => Self::Upstream(error.to_string()),
            PipelineError::Orchestrator(error) => Self::Orchestration(error.to_string()),
            PipelineError::Timeout(limit) => {
                Self::Orchestration(format!("query timed out after {limit:?}"))
            }
        }
    }
}

pub struct QueryPipeline {
    cache: Arc<CacheStore>,
    registry: Arc<ToolRegistry<CrmSession>>,
    orchestrator: Arc<dyn Orchestrator>,
    crm: CrmClient,
    max_tool_calls: u32,
    timeout: Duration,
}

impl QueryPipeline {
    pub fn new(
        cache: Arc<CacheStore>,
        registry: Arc<ToolRegistry<CrmSession>>,
        orchestrator: Arc<dyn Orchestrator>,
        crm: CrmClient,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            cache,
            registry,
            orchestrator,
            crm,
            max_tool_calls: config.max_tool_calls,
            timeout: config.timeout(),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub async fn run(&self, request: &QueryRequest) -> Result<QueryOutcome, PipelineError> {
        let correlation_id = request.correlation_id.as_str();
        stage(correlation_id, PipelineStage::Start);

        if let Err(error) = request.validate() {
            return Err(failed(correlation_id, error));
        }

        let key = CacheKey::derive(&request.prompt, &request.instance_url, request.api_key.expose_secret());
        stage(correlation_id, PipelineStage::CacheLookup);

        if let Some(entry) = self.cache.get(&key).await {
            info!(
                event_name = "pipeline.cache.hit",
                correlation_id,
                cache_key = %key,
                stage = PipelineStage::CacheHit.as_str(),
                "answer served from cache"
            );
            stage(correlation_id, PipelineStage::Respond);
            return Ok(QueryOutcome {
                answer: entry.payload,
                cached: true,
                cached_at: Some(entry.created_at),
            });
        }

        info!(
            event_name = "pipeline.cache.miss",
            correlation_id,
            cache_key = %key,
            credential = %credential_fingerprint(request.api_key.expose_secret()),
            stage = PipelineStage::CacheMiss.as_str(),
            "no cached answer"
        );

        let session =
            CrmSession::new(self.crm.clone(), request.instance_url.clone(), request.api_key.clone());
        let tools = BoundTools::new(&self.registry, &session, self.max_tool_calls);

        stage(correlation_id, PipelineStage::Invoking);
        let outcome = timeout(self.timeout, self.orchestrator.run(&request.prompt, &tools)).await;

        if tools.exhausted() {
            let error = OrchestratorError::BudgetExhausted { limit: self.max_tool_calls };
            return Err(failed(correlation_id, error.into()));
        }

        let answer = match outcome {
            Err(_) => return Err(failed(correlation_id, PipelineError::Timeout(self.timeout))),
            Ok(Err(error)) => return Err(failed(correlation_id, error.into())),
            Ok(Ok(answer)) => answer,
        };

        if tools.upstream_failures() == 0 {
            stage(correlation_id, PipelineStage::CacheWrite);
            self.cache.put(&key, &answer, self.cache.ttl()).await;
        } else {
            info!(
                event_name = "pipeline.cache.skip",
                correlation_id,
                upstream_failures = tools.upstream_failures(),
                "answer not cached; a CRM call failed during this run"
            );
        }

        stage(correlation_id, PipelineStage::Respond);
        Ok(QueryOutcome { answer, cached: false, cached_at: None })
    }

    /// Runs the query and relays the answer, or an error event, to the session.
    /// The session is always closed afterwards.
    pub async fn run_streaming(
        &self,
        session_id: &str,
        request: &QueryRequest,
        broker: &SessionBroker,
    ) -> Result<QueryOutcome, PipelineError> {
        let result = self.run(request).await;
        let delivered = match &result {
            Ok(outcome) => broker.publish(session_id, StreamEvent::Payload(outcome.answer.clone())),
            Err(error) => broker.publish(session_id, StreamEvent::Error(error.to_string())),
        };
        broker.close(session_id);

        info!(
            event_name = "pipeline.stream.delivered",
            correlation_id = %request.correlation_id,
            session_id,
            delivered,
            success = result.is_ok(),
            "streamed query finished"
        );
        result
    }
}

fn stage(correlation_id: &str, stage: PipelineStage) {
    tracing::debug!(event_name = "pipeline.stage", correlation_id, stage = stage.as_str());
}

fn failed(correlation_id: &str, error: PipelineError) -> PipelineError {
    warn!(
        event_name = "pipeline.failed",
        correlation_id,
        stage = PipelineStage::Failed.as_str(),
        error = %error,
        "query failed"
    );
    error
}
