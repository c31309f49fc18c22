use std::sync::Arc;
use std::time::{Duration, Instant};

use crmpilot_agent::crm::{crm_registry, CrmClient, CrmSession};
use crmpilot_agent::llm::{ChatCompletionsOrchestrator, Orchestrator, OrchestratorError};
use crmpilot_agent::pipeline::QueryPipeline;
use crmpilot_agent::tools::{RegistryError, ToolRegistry};
use crmpilot_core::cache::{CacheError, CacheStore};
use crmpilot_core::config::{AppConfig, ConfigError, LoadOptions};
use crmpilot_core::stream::SessionBroker;
use thiserror::Error;
use tracing::info;

/// Process-wide state, built once and cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub cache: Arc<CacheStore>,
    pub registry: Arc<ToolRegistry<CrmSession>>,
    pub pipeline: Arc<QueryPipeline>,
    pub broker: SessionBroker,
    pub crm: CrmClient,
    pub started_at: Instant,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cache backend setup failed: {0}")]
    Cache(#[from] CacheError),
    #[error("tool registration failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("CRM client setup failed: {0}")]
    CrmClient(#[source] reqwest::Error),
    #[error("orchestrator setup failed: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<AppState, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<AppState, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let orchestrator = ChatCompletionsOrchestrator::from_config(&config.llm)?;
    info!(
        event_name = "system.bootstrap.orchestrator_ready",
        correlation_id = "bootstrap",
        provider = ?config.llm.provider,
        model = %config.llm.model,
        "language model orchestrator configured"
    );

    build_state(config, Arc::new(orchestrator))
}

/// Wires cache, registry, broker, and pipeline around a given orchestrator.
pub fn build_state(
    config: AppConfig,
    orchestrator: Arc<dyn Orchestrator>,
) -> Result<AppState, BootstrapError> {
    let cache = Arc::new(CacheStore::from_config(&config.cache)?);
    let registry = Arc::new(crm_registry()?);
    let crm = CrmClient::new(Duration::from_secs(config.crm.request_timeout_secs))
        .map_err(BootstrapError::CrmClient)?;
    let broker = SessionBroker::from_config(&config.stream);
    let pipeline = Arc::new(QueryPipeline::new(
        Arc::clone(&cache),
        Arc::clone(&registry),
        orchestrator,
        crm.clone(),
        &config.pipeline,
    ));

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        tool_count = registry.len(),
        cache_backend = cache.backend_kind().as_str(),
        cache_enabled = cache.enabled(),
        "application state assembled"
    );

    Ok(AppState {
        config: Arc::new(config),
        cache,
        registry,
        pipeline,
        broker,
        crm,
        started_at: Instant::now(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use crmpilot_agent::llm::{Orchestrator, OrchestratorError};
    use crmpilot_agent::tools::ToolInvoker;
    use crmpilot_core::cache::BackendKind;
    use crmpilot_core::config::AppConfig;

    use super::{build_state, AppState, BootstrapError};

    /// Echoes the prompt so handler tests can assert on it.
    pub(crate) struct EchoOrchestrator;

    #[async_trait]
    impl Orchestrator for EchoOrchestrator {
        async fn run(
            &self,
            prompt: &str,
            _tools: &dyn ToolInvoker,
        ) -> Result<String, OrchestratorError> {
            Ok(format!("echo: {prompt}\nsecond line"))
        }
    }

    pub(crate) fn test_state() -> Result<AppState, BootstrapError> {
        build_state(AppConfig::default(), Arc::new(EchoOrchestrator))
    }

    #[tokio::test]
    async fn default_config_assembles_full_catalog_with_memory_cache() -> Result<(), BootstrapError> {
        let state = test_state()?;

        assert_eq!(state.registry.len(), 14);
        assert_eq!(state.cache.backend_kind(), BackendKind::Memory);
        assert!(state.cache.enabled());
        Ok(())
    }

    #[tokio::test]
    async fn shared_backend_with_bad_url_fails_fast() {
        let mut config = AppConfig::default();
        config.cache.backend = BackendKind::Shared;
        config.cache.shared_url = Some("definitely not a url".to_string());

        let result = build_state(config, Arc::new(EchoOrchestrator));

        assert!(matches!(result, Err(BootstrapError::Cache(_))));
    }
}
