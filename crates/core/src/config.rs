use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::BackendKind;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub crm: CrmConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub stream: StreamConfig,
    pub mcp: McpConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_rounds: u32,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub backend: BackendKind,
    pub shared_url: Option<String>,
    pub key_prefix: String,
    pub operation_timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub max_tool_calls: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub subscriber_capacity: usize,
    pub closed_retention_secs: u64,
}

/// Settings for the JSON-RPC tool endpoint. Calls arriving there carry no CRM
/// credentials of their own, so they run against this default instance.
#[derive(Clone, Debug, Default)]
pub struct McpConfig {
    pub api_key: Option<SecretString>,
    pub instance_url: Option<String>,
    pub instance_api_key: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub cache_enabled: Option<bool>,
    pub cache_ttl_secs: Option<u64>,
    pub cache_backend: Option<BackendKind>,
    pub cache_shared_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434/v1".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 60,
                max_rounds: 8,
            },
            crm: CrmConfig { request_timeout_secs: 30 },
            cache: CacheConfig {
                enabled: true,
                ttl_secs: 3600,
                backend: BackendKind::Memory,
                shared_url: None,
                key_prefix: "crmpilot:answer:".to_string(),
                operation_timeout_ms: 500,
            },
            pipeline: PipelineConfig { max_tool_calls: 8, timeout_secs: 120 },
            stream: StreamConfig { subscriber_capacity: 64, closed_retention_secs: 5 },
            mcp: McpConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl PipelineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("crmpilot.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_rounds) = llm.max_rounds {
                self.llm.max_rounds = max_rounds;
            }
        }

        if let Some(crm) = patch.crm {
            if let Some(request_timeout_secs) = crm.request_timeout_secs {
                self.crm.request_timeout_secs = request_timeout_secs;
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(enabled) = cache.enabled {
                self.cache.enabled = enabled;
            }
            if let Some(ttl_secs) = cache.ttl_secs {
                self.cache.ttl_secs = ttl_secs;
            }
            if let Some(backend) = cache.backend {
                self.cache.backend = backend;
            }
            if let Some(shared_url) = cache.shared_url {
                self.cache.shared_url = Some(shared_url);
            }
            if let Some(key_prefix) = cache.key_prefix {
                self.cache.key_prefix = key_prefix;
            }
            if let Some(operation_timeout_ms) = cache.operation_timeout_ms {
                self.cache.operation_timeout_ms = operation_timeout_ms;
            }
        }

        if let Some(pipeline) = patch.pipeline {
            if let Some(max_tool_calls) = pipeline.max_tool_calls {
                self.pipeline.max_tool_calls = max_tool_calls;
            }
            if let Some(timeout_secs) = pipeline.timeout_secs {
                self.pipeline.timeout_secs = timeout_secs;
            }
        }

        if let Some(stream) = patch.stream {
            if let Some(subscriber_capacity) = stream.subscriber_capacity {
                self.stream.subscriber_capacity = subscriber_capacity;
            }
            if let Some(closed_retention_secs) = stream.closed_retention_secs {
                self.stream.closed_retention_secs = closed_retention_secs;
            }
        }

        if let Some(mcp) = patch.mcp {
            if let Some(api_key) = mcp.api_key {
                self.mcp.api_key = Some(secret_value(api_key));
            }
            if let Some(instance_url) = mcp.instance_url {
                self.mcp.instance_url = Some(instance_url);
            }
            if let Some(instance_api_key) = mcp.instance_api_key {
                self.mcp.instance_api_key = Some(secret_value(instance_api_key));
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CRMPILOT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some((key, value)) = read_env_alias(&["CRMPILOT_SERVER_PORT", "PORT"]) {
            self.server.port = parse_u16(key, &value)?;
        }
        if let Some(value) = read_env("CRMPILOT_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("CRMPILOT_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("CRMPILOT_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("CRMPILOT_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CRMPILOT_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("CRMPILOT_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CRMPILOT_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("CRMPILOT_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CRMPILOT_LLM_MAX_ROUNDS") {
            self.llm.max_rounds = parse_u32("CRMPILOT_LLM_MAX_ROUNDS", &value)?;
        }

        if let Some(value) = read_env("CRMPILOT_CRM_REQUEST_TIMEOUT_SECS") {
            self.crm.request_timeout_secs =
                parse_u64("CRMPILOT_CRM_REQUEST_TIMEOUT_SECS", &value)?;
        }

        // Unprefixed names are the ones the first deployment used.
        if let Some((key, value)) = read_env_alias(&["CRMPILOT_CACHE_ENABLED", "ENABLE_CACHING"]) {
            self.cache.enabled = parse_bool(key, &value)?;
        }
        if let Some((key, value)) =
            read_env_alias(&["CRMPILOT_CACHE_TTL_SECS", "CACHE_TTL_SECONDS"])
        {
            self.cache.ttl_secs = parse_u64(key, &value)?;
        }
        let backend = read_env("CRMPILOT_CACHE_BACKEND");
        if let Some(value) = &backend {
            self.cache.backend = value.parse()?;
        }
        if let Some((key, value)) = read_env_alias(&["CRMPILOT_CACHE_SHARED_URL", "REDIS_URL"]) {
            self.cache.shared_url = Some(value);
            // A bare REDIS_URL selects the shared backend.
            if key == "REDIS_URL" && backend.is_none() {
                self.cache.backend = BackendKind::Shared;
            }
        }
        if let Some(value) = read_env("CRMPILOT_CACHE_KEY_PREFIX") {
            self.cache.key_prefix = value;
        }
        if let Some(value) = read_env("CRMPILOT_CACHE_OPERATION_TIMEOUT_MS") {
            self.cache.operation_timeout_ms =
                parse_u64("CRMPILOT_CACHE_OPERATION_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = read_env("CRMPILOT_PIPELINE_MAX_TOOL_CALLS") {
            self.pipeline.max_tool_calls = parse_u32("CRMPILOT_PIPELINE_MAX_TOOL_CALLS", &value)?;
        }
        if let Some(value) = read_env("CRMPILOT_PIPELINE_TIMEOUT_SECS") {
            self.pipeline.timeout_secs = parse_u64("CRMPILOT_PIPELINE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CRMPILOT_STREAM_SUBSCRIBER_CAPACITY") {
            self.stream.subscriber_capacity =
                parse_usize("CRMPILOT_STREAM_SUBSCRIBER_CAPACITY", &value)?;
        }
        if let Some(value) = read_env("CRMPILOT_STREAM_CLOSED_RETENTION_SECS") {
            self.stream.closed_retention_secs =
                parse_u64("CRMPILOT_STREAM_CLOSED_RETENTION_SECS", &value)?;
        }

        if let Some(value) = read_env("CRMPILOT_MCP_API_KEY") {
            self.mcp.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CRMPILOT_MCP_INSTANCE_URL") {
            self.mcp.instance_url = Some(value);
        }
        if let Some(value) = read_env("CRMPILOT_MCP_INSTANCE_API_KEY") {
            self.mcp.instance_api_key = Some(secret_value(value));
        }

        let log_level =
            read_env("CRMPILOT_LOGGING_LEVEL").or_else(|| read_env("CRMPILOT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CRMPILOT_LOGGING_FORMAT").or_else(|| read_env("CRMPILOT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = enabled;
        }
        if let Some(ttl_secs) = overrides.cache_ttl_secs {
            self.cache.ttl_secs = ttl_secs;
        }
        if let Some(backend) = overrides.cache_backend {
            self.cache.backend = backend;
        }
        if let Some(shared_url) = overrides.cache_shared_url {
            self.cache.shared_url = Some(shared_url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_server(&self.server)?;
        validate_llm(&self.llm)?;
        validate_crm(&self.crm)?;
        validate_cache(&self.cache)?;
        validate_pipeline(&self.pipeline)?;
        validate_stream(&self.stream)?;
        validate_mcp(&self.mcp)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("crmpilot.toml"), PathBuf::from("config/crmpilot.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.bind_address.trim().is_empty() {
        return Err(ConfigError::Validation("server.bind_address must not be empty".to_string()));
    }

    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.max_rounds == 0 {
        return Err(ConfigError::Validation(
            "llm.max_rounds must be greater than zero".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_crm(crm: &CrmConfig) -> Result<(), ConfigError> {
    if crm.request_timeout_secs == 0 || crm.request_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "crm.request_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    if cache.ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "cache.ttl_secs must be greater than zero".to_string(),
        ));
    }

    if cache.operation_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "cache.operation_timeout_ms must be greater than zero".to_string(),
        ));
    }

    if cache.backend == BackendKind::Shared {
        let url = cache.shared_url.as_deref().map(str::trim).unwrap_or_default();
        if url.is_empty() {
            return Err(ConfigError::Validation(
                "cache.shared_url is required when cache.backend is `shared` (set REDIS_URL or CRMPILOT_CACHE_SHARED_URL)"
                    .to_string(),
            ));
        }
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(ConfigError::Validation(
                "cache.shared_url must start with redis:// or rediss://".to_string(),
            ));
        }
        if cache.key_prefix.trim().is_empty() {
            return Err(ConfigError::Validation(
                "cache.key_prefix must not be empty for the shared backend".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_pipeline(pipeline: &PipelineConfig) -> Result<(), ConfigError> {
    if pipeline.max_tool_calls == 0 {
        return Err(ConfigError::Validation(
            "pipeline.max_tool_calls must be greater than zero".to_string(),
        ));
    }

    if pipeline.timeout_secs == 0 || pipeline.timeout_secs > 900 {
        return Err(ConfigError::Validation(
            "pipeline.timeout_secs must be in range 1..=900".to_string(),
        ));
    }

    Ok(())
}

fn validate_stream(stream: &StreamConfig) -> Result<(), ConfigError> {
    if stream.subscriber_capacity == 0 {
        return Err(ConfigError::Validation(
            "stream.subscriber_capacity must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_mcp(mcp: &McpConfig) -> Result<(), ConfigError> {
    if let Some(instance_url) = &mcp.instance_url {
        if !instance_url.starts_with("http://") && !instance_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "mcp.instance_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_env_alias<'a>(keys: &[&'a str]) -> Option<(&'a str, String)> {
    keys.iter().find_map(|key| read_env(key).map(|value| (*key, value)))
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid_override(key, value)),
    }
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    server: Option<ServerPatch>,
    llm: Option<LlmPatch>,
    crm: Option<CrmPatch>,
    cache: Option<CachePatch>,
    pipeline: Option<PipelinePatch>,
    stream: Option<StreamPatch>,
    mcp: Option<McpPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_rounds: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    enabled: Option<bool>,
    ttl_secs: Option<u64>,
    backend: Option<BackendKind>,
    shared_url: Option<String>,
    key_prefix: Option<String>,
    operation_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelinePatch {
    max_tool_calls: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamPatch {
    subscriber_capacity: Option<usize>,
    closed_retention_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct McpPatch {
    api_key: Option<String>,
    instance_url: Option<String>,
    instance_api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
