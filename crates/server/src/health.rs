use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use crmpilot_core::cache::{BackendKind, CacheStore};
use serde::Serialize;

use crate::bootstrap::AppState;

#[derive(Clone)]
pub struct HealthState {
    cache: Arc<CacheStore>,
}

impl HealthState {
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self { cache }
    }
}

impl FromRef<AppState> for HealthState {
    fn from_ref(state: &AppState) -> Self {
        Self::new(Arc::clone(&state.cache))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub cache: HealthCheck,
    pub checked_at: String,
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let cache = cache_check(&state.cache).await;
    let ready = cache.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "crmpilot-server runtime initialized".to_string(),
        },
        cache,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn cache_check(cache: &CacheStore) -> HealthCheck {
    if !cache.enabled() {
        return HealthCheck { status: "ready", detail: "answer cache disabled".to_string() };
    }

    let backend = cache.backend_kind();
    match cache.check().await {
        Ok(()) => HealthCheck {
            status: "ready",
            detail: format!("{} cache backend reachable", backend.as_str()),
        },
        Err(error) if backend == BackendKind::Shared => HealthCheck {
            status: "degraded",
            detail: format!("shared cache unavailable, serving uncached: {error}"),
        },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("cache check failed: {error}") }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{extract::State, http::StatusCode, Json};
    use crmpilot_core::cache::{CacheStore, MemoryBackend, SharedBackend};

    use crate::health::{health, HealthState};

    #[tokio::test]
    async fn health_returns_ready_with_memory_cache() {
        let cache = CacheStore::new(Arc::new(MemoryBackend::new()), true, Duration::from_secs(60));

        let (status, Json(payload)) = health(State(HealthState::new(Arc::new(cache)))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.cache.status, "ready");
        assert_eq!(payload.service.status, "ready");
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_shared_cache_is_down() {
        let backend = SharedBackend::new(
            "redis://127.0.0.1:1",
            "crmpilot:test:".to_string(),
            Duration::from_millis(200),
        )
        .expect("url should parse");
        let cache = CacheStore::new(Arc::new(backend), true, Duration::from_secs(60));

        let (status, Json(payload)) = health(State(HealthState::new(Arc::new(cache)))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.cache.status, "degraded");
        assert_eq!(payload.service.status, "ready");
    }

    #[tokio::test]
    async fn disabled_cache_does_not_affect_readiness() {
        let backend = SharedBackend::new(
            "redis://127.0.0.1:1",
            "crmpilot:test:".to_string(),
            Duration::from_millis(200),
        )
        .expect("url should parse");
        let cache = CacheStore::new(Arc::new(backend), false, Duration::from_secs(60));

        let (status, Json(payload)) = health(State(HealthState::new(Arc::new(cache)))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.cache.detail, "answer cache disabled");
    }
}
