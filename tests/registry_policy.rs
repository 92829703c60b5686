// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Dispatch policy tests: retry, fallback, demotion, respawn, and shutdown
//! gating, driven by scripted in-process providers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use toolbus::types::HealthStatus;
use toolbus::{
    DispatchError, DispatchResult, ErrorKind, ExecutionContext, HealthSnapshot, ProviderState,
    RegistryConfig, ToolDescriptor, ToolProvider, ToolRegistry,
};

// ============================================================================
// Scripted Provider
// ============================================================================

/// What one call against the scripted provider should do.
#[derive(Clone)]
enum Outcome {
    Ok(serde_json::Value),
    TransportLost,
    Timeout,
    ExecutionError,
    ToolNotFound,
    /// Sleep, then answer. Used to hold a call in flight across shutdown.
    SlowOk(Duration, serde_json::Value),
}

/// In-process provider that plays back a scripted sequence of outcomes.
struct ScriptedProvider {
    id: String,
    tools: Vec<String>,
    script: Mutex<VecDeque<Outcome>>,
    state: RwLock<ProviderState>,
    calls: AtomicU32,
    inits: AtomicU32,
    init_delay: Duration,
}

impl ScriptedProvider {
    fn shared(id: &str, tools: &[&str], script: Vec<Outcome>) -> Arc<Self> {
        Self::shared_with_init_delay(id, tools, script, Duration::ZERO)
    }

    /// Variant whose `initialize` takes a while, to race it against
    /// shutdown and unregistration.
    fn shared_with_init_delay(
        id: &str,
        tools: &[&str],
        script: Vec<Outcome>,
        init_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            script: Mutex::new(script.into()),
            state: RwLock::new(ProviderState::Stopped),
            calls: AtomicU32::new(0),
            inits: AtomicU32::new(0),
            init_delay,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn initialize(&self) -> DispatchResult<Vec<ToolDescriptor>> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if self.init_delay > Duration::ZERO {
            tokio::time::sleep(self.init_delay).await;
        }
        *self.state.write().await = ProviderState::Ready;
        Ok(self
            .tools
            .iter()
            .map(|name| ToolDescriptor {
                name: name.clone(),
                description: None,
                input_schema: serde_json::json!({}),
                provider_id: self.id.clone(),
            })
            .collect())
    }

    async fn shutdown(&self) {
        *self.state.write().await = ProviderState::Stopped;
    }

    async fn state(&self) -> ProviderState {
        *self.state.read().await
    }

    async fn can_execute(&self, tool_name: &str) -> bool {
        self.tools.iter().any(|t| t == tool_name)
    }

    async fn available_tools(&self) -> Vec<ToolDescriptor> {
        Vec::new()
    }

    async fn execute_tool(
        &self,
        tool_name: &str,
        _parameters: serde_json::Value,
        _timeout: Duration,
    ) -> DispatchResult<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or(Outcome::Ok(serde_json::json!({"provider": self.id})));

        match outcome {
            Outcome::Ok(value) => Ok(value),
            Outcome::SlowOk(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Outcome::TransportLost => Err(DispatchError::transport_lost(&self.id, "pipe closed")),
            Outcome::Timeout => Err(DispatchError::Timeout { timeout_ms: 10 }),
            Outcome::ExecutionError => Err(DispatchError::execution(
                "DIVISION_BY_ZERO",
                "cell B2 divides by zero",
            )),
            Outcome::ToolNotFound => Err(DispatchError::ToolNotFound {
                provider: self.id.clone(),
                tool: tool_name.to_string(),
            }),
        }
    }

    async fn health(&self) -> HealthSnapshot {
        HealthSnapshot::responsive(&self.id, HealthStatus::Healthy, 1)
    }
}

fn fast_config() -> RegistryConfig {
    RegistryConfig {
        default_timeout_ms: 500,
        retry_count: 1,
        backoff_base_ms: 1,
        failure_threshold: 1,
        max_respawn_attempts: 0,
        respawn_backoff_ms: 1,
        health_interval_ms: 60_000,
        shutdown_timeout_ms: 1_000,
        ..RegistryConfig::default()
    }
}

async fn call(registry: &ToolRegistry, tool: &str) -> toolbus::ExecutionResult {
    registry
        .execute_tool(ExecutionContext::new(tool, serde_json::json!({})))
        .await
}

// ============================================================================
// Retry and Fallback
// ============================================================================

#[tokio::test]
async fn test_retry_then_success_on_same_provider() {
    let registry = ToolRegistry::new(fast_config());
    let provider = ScriptedProvider::shared(
        "rag",
        &["search"],
        vec![
            Outcome::TransportLost,
            Outcome::Ok(serde_json::json!({"hits": 3})),
        ],
    );
    registry
        .register_provider(Arc::clone(&provider) as Arc<dyn ToolProvider>, 0)
        .await
        .unwrap();

    let result = call(&registry, "search").await;

    assert!(result.is_success());
    assert_eq!(result.value().unwrap()["hits"], 3);
    assert_eq!(result.metadata().attempt_count, 2);
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn test_timeout_is_retried_like_transport_loss() {
    let registry = ToolRegistry::new(fast_config());
    let provider = ScriptedProvider::shared(
        "rag",
        &["search"],
        vec![Outcome::Timeout, Outcome::Ok(serde_json::json!({}))],
    );
    registry
        .register_provider(Arc::clone(&provider) as Arc<dyn ToolProvider>, 0)
        .await
        .unwrap();

    let result = call(&registry, "search").await;
    assert!(result.is_success());
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_fall_through_to_next_provider() {
    let registry = ToolRegistry::new(fast_config());
    let primary = ScriptedProvider::shared(
        "primary",
        &["search"],
        vec![Outcome::TransportLost, Outcome::TransportLost],
    );
    let backup = ScriptedProvider::shared("backup", &["search"], vec![]);
    registry
        .register_provider(Arc::clone(&primary) as Arc<dyn ToolProvider>, 0)
        .await
        .unwrap();
    registry
        .register_provider(Arc::clone(&backup) as Arc<dyn ToolProvider>, 5)
        .await
        .unwrap();

    let result = call(&registry, "search").await;

    assert!(result.is_success());
    assert_eq!(result.metadata().provider_id.as_deref(), Some("backup"));
    // Two attempts against primary (initial + one retry), one against backup.
    assert_eq!(result.metadata().attempt_count, 3);
    assert_eq!(primary.calls(), 2);
    assert_eq!(backup.calls(), 1);
}

#[tokio::test]
async fn test_execution_error_is_terminal() {
    let registry = ToolRegistry::new(fast_config());
    let primary = ScriptedProvider::shared("primary", &["calc"], vec![Outcome::ExecutionError]);
    let backup = ScriptedProvider::shared("backup", &["calc"], vec![]);
    registry
        .register_provider(Arc::clone(&primary) as Arc<dyn ToolProvider>, 0)
        .await
        .unwrap();
    registry
        .register_provider(Arc::clone(&backup) as Arc<dyn ToolProvider>, 5)
        .await
        .unwrap();

    let result = call(&registry, "calc").await;

    // The tool ran and failed; no retry, no fallback.
    assert_eq!(result.failure_kind(), Some(ErrorKind::ExecutionError));
    assert_eq!(result.metadata().provider_id.as_deref(), Some("primary"));
    assert_eq!(result.metadata().attempt_count, 1);
    assert_eq!(primary.calls(), 1);
    assert_eq!(backup.calls(), 0);
}

#[tokio::test]
async fn test_disowned_tool_falls_through_without_retry() {
    let registry = ToolRegistry::new(fast_config());
    let primary = ScriptedProvider::shared("primary", &["search"], vec![Outcome::ToolNotFound]);
    let backup = ScriptedProvider::shared("backup", &["search"], vec![]);
    registry
        .register_provider(Arc::clone(&primary) as Arc<dyn ToolProvider>, 0)
        .await
        .unwrap();
    registry
        .register_provider(Arc::clone(&backup) as Arc<dyn ToolProvider>, 5)
        .await
        .unwrap();

    let result = call(&registry, "search").await;

    assert!(result.is_success());
    assert_eq!(result.metadata().provider_id.as_deref(), Some("backup"));
    assert_eq!(primary.calls(), 1);
    assert_eq!(backup.calls(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_surface_transport_lost() {
    let registry = ToolRegistry::new(fast_config());
    let provider = ScriptedProvider::shared(
        "only",
        &["search"],
        vec![Outcome::TransportLost, Outcome::TransportLost],
    );
    registry
        .register_provider(Arc::clone(&provider) as Arc<dyn ToolProvider>, 0)
        .await
        .unwrap();

    let result = call(&registry, "search").await;
    assert_eq!(result.failure_kind(), Some(ErrorKind::TransportLost));
    assert_eq!(result.metadata().attempt_count, 2);
}

#[tokio::test]
async fn test_exhausted_timeouts_surface_timeout() {
    let registry = ToolRegistry::new(fast_config());
    let provider = ScriptedProvider::shared(
        "slow",
        &["search"],
        vec![Outcome::Timeout, Outcome::Timeout],
    );
    registry
        .register_provider(Arc::clone(&provider) as Arc<dyn ToolProvider>, 0)
        .await
        .unwrap();

    // A caller must be able to see TIMEOUT (unknown outcome), not a generic
    // no-provider failure.
    let result = call(&registry, "search").await;
    assert_eq!(result.failure_kind(), Some(ErrorKind::Timeout));
    assert_eq!(result.metadata().attempt_count, 2);
    assert_eq!(provider.calls(), 2);
}

// ============================================================================
// Demotion and Respawn
// ============================================================================

#[tokio::test]
async fn test_demotion_removes_provider_from_catalog() {
    let config = RegistryConfig {
        retry_count: 0,
        ..fast_config()
    };
    let registry = ToolRegistry::new(config);
    let provider = ScriptedProvider::shared(
        "flaky",
        &["search"],
        vec![Outcome::TransportLost, Outcome::TransportLost],
    );
    registry
        .register_provider(Arc::clone(&provider) as Arc<dyn ToolProvider>, 0)
        .await
        .unwrap();

    let result = call(&registry, "search").await;
    assert_eq!(result.failure_kind(), Some(ErrorKind::TransportLost));

    // failure_threshold = 1 and no respawn attempts: the provider is demoted
    // for good.
    assert_eq!(
        registry.provider_state("flaky").await,
        Some(ProviderState::Failed)
    );
    assert!(registry.list_tools().await.is_empty());

    let result = call(&registry, "search").await;
    assert_eq!(result.failure_kind(), Some(ErrorKind::NoProviderAvailable));
    assert_eq!(result.metadata().attempt_count, 0);
}

#[tokio::test]
async fn test_demoted_provider_respawns() {
    let config = RegistryConfig {
        retry_count: 0,
        max_respawn_attempts: 3,
        ..fast_config()
    };
    let registry = ToolRegistry::new(config);
    let provider = ScriptedProvider::shared("flaky", &["search"], vec![Outcome::TransportLost]);
    registry
        .register_provider(Arc::clone(&provider) as Arc<dyn ToolProvider>, 0)
        .await
        .unwrap();

    let result = call(&registry, "search").await;
    assert_eq!(result.failure_kind(), Some(ErrorKind::TransportLost));

    // Respawn backoff is 1ms; give the background task a moment.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        registry.provider_state("flaky").await,
        Some(ProviderState::Ready)
    );
    assert_eq!(provider.inits.load(Ordering::SeqCst), 2);

    let result = call(&registry, "search").await;
    assert!(result.is_success());
}

#[tokio::test]
async fn test_shutdown_during_respawn_leaves_provider_stopped() {
    let config = RegistryConfig {
        retry_count: 0,
        max_respawn_attempts: 3,
        ..fast_config()
    };
    let registry = ToolRegistry::new(config);
    let provider = ScriptedProvider::shared_with_init_delay(
        "flaky",
        &["search"],
        vec![Outcome::TransportLost],
        Duration::from_millis(150),
    );
    registry
        .register_provider(Arc::clone(&provider) as Arc<dyn ToolProvider>, 0)
        .await
        .unwrap();

    let result = call(&registry, "search").await;
    assert_eq!(result.failure_kind(), Some(ErrorKind::TransportLost));

    // Respawn backoff is 1ms, so its slow re-initialize is now in flight.
    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.shutdown().await;

    // The re-initialize completes after shutdown; it must stop the fresh
    // backend instead of promoting the entry back to ready.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        registry.provider_state("flaky").await,
        Some(ProviderState::Stopped)
    );
    assert_eq!(provider.state().await, ProviderState::Stopped);
    assert!(registry.list_tools().await.is_empty());
}

// ============================================================================
// Shutdown Gating
// ============================================================================

#[tokio::test]
async fn test_shutdown_drains_in_flight_calls() {
    let registry = Arc::new(ToolRegistry::new(fast_config()));
    let slow = Outcome::SlowOk(Duration::from_millis(100), serde_json::json!({"done": true}));
    let provider = ScriptedProvider::shared(
        "slow",
        &["search"],
        vec![slow.clone(), slow.clone(), slow],
    );
    registry
        .register_provider(Arc::clone(&provider) as Arc<dyn ToolProvider>, 0)
        .await
        .unwrap();

    let mut in_flight = Vec::new();
    for _ in 0..3 {
        let registry = Arc::clone(&registry);
        in_flight.push(tokio::spawn(async move { call(&registry, "search").await }));
    }
    // Let the calls reach the provider before shutting down.
    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.shutdown().await;

    for handle in in_flight {
        let result = handle.await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.value().unwrap()["done"], true);
    }

    let rejected = call(&registry, "search").await;
    assert_eq!(
        rejected.failure_kind(),
        Some(ErrorKind::RegistryShuttingDown)
    );
}

#[tokio::test]
async fn test_shutdown_stops_all_providers() {
    let registry = ToolRegistry::new(fast_config());
    let a = ScriptedProvider::shared("a", &["x"], vec![]);
    let b = ScriptedProvider::shared("b", &["y"], vec![]);
    registry
        .register_provider(Arc::clone(&a) as Arc<dyn ToolProvider>, 0)
        .await
        .unwrap();
    registry
        .register_provider(Arc::clone(&b) as Arc<dyn ToolProvider>, 0)
        .await
        .unwrap();

    registry.shutdown().await;

    assert_eq!(a.state().await, ProviderState::Stopped);
    assert_eq!(b.state().await, ProviderState::Stopped);
    assert_eq!(registry.provider_state("a").await, Some(ProviderState::Stopped));
}
