// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Provider abstraction.
//!
//! `ToolProvider` is the single seam between the registry and backend
//! implementations. The registry never special-cases a backend kind: a new
//! transport (REST, database, in-process) is a new implementation of this
//! trait, nothing more. `StdioProvider` is the one shipping implementation,
//! wrapping a [`ProcessTransport`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::{ProviderSpec, RegistryConfig};
use crate::error::DispatchResult;
use crate::transport::ProcessTransport;
use crate::types::{HealthSnapshot, HealthStatus, ProviderState, ToolDescriptor};

/// A backend that can execute a subset of named tools.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Provider id, unique within a registry.
    fn id(&self) -> &str;

    /// Start the backend and return the tools it advertises.
    ///
    /// Called again by the registry on a respawn attempt; implementations
    /// must tolerate repeated initialization.
    async fn initialize(&self) -> DispatchResult<Vec<ToolDescriptor>>;

    /// Stop the backend gracefully.
    async fn shutdown(&self);

    /// Current lifecycle state.
    async fn state(&self) -> ProviderState;

    /// Whether this provider currently advertises the tool.
    async fn can_execute(&self, tool_name: &str) -> bool;

    /// Tools advertised at the last successful handshake.
    async fn available_tools(&self) -> Vec<ToolDescriptor>;

    /// Execute one tool call with the given deadline.
    async fn execute_tool(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
        timeout: Duration,
    ) -> DispatchResult<serde_json::Value>;

    /// Probe the backend and report a health snapshot.
    async fn health(&self) -> HealthSnapshot;
}

/// Provider backed by a child process speaking the stdio wire protocol.
pub struct StdioProvider {
    /// The transport owning the backend process.
    transport: ProcessTransport,
    /// Health tuning.
    health_timeout: Duration,
    degraded_latency_ms: u64,
    /// Tools from the last successful handshake.
    tools: RwLock<Vec<ToolDescriptor>>,
}

impl StdioProvider {
    /// Create a provider for the given launch spec.
    pub fn new(spec: ProviderSpec, config: RegistryConfig) -> Self {
        Self {
            health_timeout: Duration::from_millis(config.health_timeout_ms),
            degraded_latency_ms: config.degraded_latency_ms,
            transport: ProcessTransport::new(spec, config),
            tools: RwLock::new(Vec::new()),
        }
    }

    /// Shared-ownership constructor, convenient for registration.
    pub fn shared(spec: ProviderSpec, config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self::new(spec, config))
    }
}

#[async_trait]
impl ToolProvider for StdioProvider {
    fn id(&self) -> &str {
        self.transport.provider_id()
    }

    async fn initialize(&self) -> DispatchResult<Vec<ToolDescriptor>> {
        let tools = self.transport.start().await?;
        *self.tools.write().await = tools.clone();
        Ok(tools)
    }

    async fn shutdown(&self) {
        self.transport.stop().await;
        self.tools.write().await.clear();
    }

    async fn state(&self) -> ProviderState {
        self.transport.state().await
    }

    async fn can_execute(&self, tool_name: &str) -> bool {
        self.tools
            .read()
            .await
            .iter()
            .any(|t| t.name == tool_name)
    }

    async fn available_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().await.clone()
    }

    async fn execute_tool(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
        timeout: Duration,
    ) -> DispatchResult<serde_json::Value> {
        self.transport.request(tool_name, parameters, timeout).await
    }

    async fn health(&self) -> HealthSnapshot {
        let state = self.transport.state().await;
        if !state.is_dispatchable() {
            return HealthSnapshot::unhealthy(self.id(), format!("transport state: {}", state))
                .with_metric("state", serde_json::json!(state.to_string()));
        }

        let pending = self.transport.pending_count().await;
        match self.transport.ping(self.health_timeout).await {
            Ok(latency_ms) => {
                let status = if latency_ms > self.degraded_latency_ms {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                HealthSnapshot::responsive(self.id(), status, latency_ms)
                    .with_metric("state", serde_json::json!(state.to_string()))
                    .with_metric("pending_requests", serde_json::json!(pending))
            }
            Err(e) => HealthSnapshot::unhealthy(self.id(), e.to_string())
                .with_metric("state", serde_json::json!(state.to_string()))
                .with_metric("pending_requests", serde_json::json!(pending)),
        }
    }
}
