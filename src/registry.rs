// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tool provider registry.
//!
//! The registry owns the set of registered providers, the merged tool
//! catalog, and all failure policy: retry with backoff, priority-ordered
//! fallback, demotion of repeatedly failing providers, and bounded respawn.
//! It is an explicit object constructed by and passed into the orchestration
//! layer; there is no ambient global state.
//!
//! Callers always receive a well-formed [`ExecutionResult`] envelope. No
//! subprocess crash or malformed protocol line escapes this layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{ProviderSpec, RegistryConfig};
use crate::error::{DispatchError, DispatchResult, ErrorKind};
use crate::health::HealthMonitor;
use crate::provider::{StdioProvider, ToolProvider};
use crate::types::{
    ExecutionContext, ExecutionMetadata, ExecutionResult, HealthSnapshot, ProviderState,
    ToolDescriptor,
};

/// A tool name advertised by more than one provider.
///
/// Collisions are diagnostics, not errors: the lowest-priority-value
/// provider wins the catalog slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogCollision {
    /// Colliding tool name.
    pub tool: String,
    /// Provider that won the catalog slot.
    pub winner_id: String,
    /// Providers shadowed for this name, in fallback order.
    pub shadowed_ids: Vec<String>,
}

/// One registered provider as tracked by the registry.
struct ProviderEntry {
    provider: Arc<dyn ToolProvider>,
    priority: i32,
    /// Registry's view of the lifecycle state. Only the registry writes it.
    state: ProviderState,
    /// Tools from the last successful handshake.
    tools: Vec<ToolDescriptor>,
    /// Transport-class failures since the last success.
    consecutive_failures: u32,
}

/// Shared mutable registry state: provider entries plus the merged catalog.
pub(crate) struct RegistryInner {
    entries: HashMap<String, ProviderEntry>,
    catalog: HashMap<String, ToolDescriptor>,
    collisions: Vec<CatalogCollision>,
}

impl RegistryInner {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            catalog: HashMap::new(),
            collisions: Vec::new(),
        }
    }

    /// Providers for the health monitor to poll.
    pub(crate) fn provider_handles(&self) -> Vec<(String, Arc<dyn ToolProvider>)> {
        self.entries
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.provider)))
            .collect()
    }

    /// Recompute the merged catalog and collision diagnostics.
    fn rebuild_catalog(&mut self) {
        self.catalog.clear();
        self.collisions.clear();

        let mut by_name: HashMap<String, Vec<(i32, String, ToolDescriptor)>> = HashMap::new();
        for (id, entry) in &self.entries {
            if !entry.state.is_dispatchable() {
                continue;
            }
            for tool in &entry.tools {
                by_name
                    .entry(tool.name.clone())
                    .or_default()
                    .push((entry.priority, id.clone(), tool.clone()));
            }
        }

        for (name, mut offers) in by_name {
            offers.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
            if offers.len() > 1 {
                let shadowed: Vec<String> = offers[1..].iter().map(|o| o.1.clone()).collect();
                warn!(
                    tool = %name,
                    winner = %offers[0].1,
                    shadowed = ?shadowed,
                    "Tool name collision"
                );
                self.collisions.push(CatalogCollision {
                    tool: name.clone(),
                    winner_id: offers[0].1.clone(),
                    shadowed_ids: shadowed,
                });
            }
            self.catalog.insert(name, offers.swap_remove(0).2);
        }
    }

    /// All providers advertising a tool, in fallback order. Demoted and
    /// stopped providers are excluded.
    fn candidates_for(&self, tool_name: &str) -> Vec<(String, Arc<dyn ToolProvider>)> {
        let mut candidates: Vec<(i32, String, Arc<dyn ToolProvider>)> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.state.is_dispatchable() && entry.tools.iter().any(|t| t.name == tool_name)
            })
            .map(|(id, entry)| (entry.priority, id.clone(), Arc::clone(&entry.provider)))
            .collect();

        candidates.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        candidates.into_iter().map(|(_, id, p)| (id, p)).collect()
    }
}

/// Decrements the in-flight counter when an `execute_tool` call finishes
/// by any path.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Routes tool calls to backend providers with retry, fallback, and health
/// monitoring.
pub struct ToolRegistry {
    config: RegistryConfig,
    inner: Arc<RwLock<RegistryInner>>,
    health: HealthMonitor,
    shutting_down: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl ToolRegistry {
    /// Create a registry and start its health monitor.
    pub fn new(config: RegistryConfig) -> Self {
        let inner = Arc::new(RwLock::new(RegistryInner::new()));
        let health = HealthMonitor::start(
            Arc::clone(&inner),
            Duration::from_millis(config.health_interval_ms),
            Duration::from_millis(config.health_timeout_ms),
        );
        Self {
            config,
            inner,
            health,
            shutting_down: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Register a provider and start its transport.
    ///
    /// A provider whose transport fails to start is registered in the
    /// `failed` state rather than propagating the startup error; the caller
    /// can observe the state via [`provider_state`](Self::provider_state).
    pub async fn register_provider(
        &self,
        provider: Arc<dyn ToolProvider>,
        priority: i32,
    ) -> DispatchResult<()> {
        if self.is_shutting_down() {
            return Err(DispatchError::ShuttingDown);
        }

        let id = provider.id().to_string();
        {
            let mut inner = self.inner.write().await;
            if inner.entries.contains_key(&id) {
                return Err(DispatchError::DuplicateProvider { id });
            }
            inner.entries.insert(
                id.clone(),
                ProviderEntry {
                    provider: Arc::clone(&provider),
                    priority,
                    state: ProviderState::Starting,
                    tools: Vec::new(),
                    consecutive_failures: 0,
                },
            );
        }

        // Handshake runs without holding the registry lock.
        match provider.initialize().await {
            Ok(tools) => {
                info!(provider = %id, tools = tools.len(), "Provider registered");
                let mut inner = self.inner.write().await;
                if let Some(entry) = inner.entries.get_mut(&id) {
                    entry.state = ProviderState::Ready;
                    entry.tools = tools;
                }
                inner.rebuild_catalog();
            }
            Err(e) => {
                warn!(provider = %id, error = %e, "Provider failed to start");
                let mut inner = self.inner.write().await;
                if let Some(entry) = inner.entries.get_mut(&id) {
                    entry.state = ProviderState::Failed;
                }
                inner.rebuild_catalog();
            }
        }
        Ok(())
    }

    /// Register a stdio provider from a launch spec, using the spec's
    /// priority.
    pub async fn register_stdio_provider(&self, spec: ProviderSpec) -> DispatchResult<()> {
        let priority = spec.priority;
        let provider = StdioProvider::shared(spec, self.config.clone());
        self.register_provider(provider, priority).await
    }

    /// Unregister a provider and stop its transport.
    ///
    /// Tool names it shadowed re-resolve to the next candidate.
    pub async fn unregister_provider(&self, id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write().await;
            let removed = inner.entries.remove(id);
            inner.rebuild_catalog();
            removed
        };

        match removed {
            Some(entry) => {
                entry.provider.shutdown().await;
                info!(provider = %id, "Provider unregistered");
                true
            }
            None => false,
        }
    }

    /// Execute a tool call against the best available provider.
    ///
    /// Transport failures and timeouts are retried with exponential backoff
    /// and then fall through to the next candidate; execution errors are
    /// surfaced immediately and never redirected to a different provider.
    pub async fn execute_tool(&self, ctx: ExecutionContext) -> ExecutionResult {
        let started_at = Utc::now();

        if self.is_shutting_down() {
            return self.failure(
                ErrorKind::RegistryShuttingDown,
                "registry is shutting down",
                None,
                0,
                started_at,
                &ctx,
            );
        }

        let _guard = InFlightGuard::new(Arc::clone(&self.in_flight));

        // Close the race with a shutdown that began before the increment.
        if self.is_shutting_down() {
            return self.failure(
                ErrorKind::RegistryShuttingDown,
                "registry is shutting down",
                None,
                0,
                started_at,
                &ctx,
            );
        }

        let timeout = Duration::from_millis(
            ctx.timeout_ms.unwrap_or(self.config.default_timeout_ms),
        );
        let candidates = self.inner.read().await.candidates_for(&ctx.tool_name);

        if candidates.is_empty() {
            return self.failure(
                ErrorKind::NoProviderAvailable,
                format!("no provider offers tool '{}'", ctx.tool_name),
                None,
                0,
                started_at,
                &ctx,
            );
        }

        let mut attempt_count = 0u32;
        let mut last_error: Option<DispatchError> = None;

        'candidates: for (id, provider) in candidates {
            // Live transport state, not the registry's possibly stale view:
            // a provider whose process died seconds ago is skipped without
            // waiting for demotion.
            if !provider.state().await.is_dispatchable() {
                debug!(provider = %id, tool = %ctx.tool_name, "Skipping non-ready candidate");
                continue;
            }

            for attempt in 0..=self.config.retry_count {
                attempt_count += 1;
                match provider
                    .execute_tool(&ctx.tool_name, ctx.parameters.clone(), timeout)
                    .await
                {
                    Ok(value) => {
                        self.note_success(&id).await;
                        return ExecutionResult::Success {
                            value,
                            metadata: self.metadata(Some(id), attempt_count, started_at, &ctx),
                        };
                    }
                    Err(e) => match e.kind() {
                        ErrorKind::TransportLost | ErrorKind::Timeout => {
                            warn!(
                                provider = %id,
                                tool = %ctx.tool_name,
                                attempt,
                                error = %e,
                                "Transport-class failure"
                            );
                            last_error = Some(e);
                            if attempt < self.config.retry_count {
                                let backoff = Duration::from_millis(
                                    self.config.backoff_base_ms
                                        * (1u64 << attempt.min(16)),
                                );
                                tokio::time::sleep(backoff).await;
                            } else {
                                self.note_transport_failure(&id).await;
                                continue 'candidates;
                            }
                        }
                        ErrorKind::ToolNotFound => {
                            // Advertised but disowned at call time: protocol
                            // inconsistency, fall through without retry.
                            warn!(
                                provider = %id,
                                tool = %ctx.tool_name,
                                "Provider disowned advertised tool"
                            );
                            last_error = Some(e);
                            continue 'candidates;
                        }
                        ErrorKind::ExecutionError => {
                            // The tool ran. A different provider is not
                            // guaranteed to be semantically equivalent, so
                            // this is terminal for the call.
                            let message = e.to_string();
                            return self.failure(
                                ErrorKind::ExecutionError,
                                message,
                                Some(id),
                                attempt_count,
                                started_at,
                                &ctx,
                            );
                        }
                        _ => {
                            warn!(provider = %id, tool = %ctx.tool_name, error = %e, "Dispatch error");
                            last_error = Some(e);
                            continue 'candidates;
                        }
                    },
                }
            }
        }

        // When real attempts were made, the caller gets the last failure's
        // kind (a TIMEOUT result means the outcome is unknown, which the
        // caller must be able to see). NO_PROVIDER_AVAILABLE is reserved for
        // calls that never reached a backend.
        match last_error {
            Some(e) => {
                let kind = e.kind();
                self.failure(
                    kind,
                    format!("all candidates exhausted for '{}': {}", ctx.tool_name, e),
                    None,
                    attempt_count,
                    started_at,
                    &ctx,
                )
            }
            None => self.failure(
                ErrorKind::NoProviderAvailable,
                format!("no ready provider for tool '{}'", ctx.tool_name),
                None,
                attempt_count,
                started_at,
                &ctx,
            ),
        }
    }

    /// The current merged tool catalog, sorted by tool name.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let inner = self.inner.read().await;
        let mut tools: Vec<ToolDescriptor> = inner.catalog.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Collision diagnostics from the last catalog rebuild.
    pub async fn catalog_collisions(&self) -> Vec<CatalogCollision> {
        self.inner.read().await.collisions.clone()
    }

    /// Latest health snapshots without forcing a fresh poll.
    pub async fn get_all_provider_health(&self) -> Vec<HealthSnapshot> {
        self.health.snapshots().await
    }

    /// Probe every provider now, bypassing the background monitor's cache.
    pub async fn probe_provider_health(&self) -> Vec<HealthSnapshot> {
        let providers = self.inner.read().await.provider_handles();
        let probe_timeout = Duration::from_millis(self.config.health_timeout_ms);

        let mut probes = JoinSet::new();
        for (id, provider) in providers {
            probes.spawn(async move {
                match tokio::time::timeout(probe_timeout, provider.health()).await {
                    Ok(snapshot) => snapshot,
                    Err(_) => HealthSnapshot::unhealthy(&id, "health probe timed out"),
                }
            });
        }

        let mut snapshots = Vec::new();
        while let Some(result) = probes.join_next().await {
            if let Ok(snapshot) = result {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }

    /// Registry's view of one provider's state.
    pub async fn provider_state(&self, id: &str) -> Option<ProviderState> {
        self.inner.read().await.entries.get(id).map(|e| e.state)
    }

    /// Stop everything: reject new calls, drain in-flight calls, then stop
    /// all providers concurrently under the shutdown bound.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Registry shutting down");
        self.health.stop().await;

        let deadline = Instant::now()
            + Duration::from_millis(self.config.shutdown_timeout_ms);
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let providers: Vec<Arc<dyn ToolProvider>> = {
            let mut inner = self.inner.write().await;
            inner.catalog.clear();
            inner.collisions.clear();
            for entry in inner.entries.values_mut() {
                entry.state = ProviderState::Stopped;
            }
            inner
                .entries
                .values()
                .map(|e| Arc::clone(&e.provider))
                .collect()
        };

        let mut stops = JoinSet::new();
        for provider in providers {
            stops.spawn(async move { provider.shutdown().await });
        }

        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(100));
        let _ = tokio::time::timeout(remaining, async {
            while stops.join_next().await.is_some() {}
        })
        .await;
        info!("Registry shutdown complete");
    }

    async fn note_success(&self, id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.consecutive_failures = 0;
        }
    }

    /// Count a transport-class failure; demote and schedule a bounded
    /// respawn once the threshold is crossed.
    async fn note_transport_failure(&self, id: &str) {
        let demoted = {
            let mut inner = self.inner.write().await;
            let Some(entry) = inner.entries.get_mut(id) else {
                return;
            };
            entry.consecutive_failures += 1;
            if entry.consecutive_failures >= self.config.failure_threshold
                && entry.state != ProviderState::Failed
            {
                entry.state = ProviderState::Failed;
                let provider = Arc::clone(&entry.provider);
                inner.rebuild_catalog();
                Some(provider)
            } else {
                None
            }
        };

        if let Some(provider) = demoted {
            warn!(provider = %id, "Provider demoted after consecutive transport failures");
            self.spawn_respawn(id.to_string(), provider);
        }
    }

    /// Background bounded-respawn loop for a demoted provider.
    fn spawn_respawn(&self, id: String, provider: Arc<dyn ToolProvider>) {
        let inner = Arc::clone(&self.inner);
        let config = self.config.clone();
        let shutting_down = Arc::clone(&self.shutting_down);

        tokio::spawn(async move {
            for attempt in 1..=config.max_respawn_attempts {
                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                let backoff = Duration::from_millis(
                    config.respawn_backoff_ms * (1u64 << (attempt - 1).min(16)),
                );
                tokio::time::sleep(backoff).await;

                info!(provider = %id, attempt, "Respawn attempt");
                match provider.initialize().await {
                    Ok(tools) => {
                        let mut guard = inner.write().await;
                        // Shutdown may have begun, or the provider may have
                        // been unregistered, while initialize was in flight.
                        // The fresh process must not outlive either.
                        if shutting_down.load(Ordering::SeqCst)
                            || !guard.entries.contains_key(&id)
                        {
                            drop(guard);
                            provider.shutdown().await;
                            return;
                        }
                        if let Some(entry) = guard.entries.get_mut(&id) {
                            entry.state = ProviderState::Ready;
                            entry.tools = tools;
                            entry.consecutive_failures = 0;
                        }
                        guard.rebuild_catalog();
                        info!(provider = %id, "Respawn succeeded");
                        return;
                    }
                    Err(e) => {
                        warn!(provider = %id, attempt, error = %e, "Respawn attempt failed");
                    }
                }
            }
            warn!(
                provider = %id,
                "Respawn attempts exhausted, provider stays failed until re-registered"
            );
        });
    }

    fn metadata(
        &self,
        provider_id: Option<String>,
        attempt_count: u32,
        started_at: DateTime<Utc>,
        ctx: &ExecutionContext,
    ) -> ExecutionMetadata {
        ExecutionMetadata {
            provider_id,
            attempt_count,
            started_at,
            finished_at: Utc::now(),
            request_id: ctx.request_id.clone(),
        }
    }

    fn failure(
        &self,
        kind: ErrorKind,
        message: impl Into<String>,
        provider_id: Option<String>,
        attempt_count: u32,
        started_at: DateTime<Utc>,
        ctx: &ExecutionContext,
    ) -> ExecutionResult {
        ExecutionResult::Failure {
            kind,
            message: message.into(),
            metadata: self.metadata(provider_id, attempt_count, started_at, ctx),
        }
    }
}
