// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core types for tool dispatch.
//!
//! These are the shapes that cross the caller boundary: tool descriptors,
//! execution contexts, the uniform result envelope, and health snapshots.
//! Provider-specific response formats never leak past `ExecutionResult`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Lifecycle state of a provider, as observed by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    /// Transport spawning or handshake in progress.
    Starting,

    /// Process alive and handshake complete.
    Ready,

    /// Usable but showing signs of trouble (slow health probes).
    Degraded,

    /// Process exited, crashed, or handshake failed.
    Failed,

    /// Stopped by the registry.
    Stopped,
}

impl ProviderState {
    /// Whether the registry may dispatch requests to a provider in this state.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }
}

impl std::fmt::Display for ProviderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A tool advertised by a provider during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name (also the wire method name).
    pub name: String,

    /// Human-readable description.
    pub description: Option<String>,

    /// JSON Schema for tool input.
    pub input_schema: serde_json::Value,

    /// Provider that owns this catalog entry.
    pub provider_id: String,
}

/// One tool-execution request. Immutable once dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Tool to execute.
    pub tool_name: String,

    /// Opaque structured parameters, forwarded verbatim.
    pub parameters: serde_json::Value,

    /// Caller-supplied correlation id for the envelope.
    pub request_id: String,

    /// Per-call timeout override in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl ExecutionContext {
    /// Create a context with a generated request id and default timeout.
    pub fn new(tool_name: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            request_id: Uuid::new_v4().to_string(),
            timeout_ms: None,
        }
    }

    /// Override the request timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Use a caller-supplied request id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Dispatch metadata attached to every execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Provider that produced the result, if any was reached.
    pub provider_id: Option<String>,

    /// Total dispatch attempts across all candidates, including retries.
    pub attempt_count: u32,

    /// When the registry accepted the call.
    pub started_at: DateTime<Utc>,

    /// When the envelope was sealed.
    pub finished_at: DateTime<Utc>,

    /// Caller-supplied request id.
    pub request_id: String,
}

/// The uniform result envelope returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// The tool ran and returned a value.
    Success {
        /// Tool output, verbatim from the provider.
        value: serde_json::Value,
        /// Dispatch metadata.
        metadata: ExecutionMetadata,
    },

    /// The call failed; `kind` says how.
    Failure {
        /// Error classification.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
        /// Dispatch metadata.
        metadata: ExecutionMetadata,
    },
}

impl ExecutionResult {
    /// Whether this is a success envelope.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The dispatch metadata, regardless of outcome.
    pub fn metadata(&self) -> &ExecutionMetadata {
        match self {
            Self::Success { metadata, .. } | Self::Failure { metadata, .. } => metadata,
        }
    }

    /// The failure kind, if this is a failure envelope.
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Failure { kind, .. } => Some(*kind),
            Self::Success { .. } => None,
        }
    }

    /// The success value, if this is a success envelope.
    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Success { value, .. } => Some(value),
            Self::Failure { .. } => None,
        }
    }
}

/// Health classification for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Probe answered within the latency budget.
    Healthy,

    /// Probe answered, but slowly.
    Degraded,

    /// Probe failed or timed out.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Point-in-time health report for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Provider this snapshot describes.
    pub provider_id: String,

    /// Health classification.
    pub status: HealthStatus,

    /// When the probe ran.
    pub last_checked_at: DateTime<Utc>,

    /// Probe round-trip latency, if the probe answered.
    pub latency_ms: Option<u64>,

    /// Free-form metrics (state, pending request count, ...).
    #[serde(default)]
    pub metrics: HashMap<String, serde_json::Value>,
}

impl HealthSnapshot {
    /// Snapshot for a provider that answered its probe.
    pub fn responsive(
        provider_id: impl Into<String>,
        status: HealthStatus,
        latency_ms: u64,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            status,
            last_checked_at: Utc::now(),
            latency_ms: Some(latency_ms),
            metrics: HashMap::new(),
        }
    }

    /// Snapshot for a provider that did not answer.
    pub fn unhealthy(provider_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut metrics = HashMap::new();
        metrics.insert(
            "reason".to_string(),
            serde_json::Value::String(reason.into()),
        );
        Self {
            provider_id: provider_id.into(),
            status: HealthStatus::Unhealthy,
            last_checked_at: Utc::now(),
            latency_ms: None,
            metrics,
        }
    }

    /// Attach a metric.
    pub fn with_metric(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}
