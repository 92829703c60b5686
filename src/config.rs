// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Registry and provider configuration.
//!
//! All retry, backoff, and timeout tuning lives here so tests can run with
//! near-zero values deterministically. The registry never loads files itself;
//! the binaries parse a JSON document of this shape and hand the structs in:
//!
//! ```json
//! {
//!   "defaults": {
//!     "default_timeout_ms": 30000,
//!     "retry_count": 2
//!   },
//!   "providers": [
//!     {
//!       "id": "workbook-rag",
//!       "priority": 0,
//!       "command": "python3",
//!       "args": ["mcp-servers/workbook-rag/server.py"],
//!       "cwd": "/opt/workbench"
//!     }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};

/// Tuning knobs for the registry and its transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Default per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Retries per candidate after the first attempt, for transport
    /// failures and timeouts only.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Base backoff between retries; doubles per attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Handshake deadline for a starting transport.
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// Grace period between closing a backend's stdin and killing it.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Overall bound on registry shutdown.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Cadence of the pending-request expiry sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Cadence of health polling.
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    /// Per-provider health probe timeout.
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,

    /// Probe latency above which a provider reports degraded.
    #[serde(default = "default_degraded_latency_ms")]
    pub degraded_latency_ms: u64,

    /// Consecutive transport failures before a provider is demoted.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Bounded respawn attempts for a demoted provider.
    #[serde(default = "default_max_respawn_attempts")]
    pub max_respawn_attempts: u32,

    /// Base backoff before a respawn attempt; doubles per attempt.
    #[serde(default = "default_respawn_backoff_ms")]
    pub respawn_backoff_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_retry_count() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_start_timeout_ms() -> u64 {
    10_000
}

fn default_stop_grace_ms() -> u64 {
    3_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_sweep_interval_ms() -> u64 {
    250
}

fn default_health_interval_ms() -> u64 {
    15_000
}

fn default_health_timeout_ms() -> u64 {
    2_000
}

fn default_degraded_latency_ms() -> u64 {
    1_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_max_respawn_attempts() -> u32 {
    3
}

fn default_respawn_backoff_ms() -> u64 {
    500
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            retry_count: default_retry_count(),
            backoff_base_ms: default_backoff_base_ms(),
            start_timeout_ms: default_start_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            health_interval_ms: default_health_interval_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            degraded_latency_ms: default_degraded_latency_ms(),
            failure_threshold: default_failure_threshold(),
            max_respawn_attempts: default_max_respawn_attempts(),
            respawn_backoff_ms: default_respawn_backoff_ms(),
        }
    }
}

/// How to launch one backend process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Provider id, unique within the registry.
    pub id: String,

    /// Fallback priority; lower value wins tool-name collisions.
    #[serde(default)]
    pub priority: i32,

    /// Command to spawn.
    pub command: String,

    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables for the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the child process.
    pub cwd: Option<String>,
}

impl ProviderSpec {
    /// Create a spec with default priority and no arguments.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    /// Set the fallback priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set command arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set environment variables.
    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// Set the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Full dispatch configuration: registry defaults plus provider launch specs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Registry tuning.
    #[serde(default)]
    pub defaults: RegistryConfig,

    /// Providers to register at startup.
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
}

impl DispatchConfig {
    /// Load configuration from a JSON file.
    pub fn load_from_file(path: impl AsRef<Path>) -> DispatchResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DispatchError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> DispatchResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DispatchError::Config(format!("Invalid config: {}", e)))?;

        let mut seen = std::collections::HashSet::new();
        for spec in &config.providers {
            if !seen.insert(spec.id.as_str()) {
                return Err(DispatchError::Config(format!(
                    "Duplicate provider id '{}'",
                    spec.id
                )));
            }
        }
        Ok(config)
    }
}
