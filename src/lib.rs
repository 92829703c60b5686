// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Toolbus: a tool-execution dispatch layer over stdio backends.
//!
//! A tool call names a tool, carries JSON parameters, and gets back a JSON
//! result or a classified failure. Tools are served by long-lived child
//! processes speaking newline-delimited JSON over stdin/stdout; the registry
//! merges their catalogs and handles retry, priority fallback, demotion, and
//! respawn so callers never see a raw subprocess failure.
//!
//! Typical embedding:
//!
//! ```no_run
//! use toolbus::{ExecutionContext, ProviderSpec, RegistryConfig, ToolRegistry};
//!
//! # async fn run() {
//! let registry = ToolRegistry::new(RegistryConfig::default());
//! registry
//!     .register_stdio_provider(
//!         ProviderSpec::new("workbook-rag", "python3")
//!             .with_args(["mcp-servers/workbook-rag/server.py"]),
//!     )
//!     .await
//!     .unwrap();
//!
//! let result = registry
//!     .execute_tool(ExecutionContext::new(
//!         "rag/search",
//!         serde_json::json!({"query": "quarterly totals"}),
//!     ))
//!     .await;
//! println!("{}", serde_json::to_string_pretty(&result).unwrap());
//! registry.shutdown().await;
//! # }
//! ```

pub mod config;
pub mod correlator;
pub mod error;
pub mod health;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod transport;
pub mod types;

pub use config::{DispatchConfig, ProviderSpec, RegistryConfig};
pub use error::{DispatchError, DispatchResult, ErrorKind};
pub use provider::{StdioProvider, ToolProvider};
pub use registry::{CatalogCollision, ToolRegistry};
pub use types::{
    ExecutionContext, ExecutionMetadata, ExecutionResult, HealthSnapshot, HealthStatus,
    ProviderState, ToolDescriptor,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
