// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the dispatch layer.
//!
//! `DispatchError` is the internal error type used across the transport,
//! correlator, and registry. Callers of [`crate::registry::ToolRegistry`]
//! never see it directly: the registry folds every outcome into an
//! `ExecutionResult` envelope whose `ErrorKind` comes from
//! [`DispatchError::kind`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller-visible error classification carried in the result envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Backend process exited, crashed, or the pipe broke.
    TransportLost,

    /// Request deadline elapsed. The backend may still have run the tool.
    Timeout,

    /// Malformed line on the wire. Logged at the transport, never returned
    /// as a tool result.
    ProtocolDecodeError,

    /// Provider disowned a tool it advertised.
    ToolNotFound,

    /// The tool ran and reported a domain-level failure.
    ExecutionError,

    /// Every candidate provider was exhausted.
    NoProviderAvailable,

    /// Call rejected because the registry is tearing down.
    RegistryShuttingDown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TransportLost => "TRANSPORT_LOST",
            Self::Timeout => "TIMEOUT",
            Self::ProtocolDecodeError => "PROTOCOL_DECODE_ERROR",
            Self::ToolNotFound => "TOOL_NOT_FOUND",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::NoProviderAvailable => "NO_PROVIDER_AVAILABLE",
            Self::RegistryShuttingDown => "REGISTRY_SHUTTING_DOWN",
        };
        write!(f, "{}", s)
    }
}

/// Errors produced inside the dispatch layer.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Backend process could not be spawned.
    #[error("Failed to spawn provider '{provider}': {message}")]
    SpawnFailed { provider: String, message: String },

    /// Initialization handshake did not complete.
    #[error("Handshake with provider '{provider}' failed: {message}")]
    HandshakeFailed { provider: String, message: String },

    /// Process exited or the stdio pipe broke.
    #[error("Transport to provider '{provider}' lost: {message}")]
    TransportLost { provider: String, message: String },

    /// Request deadline elapsed.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Malformed line on the wire.
    #[error("Protocol decode error: {message}")]
    Decode { message: String },

    /// Provider refused a tool it previously advertised.
    #[error("Tool not found: '{tool}' on provider '{provider}'")]
    ToolNotFound { provider: String, tool: String },

    /// The tool ran and failed on its own terms.
    #[error("Execution error ({code}): {message}")]
    Execution { code: String, message: String },

    /// No ready provider could serve the tool.
    #[error("No provider available for tool '{tool}'")]
    NoProviderAvailable { tool: String },

    /// Registry is shutting down.
    #[error("Registry is shutting down")]
    ShuttingDown,

    /// Transport is not ready for requests.
    #[error("Provider '{provider}' is not ready")]
    NotReady { provider: String },

    /// A request id was registered while already outstanding.
    #[error("Request id '{id}' is already pending")]
    DuplicateRequestId { id: String },

    /// A provider id was registered twice.
    #[error("Provider '{id}' is already registered")]
    DuplicateProvider { id: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DispatchError {
    /// Create a spawn-failed error.
    pub fn spawn_failed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a handshake-failed error.
    pub fn handshake_failed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a transport-lost error.
    pub fn transport_lost(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportLost {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an execution error from a wire error code/message pair.
    pub fn execution(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Classify this error for the caller-facing envelope.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SpawnFailed { .. }
            | Self::HandshakeFailed { .. }
            | Self::TransportLost { .. }
            | Self::NotReady { .. }
            | Self::Io(_) => ErrorKind::TransportLost,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Decode { .. } | Self::Json(_) => ErrorKind::ProtocolDecodeError,
            Self::ToolNotFound { .. } => ErrorKind::ToolNotFound,
            Self::Execution { .. } => ErrorKind::ExecutionError,
            Self::DuplicateRequestId { .. } | Self::DuplicateProvider { .. } | Self::Config(_) => {
                // Misuse or bad configuration, not a tool outcome. These
                // surface as `Err` at the API boundary and are never folded
                // into a result envelope.
                debug_assert!(
                    false,
                    "internal error classified for a caller envelope: {}",
                    self
                );
                ErrorKind::ExecutionError
            }
            Self::NoProviderAvailable { .. } => ErrorKind::NoProviderAvailable,
            Self::ShuttingDown => ErrorKind::RegistryShuttingDown,
        }
    }

    /// Whether the registry may retry the same provider for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransportLost | ErrorKind::Timeout)
    }
}

/// Result alias for dispatch-layer operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DispatchError::spawn_failed("rag", "no such file");
        assert!(err.to_string().contains("rag"));
        assert!(err.to_string().contains("no such file"));

        let err = DispatchError::Timeout { timeout_ms: 1000 };
        assert!(err.to_string().contains("1000"));
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            DispatchError::transport_lost("a", "gone").kind(),
            ErrorKind::TransportLost
        );
        assert_eq!(
            DispatchError::Timeout { timeout_ms: 5 }.kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            DispatchError::execution("E_BAD_RANGE", "range out of bounds").kind(),
            ErrorKind::ExecutionError
        );
        assert_eq!(
            DispatchError::ShuttingDown.kind(),
            ErrorKind::RegistryShuttingDown
        );
    }

    #[test]
    fn test_retryable() {
        assert!(DispatchError::transport_lost("a", "gone").is_retryable());
        assert!(DispatchError::Timeout { timeout_ms: 5 }.is_retryable());
        assert!(!DispatchError::execution("E", "m").is_retryable());
        assert!(!DispatchError::ToolNotFound {
            provider: "a".into(),
            tool: "t".into()
        }
        .is_retryable());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "internal error")]
    fn test_internal_errors_never_classify_for_envelopes() {
        let _ = DispatchError::Config("bad".into()).kind();
    }

    #[test]
    fn test_kind_wire_format() {
        assert_eq!(ErrorKind::TransportLost.to_string(), "TRANSPORT_LOST");
        assert_eq!(
            ErrorKind::NoProviderAvailable.to_string(),
            "NO_PROVIDER_AVAILABLE"
        );

        let json = serde_json::to_string(&ErrorKind::Timeout).unwrap();
        assert_eq!(json, "\"TIMEOUT\"");
    }
}
