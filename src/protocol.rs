// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire protocol for backend processes.
//!
//! Uses newline-delimited JSON over the child process's stdio streams.
//! Each message is exactly one line; JSON string escaping guarantees a
//! payload can never contain a raw newline, so framing cannot desynchronize.
//! A malformed line decodes to an error and is dropped by the read loop
//! without affecting subsequent lines.

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};
use crate::types::ToolDescriptor;

/// Capability-discovery handshake method.
pub const METHOD_LIST_TOOLS: &str = "tools/list";

/// Health probe method.
pub const METHOD_PING: &str = "ping";

/// Error code a backend uses to disown a tool at call time.
pub const CODE_TOOL_NOT_FOUND: &str = "TOOL_NOT_FOUND";

/// Alternate disown code used by older backends.
pub const CODE_METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";

/// Error payload of an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl WireError {
    /// Whether this error means the backend disowned the method.
    pub fn is_method_unknown(&self) -> bool {
        self.code == CODE_TOOL_NOT_FOUND || self.code == CODE_METHOD_NOT_FOUND
    }
}

/// One logical message on the wire.
///
/// Variant order matters for untagged deserialization: a request is the only
/// shape with `method`, an error response the only one with `error`; anything
/// else with an `id` is a success response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    /// Request to a backend.
    Request {
        /// Correlation id.
        id: String,
        /// Method name (the tool name, or a reserved method).
        method: String,
        /// Method parameters.
        #[serde(default)]
        params: serde_json::Value,
    },

    /// Error response from a backend.
    ErrorResponse {
        /// Correlation id of the originating request.
        id: String,
        /// Error payload.
        error: WireError,
    },

    /// Success response from a backend.
    Response {
        /// Correlation id of the originating request.
        id: String,
        /// Result payload.
        #[serde(default)]
        result: serde_json::Value,
    },
}

impl WireMessage {
    /// Create a request.
    pub fn request(
        id: impl Into<String>,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Create a success response.
    pub fn response(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self::Response {
            id: id.into(),
            result,
        }
    }

    /// Create an error response.
    pub fn error_response(
        id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ErrorResponse {
            id: id.into(),
            error: WireError {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    /// The correlation id of this message.
    pub fn id(&self) -> &str {
        match self {
            Self::Request { id, .. } | Self::ErrorResponse { id, .. } | Self::Response { id, .. } => {
                id
            }
        }
    }

    /// Check if this is a request.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request { .. })
    }

    /// Check if this is a success response.
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response { .. })
    }

    /// Check if this is an error response.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::ErrorResponse { .. })
    }
}

/// Encode a message to a newline-terminated JSON string.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_string(msg)?;
    json.push('\n');
    Ok(json)
}

/// Decode one line into a wire message.
pub fn decode(line: &str) -> DispatchResult<WireMessage> {
    serde_json::from_str(line.trim()).map_err(|e| DispatchError::Decode {
        message: format!("{}: {}", e, truncate(line.trim(), 120)),
    })
}

/// Parse the `tools/list` handshake result into descriptors.
///
/// Expected shape: `{"tools": [{"name", "description", "inputSchema"}, ...]}`.
/// Entries without a name are skipped.
pub fn parse_tool_list(result: &serde_json::Value, provider_id: &str) -> Vec<ToolDescriptor> {
    result
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    let name = t.get("name")?.as_str()?.to_string();
                    Some(ToolDescriptor {
                        name,
                        description: t
                            .get("description")
                            .and_then(|d| d.as_str())
                            .map(String::from),
                        input_schema: t
                            .get("inputSchema")
                            .cloned()
                            .unwrap_or(serde_json::json!({})),
                        provider_id: provider_id.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
