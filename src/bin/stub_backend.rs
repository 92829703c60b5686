// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scriptable stdio backend for integration tests and manual smoke runs.
//!
//! Speaks the newline-delimited JSON protocol: answers `tools/list` with its
//! advertised tools, `ping` with an empty object, and echoes tool calls back
//! as `{"tool", "params"}`. Flags script misbehavior (failing tools, disowned
//! tools, mid-call exits, silent handshakes) so the dispatch layer's failure
//! paths can be exercised against a real child process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

use toolbus::protocol::{
    self, WireMessage, CODE_TOOL_NOT_FOUND, METHOD_LIST_TOOLS, METHOD_PING,
};

/// Scriptable stdio tool backend.
#[derive(Parser)]
#[command(name = "toolbus-stub")]
struct Cli {
    /// Comma-separated tool names to advertise
    #[arg(long, default_value = "echo")]
    tools: String,

    /// Fixed delay before answering any tool call, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Tool that always answers with an EXECUTION_ERROR response
    #[arg(long)]
    fail_tool: Option<String>,

    /// Tool that is advertised but disowned with TOOL_NOT_FOUND when called
    #[arg(long)]
    disown_tool: Option<String>,

    /// Exit(1) when the Nth tool call arrives, before answering it
    #[arg(long)]
    exit_after: Option<u64>,

    /// Exit(1) this many milliseconds after start, unprompted
    #[arg(long)]
    die_after_ms: Option<u64>,

    /// Never answer the tools/list handshake
    #[arg(long)]
    silent_handshake: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let tools: Vec<String> = cli
        .tools
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect();

    if let Some(ms) = cli.die_after_ms {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            std::process::exit(1);
        });
    }

    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let calls_seen = AtomicU64::new(0);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // Exit on stdin EOF, like the real backends.
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(WireMessage::Request { id, method, params }) = protocol::decode(&line) else {
            continue;
        };

        match method.as_str() {
            METHOD_LIST_TOOLS => {
                if cli.silent_handshake {
                    continue;
                }
                let listed: Vec<serde_json::Value> = tools
                    .iter()
                    .map(|name| {
                        serde_json::json!({
                            "name": name,
                            "description": format!("stub tool {}", name),
                            "inputSchema": {"type": "object"}
                        })
                    })
                    .collect();
                write_line(
                    &stdout,
                    &WireMessage::response(id, serde_json::json!({"tools": listed})),
                )
                .await;
            }
            METHOD_PING => {
                write_line(&stdout, &WireMessage::response(id, serde_json::json!({}))).await;
            }
            tool if tools.iter().any(|t| t == tool) => {
                let seen = calls_seen.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(n) = cli.exit_after {
                    if seen >= n {
                        // Crash mid-call: the request is accepted but never
                        // answered.
                        std::process::exit(1);
                    }
                }

                if cli.disown_tool.as_deref() == Some(tool) {
                    write_line(
                        &stdout,
                        &WireMessage::error_response(
                            id,
                            CODE_TOOL_NOT_FOUND,
                            format!("tool '{}' not served", tool),
                        ),
                    )
                    .await;
                    continue;
                }

                // Answer in a spawned task so a slow call never blocks the
                // read loop; per-request delay_ms lets tests force
                // out-of-order completion.
                let stdout = Arc::clone(&stdout);
                let failing = cli.fail_tool.as_deref() == Some(tool);
                let tool = tool.to_string();
                let delay = cli.delay_ms
                    + params
                        .get("delay_ms")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                tokio::spawn(async move {
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    let reply = if failing {
                        WireMessage::error_response(
                            id,
                            "EXECUTION_ERROR",
                            format!("tool '{}' failed as scripted", tool),
                        )
                    } else {
                        WireMessage::response(
                            id,
                            serde_json::json!({"tool": tool, "params": params}),
                        )
                    };
                    write_line(&stdout, &reply).await;
                });
            }
            _ => {
                write_line(
                    &stdout,
                    &WireMessage::error_response(
                        id,
                        CODE_TOOL_NOT_FOUND,
                        format!("unknown method '{}'", method),
                    ),
                )
                .await;
            }
        }
    }
}

async fn write_line(stdout: &Arc<Mutex<Stdout>>, msg: &WireMessage) {
    let Ok(line) = protocol::encode(msg) else {
        return;
    };
    let mut out = stdout.lock().await;
    if out.write_all(line.as_bytes()).await.is_err() {
        std::process::exit(0);
    }
    let _ = out.flush().await;
}
