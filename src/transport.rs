// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process transport: one child process per provider.
//!
//! A transport owns exactly one backend process for the lifetime of one
//! provider. Requests from many concurrent callers are multiplexed over the
//! process's stdio pair: writes are serialized under a single writer lock so
//! frames never interleave, and a background read loop demultiplexes
//! responses back to their callers by correlation id.
//!
//! Process exit, a broken pipe, or a failed handshake all surface as
//! transport failures. The transport never respawns itself; that is a
//! registry-level policy decision.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ProviderSpec, RegistryConfig};
use crate::correlator::RequestCorrelator;
use crate::error::{DispatchError, DispatchResult};
use crate::protocol::{self, WireMessage, METHOD_LIST_TOOLS, METHOD_PING};
use crate::types::{ProviderState, ToolDescriptor};

/// Transport to one backend process over newline-delimited JSON stdio.
pub struct ProcessTransport {
    /// Launch spec for the backend.
    spec: ProviderSpec,
    /// Timeout and sweep tuning.
    config: RegistryConfig,
    /// The child process, present while running.
    child: Mutex<Option<Child>>,
    /// Writer half. Single writer lock; also the graceful-stop signal,
    /// since backends exit when stdin closes.
    stdin: Mutex<Option<ChildStdin>>,
    /// Pending-request table for this transport.
    correlator: Arc<RequestCorrelator>,
    /// Shared lifecycle state.
    state: Arc<RwLock<ProviderState>>,
    /// Reader and sweeper task handles.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessTransport {
    /// Create a transport for the given launch spec. Does not spawn.
    pub fn new(spec: ProviderSpec, config: RegistryConfig) -> Self {
        Self {
            spec,
            config,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            correlator: Arc::new(RequestCorrelator::new()),
            state: Arc::new(RwLock::new(ProviderState::Stopped)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The provider id this transport serves.
    pub fn provider_id(&self) -> &str {
        &self.spec.id
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ProviderState {
        *self.state.read().await
    }

    /// Number of requests currently in flight on this transport.
    pub async fn pending_count(&self) -> usize {
        self.correlator.pending_count().await
    }

    /// Spawn the backend, start the read loop, and run the handshake.
    ///
    /// Returns the tool catalog the backend advertised. On any failure the
    /// transport ends up in the `failed` state.
    pub async fn start(&self) -> DispatchResult<Vec<ToolDescriptor>> {
        self.reset().await;
        *self.state.write().await = ProviderState::Starting;

        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        for (key, value) in &self.spec.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &self.spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                *self.state.write().await = ProviderState::Failed;
                return Err(DispatchError::spawn_failed(&self.spec.id, e.to_string()));
            }
        };

        let stdin = child.stdin.take().ok_or_else(|| {
            DispatchError::spawn_failed(&self.spec.id, "failed to capture stdin")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            DispatchError::spawn_failed(&self.spec.id, "failed to capture stdout")
        })?;

        *self.child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);

        let reader = tokio::spawn(Self::read_loop(
            self.spec.id.clone(),
            BufReader::new(stdout),
            Arc::clone(&self.correlator),
            Arc::clone(&self.state),
        ));
        let sweeper = tokio::spawn(Self::sweep_loop(
            Arc::clone(&self.correlator),
            Duration::from_millis(self.config.sweep_interval_ms),
        ));
        self.tasks.lock().await.extend([reader, sweeper]);

        // Capability-discovery handshake gates the ready state.
        let start_timeout = Duration::from_millis(self.config.start_timeout_ms);
        match self
            .request(METHOD_LIST_TOOLS, serde_json::json!({}), start_timeout)
            .await
        {
            Ok(result) => {
                let tools = protocol::parse_tool_list(&result, &self.spec.id);
                *self.state.write().await = ProviderState::Ready;
                info!(
                    provider = %self.spec.id,
                    tools = tools.len(),
                    "Transport ready"
                );
                Ok(tools)
            }
            Err(e) => {
                *self.state.write().await = ProviderState::Failed;
                self.kill_process().await;
                Err(DispatchError::handshake_failed(&self.spec.id, e.to_string()))
            }
        }
    }

    /// Send a request and wait for its response.
    ///
    /// The write happens under the writer lock; the wait does not hold any
    /// lock. A deadline miss rejects the pending entry and returns a
    /// timeout; if the response arrives later the read loop discards it.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> DispatchResult<serde_json::Value> {
        let id = self.correlator.next_id();
        let line = protocol::encode(&WireMessage::request(&id, method, params))?;
        let rx = self.correlator.register(&id, timeout).await?;

        {
            let mut guard = self.stdin.lock().await;
            let writer = match guard.as_mut() {
                Some(writer) => writer,
                None => {
                    self.correlator.discard(&id).await;
                    return Err(DispatchError::NotReady {
                        provider: self.spec.id.clone(),
                    });
                }
            };

            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.correlator.discard(&id).await;
                return Err(DispatchError::transport_lost(&self.spec.id, e.to_string()));
            }
            if let Err(e) = writer.flush().await {
                self.correlator.discard(&id).await;
                return Err(DispatchError::transport_lost(&self.spec.id, e.to_string()));
            }
        }

        let timeout_ms = timeout.as_millis() as u64;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => match outcome {
                Ok(value) => Ok(value),
                Err(DispatchError::Execution { code, message })
                    if code == protocol::CODE_TOOL_NOT_FOUND
                        || code == protocol::CODE_METHOD_NOT_FOUND =>
                {
                    debug!(provider = %self.spec.id, method, %message, "Backend disowned method");
                    Err(DispatchError::ToolNotFound {
                        provider: self.spec.id.clone(),
                        tool: method.to_string(),
                    })
                }
                Err(e) => Err(e),
            },
            Ok(Err(_closed)) => Err(DispatchError::transport_lost(
                &self.spec.id,
                "response channel closed",
            )),
            Err(_elapsed) => {
                self.correlator
                    .reject(&id, DispatchError::Timeout { timeout_ms })
                    .await;
                Err(DispatchError::Timeout { timeout_ms })
            }
        }
    }

    /// Probe the backend and return round-trip latency in milliseconds.
    ///
    /// Any answer counts, including an error response: a backend that does
    /// not implement `ping` but replies is still alive.
    pub async fn ping(&self, timeout: Duration) -> DispatchResult<u64> {
        let started = Instant::now();
        match self.request(METHOD_PING, serde_json::json!({}), timeout).await {
            Ok(_)
            | Err(DispatchError::Execution { .. })
            | Err(DispatchError::ToolNotFound { .. }) => {
                Ok(started.elapsed().as_millis() as u64)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the backend: close stdin, wait the grace period, then kill.
    pub async fn stop(&self) {
        *self.state.write().await = ProviderState::Stopped;

        // Closing stdin is the graceful-shutdown signal; backends exit on EOF.
        *self.stdin.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            let grace = Duration::from_millis(self.config.stop_grace_ms);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => {
                    debug!(provider = %self.spec.id, "Backend exited within grace period");
                }
                Err(_) => {
                    warn!(provider = %self.spec.id, "Backend ignored stdin close, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        let failed = self
            .correlator
            .fail_all(|| DispatchError::transport_lost(&self.spec.id, "transport stopped"))
            .await;
        if failed > 0 {
            debug!(provider = %self.spec.id, count = failed, "Failed pending requests on stop");
        }
    }

    /// Tear down any previous process before a (re)start.
    async fn reset(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        *self.stdin.lock().await = None;
        self.kill_process().await;
        self.correlator
            .fail_all(|| DispatchError::transport_lost(&self.spec.id, "transport restarting"))
            .await;
    }

    async fn kill_process(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// Read loop: decode each stdout line and route it by correlation id.
    async fn read_loop(
        provider_id: String,
        mut reader: BufReader<ChildStdout>,
        correlator: Arc<RequestCorrelator>,
        state: Arc<RwLock<ProviderState>>,
    ) {
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    match protocol::decode(trimmed) {
                        Ok(WireMessage::Response { id, result }) => {
                            if !correlator.resolve(&id, result).await {
                                debug!(
                                    provider = %provider_id,
                                    request_id = %id,
                                    "Discarding response with no pending request"
                                );
                            }
                        }
                        Ok(WireMessage::ErrorResponse { id, error }) => {
                            if !correlator
                                .reject(
                                    &id,
                                    DispatchError::execution(&error.code, &error.message),
                                )
                                .await
                            {
                                debug!(
                                    provider = %provider_id,
                                    request_id = %id,
                                    "Discarding error response with no pending request"
                                );
                            }
                        }
                        Ok(WireMessage::Request { method, .. }) => {
                            warn!(
                                provider = %provider_id,
                                method,
                                "Ignoring unexpected request from backend"
                            );
                        }
                        Err(e) => {
                            // One bad line must not poison the stream.
                            warn!(provider = %provider_id, error = %e, "Dropping malformed line");
                        }
                    }
                }
                Err(e) => {
                    warn!(provider = %provider_id, error = %e, "Read loop error");
                    break;
                }
            }
        }

        // Process exit or broken pipe. A graceful stop already moved the
        // state to stopped; anything else is a transport failure.
        let mut state = state.write().await;
        if *state != ProviderState::Stopped {
            *state = ProviderState::Failed;
            drop(state);
            let failed = correlator
                .fail_all(|| DispatchError::transport_lost(&provider_id, "process exited"))
                .await;
            warn!(
                provider = %provider_id,
                in_flight = failed,
                "Backend process exited"
            );
        }
    }

    /// Periodic expiry sweep for pending requests.
    async fn sweep_loop(correlator: Arc<RequestCorrelator>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = correlator.expire(Instant::now()).await;
            if !expired.is_empty() {
                debug!(count = expired.len(), "Expired pending requests");
            }
        }
    }
}
