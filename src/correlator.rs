// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Request correlation for a single transport.
//!
//! Tracks in-flight requests by id, routing each response (or timeout, or
//! transport failure) to the oneshot channel of the caller that issued it.
//! Every pending request resolves exactly once: resolution is remove-based,
//! so the race between the read loop, the expiry sweep, and transport
//! failure is benign. Whichever path removes the entry first wins; the
//! others are no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};

use crate::error::{DispatchError, DispatchResult};

/// One in-flight request.
struct PendingRequest {
    /// Channel to the waiting caller.
    tx: oneshot::Sender<DispatchResult<serde_json::Value>>,
    /// When this request expires.
    deadline: Instant,
    /// Original timeout, for the rejection error.
    timeout_ms: u64,
}

/// Tracks pending requests for one transport.
///
/// Ids are a monotonic counter scoped to this correlator; global uniqueness
/// is not required.
pub struct RequestCorrelator {
    /// Pending requests by id.
    pending: Mutex<HashMap<String, PendingRequest>>,
    /// Request id counter.
    next_id: AtomicU64,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Issue the next request id.
    pub fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Register a pending request and return the receiver for its outcome.
    ///
    /// Registering an id that is already outstanding is a programming error
    /// and fails fast.
    pub async fn register(
        &self,
        id: impl Into<String>,
        timeout: Duration,
    ) -> DispatchResult<oneshot::Receiver<DispatchResult<serde_json::Value>>> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;

        if pending.contains_key(&id) {
            return Err(DispatchError::DuplicateRequestId { id });
        }

        pending.insert(
            id,
            PendingRequest {
                tx,
                deadline: Instant::now() + timeout,
                timeout_ms: timeout.as_millis() as u64,
            },
        );
        Ok(rx)
    }

    /// Resolve a pending request with a result value.
    ///
    /// Returns `false` if no request with this id is pending (late response
    /// after a timeout already fired, or an id the transport never issued).
    pub async fn resolve(&self, id: &str, value: serde_json::Value) -> bool {
        match self.pending.lock().await.remove(id) {
            Some(entry) => {
                let _ = entry.tx.send(Ok(value));
                true
            }
            None => false,
        }
    }

    /// Reject a pending request with an error.
    pub async fn reject(&self, id: &str, error: DispatchError) -> bool {
        match self.pending.lock().await.remove(id) {
            Some(entry) => {
                let _ = entry.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop a pending request without resolving it.
    ///
    /// Used when the sender fails before the request is actually on the
    /// wire; the caller reports the failure directly.
    pub async fn discard(&self, id: &str) {
        self.pending.lock().await.remove(id);
    }

    /// Sweep requests past their deadline, rejecting each with a timeout.
    ///
    /// Returns the ids that expired.
    pub async fn expire(&self, now: Instant) -> Vec<String> {
        let mut pending = self.pending.lock().await;
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = pending.remove(id) {
                let _ = entry.tx.send(Err(DispatchError::Timeout {
                    timeout_ms: entry.timeout_ms,
                }));
            }
        }
        expired
    }

    /// Reject every pending request. Called on transport loss.
    pub async fn fail_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> DispatchError,
    {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        for (_, entry) in pending.drain() {
            let _ = entry.tx.send(Err(make_error()));
        }
        count
    }

    /// Number of requests currently in flight.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
