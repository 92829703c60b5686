// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Periodic provider health polling.
//!
//! The monitor is a sensor: it probes every registered provider on an
//! interval and caches the snapshots for [`ToolRegistry::get_all_provider_health`].
//! It never mutates registry state; demotion and respawn decisions belong to
//! the dispatch path.
//!
//! [`ToolRegistry::get_all_provider_health`]: crate::registry::ToolRegistry::get_all_provider_health

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::registry::RegistryInner;
use crate::types::HealthSnapshot;

/// Polls provider health in the background and caches the latest snapshots.
pub struct HealthMonitor {
    snapshots: Arc<RwLock<HashMap<String, HealthSnapshot>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Start polling the given registry state.
    pub(crate) fn start(
        inner: Arc<RwLock<RegistryInner>>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let snapshots = Arc::new(RwLock::new(HashMap::new()));
        let cache = Arc::clone(&snapshots);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so providers have a
            // chance to register before the first poll.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let providers = inner.read().await.provider_handles();
                if providers.is_empty() {
                    continue;
                }
                debug!(providers = providers.len(), "Polling provider health");

                let mut probes = JoinSet::new();
                for (id, provider) in providers {
                    probes.spawn(async move {
                        match tokio::time::timeout(probe_timeout, provider.health()).await {
                            Ok(snapshot) => snapshot,
                            Err(_) => {
                                warn!(provider = %id, "Health probe timed out");
                                HealthSnapshot::unhealthy(&id, "health probe timed out")
                            }
                        }
                    });
                }

                let mut fresh = HashMap::new();
                while let Some(result) = probes.join_next().await {
                    if let Ok(snapshot) = result {
                        fresh.insert(snapshot.provider_id.clone(), snapshot);
                    }
                }
                *cache.write().await = fresh;
            }
        });

        Self {
            snapshots,
            task: Mutex::new(Some(task)),
        }
    }

    /// Latest snapshots, sorted by provider id. May be empty before the
    /// first poll completes.
    pub async fn snapshots(&self) -> Vec<HealthSnapshot> {
        let mut snapshots: Vec<HealthSnapshot> =
            self.snapshots.read().await.values().cloned().collect();
        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }

    /// Stop polling. Idempotent.
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}
