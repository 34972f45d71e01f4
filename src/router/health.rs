// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Periodic endpoint health probes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::Router;

impl Router {
    /// Probe every endpoint concurrently and apply the results.
    ///
    /// A probe that errors or outlives the health timeout marks only its own
    /// endpoint unhealthy. Returns the number of endpoints whose health
    /// changed; any change drains the wait queue, and a recovery is
    /// published to capacity subscribers.
    pub async fn check_health(&self) -> usize {
        let mut probes = JoinSet::new();
        for (index, provider) in self.providers.iter().enumerate() {
            let provider = Arc::clone(provider);
            let timeout = self.health_timeout;
            probes.spawn(async move {
                let healthy = tokio::time::timeout(timeout, provider.health_check())
                    .await
                    .unwrap_or(false);
                (index, healthy)
            });
        }

        let mut results = Vec::with_capacity(self.providers.len());
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "Health probe task failed"),
            }
        }

        let mut state = self.lock();
        let now = Utc::now();
        let mut flips = 0;
        let mut recovered = false;
        for (index, healthy) in results {
            let endpoint = &mut state.endpoints[index];
            endpoint.last_check = Some(now);
            if endpoint.healthy != healthy {
                flips += 1;
                if healthy {
                    recovered = true;
                    info!(endpoint = %endpoint.name, "Endpoint recovered");
                } else {
                    warn!(endpoint = %endpoint.name, "Endpoint failed health check");
                }
            }
            endpoint.healthy = healthy;
        }
        if flips > 0 {
            state.drain();
        }
        drop(state);
        if recovered {
            self.capacity_freed();
        }
        debug!(flips, "Health sweep finished");
        flips
    }

    /// Run one sweep now, then keep sweeping every `interval` in the background.
    pub async fn start_health_checks(self: &Arc<Self>, interval: Duration) {
        self.check_health().await;

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(router) = weak.upgrade() else {
                    break;
                };
                router.check_health().await;
            }
        });

        let mut task = self.health_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the background sweep, if one is running.
    pub fn stop_health_checks(&self) {
        let mut task = self.health_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }
}
