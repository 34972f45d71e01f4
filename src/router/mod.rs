// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Endpoint router.
//!
//! Spreads LLM traffic from the manager and worker slot reservations across
//! a pool of endpoints by weighted round robin. Endpoints that fail a request
//! or a health probe leave the rotation until a probe succeeds again. When
//! nothing is available a request waits in a FIFO queue that is drained
//! whenever capacity frees up or health changes. The same moments are
//! published on a capacity channel so worker scheduling can retry too.
//!
//! ```rust,ignore
//! let router = Arc::new(Router::from_config(&config)?);
//! router.start_health_checks(config.health_check_interval).await;
//! let response = router.complete(&request).await?;
//! ```

mod endpoint;
mod health;

pub use endpoint::{select, Endpoint};

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{EndpointConfig, ResolvedConfig};
use crate::error::RouterError;
use crate::providers::create_provider;
use crate::types::{CompletionRequest, ProviderResponse, SharedProvider, StreamEvent};

/// Reservation of endpoint capacity for one running worker.
///
/// Not `Clone`: releasing consumes the token, so a slot cannot be released
/// twice.
#[derive(Debug)]
pub struct WorkerSlot {
    endpoint: usize,
    name: String,
    url: String,
    api_key: Option<String>,
}

impl WorkerSlot {
    pub fn endpoint_name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }
}

struct RouterState {
    endpoints: Vec<Endpoint>,
    waiters: VecDeque<oneshot::Sender<usize>>,
}

impl RouterState {
    /// Hand free capacity to queued requests in arrival order.
    fn drain(&mut self) {
        loop {
            while self.waiters.front().is_some_and(|tx| tx.is_closed()) {
                self.waiters.pop_front();
            }
            if self.waiters.is_empty() {
                return;
            }
            let Some(index) = select(&mut self.endpoints) else {
                return;
            };
            self.endpoints[index].current_requests += 1;
            if let Some(tx) = self.waiters.pop_front() {
                if tx.send(index).is_err() {
                    self.endpoints[index].current_requests -= 1;
                }
            }
        }
    }
}

/// Weighted, health-aware endpoint pool.
pub struct Router {
    providers: Vec<SharedProvider>,
    state: Mutex<RouterState>,
    health_timeout: Duration,
    health_task: Mutex<Option<JoinHandle<()>>>,
    capacity: watch::Sender<u64>,
}

impl Router {
    /// Create a router over already constructed providers, one per endpoint.
    pub fn new(endpoints: Vec<(EndpointConfig, SharedProvider)>, health_timeout: Duration) -> Self {
        let (configs, providers): (Vec<_>, Vec<_>) = endpoints.into_iter().unzip();
        Self {
            providers,
            state: Mutex::new(RouterState {
                endpoints: configs.iter().map(Endpoint::from_config).collect(),
                waiters: VecDeque::new(),
            }),
            health_timeout,
            health_task: Mutex::new(None),
            capacity: watch::channel(0).0,
        }
    }

    /// Create a router with an Anthropic provider for every configured endpoint.
    pub fn from_config(config: &ResolvedConfig) -> Result<Self, RouterError> {
        if config.endpoints.is_empty() {
            return Err(RouterError::NoEndpointsConfigured);
        }
        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        for endpoint in &config.endpoints {
            let provider = create_provider(endpoint, &config.model, config.health_timeout)
                .map_err(|source| RouterError::Endpoint {
                    endpoint: endpoint.name.clone(),
                    source,
                })?;
            endpoints.push((endpoint.clone(), provider));
        }
        Ok(Self::new(endpoints, config.health_timeout))
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        // A poisoned lock only means a panic elsewhere; the counters are still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send a completion request, waiting in line if no endpoint is free.
    ///
    /// A failed call marks its endpoint unhealthy. There is no retry on
    /// another endpoint.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<ProviderResponse, RouterError> {
        let index = self.acquire().await?;
        let _in_flight = InFlight { router: self, index };
        let provider = &self.providers[index];
        debug!(endpoint = provider.name(), "Routing completion");

        provider.complete(request).await.map_err(|source| {
            self.mark_unhealthy(index, &source.to_string());
            RouterError::Endpoint {
                endpoint: provider.name().to_string(),
                source,
            }
        })
    }

    /// Stream a completion. Fails at once when no endpoint is free.
    pub async fn stream(
        &self,
        request: &CompletionRequest,
        on_event: Box<dyn Fn(StreamEvent) + Send + Sync>,
    ) -> Result<ProviderResponse, RouterError> {
        let index = {
            let mut state = self.lock();
            if state.endpoints.is_empty() {
                return Err(RouterError::NoEndpointsConfigured);
            }
            let index = select(&mut state.endpoints).ok_or(RouterError::NoEndpointsAvailable)?;
            state.endpoints[index].current_requests += 1;
            index
        };
        let _in_flight = InFlight { router: self, index };
        let provider = &self.providers[index];

        provider.stream(request, on_event).await.map_err(|source| {
            self.mark_unhealthy(index, &source.to_string());
            RouterError::Endpoint {
                endpoint: provider.name().to_string(),
                source,
            }
        })
    }

    async fn acquire(&self) -> Result<usize, RouterError> {
        let rx = {
            let mut state = self.lock();
            if state.endpoints.is_empty() {
                return Err(RouterError::NoEndpointsConfigured);
            }
            if let Some(index) = select(&mut state.endpoints) {
                state.endpoints[index].current_requests += 1;
                return Ok(index);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            debug!(queued = state.waiters.len(), "No endpoint free, request queued");
            rx
        };

        let mut waiting = Waiting {
            router: self,
            rx,
            received: false,
        };
        let index = (&mut waiting.rx).await.map_err(|_| RouterError::QueueClosed)?;
        waiting.received = true;
        Ok(index)
    }

    fn finish_request(&self, index: usize) {
        let mut state = self.lock();
        let endpoint = &mut state.endpoints[index];
        endpoint.current_requests = endpoint.current_requests.saturating_sub(1);
        state.drain();
        drop(state);
        self.capacity_freed();
    }

    /// Count of capacity changes, bumped when a request finishes, a worker
    /// slot is released or an endpoint recovers.
    pub fn subscribe_capacity(&self) -> watch::Receiver<u64> {
        self.capacity.subscribe()
    }

    fn capacity_freed(&self) {
        self.capacity.send_modify(|generation| *generation += 1);
    }

    fn mark_unhealthy(&self, index: usize, reason: &str) {
        let mut state = self.lock();
        let endpoint = &mut state.endpoints[index];
        if endpoint.healthy {
            warn!(endpoint = %endpoint.name, reason, "Endpoint marked unhealthy");
        }
        endpoint.healthy = false;
    }

    /// Reserve capacity on an available endpoint for a worker.
    pub fn reserve_worker_slot(&self) -> Option<WorkerSlot> {
        let mut state = self.lock();
        let index = select(&mut state.endpoints)?;
        let endpoint = &mut state.endpoints[index];
        endpoint.reserved_slots += 1;
        debug!(endpoint = %endpoint.name, reserved = endpoint.reserved_slots, "Worker slot reserved");
        Some(WorkerSlot {
            endpoint: index,
            name: endpoint.name.clone(),
            url: endpoint.url.clone(),
            api_key: endpoint.api_key.clone(),
        })
    }

    /// Return a worker slot and let queued requests use the capacity.
    pub fn release_worker_slot(&self, slot: WorkerSlot) {
        let mut state = self.lock();
        if let Some(endpoint) = state.endpoints.get_mut(slot.endpoint) {
            endpoint.reserved_slots = endpoint.reserved_slots.saturating_sub(1);
            debug!(endpoint = %endpoint.name, reserved = endpoint.reserved_slots, "Worker slot released");
        }
        state.drain();
        drop(state);
        self.capacity_freed();
    }

    /// Copy of every endpoint's current state.
    pub fn snapshot(&self) -> Vec<Endpoint> {
        self.lock().endpoints.clone()
    }

    pub fn healthy_count(&self) -> usize {
        self.lock().endpoints.iter().filter(|e| e.healthy).count()
    }

    /// Number of requests waiting for an endpoint.
    pub fn queued_requests(&self) -> usize {
        self.lock().waiters.iter().filter(|tx| !tx.is_closed()).count()
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.stop_health_checks();
    }
}

/// Decrements the in-flight count when a call finishes or is cancelled.
struct InFlight<'a> {
    router: &'a Router,
    index: usize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.router.finish_request(self.index);
    }
}

/// A queued request. If dropped after an endpoint was handed over but before
/// it was received, the in-flight count is given back.
struct Waiting<'a> {
    router: &'a Router,
    rx: oneshot::Receiver<usize>,
    received: bool,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if self.received {
            return;
        }
        self.rx.close();
        if let Ok(index) = self.rx.try_recv() {
            self.router.finish_request(index);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::types::{Message, Provider};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    /// Provider whose calls block on a semaphore and whose health is switchable.
    pub(crate) struct GatedProvider {
        pub name: String,
        pub gate: Arc<Semaphore>,
        pub healthy: AtomicBool,
        pub fail: AtomicBool,
        pub calls: AtomicUsize,
    }

    impl GatedProvider {
        pub(crate) fn open(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
                healthy: AtomicBool::new(true),
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn closed(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                gate: Arc::new(Semaphore::new(0)),
                healthy: AtomicBool::new(true),
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for GatedProvider {
        async fn complete(&self, _request: &CompletionRequest) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.map_err(|e| ProviderError::NetworkError(e.to_string()))?;
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProviderError::NetworkError("connection reset".to_string()));
            }
            Ok(ProviderResponse::text(format!("from {}", self.name)))
        }

        async fn stream(
            &self,
            request: &CompletionRequest,
            on_event: Box<dyn Fn(StreamEvent) + Send + Sync>,
        ) -> Result<ProviderResponse, ProviderError> {
            let response = self.complete(request).await?;
            on_event(StreamEvent::TextDelta(format!("from {}", self.name)));
            Ok(response)
        }

        async fn health_check(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    pub(crate) fn router_with(providers: &[(Arc<GatedProvider>, u32, Option<usize>)]) -> Router {
        let endpoints = providers
            .iter()
            .map(|(p, weight, max)| {
                let mut config = EndpointConfig::new(p.name.clone(), format!("http://{}", p.name)).with_weight(*weight);
                config.max_concurrent = *max;
                (config, Arc::clone(p) as SharedProvider)
            })
            .collect();
        Router::new(endpoints, Duration::from_millis(200))
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![Message::user("hi")])
    }

    fn text(response: &ProviderResponse) -> String {
        response.text_segments().concat()
    }

    #[tokio::test]
    async fn test_complete_follows_weights() {
        let a = GatedProvider::open("A");
        let b = GatedProvider::open("B");
        let router = router_with(&[(a, 3, None), (b, 1, None)]);

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(text(&router.complete(&request()).await.unwrap()));
        }
        assert_eq!(seen, vec!["from A", "from A", "from A", "from B"]);
        assert_eq!(router.snapshot()[0].current_requests, 0);
    }

    #[tokio::test]
    async fn test_no_endpoints_configured() {
        let router = Router::new(Vec::new(), Duration::from_secs(1));
        assert!(matches!(
            router.complete(&request()).await,
            Err(RouterError::NoEndpointsConfigured)
        ));
    }

    #[tokio::test]
    async fn test_requests_queue_fifo_when_saturated() {
        let a = GatedProvider::closed("A");
        let router = Arc::new(router_with(&[(Arc::clone(&a), 1, Some(1))]));

        let first = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.complete(&request()).await })
        };
        while a.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.complete(&request()).await })
        };
        while router.queued_requests() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(router.snapshot()[0].current_requests, 1);

        a.gate.add_permits(2);
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(router.queued_requests(), 0);
        assert_eq!(router.snapshot()[0].current_requests, 0);
    }

    #[tokio::test]
    async fn test_stream_fails_fast_when_saturated() {
        let a = GatedProvider::open("A");
        let router = router_with(&[(a, 1, Some(1))]);
        let slot = router.reserve_worker_slot().unwrap();

        let result = router.stream(&request(), Box::new(|_| {})).await;
        assert!(matches!(result, Err(RouterError::NoEndpointsAvailable)));

        router.release_worker_slot(slot);
        assert!(router.stream(&request(), Box::new(|_| {})).await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_marks_endpoint_unhealthy() {
        let a = GatedProvider::open("A");
        a.fail.store(true, Ordering::SeqCst);
        let b = GatedProvider::open("B");
        let router = router_with(&[(Arc::clone(&a), 1, None), (b, 1, None)]);

        let err = router.complete(&request()).await.unwrap_err();
        assert!(matches!(err, RouterError::Endpoint { ref endpoint, .. } if endpoint == "A"));
        assert!(!router.snapshot()[0].healthy);

        // Only B remains in rotation.
        for _ in 0..3 {
            assert_eq!(text(&router.complete(&request()).await.unwrap()), "from B");
        }
    }

    #[tokio::test]
    async fn test_worker_slots_count_against_capacity() {
        let a = GatedProvider::open("A");
        let router = router_with(&[(a, 1, Some(2))]);

        let s1 = router.reserve_worker_slot().unwrap();
        let s2 = router.reserve_worker_slot().unwrap();
        assert_eq!(s1.endpoint_name(), "A");
        assert_eq!(s2.url(), "http://A");
        assert!(router.reserve_worker_slot().is_none());
        assert_eq!(router.snapshot()[0].reserved_slots, 2);

        router.release_worker_slot(s1);
        router.release_worker_slot(s2);
        assert_eq!(router.snapshot()[0].reserved_slots, 0);
    }

    #[tokio::test]
    async fn test_released_slot_signals_capacity() {
        let a = GatedProvider::open("A");
        let router = router_with(&[(a, 1, Some(1))]);
        let mut capacity = router.subscribe_capacity();

        let slot = router.reserve_worker_slot().unwrap();
        assert!(!capacity.has_changed().unwrap());

        router.release_worker_slot(slot);
        assert!(capacity.has_changed().unwrap());
        capacity.borrow_and_update();

        router.complete(&request()).await.unwrap();
        assert!(capacity.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_skipped() {
        let a = GatedProvider::open("A");
        let router = Arc::new(router_with(&[(a, 1, Some(1))]));
        let slot = router.reserve_worker_slot().unwrap();

        let abandoned = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.complete(&request()).await })
        };
        while router.queued_requests() == 0 {
            tokio::task::yield_now().await;
        }
        abandoned.abort();
        let _ = abandoned.await;

        router.release_worker_slot(slot);
        assert_eq!(router.snapshot()[0].current_requests, 0);
        assert!(router.complete(&request()).await.is_ok());
    }
}
