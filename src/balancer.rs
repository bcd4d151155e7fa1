//! Round-robin load balancing across healthy backends.

use crate::backend::Backend;
use futures_util::future::join_all;
use metrics::gauge;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Returned when no healthy backend can serve a request.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("no healthy backends available")]
pub struct NoBackends;

/// Round-robin balancer over the current backend set.
///
/// The backend list is replaced wholesale by the fleet manager and sorted by
/// instance id so iteration order is stable across publishes. The round-robin
/// counter and the global in-flight counter are atomics; selection takes a
/// fresh healthy snapshot under the read lock on every pick.
#[derive(Default)]
pub struct Balancer {
    backends: RwLock<Vec<Arc<Backend>>>,
    counter: AtomicU64,
    active: AtomicI64,
}

impl Balancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the backend set. Input order does not matter; the list is
    /// installed sorted ascending by instance id.
    pub fn set_backends(&self, mut backends: Vec<Arc<Backend>>) {
        backends.sort_by_key(|b| b.id());
        let mut guard = self.backends.write().unwrap();
        *guard = backends;
        gauge!("vastmux_backends_total").set(guard.len() as f64);
    }

    /// Select the next healthy backend round-robin. The healthy snapshot is
    /// taken fresh inside the read-locked section, so a backend going
    /// unhealthy is excluded from the very next pick.
    pub fn pick(&self) -> Result<Arc<Backend>, NoBackends> {
        let backends = self.backends.read().unwrap();
        let healthy: Vec<&Arc<Backend>> =
            backends.iter().filter(|b| b.is_healthy()).collect();
        if healthy.is_empty() {
            return Err(NoBackends);
        }
        let idx = self.counter.fetch_add(1, Ordering::SeqCst);
        let pick = healthy[(idx % healthy.len() as u64) as usize];
        trace!(
            instance = pick.id(),
            counter = idx,
            healthy = healthy.len(),
            total = backends.len(),
            "picked backend"
        );
        Ok(Arc::clone(pick))
    }

    /// Select a specific backend by instance id. An unknown or unhealthy id
    /// is a miss.
    pub fn pick_by_id(&self, id: u64) -> Result<Arc<Backend>, NoBackends> {
        let backends = self.backends.read().unwrap();
        backends
            .iter()
            .find(|b| b.id() == id && b.is_healthy())
            .cloned()
            .ok_or(NoBackends)
    }

    pub fn healthy_count(&self) -> usize {
        self.backends
            .read()
            .unwrap()
            .iter()
            .filter(|b| b.is_healthy())
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.backends.read().unwrap().len()
    }

    /// Increment the process-wide in-flight counter; returns the new value.
    pub fn acquire(&self) -> i64 {
        let n = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("vastmux_active_requests").set(n as f64);
        n
    }

    /// Decrement the process-wide in-flight counter; returns the new value.
    /// A return of 0 means the last client departed.
    pub fn release(&self) -> i64 {
        let n = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        gauge!("vastmux_active_requests").set(n as f64);
        n
    }

    pub fn active_requests(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether any backend's engine supports server-side abort.
    pub fn has_abort_support(&self) -> bool {
        self.backends
            .read()
            .unwrap()
            .iter()
            .any(|b| b.engine().supports_abort())
    }

    /// Fan out an abort to every healthy backend whose engine supports it.
    /// Errors are logged, never surfaced.
    pub async fn abort_all(&self) {
        let snapshot: Vec<Arc<Backend>> = self.backends.read().unwrap().clone();
        let targets: Vec<Arc<Backend>> = snapshot
            .into_iter()
            .filter(|b| b.is_healthy() && b.engine().supports_abort())
            .collect();
        if targets.is_empty() {
            return;
        }
        debug!(backends = targets.len(), "aborting in-flight inference");
        join_all(targets.iter().map(|backend| async move {
            if let Err(e) = backend.abort_all().await {
                warn!(instance = backend.id(), error = %e, "abort failed");
            }
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;
    use serde_json::json;

    fn backend(id: u64, healthy: bool) -> Arc<Backend> {
        let record = serde_json::from_value(json!({
            "id": id,
            "actual_status": "running",
        }))
        .unwrap();
        let backend = Backend::new(Instance::from_record(&record));
        backend.set_healthy(healthy);
        Arc::new(backend)
    }

    #[test]
    fn pick_on_empty_set_returns_no_backends() {
        let balancer = Balancer::new();
        assert_eq!(balancer.pick().unwrap_err(), NoBackends);
        assert_eq!(balancer.pick_by_id(1).unwrap_err(), NoBackends);
    }

    #[test]
    fn round_robin_is_fair_and_sorted_by_id() {
        let balancer = Balancer::new();
        // Register out of order; iteration must be ascending by id.
        balancer.set_backends(vec![backend(3, true), backend(1, true), backend(2, true)]);

        let picks: Vec<u64> = (0..9).map(|_| balancer.pick().unwrap().id()).collect();
        assert_eq!(&picks[..3], &[1, 2, 3]);
        for id in 1..=3u64 {
            assert_eq!(picks.iter().filter(|p| **p == id).count(), 3);
        }
    }

    #[test]
    fn unhealthy_backends_are_skipped_immediately() {
        let balancer = Balancer::new();
        let b1 = backend(1, true);
        let b2 = backend(2, true);
        balancer.set_backends(vec![Arc::clone(&b1), Arc::clone(&b2)]);

        b2.set_healthy(false);
        for _ in 0..4 {
            assert_eq!(balancer.pick().unwrap().id(), 1);
        }

        // Recovery puts it back at its sorted position.
        b2.set_healthy(true);
        let picks: Vec<u64> = (0..4).map(|_| balancer.pick().unwrap().id()).collect();
        assert!(picks.contains(&2));
    }

    #[test]
    fn pick_by_id_misses_on_unhealthy() {
        let balancer = Balancer::new();
        let b1 = backend(1, true);
        balancer.set_backends(vec![Arc::clone(&b1), backend(2, false)]);

        assert_eq!(balancer.pick_by_id(1).unwrap().id(), 1);
        assert_eq!(balancer.pick_by_id(2).unwrap_err(), NoBackends);
        assert_eq!(balancer.pick_by_id(999).unwrap_err(), NoBackends);
    }

    #[test]
    fn set_backends_is_idempotent() {
        let balancer = Balancer::new();
        let list = vec![backend(1, true), backend(2, true)];
        balancer.set_backends(list.clone());
        balancer.set_backends(list);
        assert_eq!(balancer.total_count(), 2);
        assert_eq!(balancer.healthy_count(), 2);
        assert_eq!(balancer.pick().unwrap().id(), 1);
    }

    #[test]
    fn acquire_release_reports_last_departure() {
        let balancer = Balancer::new();
        assert_eq!(balancer.acquire(), 1);
        assert_eq!(balancer.acquire(), 2);
        assert_eq!(balancer.release(), 1);
        assert_eq!(balancer.release(), 0);
    }

    #[test]
    fn abort_support_depends_on_engine_kind() {
        let balancer = Balancer::new();
        let record = serde_json::from_value(json!({
            "id": 1,
            "actual_status": "running",
            "extra_env": {"SGLANG_ARGS": "--port 30000"},
        }))
        .unwrap();
        let sglang = Arc::new(Backend::new(Instance::from_record(&record)));
        balancer.set_backends(vec![backend(2, true)]);
        assert!(!balancer.has_abort_support());
        balancer.set_backends(vec![sglang, backend(2, true)]);
        assert!(balancer.has_abort_support());
    }
}
