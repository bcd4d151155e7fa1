//! Fleet watcher: polls the control plane and reconciles instance lifecycle.
//!
//! One polling task owns reconciliation. Subscribers get every event in issue
//! order on bounded channels; a full channel drops the event for that
//! subscriber only, so emission never blocks the poll. Subscribers that
//! suspect loss reconcile from [`FleetWatcher::instances`].

use crate::control_plane::ControlPlaneClient;
use crate::instance::{EventKind, Instance, InstanceEvent, InstanceRecord, InstanceState};
use metrics::{counter, gauge};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of each subscriber's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct WatcherInner {
    instances: HashMap<u64, Instance>,
    subscribers: Vec<mpsc::Sender<InstanceEvent>>,
}

/// Polls the control plane and tracks instance lifecycle.
pub struct FleetWatcher {
    client: ControlPlaneClient,
    poll_interval: Duration,
    inner: RwLock<WatcherInner>,
}

impl FleetWatcher {
    pub fn new(client: ControlPlaneClient, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
            inner: RwLock::new(WatcherInner {
                instances: HashMap::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Register a new event sink. Each subscriber gets an independent channel
    /// that sees every event in issue order. Call before [`FleetWatcher::run`].
    pub fn subscribe(&self) -> mpsc::Receiver<InstanceEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.inner.write().unwrap().subscribers.push(tx);
        rx
    }

    /// Snapshot of all tracked instances.
    pub fn instances(&self) -> HashMap<u64, Instance> {
        self.inner.read().unwrap().instances.clone()
    }

    /// Whether an instance is tracked and not on its way out.
    pub fn has_instance(&self, id: u64) -> bool {
        self.inner
            .read()
            .unwrap()
            .instances
            .get(&id)
            .is_some_and(|inst| inst.state != InstanceState::Removing)
    }

    /// Update an instance's lifecycle state. Cross-thread hook for the
    /// lifecycle manager; does not emit an event.
    pub fn set_instance_state(&self, id: u64, state: InstanceState) {
        let mut inner = self.inner.write().unwrap();
        if let Some(inst) = inner.instances.get_mut(&id) {
            inst.state = state;
            inst.state_changed_at = Instant::now();
        }
    }

    /// Record the model name discovered for an instance. Does not emit an event.
    pub fn set_model_name(&self, id: u64, name: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(inst) = inner.instances.get_mut(&id) {
            inst.model_name = name.to_string();
        }
    }

    /// Drop a tracked instance. Called by the lifecycle manager when the
    /// instance's supervisor exits; the poll itself never deletes.
    pub fn remove_instance(&self, id: u64) {
        let mut inner = self.inner.write().unwrap();
        if inner.instances.remove(&id).is_some() {
            debug!(instance = id, "instance dropped from tracking");
        }
    }

    /// Insert an instance directly, bypassing the poll. Used in tests.
    pub fn inject_instance(&self, instance: Instance) {
        self.inner
            .write()
            .unwrap()
            .instances
            .insert(instance.id, instance);
    }

    /// Poll until cancelled. Polls immediately, then at the configured
    /// interval. Poll failures are logged and do not stop the loop.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.poll().await,
            }
        }
    }

    async fn poll(&self) {
        let records = match self.client.list_instances().await {
            Ok(records) => records,
            Err(e) => {
                counter!("vastmux_poll_failures_total").increment(1);
                warn!(error = %e, "control-plane poll failed");
                return;
            }
        };
        debug!(count = records.len(), "control-plane poll");
        self.reconcile(&records);
    }

    /// Reconcile a control-plane listing against local state, emitting
    /// `added`/`updated`/`removed` events. All mutation and emission happens
    /// under the write lock; sinks are non-blocking so this cannot stall.
    pub fn reconcile(&self, records: &[InstanceRecord]) {
        let mut inner = self.inner.write().unwrap();

        let mut seen: HashSet<u64> = HashSet::with_capacity(records.len());
        for record in records {
            if record.actual_status() != "running" {
                debug!(
                    instance = record.id,
                    status = record.actual_status(),
                    "skipping non-running instance"
                );
                continue;
            }
            seen.insert(record.id);

            match inner.instances.get_mut(&record.id) {
                None => {
                    let instance = Instance::from_record(record);
                    info!(
                        instance = instance.id,
                        gpu = %instance.gpu_name,
                        engine = ?instance.engine,
                        container_port = instance.container_port,
                        direct_ssh = instance.direct_ssh_port,
                        ssh = format!("{}:{}", instance.ssh_host, instance.ssh_port),
                        "new instance"
                    );
                    inner.instances.insert(instance.id, instance.clone());
                    emit(
                        &inner.subscribers,
                        InstanceEvent {
                            kind: EventKind::Added,
                            instance,
                        },
                    );
                }
                Some(existing) => {
                    existing.gpu_util = record.gpu_util;
                    existing.gpu_temp = record.gpu_temp;
                    existing.actual_status = record.actual_status().to_string();
                    existing.label = record.label.clone().unwrap_or_default();
                    let snapshot = existing.clone();
                    emit(
                        &inner.subscribers,
                        InstanceEvent {
                            kind: EventKind::Updated,
                            instance: snapshot,
                        },
                    );
                }
            }
        }

        // Anything tracked but absent from the listing is on its way out.
        let removed: Vec<u64> = inner
            .instances
            .iter()
            .filter(|(id, inst)| !seen.contains(id) && inst.state != InstanceState::Removing)
            .map(|(id, _)| *id)
            .collect();
        for id in removed {
            if let Some(inst) = inner.instances.get_mut(&id) {
                inst.state = InstanceState::Removing;
                inst.state_changed_at = Instant::now();
                let snapshot = inst.clone();
                info!(instance = id, "instance removed from control plane");
                emit(
                    &inner.subscribers,
                    InstanceEvent {
                        kind: EventKind::Removed,
                        instance: snapshot,
                    },
                );
            }
        }

        gauge!("vastmux_tracked_instances").set(inner.instances.len() as f64);
    }
}

fn emit(subscribers: &[mpsc::Sender<InstanceEvent>], event: InstanceEvent) {
    for tx in subscribers {
        // Drop on full; subscribers reconcile from instances() if they
        // suspect loss.
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
            counter!("vastmux_events_dropped_total").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn watcher() -> FleetWatcher {
        FleetWatcher::new(ControlPlaneClient::new("test-key"), Duration::from_secs(10))
    }

    fn running(id: u64) -> InstanceRecord {
        serde_json::from_value(json!({
            "id": id,
            "actual_status": "running",
            "gpu_util": 10.0,
            "gpu_temp": 40.0,
        }))
        .unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<InstanceEvent>) -> Vec<(EventKind, u64)> {
        let mut events = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            events.push((evt.kind, evt.instance.id));
        }
        events
    }

    #[tokio::test]
    async fn reconcile_emits_added_updated_removed_in_order() {
        let w = watcher();
        let mut rx = w.subscribe();

        w.reconcile(&[running(1), running(2)]);
        w.reconcile(&[running(1)]);

        assert_eq!(
            drain(&mut rx),
            vec![
                (EventKind::Added, 1),
                (EventKind::Added, 2),
                (EventKind::Updated, 1),
                (EventKind::Removed, 2),
            ]
        );
    }

    #[tokio::test]
    async fn identical_polls_emit_only_updates() {
        let w = watcher();
        let mut rx = w.subscribe();

        w.reconcile(&[running(1), running(2)]);
        drain(&mut rx);

        w.reconcile(&[running(1), running(2)]);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|(kind, _)| *kind == EventKind::Updated));
    }

    #[tokio::test]
    async fn non_running_records_are_filtered() {
        let w = watcher();
        let mut rx = w.subscribe();

        let stopped: InstanceRecord =
            serde_json::from_value(json!({"id": 5, "actual_status": "exited"})).unwrap();
        w.reconcile(&[stopped]);

        assert!(drain(&mut rx).is_empty());
        assert!(w.instances().is_empty());
    }

    #[tokio::test]
    async fn removed_is_emitted_once_and_record_is_kept() {
        let w = watcher();
        let mut rx = w.subscribe();

        w.reconcile(&[running(1)]);
        w.reconcile(&[]);
        w.reconcile(&[]);

        let events = drain(&mut rx);
        let removals = events
            .iter()
            .filter(|(kind, _)| *kind == EventKind::Removed)
            .count();
        assert_eq!(removals, 1);
        // Poll never deletes; the lifecycle manager does.
        assert!(w.instances().contains_key(&1));
        assert!(!w.has_instance(1));
    }

    #[tokio::test]
    async fn updated_refreshes_observational_fields() {
        let w = watcher();
        w.reconcile(&[running(1)]);

        let mut rec = running(1);
        rec.gpu_util = Some(95.0);
        rec.label = Some("claimed".into());
        w.reconcile(&[rec]);

        let inst = &w.instances()[&1];
        assert_eq!(inst.gpu_util, Some(95.0));
        assert_eq!(inst.label, "claimed");
    }

    #[tokio::test]
    async fn set_instance_state_updates_timestamp() {
        let w = watcher();
        w.reconcile(&[running(1)]);
        let before = w.instances()[&1].state_changed_at;

        w.set_instance_state(1, InstanceState::Healthy);
        let inst = &w.instances()[&1];
        assert_eq!(inst.state, InstanceState::Healthy);
        assert!(inst.state_changed_at >= before);
    }

    #[tokio::test]
    async fn set_model_name_and_remove_instance() {
        let w = watcher();
        w.reconcile(&[running(1)]);

        w.set_model_name(1, "llama-70b");
        assert_eq!(w.instances()[&1].model_name, "llama-70b");

        w.remove_instance(1);
        assert!(w.instances().is_empty());
    }

    #[tokio::test]
    async fn full_sink_drops_events_without_blocking() {
        let w = watcher();
        let mut rx = w.subscribe();

        // One more poll than the channel holds; reconcile must not block.
        for _ in 0..(EVENT_CHANNEL_CAPACITY + 8) {
            w.reconcile(&[running(1)]);
        }
        let events = drain(&mut rx);
        assert_eq!(events.len(), EVENT_CHANNEL_CAPACITY);
    }
}
