//! Fleet manager: bridges watcher events to backend supervisors.
//!
//! One dispatch task consumes the watcher's event stream. `added` spawns a
//! supervisor under a child cancellation token; `removed` cancels it. When a
//! supervisor exits — cancelled or on its own removal path — the manager
//! drops the backend, deletes the watcher record, and republishes the
//! balancer set.

use crate::balancer::Balancer;
use crate::control_plane::ControlPlaneClient;
use crate::instance::EventKind;
use crate::tunnel::TunnelFactory;
use crate::watcher::FleetWatcher;
use super::gpu::GpuUpdate;
use super::{Backend, Supervisor, SupervisorConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct BackendHandle {
    backend: Arc<Backend>,
    cancel: CancellationToken,
}

/// Owns the set of live backends and their supervisor tasks.
pub struct FleetManager {
    watcher: Arc<FleetWatcher>,
    balancer: Arc<Balancer>,
    control: ControlPlaneClient,
    factory: TunnelFactory,
    config: SupervisorConfig,
    gpu_tx: mpsc::Sender<GpuUpdate>,
}

impl FleetManager {
    pub fn new(
        watcher: Arc<FleetWatcher>,
        balancer: Arc<Balancer>,
        control: ControlPlaneClient,
        factory: TunnelFactory,
        config: SupervisorConfig,
        gpu_tx: mpsc::Sender<GpuUpdate>,
    ) -> Self {
        Self {
            watcher,
            balancer,
            control,
            factory,
            config,
            gpu_tx,
        }
    }

    /// Consume watcher events until cancelled. `events` must be subscribed
    /// before the watcher starts so no `added` is missed.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<crate::instance::InstanceEvent>,
        cancel: CancellationToken,
    ) {
        let mut backends: HashMap<u64, BackendHandle> = HashMap::new();
        // Supervisor tasks resolve to their instance id so exits can be
        // matched back regardless of which path ended them.
        let mut supervisors: JoinSet<u64> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event.kind {
                        EventKind::Added => {
                            let id = event.instance.id;
                            if backends.contains_key(&id) {
                                debug!(instance = id, "duplicate added event ignored");
                                continue;
                            }
                            let backend = Arc::new(Backend::new(event.instance));
                            let child = cancel.child_token();
                            let supervisor = Supervisor::new(
                                Arc::clone(&backend),
                                Arc::clone(&self.watcher),
                                self.control.clone(),
                                Arc::clone(&self.factory),
                                self.config.clone(),
                                self.gpu_tx.clone(),
                            );
                            let task_cancel = child.clone();
                            supervisors.spawn(async move {
                                supervisor.run(task_cancel).await;
                                id
                            });
                            backends.insert(id, BackendHandle { backend, cancel: child });
                            self.publish(&backends);
                        }
                        EventKind::Removed => {
                            if let Some(handle) = backends.get(&event.instance.id) {
                                handle.cancel.cancel();
                            }
                        }
                        EventKind::Updated => {}
                    }
                }

                exited = supervisors.join_next(), if !supervisors.is_empty() => {
                    match exited {
                        Some(Ok(id)) => {
                            backends.remove(&id);
                            self.watcher.remove_instance(id);
                            self.publish(&backends);
                        }
                        Some(Err(e)) => {
                            // A panicking supervisor must not take the fleet
                            // down; its backend is republished on the next
                            // watcher cycle if the instance still exists.
                            warn!(error = %e, "supervisor task failed");
                        }
                        None => {}
                    }
                }
            }
        }

        // Shutdown: cancel every supervisor and wait for tunnels to close.
        for handle in backends.values() {
            handle.cancel.cancel();
        }
        while supervisors.join_next().await.is_some() {}
    }

    fn publish(&self, backends: &HashMap<u64, BackendHandle>) {
        let list: Vec<Arc<Backend>> = backends
            .values()
            .map(|h| Arc::clone(&h.backend))
            .collect();
        self.balancer.set_backends(list);
    }
}
