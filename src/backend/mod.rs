//! Backend: runtime supervisor for one instance.
//!
//! Every instance gets a [`Backend`] (the capability set the balancer and
//! dispatcher see) and a [`Supervisor`] (the single task that owns its tunnel,
//! health state, label lifecycle, and metrics harvest). All engine HTTP
//! traffic goes through the tunnel; there is no direct HTTP to instances.

pub mod gpu;
pub mod manager;

use crate::control_plane::ControlPlaneClient;
use crate::instance::{EngineKind, Instance, InstanceState};
use crate::tunnel::{Tunnel, TunnelFactory, TunnelRequest};
use crate::watcher::FleetWatcher;
use self::gpu::{GpuUpdate, NVIDIA_SMI_QUERY};
use metrics::{counter, gauge};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timeout for health checks, model discovery, and abort calls.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from a backend's engine-facing HTTP calls.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no base URL for instance {0}")]
    NoBaseUrl(u64),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("engine returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("engine returned no models")]
    NoModels,
}

/// The capability set the balancer and dispatcher operate on.
///
/// `healthy` and `active` are atomics read on the request path; `base_url`
/// and `direct` are published by the supervisor and read as snapshots (a
/// stale read is benign — the next tick corrects it).
#[derive(Debug)]
pub struct Backend {
    instance: Instance,
    http: reqwest::Client,
    base_url: RwLock<Option<String>>,
    healthy: AtomicBool,
    active: AtomicI64,
    direct: AtomicBool,
}

impl Backend {
    pub fn new(instance: Instance) -> Self {
        Self {
            instance,
            // Streaming inference can run for many minutes.
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .expect("reqwest client"),
            base_url: RwLock::new(None),
            healthy: AtomicBool::new(false),
            active: AtomicI64::new(0),
            direct: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.instance.id
    }

    /// Bearer token for the engine's HTTP surface.
    pub fn token(&self) -> &str {
        &self.instance.token
    }

    pub fn engine(&self) -> EngineKind {
        self.instance.engine
    }

    /// The instance snapshot taken at creation. Endpoint fields are
    /// authoritative; observational fields may be stale (the watcher holds
    /// the live copy).
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Set the healthy flag directly. Written by the supervisor, by the
    /// dispatcher on upstream errors, and by tests.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
        gauge!("vastmux_backend_healthy", "instance" => self.instance.id.to_string())
            .set(if healthy { 1.0 } else { 0.0 });
    }

    /// Base URL reaching the engine root through the tunnel.
    pub fn base_url(&self) -> Option<String> {
        self.base_url.read().unwrap().clone()
    }

    /// Publish the base URL. Written by the supervisor and by tests.
    pub fn set_base_url(&self, url: Option<String>) {
        *self.base_url.write().unwrap() = url;
    }

    /// Whether the current tunnel takes the direct path. Observational.
    pub fn is_direct(&self) -> bool {
        self.direct.load(Ordering::SeqCst)
    }

    fn set_direct(&self, direct: bool) {
        self.direct.store(direct, Ordering::SeqCst);
    }

    /// Increment the in-flight counter.
    pub fn acquire(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the in-flight counter.
    pub fn release(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_requests(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Probe `{base}/v1/models` with the bearer token. HTTP 200 means healthy.
    pub async fn health_check(&self, base_url: &str) -> Result<(), BackendError> {
        let mut req = self
            .http
            .get(format!("{base_url}/v1/models"))
            .timeout(PROBE_TIMEOUT);
        if !self.instance.token.is_empty() {
            req = req.bearer_auth(&self.instance.token);
        }
        let resp = req.send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(BackendError::Status(resp.status()));
        }
        Ok(())
    }

    /// Query `/v1/models` and return the first model id.
    pub async fn fetch_model(&self) -> Result<String, BackendError> {
        let base = self.base_url().ok_or(BackendError::NoBaseUrl(self.id()))?;

        #[derive(Deserialize)]
        struct ModelList {
            #[serde(default)]
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }

        let mut req = self
            .http
            .get(format!("{base}/v1/models"))
            .timeout(PROBE_TIMEOUT);
        if !self.instance.token.is_empty() {
            req = req.bearer_auth(&self.instance.token);
        }
        let list: ModelList = req.send().await?.json().await?;
        list.data
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or(BackendError::NoModels)
    }

    /// Abort all in-flight inference on this engine via `POST /abort_request`
    /// with an empty request id. Only meaningful where the engine supports it.
    pub async fn abort_all(&self) -> Result<(), BackendError> {
        let base = self.base_url().ok_or(BackendError::NoBaseUrl(self.id()))?;
        let mut req = self
            .http
            .post(format!("{base}/abort_request"))
            .timeout(PROBE_TIMEOUT)
            .json(&json!({ "rid": "" }));
        if !self.instance.token.is_empty() {
            req = req.bearer_auth(&self.instance.token);
        }
        let resp = req.send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(BackendError::Status(resp.status()));
        }
        counter!("vastmux_aborts_total", "instance" => self.id().to_string()).increment(1);
        Ok(())
    }
}

/// Exponential backoff for tunnel creation: 10s, 20s, 40s, ... capped at 5m.
fn backoff_delay(consecutive_fails: u32) -> Duration {
    let exp = consecutive_fails.saturating_sub(1).min(5);
    Duration::from_secs((10u64 << exp).min(300))
}

/// Tunables for the per-backend supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval between supervisor ticks.
    pub tick: Duration,
    /// Minimum spacing between indirect→direct upgrade attempts.
    pub upgrade_interval: Duration,
    /// Label this process writes to claim an instance; `None` disables
    /// labelling.
    pub managed_label: Option<String>,
    /// SSH private key path.
    pub key_path: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            upgrade_interval: Duration::from_secs(30),
            managed_label: None,
            key_path: PathBuf::from("~/.ssh/id_rsa"),
        }
    }
}

/// Single cooperative task owning one backend's tunnel, health state, label
/// lifecycle, and metrics harvest. The tunnel is never touched from outside
/// this loop.
pub struct Supervisor {
    backend: Arc<Backend>,
    watcher: Arc<FleetWatcher>,
    control: ControlPlaneClient,
    factory: TunnelFactory,
    config: SupervisorConfig,
    gpu_tx: mpsc::Sender<GpuUpdate>,

    tunnel: Option<Box<dyn Tunnel>>,
    ssh_fails: u32,
    backoff_until: Option<Instant>,
    last_upgrade_attempt: Option<Instant>,
    was_healthy: bool,
    /// The label value we last wrote, if any. Cleared only while it still
    /// matches the last observed remote label, so operator edits survive.
    label_written: Option<String>,
}

/// Outcome of one supervisor tick.
#[derive(Debug, PartialEq, Eq)]
enum TickOutcome {
    Continue,
    /// The instance is gone from the control plane; exit the loop.
    Removed,
}

impl Supervisor {
    pub fn new(
        backend: Arc<Backend>,
        watcher: Arc<FleetWatcher>,
        control: ControlPlaneClient,
        factory: TunnelFactory,
        config: SupervisorConfig,
        gpu_tx: mpsc::Sender<GpuUpdate>,
    ) -> Self {
        Self {
            backend,
            watcher,
            control,
            factory,
            config,
            gpu_tx,
            tunnel: None,
            ssh_fails: 0,
            backoff_until: None,
            last_upgrade_attempt: None,
            was_healthy: false,
            label_written: None,
        }
    }

    /// Run until the instance disappears from the control plane or `cancel`
    /// fires. Either way the tunnel is closed and the label released before
    /// returning.
    pub async fn run(mut self, cancel: CancellationToken) {
        let id = self.backend.id();
        self.watcher
            .set_instance_state(id, InstanceState::Connecting);

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.tick().await == TickOutcome::Removed {
                        info!(instance = id, "instance removed, supervisor exiting");
                        break;
                    }
                }
            }
        }

        self.teardown().await;
    }

    async fn tick(&mut self) -> TickOutcome {
        let id = self.backend.id();

        self.ensure_tunnel().await;

        // Health check through the tunnel.
        let healthy = match &self.tunnel {
            None => false,
            Some(tunnel) => {
                let base = format!("http://{}", tunnel.local_addr());
                match self.backend.health_check(&base).await {
                    Ok(()) => {
                        self.backend.set_base_url(Some(base));
                        self.backend.set_direct(tunnel.is_direct());
                        true
                    }
                    Err(e) => {
                        debug!(instance = id, error = %e, "health check failed");
                        false
                    }
                }
            }
        };
        self.backend.set_healthy(healthy);

        // Transition side-effects.
        if healthy && !self.was_healthy {
            info!(instance = id, "backend healthy");
            self.watcher.set_instance_state(id, InstanceState::Healthy);
            self.publish_label();
        } else if !healthy && self.was_healthy {
            warn!(instance = id, "backend unhealthy");
            self.watcher
                .set_instance_state(id, InstanceState::Unhealthy);
            self.clear_label_if_owned();
        }
        self.was_healthy = healthy;

        // Normal removal path: gone from the control plane and not serving.
        if !healthy && !self.watcher.has_instance(id) {
            return TickOutcome::Removed;
        }

        if healthy {
            self.discover_model().await;
            self.maybe_upgrade_tunnel().await;
        }

        self.harvest_metrics().await;

        TickOutcome::Continue
    }

    /// Create the tunnel if absent, honouring the backoff window.
    async fn ensure_tunnel(&mut self) {
        if self.tunnel.is_some() {
            return;
        }
        if let Some(until) = self.backoff_until
            && Instant::now() < until
        {
            return;
        }

        let inst = self.backend.instance();
        let request = TunnelRequest {
            public_addr: inst.public_ipaddr.clone(),
            direct_port: inst.direct_ssh_port,
            proxy_host: inst.ssh_host.clone(),
            proxy_port: inst.ssh_port,
            key_path: self.config.key_path.clone(),
            remote_port: inst.container_port,
        };

        match (self.factory)(request).await {
            Ok(tunnel) => {
                self.ssh_fails = 0;
                self.backoff_until = None;
                self.tunnel = Some(tunnel);
            }
            Err(e) => {
                self.ssh_fails += 1;
                let wait = backoff_delay(self.ssh_fails);
                self.backoff_until = Some(Instant::now() + wait);
                counter!("vastmux_tunnel_failures_total").increment(1);
                warn!(
                    instance = inst.id,
                    consecutive = self.ssh_fails,
                    retry_in = ?wait,
                    error = %e,
                    "tunnel creation failed"
                );
            }
        }
    }

    /// Discover the served model name once, best-effort.
    async fn discover_model(&self) {
        let id = self.backend.id();
        let known = self
            .watcher
            .instances()
            .get(&id)
            .map(|i| !i.model_name.is_empty())
            .unwrap_or(true);
        if known {
            return;
        }
        if let Ok(name) = self.backend.fetch_model().await {
            info!(instance = id, model = %name, "model discovered");
            self.watcher.set_model_name(id, &name);
        }
    }

    /// Try to replace an indirect tunnel with a direct one. At most one
    /// attempt per upgrade interval; the candidate must pass its own health
    /// check before the swap, and the old tunnel is closed only after the new
    /// one is installed.
    async fn maybe_upgrade_tunnel(&mut self) {
        let Some(tunnel) = &self.tunnel else { return };
        if tunnel.is_direct() {
            return;
        }
        let inst = self.backend.instance();
        if inst.public_ipaddr.is_empty() || inst.direct_ssh_port == 0 {
            return;
        }
        if let Some(last) = self.last_upgrade_attempt
            && last.elapsed() < self.config.upgrade_interval
        {
            return;
        }
        self.last_upgrade_attempt = Some(Instant::now());

        let request = TunnelRequest {
            public_addr: inst.public_ipaddr.clone(),
            direct_port: inst.direct_ssh_port,
            proxy_host: String::new(),
            proxy_port: 0,
            key_path: self.config.key_path.clone(),
            remote_port: inst.container_port,
        };

        let candidate = match (self.factory)(request).await {
            Ok(candidate) => candidate,
            Err(e) => {
                debug!(instance = inst.id, error = %e, "direct upgrade attempt failed");
                return;
            }
        };

        let base = format!("http://{}", candidate.local_addr());
        if self.backend.health_check(&base).await.is_ok() {
            info!(instance = inst.id, "upgraded tunnel to direct path");
            let old = self.tunnel.replace(candidate);
            self.backend.set_base_url(Some(base));
            self.backend.set_direct(true);
            if let Some(old) = old {
                old.close().await;
            }
        } else {
            debug!(instance = inst.id, "direct candidate failed validation");
            candidate.close().await;
        }
    }

    /// Harvest per-GPU metrics over the tunnel. A failed command means the
    /// shell session broke; close the tunnel so the next tick rebuilds it.
    async fn harvest_metrics(&mut self) {
        let Some(tunnel) = &self.tunnel else { return };
        let id = self.backend.id();

        let metrics = match tunnel.run_command(NVIDIA_SMI_QUERY).await {
            Ok(output) => gpu::parse_nvidia_smi(&output),
            Err(e) => {
                warn!(instance = id, error = %e, "metrics command failed, rebuilding tunnel");
                if let Some(tunnel) = self.tunnel.take() {
                    tunnel.close().await;
                }
                return;
            }
        };

        match metrics {
            Ok(metrics) => {
                for (idx, g) in metrics.gpus.iter().enumerate() {
                    gauge!("vastmux_gpu_utilization", "instance" => id.to_string(), "gpu" => idx.to_string())
                        .set(g.utilization);
                    gauge!("vastmux_gpu_temperature", "instance" => id.to_string(), "gpu" => idx.to_string())
                        .set(g.temperature);
                }
                let update = GpuUpdate {
                    instance_id: id,
                    gpus: metrics.gpus,
                };
                // Non-blocking: a slow consumer drops updates, never the loop.
                let _ = self.gpu_tx.try_send(update);
            }
            Err(e) => {
                warn!(instance = id, error = %e, "metrics output unparseable, rebuilding tunnel");
                if let Some(tunnel) = self.tunnel.take() {
                    tunnel.close().await;
                }
            }
        }
    }

    /// Write the managed label, recording it as ours. Fire-and-forget.
    fn publish_label(&mut self) {
        let Some(label) = self.config.managed_label.clone() else {
            return;
        };
        let id = self.backend.id();
        self.label_written = Some(label.clone());
        let control = self.control.clone();
        tokio::spawn(async move {
            if let Err(e) = control.set_label(id, &label).await {
                warn!(instance = id, error = %e, "label publish failed");
            }
        });
    }

    /// Clear the managed label, but only while the last observed remote label
    /// is still the one we wrote.
    fn clear_label_if_owned(&mut self) {
        let Some(written) = self.label_written.clone() else {
            return;
        };
        let id = self.backend.id();
        let observed = self
            .watcher
            .instances()
            .get(&id)
            .map(|i| i.label.clone())
            .unwrap_or_default();
        if observed != written {
            debug!(instance = id, label = %observed, "label changed by operator, leaving it");
            return;
        }
        self.label_written = None;
        let control = self.control.clone();
        tokio::spawn(async move {
            if let Err(e) = control.set_label(id, "").await {
                warn!(instance = id, error = %e, "label clear failed");
            }
        });
    }

    async fn teardown(&mut self) {
        self.backend.set_healthy(false);
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.close().await;
        }
        self.clear_label_if_owned();
    }
}
