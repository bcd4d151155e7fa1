//! Fleet lifecycle tests: watcher, manager, and supervisors driven end-to-end
//! against a mock control plane and mock engines, with tunnels injected
//! through the factory seam.

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::json;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vastmux::backend::gpu::GpuUpdate;
use vastmux::instance::InstanceState;
use vastmux::tunnel::{Tunnel, TunnelError, TunnelFactory, TunnelRequest};
use vastmux::{Balancer, ControlPlaneClient, FleetManager, FleetWatcher, SupervisorConfig};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A running mock-engine process; killed on drop.
struct MockEngine {
    child: Child,
    port: u16,
}

impl MockEngine {
    async fn spawn(model: &str) -> Self {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_mock-engine"));
        cmd.args(["--port", "0", "--model", model])
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().expect("failed to spawn mock-engine");
        let stdout = child.stdout.take().expect("failed to capture stdout");
        let mut reader = BufReader::new(stdout).lines();

        let port = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(line) = reader.next_line().await.expect("failed to read stdout") {
                if let Some(port) = line.strip_prefix("READY ") {
                    return port.parse::<u16>().expect("failed to parse port");
                }
            }
            panic!("engine never signaled READY");
        })
        .await
        .expect("timeout waiting for engine");

        Self { child, port }
    }

    /// host:port, as a tunnel local address would present it.
    fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    async fn set_fail_health(&self, fail: bool) {
        reqwest::Client::new()
            .post(format!("http://{}/control/fail-health", self.addr()))
            .json(&json!({"fail": fail}))
            .send()
            .await
            .expect("fail-health control request");
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// In-process mock control plane: a mutable instance listing plus a record
/// of every label write. Label writes are applied to the stored records so
/// subsequent polls observe them, like the real control plane.
#[derive(Clone, Default)]
struct MockPlane {
    instances: Arc<Mutex<Vec<serde_json::Value>>>,
    label_writes: Arc<Mutex<Vec<(u64, String)>>>,
}

impl MockPlane {
    async fn serve(&self) -> String {
        let app = Router::new()
            .route("/instances/", get(list_instances))
            .route("/instances/{id}/", put(set_label))
            .with_state(self.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn set_instances(&self, instances: Vec<serde_json::Value>) {
        *self.instances.lock().unwrap() = instances;
    }

    fn label_writes(&self) -> Vec<(u64, String)> {
        self.label_writes.lock().unwrap().clone()
    }
}

async fn list_instances(State(plane): State<MockPlane>) -> Json<serde_json::Value> {
    let instances = plane.instances.lock().unwrap().clone();
    Json(json!({ "instances": instances }))
}

async fn set_label(
    State(plane): State<MockPlane>,
    Path(id): Path<u64>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let label = body["label"].as_str().unwrap_or_default().to_string();
    plane.label_writes.lock().unwrap().push((id, label.clone()));
    for inst in plane.instances.lock().unwrap().iter_mut() {
        if inst["id"].as_u64() == Some(id) {
            inst["label"] = json!(label);
        }
    }
    Json(json!({"success": true}))
}

/// Tunnel whose loopback address is simply the engine's own listener.
struct LoopbackTunnel {
    addr: String,
    direct: bool,
    smi_output: String,
}

#[async_trait]
impl Tunnel for LoopbackTunnel {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    fn is_direct(&self) -> bool {
        self.direct
    }

    async fn run_command(&self, _command: &str) -> Result<String, TunnelError> {
        Ok(self.smi_output.clone())
    }

    async fn close(&self) {}
}

/// Factory returning loopback tunnels to `engine_addr`. The direct flag
/// mirrors the request: a disabled relay endpoint means a direct attempt.
fn loopback_factory(engine_addr: String) -> TunnelFactory {
    Arc::new(move |request: TunnelRequest| {
        let addr = engine_addr.clone();
        Box::pin(async move {
            Ok(Box::new(LoopbackTunnel {
                addr,
                direct: request.proxy_host.is_empty(),
                smi_output: "98, 73\n45, 60\n".to_string(),
            }) as Box<dyn Tunnel>)
        })
    })
}

fn running_instance(id: u64) -> serde_json::Value {
    json!({
        "id": id,
        "actual_status": "running",
        "public_ipaddr": "203.0.113.5",
        "ssh_host": "ssh.example.net",
        "ssh_port": 22,
        "ports": {"22/tcp": [{"HostIp": "0.0.0.0", "HostPort": "2222"}]},
        "gpu_name": "RTX 4090",
        "num_gpus": 2,
        "label": "",
        "extra_env": {"SGLANG_ARGS": "--port 30000"},
    })
}

async fn wait_until<F: FnMut() -> bool>(mut condition: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

struct Fleet {
    watcher: Arc<FleetWatcher>,
    balancer: Arc<Balancer>,
    cancel: CancellationToken,
    gpu_rx: mpsc::Receiver<GpuUpdate>,
}

/// Start watcher + manager against a mock plane, with tunnels pointed at
/// `engine_addr`.
async fn start_fleet(plane: &MockPlane, engine_addr: String, upgrade_interval: Duration) -> Fleet {
    let base_url = plane.serve().await;
    let control = ControlPlaneClient::new("test-key").with_base_url(base_url);
    let watcher = Arc::new(FleetWatcher::new(
        control.clone(),
        Duration::from_millis(100),
    ));
    let balancer = Arc::new(Balancer::new());
    let (gpu_tx, gpu_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();

    let events = watcher.subscribe();
    let manager = FleetManager::new(
        Arc::clone(&watcher),
        Arc::clone(&balancer),
        control,
        loopback_factory(engine_addr),
        SupervisorConfig {
            tick: Duration::from_millis(50),
            upgrade_interval,
            managed_label: Some("test-mux".to_string()),
            key_path: "/dev/null".into(),
        },
        gpu_tx,
    );
    let manager_cancel = cancel.clone();
    tokio::spawn(async move { manager.run(events, manager_cancel).await });
    let run_watcher = Arc::clone(&watcher);
    let watcher_cancel = cancel.clone();
    tokio::spawn(async move { run_watcher.run(watcher_cancel).await });

    Fleet {
        watcher,
        balancer,
        cancel,
        gpu_rx,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn watcher_emits_lifecycle_events_over_http() {
    let plane = MockPlane::default();
    plane.set_instances(vec![running_instance(1), running_instance(2)]);
    let base_url = plane.serve().await;

    let control = ControlPlaneClient::new("test-key").with_base_url(base_url);
    let watcher = Arc::new(FleetWatcher::new(control, Duration::from_millis(150)));
    let mut events = watcher.subscribe();
    let cancel = CancellationToken::new();
    let run_watcher = Arc::clone(&watcher);
    let run_cancel = cancel.clone();
    tokio::spawn(async move { run_watcher.run(run_cancel).await });

    let mut seen = Vec::new();
    // First poll: both instances appear.
    while seen.len() < 2 {
        let evt = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timed out waiting for added events")
            .expect("event channel closed");
        seen.push((evt.kind, evt.instance.id));
    }
    // Instance 2 disappears from the listing.
    plane.set_instances(vec![running_instance(1)]);

    loop {
        let evt = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timed out waiting for removal")
            .expect("event channel closed");
        let entry = (evt.kind, evt.instance.id);
        seen.push(entry);
        if entry == (vastmux::EventKind::Removed, 2) {
            break;
        }
    }
    cancel.cancel();

    use vastmux::EventKind::*;
    assert_eq!(&seen[..2], &[(Added, 1), (Added, 2)]);
    let tail = &seen[seen.len() - 2..];
    assert_eq!(tail, &[(Updated, 1), (Removed, 2)]);
    assert_eq!(seen.iter().filter(|(k, _)| *k == Added).count(), 2);
    assert_eq!(seen.iter().filter(|(k, _)| *k == Removed).count(), 1);
}

#[tokio::test]
async fn supervisor_drives_health_label_model_and_metrics() {
    let engine = MockEngine::spawn("mock-llm").await;
    let plane = MockPlane::default();
    plane.set_instances(vec![running_instance(1)]);

    // Upgrade interval far beyond the test so the tunnel stays indirect.
    let mut fleet = start_fleet(&plane, engine.addr(), Duration::from_secs(3600)).await;

    // Healthy transition, reflected in watcher state and the balancer.
    wait_until(|| fleet.balancer.healthy_count() == 1, "backend healthy").await;
    assert_eq!(
        fleet.watcher.instances()[&1].state,
        InstanceState::Healthy
    );

    // Managed label published on the unhealthy→healthy transition.
    wait_until(
        || plane.label_writes().contains(&(1, "test-mux".to_string())),
        "label publish",
    )
    .await;

    // Model identity discovered from /v1/models.
    wait_until(
        || fleet.watcher.instances()[&1].model_name == "mock-llm",
        "model discovery",
    )
    .await;

    // Metrics harvested over the tunnel and published on the sink.
    let update = tokio::time::timeout(Duration::from_secs(3), fleet.gpu_rx.recv())
        .await
        .expect("timed out waiting for gpu update")
        .expect("gpu channel closed");
    assert_eq!(update.instance_id, 1);
    assert_eq!(update.gpus.len(), 2);
    assert_eq!(update.gpus[0].utilization, 98.0);
    assert_eq!(update.gpus[1].temperature, 60.0);

    // Let a poll refresh the observed label before failing health, so the
    // clear-if-still-ours check sees our write.
    wait_until(
        || fleet.watcher.instances()[&1].label == "test-mux",
        "label observed by watcher",
    )
    .await;

    // Health failure: unhealthy state and a label clear.
    engine.set_fail_health(true).await;
    wait_until(|| fleet.balancer.healthy_count() == 0, "backend unhealthy").await;
    assert_eq!(
        fleet.watcher.instances()[&1].state,
        InstanceState::Unhealthy
    );
    wait_until(
        || plane.label_writes().contains(&(1, String::new())),
        "label clear",
    )
    .await;

    // Removal: instance leaves the listing, supervisor exits, manager drops
    // the backend and the watcher record.
    plane.set_instances(vec![]);
    wait_until(|| fleet.balancer.total_count() == 0, "backend removed").await;
    wait_until(|| fleet.watcher.instances().is_empty(), "record dropped").await;

    fleet.cancel.cancel();
}

#[tokio::test]
async fn indirect_tunnel_upgrades_to_direct() {
    let engine = MockEngine::spawn("mock-llm").await;
    let plane = MockPlane::default();
    plane.set_instances(vec![running_instance(1)]);

    // Short upgrade interval so the supervisor attempts the direct path.
    let fleet = start_fleet(&plane, engine.addr(), Duration::from_millis(100)).await;

    wait_until(|| fleet.balancer.healthy_count() == 1, "backend healthy").await;
    wait_until(
        || {
            fleet
                .balancer
                .pick_by_id(1)
                .map(|b| b.is_direct())
                .unwrap_or(false)
        },
        "direct upgrade",
    )
    .await;

    fleet.cancel.cancel();
}

#[tokio::test]
async fn operator_label_edits_are_not_clobbered() {
    let engine = MockEngine::spawn("mock-llm").await;
    let plane = MockPlane::default();
    plane.set_instances(vec![running_instance(1)]);

    let fleet = start_fleet(&plane, engine.addr(), Duration::from_secs(3600)).await;

    wait_until(|| fleet.balancer.healthy_count() == 1, "backend healthy").await;
    wait_until(
        || plane.label_writes().contains(&(1, "test-mux".to_string())),
        "label publish",
    )
    .await;

    // Operator overwrites the label; wait until the watcher observes it.
    let mut instances = vec![running_instance(1)];
    instances[0]["label"] = json!("operator-owned");
    plane.set_instances(instances);
    wait_until(
        || fleet.watcher.instances()[&1].label == "operator-owned",
        "operator label observed",
    )
    .await;

    // Unhealthy transition must leave the operator's label alone.
    engine.set_fail_health(true).await;
    wait_until(|| fleet.balancer.healthy_count() == 0, "backend unhealthy").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        !plane.label_writes().contains(&(1, String::new())),
        "label must not be cleared after an operator edit"
    );

    fleet.cancel.cancel();
}
