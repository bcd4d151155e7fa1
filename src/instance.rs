//! Instance data model: the local projection of a control-plane record.
//!
//! The control plane reports instances as loosely-typed JSON ([`InstanceRecord`]).
//! The watcher projects each running record into an [`Instance`], resolving the
//! engine port, host port mappings, and engine kind up front. Identity and
//! endpoint fields are immutable after that projection; everything else is
//! mutated only through [`crate::watcher::FleetWatcher`] methods.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Instant;

/// Lifecycle state of a tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Seen in the control plane, no backend yet.
    Discovered,
    /// Supervisor spawned, tunnel not yet confirmed healthy.
    Connecting,
    /// Health check passing.
    Healthy,
    /// Health check failing.
    Unhealthy,
    /// Gone from the control plane; supervisor is winding down.
    Removing,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Discovered => "DISCOVERED",
            InstanceState::Connecting => "CONNECTING",
            InstanceState::Healthy => "HEALTHY",
            InstanceState::Unhealthy => "UNHEALTHY",
            InstanceState::Removing => "REMOVING",
        };
        f.write_str(s)
    }
}

/// Which inference server an instance runs.
///
/// Only the abort capability differs at the proxy level: SGLang exposes
/// `POST /abort_request`, vLLM does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Sglang,
    Vllm,
    Unknown,
}

impl EngineKind {
    /// Whether the engine accepts `POST /abort_request` to cancel all
    /// in-flight generation.
    pub fn supports_abort(self) -> bool {
        matches!(self, EngineKind::Sglang)
    }
}

/// A single host port mapping entry from the control-plane `ports` map.
#[derive(Debug, Clone, Deserialize)]
pub struct PortMapping {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

/// Raw instance record as returned by `GET /instances/`.
///
/// Fields the control plane may omit or null out are all defaulted so a
/// partially-populated record still deserializes.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceRecord {
    pub id: u64,
    #[serde(default)]
    pub actual_status: Option<String>,
    #[serde(default)]
    pub public_ipaddr: Option<String>,
    #[serde(default)]
    pub ssh_host: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub ports: Option<HashMap<String, Vec<PortMapping>>>,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub num_gpus: Option<u32>,
    #[serde(default)]
    pub gpu_util: Option<f64>,
    #[serde(default)]
    pub gpu_temp: Option<f64>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub extra_env: serde_json::Value,
    #[serde(default)]
    pub onstart: Option<String>,
    #[serde(default)]
    pub direct_port_start: Option<u16>,
    #[serde(default)]
    pub jupyter_token: Option<String>,
}

/// Top-level response from `GET /instances/`.
#[derive(Debug, Deserialize)]
pub struct InstancesResponse {
    pub instances: Vec<InstanceRecord>,
}

static PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--port\s+(\d+)").expect("port regex"));

impl InstanceRecord {
    pub fn actual_status(&self) -> &str {
        self.actual_status.as_deref().unwrap_or("")
    }

    /// Determine the engine-internal port from instance config:
    /// `--port N` in `SGLANG_ARGS`, then `VLLM_ARGS`, then the onstart
    /// script; default 8000.
    pub fn resolve_container_port(&self) -> u16 {
        let env = self.parse_extra_env();
        for key in ["SGLANG_ARGS", "VLLM_ARGS"] {
            if let Some(args) = env.get(key)
                && let Some(port) = extract_port(args)
            {
                return port;
            }
        }
        if let Some(onstart) = &self.onstart
            && let Some(port) = extract_port(onstart)
        {
            return port;
        }
        8000
    }

    /// Resolve the host port that maps to the engine's container port.
    pub fn resolve_host_port(&self) -> u16 {
        let container_port = self.resolve_container_port();
        if let Some(p) = self.mapped_port(&format!("{container_port}/tcp")) {
            return p;
        }
        for key in ["8000/tcp", "18000/tcp", "30000/tcp"] {
            if let Some(p) = self.mapped_port(key) {
                return p;
            }
        }
        self.direct_port_start.unwrap_or(0)
    }

    /// Resolve the direct SSH host port (the `22/tcp` mapping).
    pub fn resolve_direct_ssh_port(&self) -> u16 {
        self.mapped_port("22/tcp").unwrap_or(0)
    }

    fn mapped_port(&self, key: &str) -> Option<u16> {
        let mappings = self.ports.as_ref()?.get(key)?;
        mappings.first()?.host_port.parse().ok()
    }

    /// Parse `extra_env`, which the control plane serves either as an object
    /// `{"KEY":"VALUE"}` or a list of pairs `[["KEY","VALUE"],...]`. Flag-like
    /// first elements (leading `-`) in the pair form are skipped.
    pub fn parse_extra_env(&self) -> HashMap<String, String> {
        if let Ok(dict) = serde_json::from_value::<HashMap<String, String>>(self.extra_env.clone())
        {
            return dict;
        }
        let mut env = HashMap::new();
        if let Ok(pairs) = serde_json::from_value::<Vec<Vec<String>>>(self.extra_env.clone()) {
            for pair in pairs {
                if let [key, value, ..] = pair.as_slice()
                    && !key.is_empty()
                    && !key.starts_with('-')
                {
                    env.insert(key.clone(), value.clone());
                }
            }
        }
        env
    }

    /// Classify the inference engine from instance config.
    pub fn resolve_engine_kind(&self) -> EngineKind {
        let env = self.parse_extra_env();
        if env.contains_key("SGLANG_ARGS") {
            return EngineKind::Sglang;
        }
        if env.contains_key("VLLM_ARGS") {
            return EngineKind::Vllm;
        }
        let onstart = self.onstart.as_deref().unwrap_or("");
        if onstart.contains("sglang") {
            EngineKind::Sglang
        } else if onstart.contains("vllm") {
            EngineKind::Vllm
        } else {
            EngineKind::Unknown
        }
    }
}

fn extract_port(text: &str) -> Option<u16> {
    PORT_RE
        .captures(text)
        .and_then(|m| m.get(1))
        .and_then(|g| g.as_str().parse().ok())
}

/// Local projection of a control-plane record.
///
/// `id` and the endpoint fields are immutable after construction. The
/// observational fields (`gpu_util`, `gpu_temp`, `actual_status`, `label`),
/// `model_name`, and the lifecycle state are mutated only under the watcher's
/// lock; everyone else works from snapshot clones.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: u64,
    pub public_ipaddr: String,
    pub direct_ssh_port: u16,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub container_port: u16,
    pub host_port: u16,
    pub token: String,
    pub gpu_name: String,
    pub num_gpus: u32,
    pub gpu_util: Option<f64>,
    pub gpu_temp: Option<f64>,
    pub label: String,
    pub engine: EngineKind,
    pub model_name: String,
    pub actual_status: String,
    pub state: InstanceState,
    pub state_changed_at: Instant,
}

impl Instance {
    /// Project a raw record into a tracked instance in [`InstanceState::Discovered`].
    pub fn from_record(record: &InstanceRecord) -> Self {
        Self {
            id: record.id,
            public_ipaddr: record.public_ipaddr.clone().unwrap_or_default(),
            direct_ssh_port: record.resolve_direct_ssh_port(),
            ssh_host: record.ssh_host.clone().unwrap_or_default(),
            ssh_port: record.ssh_port.unwrap_or(22),
            container_port: record.resolve_container_port(),
            host_port: record.resolve_host_port(),
            token: record.jupyter_token.clone().unwrap_or_default(),
            gpu_name: record.gpu_name.clone().unwrap_or_default(),
            num_gpus: record.num_gpus.unwrap_or(0),
            gpu_util: record.gpu_util,
            gpu_temp: record.gpu_temp,
            label: record.label.clone().unwrap_or_default(),
            engine: record.resolve_engine_kind(),
            model_name: String::new(),
            actual_status: record.actual_status().to_string(),
            state: InstanceState::Discovered,
            state_changed_at: Instant::now(),
        }
    }

    /// Human-readable name, e.g. `#123 RTX 4090x2 (my-label)`.
    pub fn display_name(&self) -> String {
        let mut name = format!("#{} {}x{}", self.id, self.gpu_name, self.num_gpus);
        if !self.label.is_empty() {
            name.push_str(&format!(" ({})", self.label));
        }
        name
    }
}

/// Kind of change observed by the watcher during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Updated,
    Removed,
}

/// Lifecycle event fanned out to watcher subscribers. Carries a snapshot of
/// the instance at emit time.
#[derive(Debug, Clone)]
pub struct InstanceEvent {
    pub kind: EventKind,
    pub instance: Instance,
}
