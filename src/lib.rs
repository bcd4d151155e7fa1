//! # vastmux
//!
//! Fleet-aware reverse proxy that presents a dynamic pool of rented GPU
//! inference instances as a single OpenAI-compatible HTTP endpoint. The pool
//! is discovered at runtime from a cloud-compute control plane; every
//! instance is reached exclusively through an SSH tunnel.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────┐      event       ┌──────────────────────┐
//!                  │   Watcher    │  ───────────▶    │    Fleet Manager     │
//!   control-plane ─▶   (poller)   │   added /        │  (per-instance       │
//!                  │              │   updated /      │   supervisor)        │
//!                  └──────────────┘   removed        └────────┬─────────────┘
//!                         │                                   │ healthy / unhealthy
//!                         │ subscribe (fan-out)               ▼
//!                         │                          ┌──────────────────┐
//!                         ▼                          │     Balancer     │
//!                    UI collaborator                 │  (round-robin)   │
//!                                                    └────────┬─────────┘
//!                                          pick(id?) / abort-all
//!                                                             ▼
//!                     client HTTP ───────────▶   Reverse Proxy Dispatcher
//!                                                             │
//!                                                             ▼
//!                                                   ssh tunnel → engine
//! ```
//!
//! The watcher reconciles the control-plane listing against local state and
//! fans lifecycle events out to bounded sinks. The fleet manager spawns one
//! supervisor per instance; each supervisor owns its tunnel, keeps the
//! healthy flag honest, discovers the served model, publishes the managed
//! label, and harvests GPU metrics. The balancer round-robins over healthy
//! backends with sticky pinning via the `X-VASTPROXY-INSTANCE` header, and
//! the dispatcher relays bodies with flush-through semantics for SSE.

pub mod backend;
pub mod balancer;
pub mod config;
pub mod control_plane;
pub mod instance;
pub mod proxy;
pub mod sticky;
pub mod telemetry;
pub mod tunnel;
pub mod watcher;

pub use backend::manager::FleetManager;
pub use backend::{Backend, Supervisor, SupervisorConfig};
pub use balancer::{Balancer, NoBackends};
pub use config::Config;
pub use control_plane::{ControlPlaneClient, ControlPlaneError};
pub use instance::{EngineKind, EventKind, Instance, InstanceEvent, InstanceState};
pub use proxy::{INSTANCE_HEADER, ProxyState};
pub use sticky::StickyStats;
pub use tunnel::{Tunnel, TunnelError, TunnelFactory, TunnelRequest, ssh_tunnel_factory};
pub use watcher::FleetWatcher;
