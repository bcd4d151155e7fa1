//! Secure tunnel capability set.
//!
//! A [`Tunnel`] is a local loopback forwarder backed by a secure shell
//! connection, plus a command channel. Production tunnels are built by
//! [`ssh::connect`]; tests inject their own [`TunnelFactory`] returning
//! in-memory or loopback-HTTP mocks, so the supervisor never references the
//! concrete transport.

pub mod ssh;

use futures_util::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;

/// Failure taxonomy for tunnel establishment and use. The lifecycle manager
/// treats all establishment failures uniformly (fail count + backoff), but
/// the variants stay distinguishable for logs and tests.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("ssh authentication failed: {0}")]
    Auth(String),

    #[error("ssh handshake failed: {0}")]
    Handshake(String),

    #[error("dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("no ssh endpoints available")]
    NoEndpoints,

    #[error("remote command exited with status {status}")]
    CommandFailed { status: u32, stdout: String },

    #[error("ssh session error: {0}")]
    Session(String),
}

/// Capability set exposed by the secure-transport layer. Exclusively owned by
/// one backend supervisor.
#[async_trait::async_trait]
pub trait Tunnel: Send + Sync {
    /// Loopback address forwarding to the engine port, e.g. `127.0.0.1:54321`.
    fn local_addr(&self) -> String;

    /// Whether the connection took the direct path (public address) rather
    /// than the relay endpoint.
    fn is_direct(&self) -> bool;

    /// Run a shell command on the remote host and return its stdout. Fails
    /// with [`TunnelError::CommandFailed`] on a non-zero exit status.
    async fn run_command(&self, command: &str) -> Result<String, TunnelError>;

    /// Tear down the forwarder and the shell connection. Idempotent.
    async fn close(&self);
}

/// Endpoint and key material needed to establish a tunnel. Passing an empty
/// proxy host or a zero direct port disables that endpoint.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub public_addr: String,
    pub direct_port: u16,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub key_path: PathBuf,
    pub remote_port: u16,
}

impl TunnelRequest {
    /// A copy of this request with the relay endpoint disabled, for
    /// direct-only upgrade attempts.
    pub fn direct_only(&self) -> Self {
        Self {
            proxy_host: String::new(),
            proxy_port: 0,
            ..self.clone()
        }
    }
}

/// Pluggable tunnel constructor. The production factory is
/// [`ssh_tunnel_factory`]; tests substitute their own.
pub type TunnelFactory = Arc<
    dyn Fn(TunnelRequest) -> BoxFuture<'static, Result<Box<dyn Tunnel>, TunnelError>>
        + Send
        + Sync,
>;

/// The production factory: a real SSH connection with a local TCP forward.
pub fn ssh_tunnel_factory() -> TunnelFactory {
    Arc::new(|request| {
        Box::pin(async move {
            let tunnel = ssh::connect(request).await?;
            Ok(Box::new(tunnel) as Box<dyn Tunnel>)
        })
    })
}
