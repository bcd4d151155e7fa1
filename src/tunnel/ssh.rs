//! SSH-backed tunnel: a russh client connection plus a local TCP forward.
//!
//! The relay ("proxy") SSH endpoint is attempted first because it is more
//! reliable behind consumer NAT; the direct endpoint is the fallback and the
//! upgrade target. Host keys are accepted unverified: rented instances
//! regenerate theirs on every provision, so there is nothing to pin.

use super::{Tunnel, TunnelError, TunnelRequest};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::KeyPair;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SSH_USER: &str = "root";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

struct AcceptingClient;

#[async_trait]
impl client::Handler for AcceptingClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An established SSH connection with a loopback listener forwarding to the
/// engine port on the remote host.
pub struct SshTunnel {
    session: Arc<Handle<AcceptingClient>>,
    local_addr: SocketAddr,
    is_direct: bool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SshTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTunnel")
            .field("local_addr", &self.local_addr)
            .field("is_direct", &self.is_direct)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

/// Open an SSH tunnel per the endpoint preference in `request`.
pub async fn connect(request: TunnelRequest) -> Result<SshTunnel, TunnelError> {
    let keys = load_keys(&request.key_path)?;

    let mut candidates: Vec<(String, u16, bool)> = Vec::new();
    if !request.proxy_host.is_empty() && request.proxy_port != 0 {
        candidates.push((request.proxy_host.clone(), request.proxy_port, false));
    }
    if !request.public_addr.is_empty() && request.direct_port != 0 {
        candidates.push((request.public_addr.clone(), request.direct_port, true));
    }
    if candidates.is_empty() {
        return Err(TunnelError::NoEndpoints);
    }

    let mut last_err = TunnelError::NoEndpoints;
    for (host, port, is_direct) in candidates {
        match establish(&host, port, &keys).await {
            Ok(session) => {
                return finish(session, is_direct, request.remote_port).await;
            }
            Err(e) => {
                debug!(host = %host, port, error = %e, "ssh endpoint failed");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// Connect and authenticate against a single endpoint.
async fn establish(
    host: &str,
    port: u16,
    keys: &[Arc<KeyPair>],
) -> Result<Handle<AcceptingClient>, TunnelError> {
    let config = Arc::new(client::Config {
        keepalive_interval: Some(Duration::from_secs(15)),
        ..Default::default()
    });
    let addr = format!("{host}:{port}");

    let connect = client::connect(config, (host, port), AcceptingClient);
    let mut session = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok(session)) => session,
        Ok(Err(russh::Error::IO(e))) => {
            return Err(TunnelError::Dial {
                addr,
                reason: e.to_string(),
            });
        }
        Ok(Err(e)) => return Err(TunnelError::Handshake(e.to_string())),
        Err(_) => {
            return Err(TunnelError::Dial {
                addr,
                reason: "connection timed out".into(),
            });
        }
    };

    for key in keys {
        match session.authenticate_publickey(SSH_USER, Arc::clone(key)).await {
            Ok(true) => return Ok(session),
            Ok(false) => continue,
            Err(e) => return Err(TunnelError::Auth(e.to_string())),
        }
    }
    Err(TunnelError::Auth(format!("all {} keys rejected", keys.len())))
}

/// Bind the loopback listener and start the accept loop.
async fn finish(
    session: Handle<AcceptingClient>,
    is_direct: bool,
    remote_port: u16,
) -> Result<SshTunnel, TunnelError> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| TunnelError::Session(format!("bind forward listener: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| TunnelError::Session(format!("forward listener addr: {e}")))?;

    let session = Arc::new(session);
    let shutdown = CancellationToken::new();

    let accept_session = Arc::clone(&session);
    let accept_shutdown = shutdown.clone();
    tokio::spawn(async move {
        accept_loop(listener, accept_session, remote_port, accept_shutdown).await;
    });

    debug!(local = %local_addr, direct = is_direct, "ssh tunnel established");
    Ok(SshTunnel {
        session,
        local_addr,
        is_direct,
        shutdown,
    })
}

/// Forward each accepted local connection through a direct-tcpip channel.
/// Per-connection failures only affect that connection.
async fn accept_loop(
    listener: TcpListener,
    session: Arc<Handle<AcceptingClient>>,
    remote_port: u16,
    shutdown: CancellationToken,
) {
    loop {
        let (local, peer) = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "forward listener accept failed");
                    return;
                }
            },
        };

        let channel = match session
            .channel_open_direct_tcpip(
                "127.0.0.1",
                remote_port as u32,
                peer.ip().to_string(),
                peer.port() as u32,
            )
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                warn!(remote_port, error = %e, "open forward channel failed");
                continue;
            }
        };

        tokio::spawn(forward(local, channel));
    }
}

/// Copy bytes both ways until either side reaches EOF, then close both.
async fn forward(mut local: TcpStream, channel: russh::Channel<client::Msg>) {
    let mut remote = channel.into_stream();
    if let Err(e) = tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        debug!(error = %e, "forwarded connection ended with error");
    }
}

#[async_trait]
impl Tunnel for SshTunnel {
    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }

    fn is_direct(&self) -> bool {
        self.is_direct
    }

    async fn run_command(&self, command: &str) -> Result<String, TunnelError> {
        let mut channel = self
            .session
            .channel_open_session()
            .await
            .map_err(|e| TunnelError::Session(format!("open session: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| TunnelError::Session(format!("exec: {e}")))?;

        let mut stdout = Vec::new();
        let mut exit_status = 0u32;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = code,
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        if exit_status != 0 {
            return Err(TunnelError::CommandFailed {
                status: exit_status,
                stdout,
            });
        }
        Ok(stdout)
    }

    async fn close(&self) {
        self.shutdown.cancel();
        // A second close finds the session already disconnected; ignored.
        let _ = self
            .session
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await;
    }
}

/// Assemble the key set: the configured path plus the conventional defaults,
/// deduplicated, keeping only keys that load.
fn load_keys(key_path: &Path) -> Result<Vec<Arc<KeyPair>>, TunnelError> {
    let mut paths: Vec<PathBuf> = Vec::new();
    let configured = expand_home(key_path);
    if !configured.as_os_str().is_empty() {
        paths.push(configured.clone());
    }
    if let Some(home) = dirs::home_dir() {
        for name in ["id_rsa", "id_ed25519", "id_ecdsa"] {
            let p = home.join(".ssh").join(name);
            if p != configured {
                paths.push(p);
            }
        }
    }

    let mut keys = Vec::new();
    for path in paths {
        match russh_keys::load_secret_key(&path, None) {
            Ok(key) => keys.push(Arc::new(key)),
            Err(e) => debug!(path = %path.display(), error = %e, "skipping ssh key"),
        }
    }
    if keys.is_empty() {
        return Err(TunnelError::Auth("no usable ssh keys".into()));
    }
    Ok(keys)
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    path.to_path_buf()
}
