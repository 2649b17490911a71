pub mod controller;
pub mod handler;
pub mod session;

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::keys::PrivateKey;
use russh::{MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::*;

pub use controller::{AccessController, UserPassController};
use handler::ServerHandler;
pub use session::{LoggingDelegate, ServerSession, SessionDelegate, SessionDelegateFactory};

/// Where the server's host key comes from.
pub enum HostKeySource {
    Key(PrivateKey),
    File(PathBuf),
    /// Try the OS host keys under /etc/ssh.
    Probe,
}

pub struct SshServerConfig {
    /// `Some(port)` listens on IPv6 `[::]` and IPv4 `0.0.0.0`; `Some(0)`
    /// picks an ephemeral port and reuses it for both sockets. `None` opens
    /// no listener (call-home only).
    pub listen: Option<u16>,
    pub host_key: HostKeySource,
}

impl Default for SshServerConfig {
    fn default() -> Self {
        Self {
            listen: Some(0),
            host_key: HostKeySource::Probe,
        }
    }
}

/// Multi-address SSH server.
///
/// Each listener gets its own accept task; each accepted connection runs a
/// full SSH handshake in its own task, and each accepted session channel
/// gets a dedicated reader task. A failing client is logged and never takes
/// the accept task down. [`close`](Self::close) signals shutdown,
/// [`join`](Self::join) waits for it to complete; the pair is safe to call
/// from any task without deadlock.
pub struct SshServer {
    port: u16,
    russh_config: Arc<russh::server::Config>,
    controller: Arc<dyn AccessController>,
    factory: Arc<dyn SessionDelegateFactory>,
    sessions: Arc<Mutex<Vec<Arc<ServerSession>>>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SshServer {
    pub async fn start(
        controller: Arc<dyn AccessController>,
        factory: Arc<dyn SessionDelegateFactory>,
        config: SshServerConfig,
    ) -> Result<Self> {
        let host_key = load_host_key(config.host_key)?;

        let russh_config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            methods: MethodSet::from(&[MethodKind::Password][..]),
            keys: vec![host_key],
            nodelay: true,
            ..<_>::default()
        });

        let (shutdown, _) = watch::channel(false);

        let mut server = SshServer {
            port: 0,
            russh_config,
            controller,
            factory,
            sessions: Arc::new(Mutex::new(Vec::new())),
            shutdown,
            tasks: Vec::new(),
        };

        match config.listen {
            Some(port) => server.bind_listeners(port).await?,
            None => {
                // Call-home only: still need someone to close sessions on
                // shutdown.
                server.spawn_drain_task();
            }
        }

        Ok(server)
    }

    /// Bind IPv6 first, then IPv4 on the same port. On dual-stack systems
    /// where the v6 socket already covers v4, the second bind fails with
    /// AddrInUse and is skipped; any other error propagates.
    async fn bind_listeners(&mut self, port: u16) -> Result<()> {
        let v6 = match TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await {
            Ok(listener) => Some(listener),
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::AddrNotAvailable | io::ErrorKind::Unsupported
                ) =>
            {
                warn!(%error, "IPv6 unavailable, listening on IPv4 only");
                None
            }
            Err(error) => return Err(error).context("binding IPv6 listener"),
        };

        let mut port = port;
        if let Some(listener) = v6 {
            let bound = listener
                .local_addr()
                .context("reading bound IPv6 address")?
                .port();
            if port == 0 {
                port = bound;
            }
            self.port = bound;
            self.spawn_accept_task(listener);
        }

        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                let bound = listener
                    .local_addr()
                    .context("reading bound IPv4 address")?
                    .port();
                if self.port == 0 {
                    self.port = bound;
                }
                self.spawn_accept_task(listener);
            }
            Err(error) if error.kind() == io::ErrorKind::AddrInUse && self.port != 0 => {
                debug!(port, "IPv4 bind already covered by the IPv6 socket");
            }
            Err(error) => return Err(error).context("binding IPv4 listener"),
        }

        info!(port = self.port, "server listening");
        Ok(())
    }

    /// The bound port. Meaningful once `start` has returned; when the config
    /// asked for port 0 this is the port the OS assigned.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn controller(&self) -> &Arc<dyn AccessController> {
        &self.controller
    }

    fn spawn_accept_task(&mut self, listener: TcpListener) {
        let sessions = self.sessions.clone();
        let controller = self.controller.clone();
        let factory = self.factory.clone();
        let config = self.russh_config.clone();
        let mut shutdown = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            let local = listener.local_addr().ok();
            debug!(?local, "accepting connections");
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "client accepted");
                            let handler = ServerHandler::new(
                                peer,
                                controller.clone(),
                                factory.clone(),
                                sessions.clone(),
                            );
                            let config = config.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                run_client(config, stream, handler, shutdown, peer).await;
                            });
                        }
                        Err(error) => {
                            warn!(%error, "accept failed");
                        }
                    }
                }
            }
            drain_sessions(&sessions).await;
            debug!(?local, "accept task exiting");
        });

        self.tasks.push(task);
    }

    fn spawn_drain_task(&mut self) {
        let sessions = self.sessions.clone();
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(async move {
            let _ = shutdown.wait_for(|closing| *closing).await;
            drain_sessions(&sessions).await;
        }));
    }

    /// Dial a waiting call-home client and run the server side of SSH over
    /// the outbound connection. Sessions opened by the peer land in the same
    /// session list as passively accepted ones.
    pub async fn call_home(&self, host: &str, port: u16) -> Result<()> {
        info!(host, port, "calling home");
        let stream = TcpStream::connect((host, port))
            .await
            .context("connecting to call-home client")?;
        let peer = stream.peer_addr().context("reading peer address")?;
        debug!(%peer, "call home connected");

        let handler = ServerHandler::new(
            peer,
            self.controller.clone(),
            self.factory.clone(),
            self.sessions.clone(),
        );
        let session = russh::server::run_stream(self.russh_config.clone(), stream, handler)
            .await
            .context("ssh handshake")?;
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                result = session => {
                    if let Err(error) = result {
                        warn!(%peer, %error, "call-home session failed");
                    }
                }
                _ = shutdown.wait_for(|closing| *closing) => {
                    debug!(%peer, "dropping call-home connection on shutdown");
                }
            }
        });
        Ok(())
    }

    /// Signal shutdown. Accept tasks stop, every live session is closed.
    pub fn close(&self) {
        debug!(port = self.port, "close requested");
        let _ = self.shutdown.send(true);
    }

    /// Wait for shutdown to finish. The listen sockets are released by the
    /// time this returns, so the same port can be bound again immediately.
    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        debug!(port = self.port, "server stopped");
    }
}

async fn drain_sessions(sessions: &Mutex<Vec<Arc<ServerSession>>>) {
    loop {
        let Some(session) = sessions.lock().await.pop() else {
            break;
        };
        session.close().await;
    }
}

/// Drive one client connection to completion, or drop it when the server
/// shuts down. Per-client failures are logged here and never reach the
/// accept task.
async fn run_client(
    config: Arc<russh::server::Config>,
    stream: TcpStream,
    handler: ServerHandler,
    mut shutdown: watch::Receiver<bool>,
    peer: SocketAddr,
) {
    let result = async {
        let session = russh::server::run_stream(config, stream, handler).await?;
        tokio::select! {
            result = session => result.map_err(anyhow::Error::from),
            _ = shutdown.wait_for(|closing| *closing) => {
                debug!(%peer, "dropping client connection on shutdown");
                Ok(())
            }
        }
    }
    .await;

    if let Err(error) = result {
        warn!(%peer, %error, "client session failed");
    }
}

fn load_host_key(source: HostKeySource) -> Result<PrivateKey> {
    match source {
        HostKeySource::Key(key) => Ok(key),
        HostKeySource::File(path) => load_key_file(&path),
        HostKeySource::Probe => {
            for path in ["/etc/ssh/ssh_host_rsa_key", "/etc/ssh/ssh_host_dsa_key"] {
                let path = Path::new(path);
                if path.exists() {
                    return load_key_file(path);
                }
            }
            anyhow::bail!("no host key found under /etc/ssh");
        }
    }
}

fn load_key_file(path: &Path) -> Result<PrivateKey> {
    russh::keys::load_secret_key(path, None)
        .with_context(|| format!("loading host key from {}", path.display()))
}
