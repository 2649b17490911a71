use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tracing::*;
use uuid::Uuid;

use crate::cache::{global_cache, CachedTransport, ConnectionCache};
use crate::client::handler::Transport;
use crate::config::SshTargetOptions;
use crate::error::SshError;

/// Largest chunk handed out by a single `recv`/`recv_stderr` call.
pub const MAX_SSH_BUF: usize = 16 * 1024;

enum TransportBinding {
    /// Borrowed from a cache; given back on close.
    Pooled {
        cache: Arc<ConnectionCache>,
        transport: CachedTransport,
    },
    /// Owned outright (call-home); disconnected on close.
    Direct { handle: Arc<Transport> },
}

impl TransportBinding {
    fn handle(&self) -> &Arc<Transport> {
        match self {
            TransportBinding::Pooled { transport, .. } => transport.handle(),
            TransportBinding::Direct { handle } => handle,
        }
    }
}

/// A duplex session over one channel of a (usually shared) transport.
///
/// Stdout and stderr are buffered separately as channel messages arrive; a
/// zero-length `recv` result means the remote side reached EOF. `close` is
/// idempotent and returns the transport to its cache exactly once.
pub struct SshSession {
    id: Uuid,
    channel: Option<Channel<Msg>>,
    binding: Option<TransportBinding>,
    stdout: BytesMut,
    stderr: BytesMut,
    exit_status: Option<u32>,
    /// No more stream data will arrive.
    eof: bool,
    /// The channel itself is gone.
    closed: bool,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession").field("id", &self.id).finish()
    }
}

impl SshSession {
    /// Open a session channel over a cached transport for `options`,
    /// borrowing from `cache` or the process-global one.
    pub async fn connect(
        options: &SshTargetOptions,
        cache: Option<Arc<ConnectionCache>>,
    ) -> Result<Self, SshError> {
        let cache = cache.unwrap_or_else(global_cache);
        let transport = cache.get(options).await?;

        debug!(host = %options.host, port = options.port, "opening session channel");
        let channel = match transport.handle().channel_open_session().await {
            Ok(channel) => channel,
            Err(error) => {
                cache.release(transport);
                return Err(SshError::Channel(error));
            }
        };

        Ok(Self::new(
            channel,
            TransportBinding::Pooled { cache, transport },
        ))
    }

    pub(crate) fn over_transport(handle: Arc<Transport>, channel: Channel<Msg>) -> Self {
        Self::new(channel, TransportBinding::Direct { handle })
    }

    fn new(channel: Channel<Msg>, binding: TransportBinding) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: Some(channel),
            binding: Some(binding),
            stdout: BytesMut::new(),
            stderr: BytesMut::new(),
            exit_status: None,
            eof: false,
            closed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<usize, SshError> {
        let channel = self.channel.as_mut().ok_or(SshError::SessionClosed)?;
        channel.data(data).await?;
        Ok(data.len())
    }

    pub async fn send_all(&mut self, data: &[u8]) -> Result<(), SshError> {
        self.send(data).await.map(|_| ())
    }

    /// Next chunk of stdout, at most [`MAX_SSH_BUF`] bytes. Empty means EOF;
    /// a short read does not.
    pub async fn recv(&mut self) -> Result<Bytes, SshError> {
        while self.stdout.is_empty() && !self.eof {
            self.pump().await?;
        }
        let n = self.stdout.len().min(MAX_SSH_BUF);
        Ok(self.stdout.split_to(n).freeze())
    }

    /// Next chunk of stderr, same contract as [`recv`](Self::recv).
    pub async fn recv_stderr(&mut self) -> Result<Bytes, SshError> {
        while self.stderr.is_empty() && !self.eof {
            self.pump().await?;
        }
        let n = self.stderr.len().min(MAX_SSH_BUF);
        Ok(self.stderr.split_to(n).freeze())
    }

    /// Whether a `recv` would return data without waiting.
    pub fn recv_ready(&self) -> bool {
        !self.stdout.is_empty()
    }

    pub fn recv_stderr_ready(&self) -> bool {
        !self.stderr.is_empty()
    }

    pub fn is_active(&self) -> bool {
        match (&self.channel, &self.binding) {
            (Some(_), Some(binding)) => !binding.handle().is_closed(),
            _ => false,
        }
    }

    pub(crate) async fn recv_exit_status_inner(&mut self) -> Result<u32, SshError> {
        while self.exit_status.is_none() && !self.closed {
            self.pump().await?;
        }
        Ok(self.exit_status.unwrap_or(0))
    }

    /// Request a named subsystem and wait for the server's verdict. On
    /// refusal the session is closed and the transport released before the
    /// error is returned.
    pub(crate) async fn invoke_subsystem(&mut self, name: &str) -> Result<(), SshError> {
        debug!(session = %self.id, subsystem = name, "invoking subsystem");
        let requested = match self.channel.as_mut() {
            None => Err(SshError::SessionClosed),
            Some(channel) => channel
                .request_subsystem(true, name)
                .await
                .map_err(SshError::Channel),
        };
        let result = match requested {
            Ok(()) => self.await_request_reply(name).await,
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            self.close().await;
            return Err(error);
        }
        Ok(())
    }

    /// Wait for the SUCCESS/FAILURE reply to the most recent channel
    /// request, buffering any stream data that arrives first.
    pub(crate) async fn await_request_reply(&mut self, request: &str) -> Result<(), SshError> {
        loop {
            let msg = match self.channel.as_mut() {
                None => return Err(SshError::SessionClosed),
                Some(channel) => channel.wait().await,
            };
            match msg {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => {
                    return Err(SshError::RequestDenied {
                        request: request.to_owned(),
                    });
                }
                None => {
                    self.eof = true;
                    self.closed = true;
                    return Err(SshError::RequestDenied {
                        request: request.to_owned(),
                    });
                }
                Some(msg) => self.absorb(msg),
            }
        }
    }

    /// Close the channel and give the transport back. Safe to call any
    /// number of times; only the first call releases.
    pub async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            debug!(session = %self.id, "closing session channel");
            let _ = channel.eof().await;
        }
        self.eof = true;
        self.closed = true;

        if let Some(binding) = self.binding.take() {
            match binding {
                TransportBinding::Pooled { cache, transport } => cache.release(transport),
                TransportBinding::Direct { handle } => {
                    let _ = handle
                        .disconnect(russh::Disconnect::ByApplication, "", "")
                        .await;
                }
            }
        }
    }

    async fn pump(&mut self) -> Result<(), SshError> {
        let msg = match self.channel.as_mut() {
            None => None,
            Some(channel) => channel.wait().await,
        };
        match msg {
            Some(msg) => self.absorb(msg),
            None => {
                self.eof = true;
                self.closed = true;
            }
        }
        Ok(())
    }

    fn absorb(&mut self, msg: ChannelMsg) {
        match msg {
            ChannelMsg::Data { data } => self.stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext: 1 } => self.stderr.extend_from_slice(&data),
            ChannelMsg::ExtendedData { .. } => {}
            ChannelMsg::ExitStatus { exit_status } => self.exit_status = Some(exit_status),
            ChannelMsg::Eof => self.eof = true,
            ChannelMsg::Close => {
                self.eof = true;
                self.closed = true;
            }
            msg => trace!(session = %self.id, ?msg, "ignoring channel message"),
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // Safety net only: sessions are meant to be close()d explicitly.
        let Some(binding) = self.binding.take() else {
            return;
        };
        debug!(session = %self.id, "session dropped without close");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session = %self.id, "no runtime at drop time, leaking transport borrow");
            return;
        };
        match binding {
            TransportBinding::Pooled { cache, transport } => cache.release(transport),
            TransportBinding::Direct { handle } => {
                runtime.spawn(async move {
                    let _ = handle
                        .disconnect(russh::Disconnect::ByApplication, "", "")
                        .await;
                });
            }
        }
    }
}

/// A session with a named subsystem (e.g. `"netconf"`) invoked on its
/// channel.
pub struct SshClientSession {
    session: SshSession,
}

impl std::fmt::Debug for SshClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClientSession")
            .field("session", &self.session)
            .finish()
    }
}

impl SshClientSession {
    pub async fn connect(
        options: &SshTargetOptions,
        subsystem: &str,
        cache: Option<Arc<ConnectionCache>>,
    ) -> Result<Self, SshError> {
        let mut session = SshSession::connect(options, cache).await?;
        session.invoke_subsystem(subsystem).await?;
        Ok(Self { session })
    }

    pub(crate) fn from_session(session: SshSession) -> Self {
        Self { session }
    }
}

impl Deref for SshClientSession {
    type Target = SshSession;

    fn deref(&self) -> &SshSession {
        &self.session
    }
}

impl DerefMut for SshClientSession {
    fn deref_mut(&mut self) -> &mut SshSession {
        &mut self.session
    }
}

/// A long-lived remote pipe: the command is exec'd on the channel and the
/// session stays open for streaming I/O. For run-to-completion commands use
/// [`crate::SshCommand`] instead.
pub struct SshCommandSession {
    session: SshSession,
}

impl SshCommandSession {
    pub async fn connect(
        options: &SshTargetOptions,
        command: &str,
        cache: Option<Arc<ConnectionCache>>,
    ) -> Result<Self, SshError> {
        let mut session = SshSession::connect(options, cache).await?;
        debug!(session = %session.id(), command, "starting remote command");
        let requested = match session.channel.as_mut() {
            None => Err(SshError::SessionClosed),
            Some(channel) => channel.exec(true, command).await.map_err(SshError::Channel),
        };
        let result = match requested {
            Ok(()) => session.await_request_reply("exec").await,
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            session.close().await;
            return Err(error);
        }
        Ok(Self { session })
    }

    /// Wait for the remote command to exit.
    pub async fn recv_exit_status(&mut self) -> Result<u32, SshError> {
        self.session.recv_exit_status_inner().await
    }
}

impl Deref for SshCommandSession {
    type Target = SshSession;

    fn deref(&self) -> &SshSession {
        &self.session
    }
}

impl DerefMut for SshCommandSession {
    fn deref_mut(&mut self) -> &mut SshSession {
        &mut self.session
    }
}
