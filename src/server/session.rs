use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::Msg;
use russh::{Channel, ChannelMsg, ChannelReadHalf, ChannelWriteHalf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::*;
use uuid::Uuid;

use crate::error::SshError;

/// Per-session framing and dispatch hooks, driven by the reader task.
/// The defaults just log, which is enough for connectivity tests; real
/// servers install their own delegate via [`SessionDelegateFactory`].
#[async_trait]
pub trait SessionDelegate: Send {
    async fn handle_data(&mut self, session: &ServerSession, data: Bytes) -> anyhow::Result<()> {
        debug!(session = %session.id(), len = data.len(), "session data");
        Ok(())
    }

    /// Called exactly once, from the reader task, as it exits.
    async fn reader_exited(&mut self, session: &ServerSession) {
        debug!(session = %session.id(), "reader exited");
    }
}

/// Produces one delegate per accepted session channel.
pub trait SessionDelegateFactory: Send + Sync {
    fn create_delegate(&self) -> Box<dyn SessionDelegate>;
}

impl<F> SessionDelegateFactory for F
where
    F: Fn() -> Box<dyn SessionDelegate> + Send + Sync,
{
    fn create_delegate(&self) -> Box<dyn SessionDelegate> {
        self()
    }
}

/// Delegate that only logs. Used when no factory is supplied.
pub struct LoggingDelegate;

#[async_trait]
impl SessionDelegate for LoggingDelegate {}

/// One server-side channel plus the reader task that drains it.
///
/// Terminal states: closed locally via [`close`](Self::close), by remote
/// EOF, or by a delegate error. In every case the reader task runs the
/// delegate's `reader_exited` hook on its way out.
pub struct ServerSession {
    id: Uuid,
    peer: SocketAddr,
    write: Mutex<Option<ChannelWriteHalf<Msg>>>,
    keep_running: watch::Sender<bool>,
}

impl ServerSession {
    pub(crate) fn start(
        channel: Channel<Msg>,
        peer: SocketAddr,
        delegate: Box<dyn SessionDelegate>,
    ) -> Arc<Self> {
        let (keep_running, stop_rx) = watch::channel(true);
        let (read, write) = channel.split();
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            peer,
            write: Mutex::new(Some(write)),
            keep_running,
        });

        let this = session.clone();
        tokio::spawn(async move {
            this.reader_loop(read, stop_rx, delegate).await;
        });

        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the reader is still running.
    pub fn is_active(&self) -> bool {
        *self.keep_running.borrow()
    }

    /// Write to the channel. Serialized by an internal lock so delegates and
    /// other tasks may send concurrently.
    pub async fn send(&self, data: &[u8]) -> Result<(), SshError> {
        let mut guard = self.write.lock().await;
        let Some(write) = guard.as_mut() else {
            return Err(SshError::SessionClosed);
        };
        let mut writer = write.make_writer();
        writer.write_all(data).await?;
        Ok(())
    }

    /// Stop the reader and close the channel. Idempotent.
    pub async fn close(&self) {
        let _ = self.keep_running.send(false);
        self.shutdown_write().await;
    }

    async fn shutdown_write(&self) {
        if let Some(write) = self.write.lock().await.take() {
            debug!(session = %self.id, "closing server channel");
            let _ = write.close().await;
        }
    }

    async fn reader_loop(
        self: Arc<Self>,
        mut read: ChannelReadHalf,
        mut stop: watch::Receiver<bool>,
        mut delegate: Box<dyn SessionDelegate>,
    ) {
        debug!(session = %self.id, peer = %self.peer, "reader started");
        loop {
            let msg = tokio::select! {
                _ = stop.changed() => {
                    if !*stop.borrow() {
                        debug!(session = %self.id, "reader stopping on local close");
                        break;
                    }
                    continue;
                }
                msg = read.wait() => msg,
            };

            match msg {
                Some(ChannelMsg::Data { data }) => {
                    let data = Bytes::from(data.to_vec());
                    if let Err(error) = delegate.handle_data(&self, data).await {
                        if *self.keep_running.borrow() {
                            error!(session = %self.id, %error, "delegate failed, closing session");
                            self.close().await;
                        } else {
                            debug!(session = %self.id, %error, "delegate failed during shutdown");
                        }
                        break;
                    }
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    debug!(session = %self.id, "remote closed");
                    break;
                }
                Some(msg) => {
                    trace!(session = %self.id, ?msg, "ignoring channel message");
                }
            }
        }

        let _ = self.keep_running.send(false);
        self.shutdown_write().await;
        delegate.reader_exited(&self).await;
    }
}
