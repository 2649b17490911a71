use std::net::SocketAddr;
use std::sync::Arc;

use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId};
use tokio::sync::Mutex;
use tracing::*;

use super::controller::AccessController;
use super::session::{ServerSession, SessionDelegateFactory};

/// Per-connection russh handler. Authorization is delegated to the
/// [`AccessController`]; accepted session channels are wrapped in
/// [`ServerSession`]s and registered in the server-wide list.
pub struct ServerHandler {
    peer: SocketAddr,
    controller: Arc<dyn AccessController>,
    factory: Arc<dyn SessionDelegateFactory>,
    sessions: Arc<Mutex<Vec<Arc<ServerSession>>>>,
}

impl ServerHandler {
    pub(crate) fn new(
        peer: SocketAddr,
        controller: Arc<dyn AccessController>,
        factory: Arc<dyn SessionDelegateFactory>,
        sessions: Arc<Mutex<Vec<Arc<ServerSession>>>>,
    ) -> Self {
        Self {
            peer,
            controller,
            factory,
            sessions,
        }
    }
}

impl russh::server::Handler for ServerHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.controller.check_auth_password(user, password) {
            info!(peer = %self.peer, user, "password auth accepted");
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.controller.check_channel_open_session() {
            warn!(peer = %self.peer, "session channel refused");
            return Ok(false);
        }
        let session = ServerSession::start(channel, self.peer, self.factory.create_delegate());
        debug!(peer = %self.peer, session = %session.id(), "session channel opened");
        self.sessions.lock().await.push(session);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.controller.check_subsystem(name) {
            debug!(peer = %self.peer, subsystem = name, "subsystem accepted");
            session.channel_success(channel)?;
            self.controller.subsystem_opened();
        } else {
            warn!(peer = %self.peer, subsystem = name, "subsystem refused");
            session.channel_failure(channel)?;
        }
        Ok(())
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        debug!(peer = %self.peer, "client disconnected");
    }
}
