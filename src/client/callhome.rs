use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::PublicKey;
use tracing::*;

use crate::auth;
use crate::client::handler::{ClientHandler, HostKeyPolicy};
use crate::client::session::{SshClientSession, SshSession};
use crate::config::SshAuthMethod;
use crate::error::SshError;

/// Inverted-direction client: the SSH *server* dials us over TCP, and we run
/// the client side of SSH on the accepted connection.
///
/// Unlike the cache's outbound connections, the peer's host key is checked
/// strictly against the caller-supplied key list.
pub struct CallHomeClient {
    listener: tokio::net::TcpListener,
}

impl CallHomeClient {
    /// Listen on `addr` (IPv4 or IPv6 depending on the bind address) for a
    /// single inbound connection.
    pub async fn bind(addr: SocketAddr) -> Result<Self, SshError> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        debug!(addr = %listener.local_addr()?, "call-home client listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SshError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection, validate the caller's host key against
    /// `host_keys` (keyed by the peer's IP address), authenticate, and open
    /// a session with `subsystem` invoked on it.
    pub async fn accept(
        &self,
        username: &str,
        auth_method: &SshAuthMethod,
        subsystem: &str,
        host_keys: &HashMap<String, Vec<PublicKey>>,
    ) -> Result<SshClientSession, SshError> {
        let (stream, peer) = self.listener.accept().await?;
        info!(%peer, "call-home connection accepted");

        let host = peer.ip().to_string();
        let handler = ClientHandler {
            policy: HostKeyPolicy::Strict {
                host: host.clone(),
                known_keys: host_keys.get(&host).cloned(),
            },
        };

        let config = Arc::new(russh::client::Config::default());
        let mut handle = russh::client::connect_stream(config, stream, handler).await?;

        if let Err(error) = auth::authenticate(&mut handle, username, auth_method).await {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
            return Err(error);
        }

        let handle = Arc::new(handle);
        let channel = match handle.channel_open_session().await {
            Ok(channel) => channel,
            Err(error) => {
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "", "")
                    .await;
                return Err(SshError::Channel(error));
            }
        };

        let mut session = SshSession::over_transport(handle, channel);
        session.invoke_subsystem(subsystem).await?;
        Ok(SshClientSession::from_session(session))
    }
}
