use russh::keys::{PublicKey, PublicKeyBase64};
use tracing::*;

use crate::error::SshError;

/// An authenticated russh client handle as pooled by the cache.
pub type Transport = russh::client::Handle<ClientHandler>;

/// How the client treats the server's host key.
///
/// The cache's outbound connections default to [`HostKeyPolicy::AcceptAny`]
/// (the call sites own trust decisions); the call-home client pins keys.
#[derive(Clone, Debug)]
pub enum HostKeyPolicy {
    AcceptAny,
    /// Accept only a key from the list recorded for `host`. `None` means the
    /// host has no entry at all.
    Strict {
        host: String,
        known_keys: Option<Vec<PublicKey>>,
    },
}

pub struct ClientHandler {
    pub policy: HostKeyPolicy,
}

impl russh::client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.policy {
            HostKeyPolicy::AcceptAny => {
                debug!(
                    key = %server_public_key.public_key_base64(),
                    "accepting server host key"
                );
                Ok(true)
            }
            HostKeyPolicy::Strict { host, known_keys } => {
                let Some(known_keys) = known_keys else {
                    warn!(host, "no host key recorded for server");
                    return Err(SshError::HostKeyUnknown { host: host.clone() });
                };
                let received = server_public_key.public_key_base64();
                if known_keys.iter().any(|k| k.public_key_base64() == received) {
                    return Ok(true);
                }
                match known_keys.first() {
                    Some(expected) => {
                        warn!(host, "server host key does not match any recorded key");
                        Err(SshError::HostKeyMismatch {
                            host: host.clone(),
                            received_key_type: server_public_key.algorithm().to_string(),
                            received_key_base64: received,
                            known_key_type: expected.algorithm().to_string(),
                            known_key_base64: expected.public_key_base64(),
                        })
                    }
                    None => Err(SshError::HostKeyUnknown { host: host.clone() }),
                }
            }
        }
    }
}
