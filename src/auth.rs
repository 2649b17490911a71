use std::sync::Arc;

use russh::keys::agent::client::AgentClient;
use russh::keys::PrivateKeyWithHashAlg;
use tracing::*;

use crate::client::handler::Transport;
use crate::config::{Secret, SshAuthMethod};
use crate::error::SshError;

/// Run the credential fallback chain against a freshly connected transport:
/// password (when configured), then every agent identity in order, then the
/// explicit private key. Intermediate rejections are swallowed so that later
/// credentials get their turn, but each one is logged; only the last
/// candidate's failure is surfaced.
pub(crate) async fn authenticate(
    handle: &mut Transport,
    username: &str,
    auth: &SshAuthMethod,
) -> Result<(), SshError> {
    let mut last_failure = None;

    if let SshAuthMethod::Password { password } = auth {
        match try_password(handle, username, password).await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                warn!(username, "password rejected, trying agent keys");
                last_failure = Some(SshError::Auth {
                    username: username.to_owned(),
                    reason: "password rejected".to_owned(),
                });
            }
            Err(error) => {
                warn!(username, %error, "password auth errored, trying agent keys");
                last_failure = Some(SshError::Auth {
                    username: username.to_owned(),
                    reason: error.to_string(),
                });
            }
        }
    }

    match AgentClient::connect_env().await {
        Ok(mut agent) => {
            let identities = match agent.request_identities().await {
                Ok(identities) => identities,
                Err(error) => {
                    warn!(%error, "could not list agent identities");
                    vec![]
                }
            };
            for (index, identity) in identities.into_iter().enumerate() {
                let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
                match handle
                    .authenticate_publickey_with(
                        username,
                        identity.public_key().into_owned(),
                        hash_alg,
                        &mut agent,
                    )
                    .await
                {
                    Ok(result) if result.success() => {
                        debug!(username, index, "authenticated with agent key");
                        return Ok(());
                    }
                    Ok(_) => {
                        warn!(username, index, "agent key rejected");
                        last_failure = Some(SshError::Auth {
                            username: username.to_owned(),
                            reason: format!("agent key #{index} rejected"),
                        });
                    }
                    Err(error) => {
                        warn!(username, index, %error, "agent key auth errored");
                        last_failure = Some(SshError::Auth {
                            username: username.to_owned(),
                            reason: error.to_string(),
                        });
                    }
                }
            }
        }
        Err(error) => {
            debug!(%error, "no ssh agent available");
        }
    }

    if let SshAuthMethod::Key { path, passphrase } = auth {
        // The explicit key goes last, and as the last candidate even a key
        // that fails to load is the failure that gets surfaced.
        let key = match russh::keys::load_secret_key(
            path,
            passphrase.as_ref().map(|p| p.expose()),
        ) {
            Ok(key) => Arc::new(key),
            Err(error) => {
                warn!(username, path = %path.display(), %error, "could not load private key");
                return Err(SshError::Key(error));
            }
        };
        let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
        let result = handle
            .authenticate_publickey(username, PrivateKeyWithHashAlg::new(key, hash_alg))
            .await?;
        if result.success() {
            debug!(username, "authenticated with private key");
            return Ok(());
        }
        return Err(SshError::Auth {
            username: username.to_owned(),
            reason: "private key rejected".to_owned(),
        });
    }

    Err(last_failure.unwrap_or_else(|| SshError::Auth {
        username: username.to_owned(),
        reason: "no credentials accepted".to_owned(),
    }))
}

async fn try_password(
    handle: &mut Transport,
    username: &str,
    password: &Secret,
) -> Result<bool, russh::Error> {
    let result = handle
        .authenticate_password(username, password.expose())
        .await?;
    if result.success() {
        debug!(username, "authenticated with password");
        Ok(true)
    } else {
        Ok(false)
    }
}
