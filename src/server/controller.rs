use tokio::sync::watch;
use tracing::*;

use crate::config::Secret;

/// Authorization hooks for the server: who may log in, which channel kinds
/// may open, and which subsystems may be invoked. Implementations must be
/// cheap; they are consulted from the protocol handlers.
pub trait AccessController: Send + Sync {
    fn check_auth_password(&self, username: &str, password: &str) -> bool;

    fn check_channel_open_session(&self) -> bool {
        true
    }

    fn check_subsystem(&self, name: &str) -> bool;

    /// Called once a subsystem channel has been accepted, letting callers
    /// wait for readiness.
    fn subsystem_opened(&self) {}
}

/// Controller accepting exactly one username/password pair and only the
/// `"netconf"` subsystem.
pub struct UserPassController {
    username: String,
    password: Secret,
    ready: watch::Sender<bool>,
}

impl UserPassController {
    pub fn new(username: impl Into<String>, password: impl Into<Secret>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            username: username.into(),
            password: password.into(),
            ready,
        }
    }

    /// Wait until a client has opened an authorized subsystem channel.
    pub async fn wait_subsystem_opened(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|opened| *opened).await;
    }
}

impl AccessController for UserPassController {
    fn check_auth_password(&self, username: &str, password: &str) -> bool {
        let ok = self.username == username && self.password.expose() == password;
        if !ok {
            warn!(username, "rejecting password auth");
        }
        ok
    }

    fn check_subsystem(&self, name: &str) -> bool {
        name == "netconf"
    }

    fn subsystem_opened(&self) {
        let _ = self.ready.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configured_pair_is_accepted() {
        let ctl = UserPassController::new("admin", "secret");
        assert!(ctl.check_auth_password("admin", "secret"));
        assert!(!ctl.check_auth_password("admin", "wrong"));
        assert!(!ctl.check_auth_password("root", "secret"));
    }

    #[test]
    fn only_netconf_subsystem_is_accepted() {
        let ctl = UserPassController::new("admin", "secret");
        assert!(ctl.check_subsystem("netconf"));
        assert!(!ctl.check_subsystem("sftp"));
    }
}
