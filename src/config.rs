use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A password or key passphrase. Kept out of `Debug` output (and therefore
/// log lines); the value only leaves through [`expose`](Secret::expose) at
/// the point it is handed to the SSH library.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

fn _default_ssh_port() -> u16 {
    22
}

fn _default_username() -> String {
    whoami::username()
}

fn _default_close_timeout() -> Duration {
    Duration::from_secs(1)
}

fn _default_max_channels() -> usize {
    8
}

/// Where and how to connect for the client-side operations.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SshTargetOptions {
    pub host: String,
    #[serde(default = "_default_ssh_port")]
    pub port: u16,
    #[serde(default = "_default_username")]
    pub username: String,
    #[serde(default)]
    pub auth: SshAuthMethod,
    #[serde(default)]
    pub proxy_command: Option<String>,
}

impl SshTargetOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: _default_ssh_port(),
            username: _default_username(),
            auth: SshAuthMethod::default(),
            proxy_command: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SshAuthMethod {
    Password {
        password: Secret,
    },
    #[serde(rename = "publickey")]
    Key {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<Secret>,
    },
    #[default]
    Agent,
}

/// Tuning for a [`crate::ConnectionCache`].
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    /// How long a released transport is kept around for reuse.
    #[serde(default = "_default_close_timeout", with = "humantime_serde")]
    pub close_timeout: Duration,
    /// How many channels may share one transport before another one is dialed.
    #[serde(default = "_default_max_channels")]
    pub max_channels: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            close_timeout: _default_close_timeout(),
            max_channels: _default_max_channels(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_options_defaults() {
        let options: SshTargetOptions = serde_json::from_str(r#"{"host": "example.org"}"#)
            .expect("minimal target options should deserialize");
        assert_eq!(options.port, 22);
        assert_eq!(options.username, whoami::username());
        assert!(matches!(options.auth, SshAuthMethod::Agent));
        assert!(options.proxy_command.is_none());
    }

    #[test]
    fn cache_config_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.close_timeout, Duration::from_secs(1));
        assert_eq!(config.max_channels, 8);
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let auth = SshAuthMethod::Password {
            password: "hunter2".into(),
        };
        let rendered = format!("{auth:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
