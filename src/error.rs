use std::io;

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },

    #[error("connection to {host}:{port} failed")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("authentication failed for {username}: {reason}")]
    Auth { username: String, reason: String },

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Key(#[from] russh::keys::Error),

    #[error("channel operation failed")]
    Channel(#[source] russh::Error),

    #[error("{request} request denied by server")]
    RequestDenied { request: String },

    #[error("host key mismatch for {host}")]
    HostKeyMismatch {
        host: String,
        received_key_type: String,
        received_key_base64: String,
        known_key_type: String,
        known_key_base64: String,
    },

    #[error("no host key known for {host}")]
    HostKeyUnknown { host: String },

    #[error("command '{command}' returned non-zero exit status {exit}")]
    CommandFailed {
        exit: u32,
        command: String,
        stdout: String,
        stderr: String,
    },

    #[error("session is closed")]
    SessionClosed,

    #[error("I/O: {0}")]
    Io(#[from] io::Error),
}
