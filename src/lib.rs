pub use russh;

mod auth;
mod cache;
mod client;
mod config;
mod dial;
mod error;
mod helpers;
mod host;
mod server;
mod shell;

pub use cache::{
    disable_global_caching, enable_global_caching, global_cache, CacheStats, CachedTransport,
    ConnectionCache, EndpointKey,
};
pub use client::{
    CallHomeClient, ClientHandler, HostKeyPolicy, SshClientSession, SshCommand, SshCommandSession,
    SshPtyCommand, SshSession, Transport, MAX_SSH_BUF,
};
pub use config::{CacheConfig, Secret, SshAuthMethod, SshTargetOptions};
pub use error::SshError;
pub use helpers::shell_escape_single_quote;
pub use host::Host;
pub use server::{
    AccessController, HostKeySource, LoggingDelegate, ServerSession, SessionDelegate,
    SessionDelegateFactory, SshServer, SshServerConfig, UserPassController,
};
pub use shell::ShellCommand;
