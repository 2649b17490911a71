pub mod callhome;
pub mod command;
pub mod handler;
pub mod session;

pub use callhome::CallHomeClient;
pub use command::{SshCommand, SshPtyCommand};
pub use handler::{ClientHandler, HostKeyPolicy, Transport};
pub use session::{SshClientSession, SshCommandSession, SshSession, MAX_SSH_BUF};
