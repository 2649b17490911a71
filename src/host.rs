use tracing::*;

use crate::config::SshTargetOptions;
use crate::error::SshError;
use crate::helpers::shell_escape_single_quote;
use crate::shell::ShellCommand;
use crate::SshCommand;

enum HostBackend {
    Local,
    Remote(SshTargetOptions),
}

/// Uniform command access to one machine, local or remote. Every command is
/// wrapped in `bash -c 'cd <cwd> && <command>'` so that relative paths
/// resolve against a stable working directory.
pub struct Host {
    backend: HostBackend,
    cwd: String,
}

impl Host {
    /// A handle on the local machine. When `cwd` is not given it is captured
    /// from `pwd` once, up front.
    pub async fn local(cwd: Option<String>) -> Result<Self, SshError> {
        Self::build(HostBackend::Local, cwd).await
    }

    /// A handle on a remote machine reached over SSH.
    pub async fn remote(options: SshTargetOptions, cwd: Option<String>) -> Result<Self, SshError> {
        Self::build(HostBackend::Remote(options), cwd).await
    }

    async fn build(backend: HostBackend, cwd: Option<String>) -> Result<Self, SshError> {
        let cwd = match cwd {
            Some(cwd) => cwd,
            None => {
                let pwd = match &backend {
                    HostBackend::Local => ShellCommand::new("pwd").run().await?,
                    HostBackend::Remote(options) => {
                        SshCommand::new("pwd", options.clone()).run().await?
                    }
                };
                pwd.trim().to_owned()
            }
        };
        debug!(cwd = %cwd, "host ready");
        Ok(Self { backend, cwd })
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    fn wrap(&self, command: &str) -> String {
        format!(
            "bash -c 'cd {} && {}'",
            self.cwd,
            shell_escape_single_quote(command)
        )
    }

    pub async fn run_status_stderr(&self, command: &str) -> Result<(u32, String, String), SshError> {
        let wrapped = self.wrap(command);
        match &self.backend {
            HostBackend::Local => Ok(ShellCommand::new(wrapped).run_status_stderr().await),
            HostBackend::Remote(options) => {
                SshCommand::new(wrapped, options.clone())
                    .run_status_stderr()
                    .await
            }
        }
    }

    pub async fn run_status(&self, command: &str) -> Result<(u32, String), SshError> {
        let (exit, stdout, _) = self.run_status_stderr(command).await?;
        Ok((exit, stdout))
    }

    pub async fn run_stderr(&self, command: &str) -> Result<(String, String), SshError> {
        let wrapped = self.wrap(command);
        let (exit, stdout, stderr) = self.run_status_stderr(command).await?;
        if exit != 0 {
            return Err(SshError::CommandFailed {
                exit,
                command: wrapped,
                stdout,
                stderr,
            });
        }
        Ok((stdout, stderr))
    }

    pub async fn run(&self, command: &str) -> Result<String, SshError> {
        self.run_stderr(command).await.map(|(stdout, _)| stdout)
    }
}
