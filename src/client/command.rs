use std::ops::Deref;
use std::sync::Arc;

use bytes::BytesMut;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tracing::*;

use crate::cache::{global_cache, CachedTransport, ConnectionCache};
use crate::config::SshTargetOptions;
use crate::error::SshError;
use crate::helpers;

/// A run-to-completion remote command.
///
/// Opens a channel on a cached transport, execs, drains stdout and stderr to
/// EOF, collects the exit status and releases the transport on every exit
/// path.
pub struct SshCommand {
    command: String,
    options: SshTargetOptions,
    cache: Option<Arc<ConnectionCache>>,
    pty: bool,
}

impl SshCommand {
    pub fn new(command: impl Into<String>, options: SshTargetOptions) -> Self {
        Self {
            command: command.into(),
            options,
            cache: None,
            pty: false,
        }
    }

    /// Use a specific cache instead of the process-global one.
    pub fn with_cache(mut self, cache: Arc<ConnectionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Exit status, stdout and stderr of the remote command.
    pub async fn run_status_stderr(&self) -> Result<(u32, String, String), SshError> {
        debug!(command = %self.command, host = %self.options.host, "running remote command");
        let cache = self.cache.clone().unwrap_or_else(global_cache);
        let transport = cache.get(&self.options).await?;
        let result = self.run_on(&transport).await;
        cache.release(transport);
        let (exit, stdout, stderr) = result?;
        debug!(
            command = %self.command,
            exit,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "remote command finished"
        );
        Ok((exit, stdout, stderr))
    }

    /// Exit status and stdout.
    pub async fn run_status(&self) -> Result<(u32, String), SshError> {
        let (exit, stdout, _) = self.run_status_stderr().await?;
        Ok((exit, stdout))
    }

    /// Stdout and stderr; a non-zero exit becomes
    /// [`SshError::CommandFailed`].
    pub async fn run_stderr(&self) -> Result<(String, String), SshError> {
        let (exit, stdout, stderr) = self.run_status_stderr().await?;
        if exit != 0 {
            return Err(SshError::CommandFailed {
                exit,
                command: self.command.clone(),
                stdout,
                stderr,
            });
        }
        Ok((stdout, stderr))
    }

    /// Stdout only; a non-zero exit becomes [`SshError::CommandFailed`].
    pub async fn run(&self) -> Result<String, SshError> {
        self.run_stderr().await.map(|(stdout, _)| stdout)
    }

    async fn run_on(&self, transport: &CachedTransport) -> Result<(u32, String, String), SshError> {
        let mut channel = transport
            .handle()
            .channel_open_session()
            .await
            .map_err(SshError::Channel)?;

        if self.pty {
            let (width, height) = helpers::terminal_size();
            let term = std::env::var("TERM").unwrap_or_else(|_| "xterm".to_owned());
            channel
                .request_pty(true, &term, width, height, 0, 0, &[])
                .await
                .map_err(SshError::Channel)?;
        }

        channel
            .exec(true, self.command.as_str())
            .await
            .map_err(SshError::Channel)?;

        drain_to_eof(&mut channel, self.pty).await
    }
}

/// Collect stdout/stderr until the channel reaches EOF, plus the exit
/// status. A zero-length read is the only EOF signal; request replies are
/// counted so that a refused PTY or exec surfaces as an error.
async fn drain_to_eof(
    channel: &mut Channel<Msg>,
    pty: bool,
) -> Result<(u32, String, String), SshError> {
    let mut stdout = BytesMut::new();
    let mut stderr = BytesMut::new();
    let mut exit_status = None;
    // One reply per want-reply request: the exec, plus the PTY before it.
    let mut pending_replies = if pty { 2 } else { 1 };

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { .. }) => {}
            Some(ChannelMsg::ExitStatus {
                exit_status: status,
            }) => exit_status = Some(status),
            Some(ChannelMsg::Success) => pending_replies = i32::max(pending_replies - 1, 0),
            Some(ChannelMsg::Failure) => {
                return Err(SshError::RequestDenied {
                    request: if pending_replies > 1 { "pty" } else { "exec" }.to_owned(),
                });
            }
            Some(ChannelMsg::Eof) => {}
            Some(ChannelMsg::Close) | None => break,
            Some(msg) => trace!(?msg, "ignoring channel message"),
        }
    }

    Ok((
        exit_status.unwrap_or(0),
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    ))
}

/// [`SshCommand`] that also allocates a PTY sized to the controlling
/// terminal before exec.
pub struct SshPtyCommand {
    inner: SshCommand,
}

impl SshPtyCommand {
    pub fn new(command: impl Into<String>, options: SshTargetOptions) -> Self {
        Self {
            inner: SshCommand {
                command: command.into(),
                options,
                cache: None,
                pty: true,
            },
        }
    }

    pub fn with_cache(mut self, cache: Arc<ConnectionCache>) -> Self {
        self.inner.cache = Some(cache);
        self
    }
}

impl Deref for SshPtyCommand {
    type Target = SshCommand;

    fn deref(&self) -> &SshCommand {
        &self.inner
    }
}
