use tokio::process::Command;
use tracing::*;

use crate::error::SshError;

/// Local twin of [`crate::SshCommand`]: runs the command through
/// `/bin/sh -c` and exposes the same four run methods.
pub struct ShellCommand {
    command: String,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Exit status, stdout and stderr. A spawn failure is reported as exit
    /// code 1 with empty output rather than an error.
    pub async fn run_status_stderr(&self) -> (u32, String, String) {
        debug!(command = %self.command, "running local command");
        match Command::new("/bin/sh")
            .arg("-c")
            .arg(&self.command)
            .output()
            .await
        {
            Ok(output) => {
                let exit = output.status.code().map(|c| c as u32).unwrap_or(1);
                (
                    exit,
                    String::from_utf8_lossy(&output.stdout).into_owned(),
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                )
            }
            Err(error) => {
                debug!(command = %self.command, %error, "local command failed to spawn");
                (1, String::new(), String::new())
            }
        }
    }

    pub async fn run_status(&self) -> (u32, String) {
        let (exit, stdout, _) = self.run_status_stderr().await;
        (exit, stdout)
    }

    pub async fn run_stderr(&self) -> Result<(String, String), SshError> {
        let (exit, stdout, stderr) = self.run_status_stderr().await;
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

    pub async fn run(&self) -> Result<String, SshError> {
        self.run_stderr().await.map(|(stdout, _)| stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let (exit, stdout, stderr) = ShellCommand::new("echo testing").run_status_stderr().await;
        assert_eq!(exit, 0);
        assert_eq!(stdout, "testing\n");
        assert_eq!(stderr, "");
    }

    #[tokio::test]
    async fn captures_stderr_and_status() {
        let (exit, stdout, stderr) = ShellCommand::new("echo testing >&2; exit 3")
            .run_status_stderr()
            .await;
        assert_eq!(exit, 3);
        assert_eq!(stdout, "");
        assert_eq!(stderr, "testing\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_command_failed() {
        let error = ShellCommand::new("echo foo; exit 2")
            .run()
            .await
            .expect_err("exit 2 must fail");
        match error {
            SshError::CommandFailed {
                exit,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(exit, 2);
                assert_eq!(stdout, "foo\n");
                assert_eq!(stderr, "");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_command_is_127() {
        let (exit, stdout, stderr) = ShellCommand::new("no-command-named-this")
            .run_status_stderr()
            .await;
        assert_eq!(exit, 127);
        assert_eq!(stdout, "");
        assert!(stderr.contains("not found"));
    }
}
