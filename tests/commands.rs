mod common;

use std::io::Write;

use sshpool::{Host, ShellCommand, SshCommand, SshError, SshTargetOptions};

#[tokio::test]
async fn host_runs_in_its_working_directory() {
    let host = Host::local(Some("/".to_owned())).await.expect("host");
    let output = host.run("pwd").await.expect("pwd");
    assert_eq!(output, "/\n");
}

#[tokio::test]
async fn host_captures_cwd_on_first_use() {
    let host = Host::local(None).await.expect("host");
    let expected = ShellCommand::new("pwd").run().await.expect("pwd");
    assert_eq!(format!("{}\n", host.cwd()), expected);
}

#[tokio::test]
async fn host_failure_carries_exit_stdout_stderr() {
    let host = Host::local(Some("/".to_owned())).await.expect("host");
    let error = host
        .run("echo foo; exit 2")
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
async fn host_quoting_survives_single_quotes() {
    let host = Host::local(Some("/".to_owned())).await.expect("host");
    let output = host.run("echo 'it'\\''s quoted'").await.expect("echo");
    assert_eq!(output, "it's quoted\n");
}

#[tokio::test]
async fn host_run_variations() {
    let host = Host::local(Some("/".to_owned())).await.expect("host");

    let (status, output, stderr) = host
        .run_status_stderr("echo testing >&2; exit 3")
        .await
        .expect("run");
    assert_eq!(status, 3);
    assert_eq!(output, "");
    assert_eq!(stderr, "testing\n");

    let (status, output) = host.run_status("echo testing").await.expect("run");
    assert_eq!(status, 0);
    assert_eq!(output, "testing\n");

    let (output, stderr) = host.run_stderr("echo testing >&2").await.expect("run");
    assert_eq!(output, "");
    assert_eq!(stderr, "testing\n");
}

#[tokio::test]
async fn host_key_loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(common::HOST_KEY.as_bytes()).expect("write");

    let key = sshpool::russh::keys::load_secret_key(file.path(), None).expect("load");
    assert_eq!(
        key.public_key().clone(),
        common::host_public_key(),
    );
}

// The remaining scenarios need a real sshd accepting the current user on
// localhost, like the original integration environment provides.

#[tokio::test]
#[ignore = "requires an SSH server on localhost accepting the current user"]
async fn ssh_command_against_localhost() {
    let output = SshCommand::new("ls -d /etc", SshTargetOptions::new("localhost"))
        .run()
        .await
        .expect("ls");
    assert_eq!(output, "/etc\n");
}

#[tokio::test]
#[ignore = "requires an SSH server on localhost accepting the current user"]
async fn ssh_command_missing_executable() {
    let (status, output, stderr) =
        SshCommand::new("no-command-named-this", SshTargetOptions::new("localhost"))
            .run_status_stderr()
            .await
            .expect("run");
    assert_eq!(status, 127);
    assert_eq!(output, "");
    assert!(stderr.contains("command not found"));
}

#[tokio::test]
#[ignore = "requires an SSH server on localhost accepting the current user"]
async fn ssh_command_through_proxy() {
    let mut options = SshTargetOptions::new("localhost");
    options.proxy_command = Some(
        "ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null localhost /bin/nc %h %p"
            .to_owned(),
    );
    let output = SshCommand::new("echo testing", options)
        .run()
        .await
        .expect("echo");
    assert_eq!(output, "testing\n");
}
