use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::*;

use crate::error::SshError;

/// The byte stream under an SSH transport: either a plain TCP connection or
/// the stdio of a proxy-command subprocess.
#[derive(Debug)]
pub enum TargetStream {
    Tcp(TcpStream),
    Proxy(ProxyStream),
}

/// A subprocess whose stdin/stdout stand in for the TCP socket. The child is
/// killed when the stream is dropped.
#[derive(Debug)]
pub struct ProxyStream {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

pub(crate) fn render_proxy_command(template: &str, host: &str, port: u16) -> String {
    template
        .replace("%h", host)
        .replace("%p", &port.to_string())
}

/// Dial `host:port`, trying every resolved address in order, or spawn the
/// proxy command when one is configured. No retries: a single pass over the
/// candidate addresses.
pub async fn connect(
    host: &str,
    port: u16,
    proxy_command: Option<&str>,
) -> Result<TargetStream, SshError> {
    if let Some(template) = proxy_command {
        let rendered = render_proxy_command(template, host, port);
        debug!(command = %rendered, "spawning proxy command");
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&rendered)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SshError::Io(io::Error::other("proxy command stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SshError::Io(io::Error::other("proxy command stdout unavailable")))?;
        return Ok(TargetStream::Proxy(ProxyStream {
            _child: child,
            stdin,
            stdout,
        }));
    }

    let addresses: Vec<_> = lookup_host((host, port))
        .await
        .map_err(|error| {
            debug!(host, port, %error, "address resolution failed");
            SshError::Resolve {
                host: host.to_owned(),
                port,
            }
        })?
        .collect();

    if addresses.is_empty() {
        return Err(SshError::Resolve {
            host: host.to_owned(),
            port,
        });
    }

    let mut last_error = None;
    for address in addresses {
        debug!(%address, "connecting");
        match TcpStream::connect(address).await {
            Ok(stream) => return Ok(TargetStream::Tcp(stream)),
            Err(error) => {
                debug!(%address, %error, "connect attempt failed");
                last_error = Some(error);
            }
        }
    }

    Err(SshError::Connect {
        host: host.to_owned(),
        port,
        source: last_error
            .unwrap_or_else(|| io::Error::other("no connect attempt was made")),
    })
}

impl AsyncRead for TargetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TargetStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            TargetStream::Proxy(proxy) => Pin::new(&mut proxy.stdout).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TargetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TargetStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            TargetStream::Proxy(proxy) => Pin::new(&mut proxy.stdin).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TargetStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            TargetStream::Proxy(proxy) => Pin::new(&mut proxy.stdin).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TargetStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            TargetStream::Proxy(proxy) => Pin::new(&mut proxy.stdin).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn proxy_command_substitution() {
        assert_eq!(
            render_proxy_command("nc %h %p", "example.org", 830),
            "nc example.org 830"
        );
        assert_eq!(render_proxy_command("nc fixed 22", "h", 1), "nc fixed 22");
    }

    #[tokio::test]
    async fn proxy_stream_round_trip() {
        // `cat` echoes its stdin, which makes the pipe pair observable.
        let mut stream = connect("unused", 22, Some("cat"))
            .await
            .expect("spawning cat must succeed");
        stream.write_all(b"ping").await.expect("write");
        stream.flush().await.expect("flush");
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn resolve_failure() {
        let result = connect("host.invalid.sshpool.test", 22, None).await;
        assert!(matches!(
            result,
            Err(SshError::Resolve { .. }) | Err(SshError::Connect { .. })
        ));
    }
}
