//! Remote shell transport over the system OpenSSH client.
//!
//! Commands run as `ssh`, uploads as `scp`, and tunnelled connections as
//! `ssh -W host:port`, all through a [`CommandRunner`]. Password
//! authentication goes through `sshpass -e` with the secret in `SSHPASS`,
//! never on the command line.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::process::Output;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{BoxedStream, CommandRunner, RemoteShell, ShellConnector, TunnelDialer};
use crate::domain::{SshAuth, SshTarget, TransportError};
use crate::infra::command_runner::{REMOTE_CMD_TIMEOUT, TokioCommandRunner};

/// Exit status the OpenSSH client uses for its own failures.
const SSH_CLIENT_ERROR: i32 = 255;

#[cfg(windows)]
const DEVNULL: &str = "NUL";
#[cfg(not(windows))]
const DEVNULL: &str = "/dev/null";

/// A program plus its arguments, ready for a [`CommandRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    fn arg_refs(&self) -> Vec<&str> {
        self.args.iter().map(String::as_str).collect()
    }
}

fn client_options(target: &SshTarget, port_flag: &str) -> Vec<String> {
    let mut args = vec![
        port_flag.to_string(),
        target.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        format!("UserKnownHostsFile={DEVNULL}"),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
    ];
    match &target.auth {
        SshAuth::Key(path) => {
            args.push("-i".to_string());
            args.push(path.to_string_lossy().into_owned());
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        SshAuth::Password(_) => {
            args.push("-o".to_string());
            args.push("PubkeyAuthentication=no".to_string());
        }
    }
    args
}

fn wrap(target: &SshTarget, client: &str, client_args: Vec<String>) -> Invocation {
    match target.auth {
        SshAuth::Password(_) => {
            let mut args = vec!["-e".to_string(), client.to_string()];
            args.extend(client_args);
            Invocation {
                program: "sshpass".to_string(),
                args,
            }
        }
        SshAuth::Key(_) => Invocation {
            program: client.to_string(),
            args: client_args,
        },
    }
}

/// `ssh` invocation running `command` on `target`.
#[must_use]
pub fn ssh_command(target: &SshTarget, command: &str) -> Invocation {
    let mut args = client_options(target, "-p");
    args.push(target.destination());
    args.push(command.to_string());
    wrap(target, "ssh", args)
}

/// `scp` invocation copying `local` to `remote` on `target`.
#[must_use]
pub fn scp_command(target: &SshTarget, local: &Path, remote: &str) -> Invocation {
    let mut args = client_options(target, "-P");
    args.push(local.to_string_lossy().into_owned());
    args.push(format!("{}:{remote}", target.destination()));
    wrap(target, "scp", args)
}

/// `ssh -W` invocation whose stdin/stdout carry a TCP stream to
/// `dest_host:dest_port` opened from `entry`.
#[must_use]
pub fn forward_command(entry: &SshTarget, dest_host: &str, dest_port: u16) -> Invocation {
    let mut args = client_options(entry, "-p");
    args.push("-W".to_string());
    args.push(format!("{dest_host}:{dest_port}"));
    args.push(entry.destination());
    wrap(entry, "ssh", args)
}

/// A runner that carries the password for `sshpass -e`, if any.
#[must_use]
pub fn runner_for(target: &SshTarget, timeout: Duration) -> TokioCommandRunner {
    let runner = TokioCommandRunner::new(timeout);
    match &target.auth {
        SshAuth::Password(password) => runner.with_env("SSHPASS", password),
        SshAuth::Key(_) => runner,
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Commands and uploads on one SSH target.
pub struct OpenSshTransport<R: CommandRunner> {
    runner: R,
    target: SshTarget,
}

impl<R: CommandRunner> OpenSshTransport<R> {
    pub fn new(runner: R, target: SshTarget) -> Self {
        Self { runner, target }
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<Output, TransportError> {
        self.runner
            .run(&invocation.program, &invocation.arg_refs())
            .await
            .map_err(|e| TransportError::Spawn {
                program: invocation.program.clone(),
                reason: format!("{e:#}"),
            })
    }

    /// Classify a finished client process. `earlier` is output captured from
    /// previous commands of the same batch.
    fn check(&self, command: &str, output: Output, earlier: &str) -> Result<String, TransportError> {
        let stdout = text(&output.stdout);
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = text(&output.stderr);
        if output.status.code() == Some(SSH_CLIENT_ERROR) {
            return Err(TransportError::Connect {
                host: self.target.host.clone(),
                reason: stderr,
            });
        }
        let captured = if earlier.is_empty() {
            stdout
        } else {
            format!("{earlier}\n{stdout}")
        };
        Err(TransportError::CommandFailed {
            command: command.to_string(),
            status: output.status.to_string(),
            stdout: captured,
            stderr,
        })
    }
}

#[async_trait]
impl<R: CommandRunner> RemoteShell for OpenSshTransport<R> {
    async fn run_command(&self, command: &str) -> Result<String> {
        tracing::debug!(host = %self.target.host, command, "remote command");
        let output = self.invoke(&ssh_command(&self.target, command)).await?;
        Ok(self.check(command, output, "")?)
    }

    async fn run_commands(&self, commands: &[String]) -> Result<String> {
        let mut combined = String::new();
        for command in commands {
            tracing::debug!(host = %self.target.host, command = %command, "remote command");
            let output = self.invoke(&ssh_command(&self.target, command)).await?;
            let stdout = self.check(command, output, &combined)?;
            if !stdout.is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&stdout);
            }
        }
        Ok(combined)
    }

    async fn upload_file(&self, local: &Path, remote: &str, executable: bool) -> Result<()> {
        let invocation = scp_command(&self.target, local, remote);
        let output = self.invoke(&invocation).await?;
        self.check(&format!("scp {} {remote}", local.display()), output, "")?;
        if executable {
            self.run_command(&format!("chmod +x '{remote}'")).await?;
        }
        Ok(())
    }
}

/// Builds [`OpenSshTransport`]s.
pub struct OpenSshConnector {
    timeout: Duration,
}

impl OpenSshConnector {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for OpenSshConnector {
    fn default() -> Self {
        Self::new(REMOTE_CMD_TIMEOUT)
    }
}

impl ShellConnector for OpenSshConnector {
    fn connect(&self, target: &SshTarget) -> Box<dyn RemoteShell> {
        Box::new(OpenSshTransport::new(
            runner_for(target, self.timeout),
            target.clone(),
        ))
    }
}

/// Dials tunnelled connections with one `ssh -W` process each.
#[derive(Default)]
pub struct SshDialer;

#[async_trait]
impl TunnelDialer for SshDialer {
    async fn dial(&self, entry: &SshTarget, dest_host: &str, dest_port: u16) -> Result<BoxedStream> {
        let invocation = forward_command(entry, dest_host, dest_port);
        let runner = runner_for(entry, REMOTE_CMD_TIMEOUT);
        let child = runner.spawn(&invocation.program, &invocation.arg_refs())?;
        let route = format!("{dest_host}:{dest_port} via {}", entry.host);
        Ok(Box::new(SshChannel::new(child, route)?))
    }
}

/// The stdin/stdout of an `ssh -W` process as one duplex stream.
///
/// Shutting down the write half closes the child's stdin, which the client
/// forwards as EOF to the destination. The child itself is handed to
/// [`watch_exit`], which reports a failed dial and kills the client once the
/// channel is dropped.
pub struct SshChannel {
    stdout: ChildStdout,
    stdin: Option<ChildStdin>,
    closed: CancellationToken,
}

impl SshChannel {
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the child was spawned without piped stdio.
    pub fn new(mut child: Child, route: String) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("ssh child has no stdout pipe"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("ssh child has no stdin pipe"))?;
        let closed = CancellationToken::new();
        tokio::spawn(watch_exit(child, route, closed.clone()));
        Ok(Self {
            stdout,
            stdin: Some(stdin),
            closed,
        })
    }
}

impl Drop for SshChannel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Wait for a forwarding client to exit and log a non-zero exit together with
/// its stderr.
///
/// `ssh -W` always spawns, so authentication and dial failures only show up
/// here. Once `closed` fires, a client that is still running is killed
/// without a report. Returns the logged failure, if any.
pub async fn watch_exit(
    mut child: Child,
    route: String,
    closed: CancellationToken,
) -> Option<String> {
    let stderr = child.stderr.take();
    let mut errors = Vec::new();
    let status = tokio::select! {
        (status, ()) = async {
            tokio::join!(child.wait(), async {
                if let Some(mut pipe) = stderr {
                    let _ = pipe.read_to_end(&mut errors).await;
                }
            })
        } => status.ok(),
        () = closed.cancelled() => match child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                let _ = child.kill().await;
                None
            }
        },
    };
    let status = status.filter(|s| !s.success())?;
    let errors = String::from_utf8_lossy(&errors);
    let errors = errors.trim();
    tracing::warn!(%route, %status, stderr = errors, "tunnel dial failed");
    Some(format!("{status}: {errors}"))
}

impl AsyncRead for SshChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "write half already shut down")
}

impl AsyncWrite for SshChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_write(cx, buf),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        if let Some(stdin) = self.stdin.as_mut() {
            match Pin::new(stdin).poll_flush(cx) {
                Poll::Ready(Ok(())) => {}
                other => return other,
            }
        }
        self.stdin = None;
        Poll::Ready(Ok(()))
    }
}
