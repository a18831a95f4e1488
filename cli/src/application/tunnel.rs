//! Local port forwarding through an SSH entry host.
//!
//! [`open_tunnel`] spawns an accept loop on a local listener. Every accepted
//! connection is dialled through the entry host to the real destination and
//! then copied in both directions at once. Each direction forwards EOF as a
//! write shutdown on the far side, so a half-closed connection keeps flowing
//! the other way until it ends too. A copy error cancels the sibling
//! direction of that connection only.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::application::ports::TunnelDialer;
use crate::domain::SshTarget;

/// Where tunnelled connections go.
#[derive(Debug, Clone)]
pub struct TunnelRoute {
    pub entry: SshTarget,
    pub dest_host: String,
    pub dest_port: u16,
}

/// A running port forward. Stopping (or dropping) it ends the accept loop and
/// every session it started.
#[derive(Debug)]
pub struct ForwardHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ForwardHandle {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting, tear down open sessions and wait for the loop to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "port forward task ended abnormally");
            }
        }
    }
}

impl Drop for ForwardHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Bind the first free port in `[min, max]` on the loopback interface.
///
/// # Errors
///
/// Returns an error when every port in the range is taken.
pub async fn bind_first_free(min: u16, max: u16) -> Result<TcpListener> {
    for port in min..=max {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => tracing::trace!(port, error = %e, "port unavailable"),
        }
    }
    anyhow::bail!("no free local port in range {min}-{max}")
}

/// Start forwarding connections accepted on `listener` along `route`.
///
/// Returns as soon as the accept loop is running.
///
/// # Errors
///
/// Returns an error if the listener has no local address.
pub fn open_tunnel(
    listener: TcpListener,
    dialer: Arc<dyn TunnelDialer>,
    route: TunnelRoute,
) -> Result<ForwardHandle> {
    let local_addr = listener.local_addr().context("listener has no local address")?;
    let cancel = CancellationToken::new();
    let task = tokio::spawn(accept_loop(listener, dialer, Arc::new(route), cancel.clone()));
    tracing::debug!(%local_addr, "port forward listening");
    Ok(ForwardHandle {
        local_addr,
        cancel,
        task: Some(task),
    })
}

async fn accept_loop(
    listener: TcpListener,
    dialer: Arc<dyn TunnelDialer>,
    route: Arc<TunnelRoute>,
    cancel: CancellationToken,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "accepted tunnel connection");
                    sessions.spawn(forward(
                        stream,
                        Arc::clone(&dialer),
                        Arc::clone(&route),
                        cancel.child_token(),
                    ));
                }
                Err(e) => tracing::warn!(error = %e, "local accept failed"),
            },
            Some(done) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = done {
                    tracing::warn!(error = %e, "tunnel session panicked");
                }
            }
        }
    }
    sessions.shutdown().await;
}

async fn forward(
    local: TcpStream,
    dialer: Arc<dyn TunnelDialer>,
    route: Arc<TunnelRoute>,
    session: CancellationToken,
) {
    let remote = match dialer
        .dial(&route.entry, &route.dest_host, route.dest_port)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(
                entry = %route.entry.host,
                dest = %format!("{}:{}", route.dest_host, route.dest_port),
                error = %format!("{e:#}"),
                "tunnel dial failed"
            );
            return;
        }
    };

    let (local_read, local_write) = local.into_split();
    let (remote_read, remote_write) = tokio::io::split(remote);

    let (sent, received) = tokio::join!(
        pipe(local_read, remote_write, session.clone(), "upstream"),
        pipe(remote_read, local_write, session.clone(), "downstream"),
    );
    tracing::debug!(
        sent = sent.unwrap_or(0),
        received = received.unwrap_or(0),
        "tunnel session closed"
    );
}

/// Copy one direction until EOF, then shut down the writer so the far side
/// sees EOF too.
async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    session: CancellationToken,
    direction: &'static str,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::select! {
        r = tokio::io::copy(&mut reader, &mut writer) => r,
        () = session.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "session cancelled")),
    };
    match &copied {
        Ok(_) => {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(direction, error = %e, "shutdown after EOF failed");
            }
        }
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
        Err(e) => {
            tracing::warn!(direction, error = %e, "tunnel copy failed");
            session.cancel();
        }
    }
    copied
}
