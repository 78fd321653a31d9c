//! A stateless RESP proxy fronting a fleet of cache backends. Commands are
//! routed to one backend by a consistent hash of a per-command routing key;
//! `DISTGET` reassembles chunked values by fanning reads out across peer
//! proxies through the fleet coordinator's broadcast channel.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use futures::{FutureExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

pub mod backend;
pub mod broadcast;
pub mod cluster;
pub mod coordinator;
pub mod distget;
pub(crate) mod hint;
pub mod logging;
pub mod metrics_server;
pub mod session;

use session::{Disposition, Session};

/// Shared process state handed to every session.
pub struct App {
    pub cluster: Arc<cluster::Cluster>,
    pub coordinator: Arc<dyn coordinator::Coordinator>,
    /// Set by leader-liveness broadcasts from the fleet coordinator.
    pub leader_active: Arc<AtomicBool>,
}

/// Wires the receiver side of the broadcast channel: the handler holds the
/// cluster by one-way reference and is invoked for every inbound payload.
pub fn register_broadcast(
    coordinator: &dyn coordinator::Coordinator,
    ctx: broadcast::BroadcastContext,
) {
    let ctx = Arc::new(ctx);
    coordinator.register_handler(Arc::new(move |payload| {
        let ctx = ctx.clone();
        broadcast::handle(ctx, payload).boxed()
    }));
}

/// Accepts and serves RESP clients until `stop` is cancelled.
pub async fn serve(
    app: Arc<App>,
    listener: TcpListener,
    stop: CancellationToken,
    max_connections: usize,
) -> anyhow::Result<()> {
    let connection_limit = Arc::new(Semaphore::new(max_connections));
    loop {
        tokio::select! {
            accept = listener.accept() => {
                let Ok((socket, addr)) = accept else {
                    continue;
                };
                let session = Session::new(app.clone());
                tokio::spawn(serve_connection(
                    session,
                    socket,
                    addr,
                    stop.child_token(),
                    connection_limit.clone(),
                ));
            }
            _ = stop.cancelled() => return Ok(()),
        }
    }
}

enum Exit {
    Closed,
    Detached,
}

#[tracing::instrument(level = "debug", err(Debug, level = "warn"), skip(session, socket, stop, connection_limit), fields(?addr))]
async fn serve_connection(
    session: Session,
    socket: TcpStream,
    addr: SocketAddr,
    stop: CancellationToken,
    connection_limit: Arc<Semaphore>,
) -> anyhow::Result<()> {
    let permit = match connection_limit.try_acquire() {
        Ok(permit) => permit,
        Err(_) => {
            metrics::counter!("shoal_rejected_connections", "reason" => "over_limit")
                .increment(1);
            anyhow::bail!("connection limit reached, rejecting connection");
        }
    };

    socket.set_nodelay(true)?;
    let mut framed = Framed::new(socket, resp::Codec);
    let mut out = BytesMut::new();

    metrics::gauge!("shoal_total_connections").increment(1.0);

    let result = async {
        loop {
            tokio::select! {
                frame = framed.next() => {
                    let Some(frame) = frame else {
                        return Ok(Exit::Closed);
                    };
                    let value = frame.context("failed to read next command")?;
                    let argv = match resp::command(value) {
                        Ok(argv) => argv,
                        Err(err) => {
                            // Malformed command shape; the connection itself
                            // is still framed correctly.
                            resp::encode(
                                &resp::Value::Error(format!("ERR {err}")),
                                &mut out,
                            );
                            framed.get_mut().write_all(&out).await?;
                            out.clear();
                            continue;
                        }
                    };
                    let disposition = session.dispatch(argv, &mut out).await;
                    framed.get_mut().write_all(&out).await?;
                    out.clear();
                    match disposition {
                        Disposition::Continue => {}
                        Disposition::Close => return Ok(Exit::Closed),
                        Disposition::Detach => return Ok(Exit::Detached),
                    }
                }
                _ = stop.cancelled() => {
                    anyhow::bail!("signalled to stop")
                }
            }
        }
    }
    .await;

    metrics::gauge!("shoal_total_connections").decrement(1.0);

    let result = match result {
        Ok(Exit::Detached) => {
            // The detach reply is written from its own task; buffered
            // pipeline input is dropped without further processing.
            tracing::info!("connection has been detached");
            let mut stream = framed.into_inner();
            tokio::spawn(async move {
                let _ = stream.write_all(b"+OK\r\n").await;
                let _ = stream.shutdown().await;
            });
            Ok(())
        }
        Ok(Exit::Closed) => {
            framed.get_mut().shutdown().await?;
            Ok(())
        }
        Err(err) => Err(err),
    };

    drop(permit);

    result
}
