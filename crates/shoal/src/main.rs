use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use shoal::broadcast::BroadcastContext;
use shoal::cluster::{Cluster, ClusterConfig};
use shoal::coordinator::{Coordinator, SoloCoordinator};
use shoal::{logging, metrics_server, App};
use tokio_util::sync::CancellationToken;

/// A RESP proxy routing commands across a fleet of cache backends.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// The port to listen on for RESP clients.
    #[arg(long, default_value = "6379", env = "LISTEN_PORT")]
    listen_port: u16,

    /// Initial backend members, comma-separated, fmt: host:port.
    #[arg(long, env = "MEMBERS", value_delimiter = ',', required = true)]
    members: Vec<String>,

    /// Partition count for the consistent hashring.
    #[arg(long, default_value = "27103", env = "PARTITIONS")]
    partitions: usize,

    /// Replication factor for the consistent hashring.
    #[arg(long, default_value = "10", env = "REPLICATION_FACTOR")]
    replication_factor: usize,

    /// Maximum idle connections kept per backend.
    #[arg(long, default_value = "3", env = "MAX_IDLE")]
    max_idle: usize,

    /// Maximum active connections per backend; also caps distributed-get
    /// chunk-read parallelism.
    #[arg(long, default_value = "1000", env = "MAX_ACTIVE")]
    max_active: usize,

    /// Worker tasks per backend.
    #[arg(long, default_value = "100", env = "WORKERS")]
    workers: usize,

    /// Maximum number of client connections to allow at once.
    #[arg(long, default_value = "300", env = "MAX_CONNECTIONS")]
    max_connections: usize,

    /// The port to listen on for prometheus metrics.
    #[arg(long, default_value = "9090", env = "METRICS_PORT")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::install();
    let cli = Cli::parse();

    tracing::info!("starting shoal");

    let config = ClusterConfig {
        partitions: cli.partitions,
        replication_factor: cli.replication_factor,
        max_idle: cli.max_idle,
        max_active: cli.max_active,
        workers: cli.workers,
    };
    let cluster = Arc::new(Cluster::new(config));
    for host in &cli.members {
        cluster.add_member(host);
    }
    cluster
        .ping_members()
        .await
        .context("backend ping failed during startup")?;

    let coordinator = SoloCoordinator::new(format!("127.0.0.1:{}", cli.listen_port));
    let leader_active = Arc::new(AtomicBool::new(false));
    shoal::register_broadcast(
        coordinator.as_ref(),
        BroadcastContext {
            cluster: cluster.clone(),
            self_id: coordinator.name(),
            leader_active: leader_active.clone(),
            max_active: cli.max_active,
        },
    );
    let app = Arc::new(App {
        cluster: cluster.clone(),
        coordinator: coordinator.clone(),
        leader_active,
    });

    let cancel_token = CancellationToken::new();

    // Cancel the token on SIGINT or SIGTERM.
    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, initiating shutdown"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, initiating shutdown"),
        }
        signal_token.cancel();
    });

    let metrics_listener =
        tokio::net::TcpListener::bind(format!("[::]:{}", cli.metrics_port))
            .await
            .context("failed to bind metrics port")?;
    tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_server::build_router())
            .await
            .unwrap()
    });

    let listener = tokio::net::TcpListener::bind(format!("[::]:{}", cli.listen_port))
        .await
        .context("failed to bind server port")?;
    tracing::info!(
        port = cli.listen_port,
        members = ?cli.members,
        "serving RESP clients"
    );

    shoal::serve(app, listener, cancel_token.clone(), cli.max_connections).await?;

    cluster.shutdown().await;
    tracing::info!("bye");
    Ok(())
}
