use anyhow::Context;
use clap::Parser;
use shoal::backend::MemBackend;
use shoal::logging;
use tokio_util::sync::CancellationToken;

/// An in-memory RESP cache backend for local runs and benchmarks.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// The port to listen on for RESP clients.
    #[arg(long, default_value = "6379", env = "LISTEN_PORT")]
    listen_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::install();
    let cli = Cli::parse();

    let listener = tokio::net::TcpListener::bind(format!("[::]:{}", cli.listen_port))
        .await
        .context("failed to bind server port")?;
    tracing::info!(port = cli.listen_port, "serving in-memory cache");

    let stop = CancellationToken::new();
    let signal_token = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received Ctrl+C, initiating shutdown");
        signal_token.cancel();
    });

    MemBackend::new().serve(listener, stop).await
}
