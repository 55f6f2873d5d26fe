use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use flotilla::app::{self, Collaborators};
use flotilla::config::SchedulerConfig;
use flotilla::leader::InMemoryLeaseApi;
use flotilla::publisher::InMemoryEventSink;
use flotilla::repository::InMemoryJobRepository;
use flotilla::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "flotilla")]
#[command(about = "Control-plane scheduler for a cluster job orchestrator")]
struct Args {
    /// Path to the YAML configuration document. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the gRPC listen port from the configuration.
    #[arg(long)]
    grpc_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SchedulerConfig::from_file(path)?,
        None => SchedulerConfig::default(),
    };
    if let Some(port) = args.grpc_port {
        config.grpc_listen_addr.set_port(port);
    }

    tracing::info!(
        addr = %config.grpc_listen_addr,
        leader_mode = ?config.leader_mode,
        cycle_period_ms = config.cycle_period_ms,
        "starting flotilla scheduler"
    );

    // The durable repository, event bus, and coordination service are
    // deployment concerns; the binary wires in-process stand-ins so a single
    // node can be run against real executors out of the box.
    let collaborators = Collaborators {
        job_repository: Arc::new(InMemoryJobRepository::new()),
        event_sink: Arc::new(InMemoryEventSink::new(1)),
        lease_api: Some(Arc::new(InMemoryLeaseApi::new())),
    };

    let shutdown = install_shutdown_handler()?;
    app::run(config, collaborators, shutdown).await?;

    Ok(())
}
