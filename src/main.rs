//! rideline-node daemon: wires the coordination services for one client
//! process (rider, driver, or operations) and runs until interrupted.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use rideline_node::channel::transport::WebSocketTransport;
use rideline_node::channel::ChannelConnection;
use rideline_node::config::Config;
use rideline_node::estimate::GeoPoint;
use rideline_node::location::source::{SimulatedSource, TokioTaskRunner};
use rideline_node::location::store::LocationStore;
use rideline_node::location::{LocationTracker, SamplingMode, StartOutcome};
use rideline_node::queue::OfflineQueue;
use rideline_node::trip::{Role, TripCoordinator};

#[derive(Parser)]
#[command(name = "rideline-node")]
#[command(about = "Trip coordination and offline location sync runtime")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "rideline-node.toml")]
    config: String,

    /// Data directory
    #[arg(short, long, env = "RIDELINE_DATA_DIR")]
    data_dir: Option<String>,

    /// Device ID (overrides config file)
    #[arg(long, env = "RIDELINE_DEVICE_ID")]
    device_id: Option<String>,

    /// Role: rider, driver, or operations (overrides config file)
    #[arg(long, env = "RIDELINE_ROLE")]
    role: Option<String>,

    /// Bearer token for the relay connection
    #[arg(long, env = "RIDELINE_AUTH_TOKEN")]
    auth_token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rideline_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting rideline-node");
    info!("Config file: {}", cli.config);

    let mut config = if std::path::Path::new(&cli.config).exists() {
        let content = std::fs::read_to_string(&cli.config)?;
        toml::from_str(&content)?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir.into();
    }
    if let Some(device_id) = cli.device_id {
        config.node.device_id = device_id;
    }
    if let Some(role) = cli.role {
        config.node.role = role.parse().map_err(anyhow::Error::msg)?;
    }

    info!(
        device_id = %config.node.device_id,
        role = %config.node.role,
        "node configured"
    );

    // Durable state surfaces, keyed per device
    let store = Arc::new(LocationStore::open(
        &config.node.data_dir,
        &config.node.device_id,
    )?);
    let queue = Arc::new(OfflineQueue::open(
        &config.node.data_dir,
        &config.node.device_id,
    )?);

    // Channel connection; an auth rejection is fatal, not retried
    let channel = match ChannelConnection::connect(
        Arc::new(WebSocketTransport),
        config.channel.clone(),
        &cli.auth_token,
    )
    .await
    {
        Ok(channel) => Arc::new(channel),
        Err(e) => {
            error!(error = %e, "failed to connect to relay");
            return Err(e.into());
        }
    };

    // Location tracker on the platform seams. The simulated source stands
    // in until a real positioning integration is injected here.
    let source = Arc::new(SimulatedSource::new(GeoPoint::new(52.5200, 13.4050)));
    let runner = Arc::new(TokioTaskRunner::new());
    let tracker = Arc::new(LocationTracker::new(
        source,
        runner,
        Arc::clone(&store),
        config.location.clone(),
    ));

    let coordinator = TripCoordinator::new(
        config.node.role,
        Arc::clone(&channel),
        Arc::clone(&queue),
        Arc::clone(&tracker),
        Duration::from_millis(config.queue.retry_interval_ms),
    );
    coordinator.start();

    match tracker
        .start(SamplingMode::IdleScan, coordinator.location_publisher())
        .await?
    {
        StartOutcome::Started => {}
        StartOutcome::PermissionDenied { reason } => {
            // Recoverable: the node runs without live positioning
            error!(reason, "location permission denied, tracking disabled");
        }
    }

    if config.node.role == Role::Driver {
        coordinator.set_driver_availability(true)?;
    }

    info!("rideline-node running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    if config.node.role == Role::Driver {
        coordinator.set_driver_availability(false)?;
    }
    coordinator.shutdown().await;
    tracker.stop().await;
    channel.disconnect().await;

    Ok(())
}
