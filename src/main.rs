//! edgegate - MQTT edge gateway entry point

use clap::{Parser, Subcommand};
use edgegate::observability::{
    init_default_logging, init_logging, metrics, HealthCheck, HealthServer, LogFormat,
};
use edgegate::transport::mqtt::MqttClient;
use edgegate::transport::Transport;
use edgegate::{EventLog, GatewayConfig, GatewayNode};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};

/// Capacity of the channel between the MQTT event loop and the inbound router
const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// MQTT edge gateway
#[derive(Parser)]
#[command(name = "edgegate")]
#[command(about = "Polls industrial devices and bridges them to an MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "EDGEGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until SIGINT or SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, log_format_from_env(), false),
        _ => init_logging(Level::TRACE, log_format_from_env(), true),
    }

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_gateway(config),
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn log_format_from_env() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()))
}

fn load_configuration(config_path: Option<&Path>) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(GatewayConfig::load_from_file(path)?);
    }

    for path_str in ["edgegate.toml", "config/edgegate.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(GatewayConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create edgegate.toml".into())
}

fn run_gateway(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    // The shared worker pool is sized from configuration, so the runtime is built by hand
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.scheduling.worker_threads)
        .thread_name("edgegate-worker")
        .enable_all()
        .build()?;

    runtime.block_on(run_node(config))
}

async fn run_node(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        node_id = %config.node.id,
        adapters = config.adapters.len(),
        "Starting edgegate v{}",
        env!("CARGO_PKG_VERSION")
    );
    let collector = metrics();
    collector.set_node_state("initializing");

    let events = Arc::new(EventLog::new());

    let health_server = Arc::new(HealthServer::new(
        config.node.id.clone(),
        config.health.port,
        events.clone(),
    ));
    tokio::spawn(health_server.clone().start());

    let mut client = MqttClient::new(&config.node.id, &config.mqtt)?;
    if let Err(e) = client.connect().await {
        // The supervisor keeps retrying in the background
        warn!(error = %e, "MQTT broker not reachable yet, continuing startup");
    }
    let client = Arc::new(client);

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    client.set_inbound_sender(inbound_tx);

    let node = Arc::new(GatewayNode::new(config, client.clone(), events));
    for (adapter_id, e) in node.start_all() {
        error!(adapter_id = %adapter_id, error = %e, "Adapter failed to start");
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        health_server
            .add_health_check(
                format!("adapter:{adapter_id}"),
                HealthCheck::new("unhealthy", e.to_string(), now),
            )
            .await;
    }
    node.subscribe_write_topics(client.as_ref()).await?;
    let inbound = tokio::spawn(node.clone().run_inbound(inbound_rx));

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Gateway is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = monitor_connection_health(&client, &health_server) => {
            error!("MQTT connection permanently lost, shutting down gateway...");
        }
    }

    if !node.shutdown().await {
        warn!("Jobs still running after the shutdown timeout were aborted");
    }
    inbound.abort();
    let _ = inbound.await;
    drop(node);

    match Arc::try_unwrap(client) {
        Ok(mut client) => {
            if let Err(e) = client.disconnect().await {
                warn!(error = %e, "MQTT disconnect failed");
            }
        }
        Err(_) => warn!("MQTT client still shared at shutdown, skipping clean disconnect"),
    }
    health_server.set_mqtt_connected(false);

    info!("Gateway shutdown complete");
    Ok(())
}

fn handle_config_command(config: &GatewayConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Effective configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

/// Mirror the MQTT connection into the health server until it is permanently lost
async fn monitor_connection_health(client: &MqttClient, health_server: &HealthServer) {
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    loop {
        interval.tick().await;
        if client.is_permanently_disconnected() {
            health_server.set_mqtt_connected(false);
            break;
        }
        health_server.set_mqtt_connected(client.is_connected());
    }
}
