//! MQTT session runner - Main Entry Point
//!
//! Runs one resilient session from a TOML configuration file and logs every
//! inbound message.

use mqtt_session::config::{ConfigStore, FileConfigStore, StoredSettings, DEFAULT_CONFIG_PATHS};
use mqtt_session::observability::init_default_logging;
use mqtt_session::session::{handler_fn, ConnectionState, HandlerError, SessionManager};
use mqtt_session::transport::MqttTransport;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::{signal, time::Duration};
use tracing::{debug, error, info};

/// How often the runner logs a metrics snapshot
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Resilient MQTT client session
#[derive(Parser)]
#[command(name = "mqtt-session")]
#[command(about = "Keep one MQTT session alive across broker and network failures")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the session until SIGINT/SIGTERM
    Run {
        /// Connect on startup even when auto_start is off
        #[arg(long)]
        connect: bool,
    },
    /// Validate configuration
    Config {
        /// Print the stored configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mqtt-session v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(FileConfigStore::new(resolve_config_path(cli.config)));
    info!("Using configuration file: {}", store.path().display());

    let result = match cli.command {
        Commands::Run { connect } => run_session(store, connect).await,
        Commands::Config { show } => handle_config_command(store.as_ref(), show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

/// Explicit path, else the first default location that exists
fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATHS[0]))
    })
}

async fn run_session(
    store: Arc<FileConfigStore>,
    connect: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let auto_start = store.load()?.auto_start;

    let handler = handler_fn(|message| async move {
        info!(
            topic = %message.topic,
            qos = u8::from(message.qos),
            retained = message.retained,
            payload = %message.payload_str(),
            "Message received"
        );
        Ok::<(), HandlerError>(())
    });

    let manager = SessionManager::from_store(Arc::new(MqttTransport::new()), store)?
        .handler(handler)
        .build();

    if auto_start || connect {
        manager.connect().await?;
    } else {
        info!("auto_start is off; pass --connect to connect on startup");
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut metrics_tick = tokio::time::interval(METRICS_LOG_INTERVAL);
    let mut states = manager.subscribe_state();

    info!("Session is running");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(state = %state, "Session state changed");
                if state == ConnectionState::Closed {
                    break;
                }
            }
            _ = metrics_tick.tick() => {
                let snapshot = manager.metrics();
                match serde_json::to_string(&snapshot) {
                    Ok(json) => debug!(metrics = %json, "Session metrics"),
                    Err(e) => debug!(error = %e, "Could not serialize metrics"),
                }
            }
        }
    }

    manager.close().await?;
    Ok(())
}

fn handle_config_command(
    store: &dyn ConfigStore,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings: StoredSettings = store.load()?;

    match settings.session()? {
        Some(session) => info!(
            client_id = %session.client_id,
            server_uri = %session.server_uri,
            fallbacks = session.fallback_uris.len(),
            "Session configuration is valid"
        ),
        None => info!("No session configured (client_id and server_uri are required to connect)"),
    }
    info!(subscriptions = settings.subscriptions().len(), "Subscriptions loaded");

    if show {
        println!("{}", settings.to_toml_string()?);
    }
    Ok(())
}
