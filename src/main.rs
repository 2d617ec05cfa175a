//! upstream-relay
//!
//! ```text
//!                    ┌──────────────────────────────────────────────┐
//!                    │                UPSTREAM RELAY                │
//!   Client request   │  ┌────────┐   ┌─────────┐   ┌────────────┐   │
//!  ──────────────────┼─▶│  http  │──▶│ routing │──▶│  session   │   │
//!                    │  │ server │   │location │   │ controller │   │
//!                    │  └────────┘   └─────────┘   └─────┬──────┘   │
//!                    │                                   ▼          │
//!   Client response  │  ┌────────┐   ┌─────────┐   ┌────────────┐   │
//!  ◀─────────────────┼──│  body  │◀──│ header  │◀──│  parser    │◀──┼── Engine
//!                    │  │streamer│   │ policy  │   │  + driver  │   │
//!                    │  └────────┘   └─────────┘   └────────────┘   │
//!                    └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use upstream_relay::config::loader::{load_config, ConfigError};
use upstream_relay::config::validation::validate_config;
use upstream_relay::config::ProxyConfig;
use upstream_relay::observability::{logging, metrics};
use upstream_relay::{HttpServer, Shutdown};

#[derive(Debug, Parser)]
#[command(name = "upstream-relay", version, about = "Relay search queries to an upstream engine")]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
        validate_config(&config).map_err(ConfigError::Validation)?;
    }

    logging::init(config.observability.log_format);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "upstream-relay starting");

    if cli.check {
        println!("configuration ok");
        return Ok(());
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        locations = config.locations.len(),
        default_engine = %config.upstream.default_engine,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config);
    let server_shutdown = shutdown.subscribe();
    let server_task = tokio::spawn(server.run(listener, server_shutdown));

    tokio::signal::ctrl_c().await?;
    shutdown.trigger();
    server_task.await??;

    tracing::info!("Shutdown complete");
    Ok(())
}
