//! tunnelkeeper server binary.
//!
//! Provisions an ephemeral PKI, starts the mutual-TLS tunnel server bound to
//! it, and supervises its lifecycle until a termination signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use tunnelkeeper::config::RunConfig;
use tunnelkeeper::lifecycle::{spawn_signal_listener, LifecycleController};
use tunnelkeeper::logging::{init_logging, level_from_str, LogOptions};
use tunnelkeeper::pki::RcgenIssuer;
use tunnelkeeper::server::QuicServerFactory;

/// Command-line arguments for the tunnel supervisor.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Virtual network CIDR served by the tunnel
    #[clap(short, long)]
    network: Option<String>,

    /// Address the tunnel server listens on
    #[clap(long)]
    listen_address: Option<String>,

    /// Port the tunnel server listens on
    #[clap(short, long)]
    port: Option<u16>,

    /// Virtual interface name override
    #[clap(short, long)]
    interface: Option<String>,

    /// Log level
    #[clap(short, long)]
    log_level: Option<String>,
}

/// File settings first, CLI flags on top.
fn merge_config(args: &Args) -> anyhow::Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };

    if let Some(network) = &args.network {
        config.network = network.clone();
    }
    if let Some(listen_address) = &args.listen_address {
        config.listen_address = listen_address.clone();
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(interface) = &args.interface {
        config.interface_name = interface.clone();
    }
    if let Some(log_level) = &args.log_level {
        config.log_level = log_level.clone();
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match merge_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e:#}");
            std::process::exit(2);
        }
    };

    let _guard = init_logging(LogOptions {
        level: level_from_str(&config.log_level),
        log_to_file: config.log_to_file,
        log_dir: config.log_dir.clone(),
        json_format: config.log_json,
        ..Default::default()
    });

    info!(
        network = %config.network,
        listen = %format!("{}:{}", config.listen_address, config.listen_port),
        "starting tunnelkeeper"
    );

    let shutdown = match spawn_signal_listener() {
        Ok(rx) => rx,
        Err(e) => {
            error!(error = %e, "failed to install signal handlers");
            std::process::exit(1);
        }
    };

    let mut controller = LifecycleController::new(
        config,
        Arc::new(RcgenIssuer::new()),
        Arc::new(QuicServerFactory),
        shutdown,
    );

    if let Err(e) = controller.execute().await {
        error!(error = %e, "supervisor run failed");
        std::process::exit(1);
    }

    info!("shut down cleanly");
}
