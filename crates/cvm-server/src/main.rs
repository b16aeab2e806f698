//! cvm-server: CollabVM session and relay server.
//!
//! Accepts WebSocket clients speaking the `cvm2` subprotocol, tracks them per
//! address, and relays the screens of upstream VNC servers to every user
//! viewing the same VM.

mod config;
mod context;
mod ip_data;
mod server;
mod session;
mod transport;
mod vm;
mod work;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use context::AppContext;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// cvm-server: CollabVM relay server
#[derive(Parser, Debug)]
#[command(name = "cvm-server", version, about = "CollabVM session and relay server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    listen: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.cvm/config.toml")]
    config: String,

    /// Region encoding (png, jpeg)
    #[arg(long)]
    encoding: Option<String>,

    /// JPEG quality (0-100)
    #[arg(long)]
    jpeg_quality: Option<u32>,

    /// Verbose logging (forces debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let overrides = CliOverrides {
        port: cli.port,
        listen: cli.listen,
        encoding: cli.encoding.clone(),
        jpeg_quality: cli.jpeg_quality,
        verbose: cli.verbose,
    };
    let config_path = PathBuf::from(&cli.config);
    // Tracing is not up yet; the config decides the verbosity.
    let server_config = ServerConfig::load(Some(&config_path), &overrides);

    let verbose = cli.verbose
        || server_config.as_ref().map(|c| c.verbose).unwrap_or(false);
    init_tracing(&cli.log_level, verbose);

    let server_config = match server_config {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %server_config.listen,
        vms = server_config.vms.len(),
        "starting cvm-server"
    );

    let ctx = match AppContext::start(server_config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    info!(addr = %ctx.local_addr(), sweep = ?ctx.config().ip_sweep_interval, "received shutdown signal");

    ctx.shutdown().await;
    info!("cvm-server stopped");
}

fn init_tracing(log_level: &str, verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let env_filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
