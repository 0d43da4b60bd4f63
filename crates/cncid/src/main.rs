//! cncid - Tenant overlay network concentrator daemon
//!
//! Entry point: load configuration, initialize the concentrator against the
//! live kernel, then run until asked to stop.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cncid::concentrator::Concentrator;
use cncid::config::Config;
use cncid::dhcp::DnsmasqLauncher;
use cncid::kernel::ShellKernel;

/// Tenant overlay network concentrator
#[derive(Parser, Debug)]
#[command(name = "cncid")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "/etc/cncid/config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "Cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = term.recv() => info!("SIGTERM received"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("--- Starting cncid ---");

    let config = match Config::from_yaml_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "Cannot load configuration");
            return ExitCode::FAILURE;
        }
    };

    let dhcp = Arc::new(DnsmasqLauncher::new(config.state_dir.clone()));
    let concentrator = Concentrator::new(config, Arc::new(ShellKernel::new()), dhcp);

    if let Err(e) = concentrator.init().await {
        error!(error = %e, "Initialization failed");
        return ExitCode::FAILURE;
    }

    wait_for_signal().await;

    if let Err(e) = concentrator.shutdown().await {
        error!(error = %e, "Shutdown finished with errors");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
