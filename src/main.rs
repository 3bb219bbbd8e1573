//! naive-tunnel - Padded CONNECT tunnels through an HTTP/2 or QUIC proxy.

use clap::Parser;
use naive_tunnel::{run_client, run_nc, BuildInfo, Cli, Command, Engine, LoopbackEngine};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    // For nc mode, default to "error" level to avoid interfering with stdout
    let log_level = if matches!(cli.command, Command::Nc(_)) && cli.log_level == "info" {
        "error".to_string()
    } else {
        cli.log_level.clone()
    };
    let filter = EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Initialize the crypto provider
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        tracing::warn!("failed to install default crypto provider (may already be installed): {:?}", e);
    }

    match cli.command {
        Command::Client(args) => {
            tracing::info!("Client command received");
            tracing::debug!(?args, "Client arguments");

            let runtime = new_runtime();
            if let Err(e) = runtime.block_on(run_client(&args)) {
                tracing::error!(error = %e, "client error");
                std::process::exit(e.exit_code().into());
            }
        }
        Command::Nc(args) => {
            let runtime = new_runtime();
            if let Err(e) = runtime.block_on(run_nc(&args)) {
                tracing::error!(error = %e, "nc error");
                std::process::exit(e.exit_code().into());
            }
        }
        Command::Version => {
            let info = BuildInfo::get();
            let engine = LoopbackEngine::default();
            println!("{}", info.format(&engine.version()));
        }
    }
}

fn new_runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to create tokio runtime");
            std::process::exit(1);
        }
    }
}
