//! Keelnet CLI: serve a registry or probe a remote endpoint.

mod cli;
mod cmd;
mod ui;

use crate::cli::{Cli, Commands};
use clap::Parser;
use keelnet_wire::load_config;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let config = load_config(cli.config.as_deref());
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to create Tokio runtime: {e}"));
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve { port } => rt.block_on(cmd::cmd_serve(config, port)),
        Commands::Ping {
            host,
            port,
            count,
            encrypt,
        } => rt.block_on(cmd::cmd_ping(config, &host, port, count, encrypt)),
    };

    if let Err(e) = result {
        ui::error(&e.to_string());
        std::process::exit(1);
    }
}
