//! Clap CLI definitions for Keelnet.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Keelnet: encrypted request/response sessions over TCP.
#[derive(Parser)]
#[command(name = "keelnet", version, about)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Accept connections and answer pings, key exchanges and `echo` requests.
    Serve {
        /// Port to listen on (defaults to `server.port` from the config).
        #[arg(long, short = 'p')]
        port: Option<u16>,
    },
    /// Connect to a server and measure ping round trips.
    Ping {
        /// Host name or address of the server.
        host: String,
        /// Server port (defaults to `server.port` from the config).
        #[arg(long, short = 'p')]
        port: Option<u16>,
        /// Number of pings to send.
        #[arg(long, short = 'c', default_value_t = 4)]
        count: u32,
        /// Run the key exchange first and ping over the encrypted session.
        #[arg(long)]
        encrypt: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_args() {
        let cli = Cli::parse_from(["keelnet", "ping", "::1", "-p", "7000", "--encrypt"]);
        match cli.command {
            Commands::Ping {
                host,
                port,
                count,
                encrypt,
            } => {
                assert_eq!(host, "::1");
                assert_eq!(port, Some(7000));
                assert_eq!(count, 4);
                assert!(encrypt);
            }
            _ => panic!("Expected ping"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["keelnet", "serve", "--config", "keelnet.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("keelnet.toml")));
        assert!(matches!(cli.command, Commands::Serve { port: None }));
    }
}
