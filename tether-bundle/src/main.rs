//! tether test bundle
//!
//! Serves the bundle protocol over stdin/stdout for the `tether` driver.
//! The same binary runs on the device (`--role local`) and on the host
//! (`--role remote`).

#![forbid(unsafe_code)]

mod builtin;
mod registry;
mod runner;
mod services;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tether_common::rpc::RpcError;
use tether_common::{LogConfig, PipeConn, PipeListener, init_logging};
use tracing::{info, warn};

use crate::builtin::Role;

#[derive(Parser)]
#[command(name = "tether-bundle")]
#[command(author, version, about = "tether test bundle")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Which half of the bundle to serve
    #[arg(long, value_enum)]
    role: Role,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve RPC on stdin/stdout until the peer disconnects or a signal arrives
    Rpc {
        /// Base directory for output directories of calls that name none
        #[arg(long, default_value_os_t = std::env::temp_dir().join("tether-bundle"))]
        out_base: PathBuf,
    },

    /// Print every test and fixture as JSON lines
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol; logs go to stderr only.
    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let registry = builtin::registry(cli.role).context("building the bundle registry")?;

    match cli.command {
        Commands::Rpc { out_base } => {
            let server = services::build_server(Arc::new(registry), out_base);
            let listener = PipeListener::new(
                PipeConn::new(tokio::io::stdin(), tokio::io::stdout()).with_peer("stdio"),
            );
            info!("Serving {:?} bundle on stdin/stdout", cli.role);
            match server.serve_listener(&listener, shutdown_signal()).await {
                Ok(()) => Ok(()),
                Err(RpcError::Terminated(signal)) => {
                    info!("Stopped by {}", signal);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
        Commands::List => {
            for entity in registry.entities() {
                println!("{}", serde_json::to_string(&entity)?);
            }
            Ok(())
        }
    }
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> String {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => return "SIGTERM".to_string(),
                    _ = tokio::signal::ctrl_c() => return "SIGINT".to_string(),
                }
            }
            Err(e) => warn!("Cannot watch SIGTERM: {}", e),
        }
    }
    match tokio::signal::ctrl_c().await {
        Ok(()) => "SIGINT".to_string(),
        Err(e) => {
            warn!("Cannot watch SIGINT: {}", e);
            std::future::pending().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_role() {
        assert!(Cli::try_parse_from(["tether-bundle", "rpc"]).is_err());
    }

    #[test]
    fn test_cli_parses_rpc() {
        let cli = Cli::try_parse_from([
            "tether-bundle",
            "--role",
            "remote",
            "-v",
            "rpc",
            "--out-base",
            "/tmp/out",
        ])
        .unwrap();
        assert_eq!(cli.role, Role::Remote);
        assert!(cli.verbose);
        match cli.command {
            Commands::Rpc { out_base } => assert_eq!(out_base, PathBuf::from("/tmp/out")),
            Commands::List => panic!("expected rpc"),
        }
    }

    #[test]
    fn test_cli_parses_list() {
        let cli = Cli::try_parse_from(["tether-bundle", "--role", "local", "list"]).unwrap();
        assert_eq!(cli.role, Role::Local);
        assert!(matches!(cli.command, Commands::List));
    }
}
