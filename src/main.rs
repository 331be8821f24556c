//! gatehouse - a configurable HTTP/HTTPS front-end.
//!
//! Loads a TOML configuration declaring named services and sockets, builds
//! the service graph, and serves until a fatal error. Configuration errors
//! are printed but do not stop startup; the broken service fails its own
//! requests while the rest of the graph keeps working.

use anyhow::{Context, Result};
use clap::Parser;
use gatehouse::config::Config;
use gatehouse::server::Server;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(version)]
#[command(about = "Route HTTP traffic through a configurable graph of services")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "gatehouse.toml")]
    config: PathBuf,

    /// Override an external service's address (repeatable)
    #[arg(long = "external-addr", value_name = "NAME=ADDR")]
    external_addr: Vec<String>,

    /// Override a disk service's path (repeatable)
    #[arg(long = "directory-path", value_name = "NAME=PATH")]
    directory_path: Vec<String>,

    /// Override a socket's bind address (repeatable)
    #[arg(long = "socket-addr", value_name = "NAME=ADDR")]
    socket_addr: Vec<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Split a `NAME=VALUE` override argument.
fn parse_override(arg: &str, flag: &str) -> Result<(String, String)> {
    let (name, value) = arg
        .split_once('=')
        .with_context(|| format!("--{flag} expects NAME=VALUE, got \"{arg}\""))?;
    Ok((name.to_string(), value.to_string()))
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load_from(&cli.config)?;

    let mut server = Server::new();
    for arg in &cli.external_addr {
        let (name, addr) = parse_override(arg, "external-addr")?;
        server = server.override_external_addr(name, addr);
    }
    for arg in &cli.directory_path {
        let (name, path) = parse_override(arg, "directory-path")?;
        server = server.override_directory_path(name, path);
    }
    for arg in &cli.socket_addr {
        let (name, addr) = parse_override(arg, "socket-addr")?;
        server = server.override_socket_addr(name, addr);
    }

    server.run(config).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    if let Err(e) = run(cli).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_override() {
        let (name, value) = parse_override("main=*:9000", "socket-addr").unwrap();
        assert_eq!(name, "main");
        assert_eq!(value, "*:9000");
    }

    #[test]
    fn test_parse_override_rejects_missing_equals() {
        let err = parse_override("justaname", "socket-addr").unwrap_err();
        assert!(err.to_string().contains("expects NAME=VALUE"));
    }

    #[test]
    fn test_parse_override_keeps_extra_equals_in_value() {
        let (name, value) = parse_override("svc=host=weird", "external-addr").unwrap();
        assert_eq!(name, "svc");
        assert_eq!(value, "host=weird");
    }
}
