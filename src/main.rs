// src/main.rs

//! The main entry point for the tallyd accounting daemon.

use anyhow::Result;
use std::env;
use std::sync::Arc;
use tallyd::config::Config;
use tallyd::server::{MemStore, Server};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("tallyd version {VERSION}");
        return Ok(());
    }

    // The configuration path defaults to "tallyd.toml" and can be
    // overridden with --config.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("tallyd.toml");

    let mut config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    // Override the listen port if provided on the command line.
    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        match args.get(port_index + 1).and_then(|s| s.parse::<u16>().ok()) {
            Some(port) => config.port = port,
            None => {
                eprintln!("--port flag requires a valid port number");
                std::process::exit(1);
            }
        }
    }

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    info!("starting tallyd {VERSION} for cluster {:?}", config.cluster_name);

    let auth = config.auth_provider()?;
    let store = Arc::new(MemStore::new());
    let addr = format!("{}:{}", config.host, config.port);
    let server = Server::bind(&addr, config.max_connections, store, auth).await?;

    // SIGINT and SIGTERM both trigger the graceful shutdown sequence.
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to create SIGINT stream");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to create SIGTERM stream");
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown"),
        }
        shutdown.shutdown();
    });

    if let Err(e) = server.serve().await {
        error!("server runtime error: {e}");
        return Err(e.into());
    }

    Ok(())
}
