mod config;
mod control;
mod error;
mod headers;
mod lists;
mod onion;
mod pipeline;
mod respond;
mod socks;
mod splice;
mod state;
mod vault;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::ProxyError;
use crate::state::ServiceState;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Reverse proxy that serves Tor v3 onion services under a wildcard DNS suffix",
    long_about = "http2socks answers plain HTTP requests for <label>.<suffix> hosts by opening \
a SOCKS4a tunnel through a local Tor client to <label>.onion and splicing the two \
connections together.\n\nA line-based control port lets an operator manage aliases and the \
blacklist, halt and resume request processing, and query status without a restart."
)]
struct Cli {
    /// Path to the INI configuration file
    #[arg(short, long, default_value = "http2socks.ini")]
    config: PathBuf,
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ProxyError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ProxyError::Bind { addr, source })
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("http2socks=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = config::load(&args.config)?;
    let state = Arc::new(ServiceState::new(config)?);

    let http_listener = bind(state.config.http_bind).await?;
    info!(
        "HTTP listener on http://{} for suffix {}",
        state.config.http_bind, state.config.suffix
    );
    info!("Tor SOCKS endpoint: {}", state.config.tor_addr);

    if let Some(control_bind) = state.config.control_bind {
        let control_listener = bind(control_bind).await?;
        info!("control listener on {control_bind}");
        let state = state.clone();
        tokio::spawn(async move {
            control::run_listener(state, control_listener).await;
        });
    }

    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        info!("Shutdown signal received");
    };

    tokio::select! {
        _ = pipeline::run_listener(state.clone(), http_listener) => {
            warn!("HTTP listener loop terminated");
        }
        _ = shutdown => {
            info!("Server shutdown complete");
        }
    }

    Ok(())
}
