mod buffer_pool;
mod config;
mod request;
mod session;
mod tunnel;

use crate::config::{Cli, ProxyConfig};
use clap::Parser;
use color_eyre::eyre::Result;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ctproxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = ProxyConfig::from_cli(args);

    // Failing to bind is the only fatal error in the process
    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("proxy listening on {}", config.listen_addr);

    // Main accept loop: one independent task per connection. Session errors
    // are handled inside the session and can never stop the acceptor.
    let server = async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    tokio::task::spawn(tunnel::handle_client(stream, peer_addr));
                }
                Err(e) => {
                    warn!("accept error: {} (continuing)", e);
                    continue;
                }
            }
        }
    };

    tokio::select! {
        _ = server => {
            warn!("accept loop terminated");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}
