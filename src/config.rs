use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "HTTP CONNECT tunneling proxy",
    long_about = "ctproxy accepts plaintext TCP connections, reads an HTTP CONNECT request,\n\
        dials the requested destination and relays bytes in both directions until\n\
        either side closes. Non-CONNECT traffic is dropped without a response."
)]
pub struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8081)]
    pub port: u16,

    /// IP address to bind the listener
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_ip: Ipv4Addr,
}

/// Proxy configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub fn from_cli(args: Cli) -> Self {
        Self {
            listen_addr: SocketAddr::from((args.listen_ip, args.port)),
        }
    }
}
