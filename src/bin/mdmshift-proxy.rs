//! Command proxy server: accepts JSON command requests and relays them to
//! the remote MDM service's enqueue API.

use clap::Parser;
use mdmshift::proxy::{self, ProxyState};
use mdmshift::DeliveryClient;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Proxy MDM commands to a remote service")]
struct Args {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:9001")]
    listen: SocketAddr,

    /// API key inbound callers authenticate with
    #[arg(long = "api-key")]
    api_key: String,

    /// Remote command endpoint URL
    #[arg(long = "remote-url")]
    remote_url: String,

    /// Remote API key
    #[arg(long = "remote-key")]
    remote_key: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let client = DeliveryClient::new(args.remote_url, args.remote_key);
    let state = ProxyState::new(client, args.api_key);
    proxy::serve(args.listen, state).await?;
    Ok(())
}
