//! SOCKS5 Proxy Binary
//!
//! Serves the domain-restricted SOCKS5 proxy and its Prometheus metrics
//! exporter. All configuration comes from the environment (PROXY_HOST,
//! PROXY_PORT, AUTH_REQUIRED, ALLOWED_DESTINATIONS, ...).

use hopsocks::config::ProxyConfig;
use hopsocks::server::{ProxyContext, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing — respects RUST_LOG env var (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ProxyConfig::from_env()?;
    tracing::info!(
        "Starting SOCKS5 proxy on {}:{} (metrics on :{})",
        config.host,
        config.port,
        config.metrics_port
    );

    let context = ProxyContext::new(config)?;
    let server = Server::new(context);
    server.run().await?;

    Ok(())
}
