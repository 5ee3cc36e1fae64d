//! Bypass Gateway Binary
//!
//! Runs the censorship-evasion transports in front of an already-running
//! SOCKS5 proxy: the port hopper, the HTTP tunnel, and the WebSocket
//! tunnel. Configuration comes from the environment (SOCKS_HOST,
//! SOCKS_PORT, BYPASS_HTTP_PORT, BYPASS_WS_PORT, PORT_HOP_*,
//! OBFUSCATION_KEY).

use hopsocks::bypass;
use hopsocks::config::BypassConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = BypassConfig::from_env()?;
    tracing::info!(
        "Starting bypass gateways for SOCKS5 at {} (http :{}, ws :{})",
        config.socks_addr(),
        config.http_port,
        config.ws_port
    );

    bypass::run_gateways(config).await?;

    Ok(())
}
