//! Bypass Client Binary
//!
//! Usage: client [TARGET_HOST] [TARGET_PORT]
//!
//! Tries every transport strategy in order (direct, HTTP tunnel, WebSocket,
//! port hop, domain fronting) until one yields a working stream to the
//! target, then reports which strategy succeeded. Defaults to probing
//! api.telegram.org:443. Server location and credentials come from the
//! environment (SERVER_HOST, PROXY_PORT, SOCKS_USERNAME, SOCKS_PASSWORD,
//! OBFUSCATION_KEY).

use std::env;

use hopsocks::client::{connect_with_fallback, default_strategies, ClientContext};
use hopsocks::config::ClientConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.get(1).map(String::as_str) == Some("-h") || args.get(1).map(String::as_str) == Some("--help") {
        print_usage();
        return Ok(());
    }

    let target_host = args.get(1).cloned().unwrap_or_else(|| "api.telegram.org".into());
    let target_port: u16 = match args.get(2) {
        Some(raw) => raw.parse()?,
        None => 443,
    };

    let config = ClientConfig::from_env()?;
    tracing::info!(
        "Testing connection to {}:{} via proxy at {}",
        target_host,
        target_port,
        config.server_host
    );

    let ctx = ClientContext::new(config);
    let strategies = default_strategies();

    match connect_with_fallback(&ctx, &strategies, &target_host, target_port).await {
        Ok(_stream) => {
            println!("Successfully connected to {target_host}:{target_port}");
            println!("Your bypass proxy is working.");
        }
        Err(e) => {
            eprintln!("All connection strategies failed: {e}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"Bypass connectivity checker

USAGE:
    client [TARGET_HOST] [TARGET_PORT]

ENVIRONMENT:
    SERVER_HOST       Proxy server hostname or IP (default 127.0.0.1)
    PROXY_PORT        Main SOCKS5 port (default 1080)
    BYPASS_HTTP_PORT  HTTP tunnel port (default 8443)
    BYPASS_WS_PORT    WebSocket tunnel port (default 8444)
    SOCKS_USERNAME    SOCKS5 username (default admin)
    SOCKS_PASSWORD    SOCKS5 password
    OBFUSCATION_KEY   Hex-encoded 32-byte key shared with the gateway

EXAMPLES:
    Probe the default Telegram endpoint:
        client

    Probe a specific target:
        client core.telegram.org 443
"#
    );
}
