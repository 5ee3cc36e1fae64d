//! Censorship-evasion transports in front of the SOCKS5 engine.
//!
//! Four independent reachability paths, run side by side by the bypass
//! gateway process:
//!
//! - [`port_hop`] — rotating raw TCP listener
//! - [`http_tunnel`] — SOCKS5 bytes inside plain HTTP POSTs
//! - [`ws_tunnel`] — SOCKS5 bytes inside WebSocket binary frames
//! - [`fronting`] — outbound CONNECT tunnels through CDN hostnames

pub mod fronting;
pub mod http_tunnel;
pub mod port_hop;
pub mod ws_tunnel;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::BypassConfig;
use crate::error::Result;
use crate::obfuscate::Obfuscator;
use crate::socks::REPLY_LEN;
use crate::{DIAL_TIMEOUT, RELAY_CHUNK_SIZE};

use http_tunnel::HttpTunnel;
use port_hop::PortHopper;
use ws_tunnel::WsTunnel;

/// Shortest complete answer to a combined handshake blob: method selection
/// plus the fixed-size CONNECT reply (the auth status, when present, adds
/// two more bytes).
const MIN_COMBINED_REPLY: usize = 2 + REPLY_LEN;

/// How long back-to-back reply chunks may be apart once the response looks
/// complete.
const COALESCE_IDLE: Duration = Duration::from_millis(50);

/// One tunneled exchange with the SOCKS5 engine: write the payload on a
/// fresh connection, read the response. The engine answers a combined
/// handshake blob with several small writes, and the CONNECT reply among
/// them waits on the upstream dial — so while the response is still shorter
/// than a complete handshake answer, follow-up reads run against the dial
/// budget. After that only back-to-back chunks are coalesced.
pub(crate) async fn socks_exchange(socks_addr: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(socks_addr).await?;
    stream.write_all(payload).await?;

    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    let mut total = stream.read(&mut buf).await?;
    let deadline = tokio::time::Instant::now() + DIAL_TIMEOUT;
    while total > 0 && total < buf.len() {
        let wait = if total < MIN_COMBINED_REPLY {
            deadline.saturating_duration_since(tokio::time::Instant::now())
        } else {
            COALESCE_IDLE
        };
        if wait.is_zero() {
            break;
        }
        match tokio::time::timeout(wait, stream.read(&mut buf[total..])).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    buf.truncate(total);
    Ok(buf)
}

/// Run every gateway transport until the process exits.
pub async fn run_gateways(config: BypassConfig) -> Result<()> {
    config.validate()?;

    let obfuscator = config
        .obfuscation_key
        .map(|key| Arc::new(Obfuscator::new(key)));
    if obfuscator.is_some() {
        tracing::info!("Obfuscation enabled on the HTTP tunnel");
    }

    let hopper = Arc::new(PortHopper::new(&config));

    let http_listener = TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    let http = Arc::new(HttpTunnel::new(
        config.socks_addr(),
        obfuscator,
        Some(Arc::clone(&hopper)),
    ));

    let ws_listener = TcpListener::bind(("0.0.0.0", config.ws_port)).await?;
    let ws = Arc::new(WsTunnel::new(config.socks_addr()));

    tracing::info!(
        http_port = config.http_port,
        ws_port = config.ws_port,
        hop_range = ?config.port_range,
        "All bypass transports starting"
    );

    tokio::select! {
        r = Arc::clone(&hopper).run() => r,
        r = http.serve(http_listener) => r,
        r = ws.serve(ws_listener) => r,
    }
}
