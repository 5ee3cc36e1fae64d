//! Client-side transport selection.
//!
//! When the main SOCKS5 port is blocked, the same handshake can travel
//! through any of the bypass transports. A fixed, ordered list of strategy
//! values is tried in turn; the first one that yields a working stream wins
//! and the rest are never touched. Every attempt returns an explicit
//! `Result`, so a failing transport is just a log line and a move to the
//! next entry.
//!
//! The tunnel strategies (HTTP, WebSocket) carry the whole greeting + auth +
//! CONNECT exchange as one combined blob, parse the concatenated replies,
//! and then hand the caller one end of an in-process duplex pipe. A pump
//! task behind the pipe converts each written chunk into one tunnel
//! exchange, so the caller sees an ordinary byte stream.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::bypass::fronting::FrontedConnector;
use crate::bypass::port_hop::PortHopperStatus;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::obfuscate::Obfuscator;
use crate::socks;
use crate::{DIAL_TIMEOUT, RELAY_CHUNK_SIZE};

/// Object-safe alias for the streams strategies hand back.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A connected byte pipe to the requested target.
pub type BoxedStream = Box<dyn TunnelStream>;

/// Shared state every strategy attempt reads from.
pub struct ClientContext {
    /// Client configuration
    pub config: ClientConfig,
    /// Reused HTTP client for tunnel POSTs and port discovery
    pub http: reqwest::Client,
    /// Obfuscation context shared with the HTTP tunnel gateway
    pub obfuscator: Option<Arc<Obfuscator>>,
}

impl ClientContext {
    /// Build the context from a client configuration.
    pub fn new(config: ClientConfig) -> Self {
        let obfuscator = config.obfuscation_key.map(|key| Arc::new(Obfuscator::new(key)));
        Self {
            config,
            http: reqwest::Client::new(),
            obfuscator,
        }
    }

    fn combined_request(&self, host: &str, port: u16) -> Result<Vec<u8>> {
        socks::build_combined_request(&self.config.username, &self.config.password, host, port)
    }
}

/// One way of reaching the proxy. Implementations are stateless values; all
/// per-attempt inputs arrive through the context.
pub trait ConnectStrategy: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Attempt to open a stream to `host:port` through the proxy.
    fn connect<'a>(
        &'a self,
        ctx: &'a ClientContext,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<BoxedStream>>;
}

/// The fixed strategy order: cheapest and least conspicuous first.
pub fn default_strategies() -> Vec<Box<dyn ConnectStrategy>> {
    vec![
        Box::new(Direct),
        Box::new(HttpTunnel),
        Box::new(WebSocketTunnel),
        Box::new(PortHop),
        Box::new(DomainFronting),
    ]
}

/// Try each strategy in order; return the first stream that comes up.
pub async fn connect_with_fallback(
    ctx: &ClientContext,
    strategies: &[Box<dyn ConnectStrategy>],
    host: &str,
    port: u16,
) -> Result<BoxedStream> {
    for strategy in strategies {
        tracing::info!(strategy = strategy.name(), target = host, "Trying strategy");
        match strategy.connect(ctx, host, port).await {
            Ok(stream) => {
                tracing::info!(strategy = strategy.name(), "Connected");
                return Ok(stream);
            }
            Err(e) => {
                tracing::warn!(strategy = strategy.name(), "Strategy failed: {}", e);
            }
        }
    }
    Err(Error::tunnel("all connection strategies failed"))
}

/// Direct connection to the main SOCKS5 port.
pub struct Direct;

impl ConnectStrategy for Direct {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn connect<'a>(
        &'a self,
        ctx: &'a ClientContext,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<BoxedStream>> {
        async move {
            let addr = (ctx.config.server_host.as_str(), ctx.config.socks_port);
            let mut stream = dial(addr).await?;
            socks::connect(
                &mut stream,
                &ctx.config.username,
                &ctx.config.password,
                host,
                port,
            )
            .await?;
            Ok(Box::new(stream) as BoxedStream)
        }
        .boxed()
    }
}

/// SOCKS5 over `POST /tunnel` exchanges.
pub struct HttpTunnel;

impl HttpTunnel {
    fn url(ctx: &ClientContext) -> String {
        format!(
            "http://{}:{}/tunnel",
            ctx.config.server_host, ctx.config.http_port
        )
    }

    async fn exchange(
        http: &reqwest::Client,
        url: &str,
        obfuscator: Option<&Obfuscator>,
        payload: &[u8],
    ) -> Result<Bytes> {
        let body = match obfuscator {
            Some(obfuscator) => Bytes::from(obfuscator.obfuscate(payload)?),
            None => Bytes::copy_from_slice(payload),
        };

        let response = http
            .post(url)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::tunnel(format!("tunnel POST failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::tunnel(format!(
                "tunnel POST status {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::tunnel(format!("tunnel body read failed: {e}")))?;

        match obfuscator {
            Some(obfuscator) => Ok(Bytes::from(obfuscator.deobfuscate(&body)?)),
            None => Ok(body),
        }
    }
}

impl ConnectStrategy for HttpTunnel {
    fn name(&self) -> &'static str {
        "http-tunnel"
    }

    fn connect<'a>(
        &'a self,
        ctx: &'a ClientContext,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<BoxedStream>> {
        async move {
            let url = Self::url(ctx);
            let blob = ctx.combined_request(host, port)?;
            let reply =
                Self::exchange(&ctx.http, &url, ctx.obfuscator.as_deref(), &blob).await?;
            socks::parse_combined_reply(&reply)?;

            // handshake accepted; everything after rides the pump
            let (near, far) = tokio::io::duplex(RELAY_CHUNK_SIZE);
            let http = ctx.http.clone();
            let obfuscator = ctx.obfuscator.clone();
            tokio::spawn(async move {
                if let Err(e) = http_pump(far, http, url, obfuscator).await {
                    tracing::debug!("HTTP tunnel pump ended: {}", e);
                }
            });
            Ok(Box::new(near) as BoxedStream)
        }
        .boxed()
    }
}

/// One POST per written chunk; the response bytes flow back into the pipe.
async fn http_pump(
    mut pipe: DuplexStream,
    http: reqwest::Client,
    url: String,
    obfuscator: Option<Arc<Obfuscator>>,
) -> Result<()> {
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let reply =
            HttpTunnel::exchange(&http, &url, obfuscator.as_deref(), &buf[..n]).await?;
        if !reply.is_empty() {
            pipe.write_all(&reply).await?;
        }
    }
}

/// SOCKS5 over WebSocket binary frames.
pub struct WebSocketTunnel;

impl ConnectStrategy for WebSocketTunnel {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn connect<'a>(
        &'a self,
        ctx: &'a ClientContext,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<BoxedStream>> {
        async move {
            let url = format!(
                "ws://{}:{}/ws",
                ctx.config.server_host, ctx.config.ws_port
            );
            let (mut ws, _) = connect_async(url)
                .await
                .map_err(|e| Error::tunnel(format!("websocket connect failed: {e}")))?;

            let blob = ctx.combined_request(host, port)?;
            ws.send(Message::Binary(blob))
                .await
                .map_err(|e| Error::tunnel(format!("websocket send failed: {e}")))?;
            let reply = next_binary(&mut ws).await?;
            socks::parse_combined_reply(&reply)?;

            let (near, far) = tokio::io::duplex(RELAY_CHUNK_SIZE);
            tokio::spawn(async move {
                if let Err(e) = ws_pump(far, ws).await {
                    tracing::debug!("WebSocket tunnel pump ended: {}", e);
                }
            });
            Ok(Box::new(near) as BoxedStream)
        }
        .boxed()
    }
}

async fn next_binary(
    ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> Result<Vec<u8>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(data),
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::tunnel("websocket closed mid-exchange"))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(Error::tunnel(format!("websocket error: {e}"))),
        }
    }
}

/// One frame per written chunk; the response frame flows back into the pipe.
async fn ws_pump(
    mut pipe: DuplexStream,
    mut ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> Result<()> {
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            let _ = ws.close(None).await;
            return Ok(());
        }
        ws.send(Message::Binary(buf[..n].to_vec()))
            .await
            .map_err(|e| Error::tunnel(format!("websocket send failed: {e}")))?;
        let reply = next_binary(&mut ws).await?;
        if !reply.is_empty() {
            pipe.write_all(&reply).await?;
        }
    }
}

/// SOCKS5 over whatever port the hopper is currently on.
pub struct PortHop;

impl PortHop {
    /// Discover candidate ports: `/port-info` when reachable, otherwise a
    /// bounded handful of random in-range guesses.
    async fn candidate_ports(ctx: &ClientContext) -> Vec<u16> {
        let url = format!(
            "http://{}:{}/port-info",
            ctx.config.server_host, ctx.config.http_port
        );
        if let Ok(response) = ctx.http.get(&url).send().await {
            if response.status().is_success() {
                if let Ok(status) = response.json::<PortHopperStatus>().await {
                    let mut ports = Vec::new();
                    if let Some(current) = status.current_port {
                        ports.push(current);
                    }
                    for port in status.active_ports {
                        if !ports.contains(&port) {
                            ports.push(port);
                        }
                    }
                    if !ports.is_empty() {
                        return ports;
                    }
                }
            }
        }

        let (min, max) = ctx.config.port_range;
        (0..5)
            .map(|_| rand::thread_rng().gen_range(min..=max))
            .collect()
    }
}

impl ConnectStrategy for PortHop {
    fn name(&self) -> &'static str {
        "port-hop"
    }

    fn connect<'a>(
        &'a self,
        ctx: &'a ClientContext,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<BoxedStream>> {
        async move {
            for hop_port in Self::candidate_ports(ctx).await {
                let addr = (ctx.config.server_host.as_str(), hop_port);
                let mut stream = match dial(addr).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::debug!(port = hop_port, "Hop port unreachable: {}", e);
                        continue;
                    }
                };
                match socks::connect(
                    &mut stream,
                    &ctx.config.username,
                    &ctx.config.password,
                    host,
                    port,
                )
                .await
                {
                    Ok(()) => return Ok(Box::new(stream) as BoxedStream),
                    Err(e) => tracing::debug!(port = hop_port, "Hop handshake failed: {}", e),
                }
            }
            Err(Error::tunnel("no reachable hop port"))
        }
        .boxed()
    }
}

/// SOCKS5 through a TLS front.
pub struct DomainFronting;

impl ConnectStrategy for DomainFronting {
    fn name(&self) -> &'static str {
        "domain-fronting"
    }

    fn connect<'a>(
        &'a self,
        ctx: &'a ClientContext,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<BoxedStream>> {
        async move {
            let connector = FrontedConnector::new(ctx.config.fronting_domains.clone())?;
            let mut stream = connector
                .connect(&ctx.config.server_host, ctx.config.socks_port)
                .await?;
            socks::connect(
                &mut stream,
                &ctx.config.username,
                &ctx.config.password,
                host,
                port,
            )
            .await?;
            Ok(Box::new(stream) as BoxedStream)
        }
        .boxed()
    }
}

async fn dial(addr: (&str, u16)) -> Result<TcpStream> {
    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::Timeout(DIAL_TIMEOUT.as_millis() as u64)),
    }
}
