//! End-to-end flows over loopback: raw SOCKS5 sessions against a live
//! server, and handshakes carried through the tunnel gateways.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use hopsocks::auth::{hash_password, AuthManager};
use hopsocks::bypass::http_tunnel::HttpTunnel;
use hopsocks::bypass::ws_tunnel::WsTunnel;
use hopsocks::client::{ClientContext, ConnectStrategy};
use hopsocks::config::{ClientConfig, ProxyConfig};
use hopsocks::filter::AllowSet;
use hopsocks::server::metrics::Metrics;
use hopsocks::server::rate_limit::RateLimiter;
use hopsocks::server::{ProxyContext, Server};
use hopsocks::socks;

/// Echo server standing in for an allowed upstream.
async fn start_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

/// Proxy server over an ephemeral port, allowing loopback destinations.
async fn start_proxy(auth_required: bool) -> u16 {
    let config = ProxyConfig {
        auth_required,
        ..ProxyConfig::default()
    };
    let mut tokens = HashMap::new();
    tokens.insert("admin".to_string(), hash_password("password"));

    let context = ProxyContext {
        allow: Arc::new(AllowSet::new(["127.0.0.1/32", "api.telegram.org"])),
        auth: Arc::new(AuthManager::new(auth_required, tokens)),
        limiter: Arc::new(RateLimiter::new(
            config.rate_limit_per_ip,
            config.rate_limit_window,
        )),
        metrics: Arc::new(Metrics::new()),
        config,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Server::new(context);
    tokio::spawn(async move { server.serve(listener).await });
    port
}

#[tokio::test]
async fn full_session_with_auth_and_echo() {
    let upstream_port = start_upstream().await;
    let proxy_port = start_proxy(true).await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();

    // greeting: offer userpass
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x02]);

    // RFC 1929 auth
    let mut auth = vec![0x01, 0x05];
    auth.extend_from_slice(b"admin");
    auth.push(0x08);
    auth.extend_from_slice(b"password");
    stream.write_all(&auth).await.unwrap();
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x01, 0x00]);

    // CONNECT to the echo upstream by IPv4 literal
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&upstream_port.to_be_bytes());
    stream.write_all(&request).await.unwrap();
    let mut connect_reply = [0u8; 10];
    stream.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply[0], 0x05);
    assert_eq!(connect_reply[1], 0x00);
    // bind address is always zeroed
    assert_eq!(&connect_reply[4..], &[0, 0, 0, 0, 0, 0]);

    // relay carries application bytes both ways
    stream.write_all(b"hello through the proxy").await.unwrap();
    let mut echoed = [0u8; 23];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello through the proxy");
}

#[tokio::test]
async fn client_helper_performs_full_handshake() {
    let upstream_port = start_upstream().await;
    let proxy_port = start_proxy(true).await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    socks::connect(&mut stream, "admin", "password", "127.0.0.1", upstream_port)
        .await
        .unwrap();

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let proxy_port = start_proxy(true).await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    let err = socks::connect(&mut stream, "admin", "wrong", "127.0.0.1", 80)
        .await
        .unwrap_err();
    assert!(matches!(err, hopsocks::Error::AuthFailed));
}

#[tokio::test]
async fn denied_destination_gets_reply_code_2() {
    let proxy_port = start_proxy(false).await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    let host = b"evil.example.com";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host);
    request.extend_from_slice(&443u16.to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut connect_reply = [0u8; 10];
    stream.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply[1], 0x02);

    // connection closes after the refusal
    let mut rest = [0u8; 1];
    let n = stream.read(&mut rest).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn bad_version_closes_without_reply() {
    let proxy_port = start_proxy(false).await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

    let mut buf = [0u8; 16];
    let deadline = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await;
    assert_eq!(deadline.unwrap().unwrap(), 0);
}

fn tunnel_client_config(proxy_port: u16, http_port: u16, ws_port: u16) -> ClientConfig {
    ClientConfig {
        server_host: "127.0.0.1".into(),
        socks_port: proxy_port,
        http_port,
        ws_port,
        username: "admin".into(),
        password: "password".into(),
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn http_tunnel_strategy_completes_handshake() {
    let upstream_port = start_upstream().await;
    let proxy_port = start_proxy(true).await;

    let gateway_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_port = gateway_listener.local_addr().unwrap().port();
    let gateway = Arc::new(HttpTunnel::new(
        format!("127.0.0.1:{proxy_port}"),
        None,
        None,
    ));
    tokio::spawn(gateway.serve(gateway_listener));

    let ctx = ClientContext::new(tunnel_client_config(proxy_port, http_port, 0));
    let strategy = hopsocks::client::HttpTunnel;
    let stream = strategy
        .connect(&ctx, "127.0.0.1", upstream_port)
        .await
        .unwrap();
    drop(stream);
}

#[tokio::test]
async fn websocket_strategy_completes_handshake() {
    let upstream_port = start_upstream().await;
    let proxy_port = start_proxy(true).await;

    let gateway_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_port = gateway_listener.local_addr().unwrap().port();
    let gateway = Arc::new(WsTunnel::new(format!("127.0.0.1:{proxy_port}")));
    tokio::spawn(gateway.serve(gateway_listener));

    let ctx = ClientContext::new(tunnel_client_config(proxy_port, 0, ws_port));
    let strategy = hopsocks::client::WebSocketTunnel;
    let stream = strategy
        .connect(&ctx, "127.0.0.1", upstream_port)
        .await
        .unwrap();
    drop(stream);
}

#[tokio::test]
async fn metrics_record_session_outcomes() {
    let upstream_port = start_upstream().await;

    let config = ProxyConfig::default();
    let mut tokens = HashMap::new();
    tokens.insert("admin".to_string(), hash_password("password"));
    let context = ProxyContext {
        allow: Arc::new(AllowSet::new(["127.0.0.1/32"])),
        auth: Arc::new(AuthManager::new(true, tokens)),
        limiter: Arc::new(RateLimiter::new(
            config.rate_limit_per_ip,
            config.rate_limit_window,
        )),
        metrics: Arc::new(Metrics::new()),
        config,
    };
    let metrics = Arc::clone(&context.metrics);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = listener.local_addr().unwrap().port();
    let server = Server::new(context);
    tokio::spawn(async move { server.serve(listener).await });

    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    socks::connect(&mut stream, "admin", "password", "127.0.0.1", upstream_port)
        .await
        .unwrap();
    stream.write_all(b"data").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    drop(stream);

    // let the session task observe the close
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(metrics.connections_total(), 1);
    assert_eq!(metrics.active_connections(), 0);
    let rendered = metrics.render_prometheus();
    assert!(rendered.contains("socks5_connections_total 1"));
}
