//! HTTP tunnel gateway.
//!
//! Carries SOCKS5 handshake bytes through plain HTTP for networks that only
//! let web traffic out. Every response claims to come from nginx, and the
//! non-tunnel routes serve a believable static-content facade so a probing
//! censor sees an ordinary CDN node.
//!
//! One `POST /tunnel` exchange forwards the request body to the SOCKS5
//! engine over a fresh connection and returns the first response chunk.
//! When an obfuscation context is configured, obfuscated bodies are
//! unwrapped before forwarding and the response is wrapped the same way;
//! a body that does not decode is forwarded raw and answered raw.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;

use crate::bypass::port_hop::PortHopper;
use crate::error::Result;
use crate::obfuscate::Obfuscator;

const FAKE_SERVER: &str = "nginx/1.18.0";

/// HTTP tunnel gateway state shared by all request handlers.
pub struct HttpTunnel {
    socks_addr: String,
    obfuscator: Option<Arc<Obfuscator>>,
    hopper: Option<Arc<PortHopper>>,
}

impl HttpTunnel {
    /// Create a gateway forwarding to the given SOCKS5 address.
    pub fn new(
        socks_addr: String,
        obfuscator: Option<Arc<Obfuscator>>,
        hopper: Option<Arc<PortHopper>>,
    ) -> Self {
        Self {
            socks_addr,
            obfuscator,
            hopper,
        }
    }

    /// Serve the gateway on an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "HTTP tunnel listening");
        loop {
            let (stream, _) = listener.accept().await?;
            let tunnel = Arc::clone(&self);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let tunnel = Arc::clone(&tunnel);
                    async move { tunnel.handle(req).await }
                });
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    tracing::debug!("HTTP tunnel connection error: {}", e);
                }
            });
        }
    }

    async fn handle(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let response = match (req.method(), req.uri().path()) {
            (&Method::POST, "/tunnel") => self.tunnel_exchange(req).await,
            (&Method::GET, "/port-info") => self.port_info(),
            (&Method::GET, "/health") => {
                json_response(StatusCode::OK, json!({"status": "ok", "service": "cdn"}))
            }
            (&Method::GET, "/") => html_response(FAKE_INDEX),
            (&Method::GET, "/api/status") => {
                let uptime = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                json_response(
                    StatusCode::OK,
                    json!({
                        "version": "1.2.3",
                        "status": "operational",
                        "uptime": uptime,
                        "endpoints": ["/api/status", "/health", "/static/*"],
                    }),
                )
            }
            (&Method::GET, path) if path.starts_with("/static/") => {
                let filename = &path["/static/".len()..];
                let content_type = if filename.ends_with(".css") {
                    "text/css"
                } else {
                    "text/plain"
                };
                let body = format!(
                    "/* Static file: {filename} */\nbody {{ font-family: Arial; }}"
                );
                camouflaged(StatusCode::OK)
                    .header("Content-Type", content_type)
                    .body(Full::new(Bytes::from(body)))
                    .unwrap()
            }
            _ => camouflaged(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    /// One tunneled exchange: body in, first SOCKS5 response chunk out.
    async fn tunnel_exchange(&self, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Tunnel body read failed: {}", e);
                return server_error();
            }
        };

        // Unwrap obfuscated bodies; a raw body stays raw and the reply
        // mirrors whichever form the request used
        let (payload, wrap_response) = match &self.obfuscator {
            Some(obfuscator) => match obfuscator.deobfuscate(&body) {
                Ok(payload) => (Bytes::from(payload), true),
                Err(e) => {
                    tracing::debug!("Tunnel body not obfuscated: {}", e);
                    (body, false)
                }
            },
            None => (body, false),
        };

        let response = match crate::bypass::socks_exchange(&self.socks_addr, &payload).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Tunnel forward failed: {}", e);
                return server_error();
            }
        };

        let body = if wrap_response {
            match self
                .obfuscator
                .as_ref()
                .map(|o| o.obfuscate(&response))
                .transpose()
            {
                Ok(Some(wrapped)) => Bytes::from(wrapped),
                _ => return server_error(),
            }
        } else {
            Bytes::from(response)
        };

        camouflaged(StatusCode::OK)
            .header("Content-Type", "application/octet-stream")
            .header("Cache-Control", "no-cache")
            .body(Full::new(body))
            .unwrap()
    }

    fn port_info(&self) -> Response<Full<Bytes>> {
        match self.hopper.as_ref().map(|h| h.status()) {
            Some(status) if status.current_port.is_some() => json_response(
                StatusCode::OK,
                serde_json::to_value(&status).unwrap_or_default(),
            ),
            _ => json_response(
                StatusCode::NOT_FOUND,
                json!({"current_port": null, "active_ports": []}),
            ),
        }
    }
}

fn camouflaged(status: StatusCode) -> hyper::http::response::Builder {
    Response::builder().status(status).header("Server", FAKE_SERVER)
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    camouflaged(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap()
}

fn html_response(html: &'static str) -> Response<Full<Bytes>> {
    camouflaged(StatusCode::OK)
        .header("Content-Type", "text/html")
        .body(Full::new(Bytes::from(html)))
        .unwrap()
}

fn server_error() -> Response<Full<Bytes>> {
    camouflaged(StatusCode::INTERNAL_SERVER_ERROR)
        .body(Full::new(Bytes::from("Internal Server Error")))
        .unwrap()
}

const FAKE_INDEX: &str = r#"<!DOCTYPE html>
<html>
<head><title>CDN Service</title></head>
<body>
<h1>Content Delivery Network</h1>
<p>This is a CDN service for static content delivery.</p>
<p>Status: Online</p>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::build_combined_request;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;

    /// Minimal SOCKS-side stub: accepts one connection, records what it
    /// received, answers with a canned byte string.
    async fn socks_stub(reply: &'static [u8]) -> (String, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            buf.truncate(n);
            stream.write_all(reply).await.unwrap();
            buf
        });
        (addr, task)
    }

    async fn start_gateway(tunnel: HttpTunnel) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(Arc::new(tunnel).serve(listener));
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_tunnel_roundtrip_raw() {
        let (socks_addr, received) = socks_stub(b"\x05\x00").await;
        let base = start_gateway(HttpTunnel::new(socks_addr, None, None)).await;

        let blob = build_combined_request("admin", "pw", "api.telegram.org", 443).unwrap();
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/tunnel"))
            .body(blob.clone())
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["server"], FAKE_SERVER);
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"\x05\x00");
        assert_eq!(received.await.unwrap(), blob);
    }

    #[tokio::test]
    async fn test_tunnel_reply_survives_slow_upstream_dial() {
        // engine answers method selection at once, but the CONNECT reply
        // only lands after the upstream dial completes
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socks_addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            stream.read(&mut buf).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        let base = start_gateway(HttpTunnel::new(socks_addr, None, None)).await;

        let blob = build_combined_request("", "", "api.telegram.org", 443).unwrap();
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/tunnel"))
            .body(blob)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body = response.bytes().await.unwrap();
        assert_eq!(body.len(), 12);
        assert_eq!(&body[..2], b"\x05\x00");
        assert_eq!(body[3], 0x01);
        crate::socks::parse_combined_reply(&body).unwrap();
    }

    #[tokio::test]
    async fn test_tunnel_obfuscated_exchange() {
        let obfuscator = Arc::new(Obfuscator::random());
        let peer = Obfuscator::new(*obfuscator.key());

        let (socks_addr, received) = socks_stub(b"\x05\x02\x01\x00").await;
        let base =
            start_gateway(HttpTunnel::new(socks_addr, Some(Arc::clone(&obfuscator)), None)).await;

        let blob = peer.obfuscate(b"\x05\x01\x02").unwrap();
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/tunnel"))
            .body(blob)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        // gateway unwrapped the request before forwarding
        assert_eq!(received.await.unwrap(), b"\x05\x01\x02");
        // and wrapped the reply
        let body = response.bytes().await.unwrap();
        assert_eq!(peer.deobfuscate(&body).unwrap(), b"\x05\x02\x01\x00");
    }

    #[tokio::test]
    async fn test_port_info_without_hopper_is_404() {
        let base = start_gateway(HttpTunnel::new("127.0.0.1:1".into(), None, None)).await;

        let response = reqwest::get(format!("{base}/port-info")).await.unwrap();
        assert_eq!(response.status(), 404);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["current_port"].is_null());
        assert_eq!(body["active_ports"], json!([]));
    }

    #[tokio::test]
    async fn test_decoy_routes() {
        let base = start_gateway(HttpTunnel::new("127.0.0.1:1".into(), None, None)).await;

        let index = reqwest::get(format!("{base}/")).await.unwrap();
        assert_eq!(index.headers()["server"], FAKE_SERVER);
        assert!(index.text().await.unwrap().contains("Content Delivery Network"));

        let status = reqwest::get(format!("{base}/api/status")).await.unwrap();
        let body: serde_json::Value = status.json().await.unwrap();
        assert_eq!(body["status"], "operational");

        let css = reqwest::get(format!("{base}/static/style.css")).await.unwrap();
        assert_eq!(css.headers()["content-type"], "text/css");

        let missing = reqwest::get(format!("{base}/admin")).await.unwrap();
        assert_eq!(missing.status(), 404);
    }
}
