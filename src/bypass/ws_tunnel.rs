//! WebSocket tunnel gateway.
//!
//! Same per-frame exchange model as the HTTP tunnel but over a persistent
//! WebSocket: each binary frame is forwarded to the SOCKS5 engine on a fresh
//! connection and the first response chunk comes back as a binary frame.
//! `GET /` serves a decoy chat page so the port passes casual inspection as
//! a web chat service.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::WebSocketStream;

use crate::error::Result;

/// WebSocket tunnel gateway state.
pub struct WsTunnel {
    socks_addr: String,
}

impl WsTunnel {
    /// Create a gateway forwarding to the given SOCKS5 address.
    pub fn new(socks_addr: String) -> Self {
        Self { socks_addr }
    }

    /// Serve the gateway on an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "WebSocket tunnel listening");
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
                    .with_upgrades()
                    .await
                {
                    tracing::debug!("WebSocket tunnel connection error: {}", e);
                }
            });
        }
    }

    async fn handle(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let response = match (req.method(), req.uri().path()) {
            (&Method::GET, "/ws") => self.upgrade(req),
            (&Method::GET, "/") => Response::builder()
                .header("Content-Type", "text/html")
                .body(Full::new(Bytes::from(FAKE_CHAT_PAGE)))
                .unwrap(),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    /// Complete the WebSocket handshake and hand the upgraded connection to
    /// the frame loop.
    fn upgrade(&self, mut req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
        let key = match req.headers().get(SEC_WEBSOCKET_KEY) {
            Some(key) => key.clone(),
            None => {
                return Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(Full::new(Bytes::from("missing Sec-WebSocket-Key")))
                    .unwrap()
            }
        };
        let accept = derive_accept_key(key.as_bytes());

        let socks_addr = self.socks_addr.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(&mut req).await {
                Ok(upgraded) => {
                    let ws = WebSocketStream::from_raw_socket(
                        TokioIo::new(upgraded),
                        Role::Server,
                        None,
                    )
                    .await;
                    frame_loop(ws, socks_addr).await;
                }
                Err(e) => tracing::warn!("WebSocket upgrade failed: {}", e),
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_ACCEPT, accept)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }
}

/// Exchange frames until the peer closes: binary in → SOCKS5 exchange →
/// binary out. Non-binary frames are ignored apart from close.
async fn frame_loop<S>(mut ws: WebSocketStream<S>, socks_addr: String)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    while let Some(frame) = ws.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("WebSocket frame error: {}", e);
                break;
            }
        };
        match frame {
            Message::Binary(data) => match crate::bypass::socks_exchange(&socks_addr, &data).await
            {
                Ok(response) => {
                    if ws.send(Message::Binary(response)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("WebSocket forward failed: {}", e);
                    break;
                }
            },
            Message::Close(_) => break,
            Message::Ping(data) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            _ => {}
        }
    }
}

const FAKE_CHAT_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Chat Application</title>
    <style>
        body { font-family: Arial, sans-serif; margin: 20px; }
        #messages { border: 1px solid #ccc; height: 300px; overflow-y: scroll; padding: 10px; }
        #messageInput { width: 80%; padding: 5px; }
        #sendButton { padding: 5px 10px; }
    </style>
</head>
<body>
    <h1>Secure Chat</h1>
    <div id="messages"></div>
    <input type="text" id="messageInput" placeholder="Type a message...">
    <button id="sendButton">Send</button>

    <script>
        const messages = document.getElementById('messages');
        const input = document.getElementById('messageInput');
        const button = document.getElementById('sendButton');

        button.onclick = () => {
            if (input.value.trim()) {
                const div = document.createElement('div');
                div.textContent = `You: ${input.value}`;
                messages.appendChild(div);
                input.value = '';
                messages.scrollTop = messages.scrollHeight;
            }
        };

        input.onkeypress = (e) => {
            if (e.key === 'Enter') button.click();
        };
    </script>
</body>
</html>
"#;
