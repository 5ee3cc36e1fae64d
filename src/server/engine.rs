//! SOCKS5 protocol engine.
//!
//! Drives one session through the handshake state machine:
//!
//! ```text
//! greeting → method selection → [auth] → request → filter → dial → reply → relay
//! ```
//!
//! Every handshake-phase read carries a deadline; a peer that stalls
//! mid-message is treated as malformed and the session closes. Protocol
//! violations close the connection without sending any bytes (scanners get
//! nothing to fingerprint), while post-handshake failures send the proper
//! reply code before closing.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::auth::AuthManager;
use crate::error::{Error, Result};
use crate::filter::AllowSet;
use crate::server::relay::relay;
use crate::socks::{
    DestAddr, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, AUTH_VERSION, CMD_CONNECT, METHOD_NONE,
    METHOD_UNACCEPTABLE, METHOD_USERPASS, REPLY_ATYP_UNSUPPORTED, REPLY_CMD_UNSUPPORTED,
    REPLY_GENERAL_FAILURE, REPLY_NOT_ALLOWED, REPLY_SUCCESS, SOCKS_VERSION,
};
use crate::{DIAL_TIMEOUT, HANDSHAKE_TIMEOUT};

/// A validated CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Requested destination
    pub dest: DestAddr,
    /// Requested port
    pub port: u16,
    /// Authenticated username, when the userpass method ran
    pub username: Option<String>,
}

/// Per-connection record, owned by its connection task for the lifetime of
/// the socket.
#[derive(Debug)]
pub struct Session {
    /// Source address
    pub peer: IpAddr,
    /// Authenticated principal, if the userpass method ran
    pub username: Option<String>,
    /// Destination that was dialed
    pub dest: DestAddr,
    /// Destination port
    pub port: u16,
    /// Bytes relayed client → upstream
    pub bytes_up: u64,
    /// Bytes relayed upstream → client
    pub bytes_down: u64,
}

/// Shared per-process engine state; one instance serves all sessions.
pub struct Engine {
    auth: Arc<AuthManager>,
    allow: Arc<AllowSet>,
}

impl Engine {
    /// Create an engine over the given authenticator and allow-list.
    pub fn new(auth: Arc<AuthManager>, allow: Arc<AllowSet>) -> Self {
        Self { auth, allow }
    }

    /// Run the handshake: greeting, method selection, optional auth, request
    /// parsing, and the allow-list check. On success the success reply has
    /// NOT yet been sent; the caller dials and replies.
    ///
    /// On post-handshake failures the matching reply code is written before
    /// the error is returned. Silent-close errors send nothing.
    pub async fn handshake<S>(&self, stream: &mut S, peer: IpAddr) -> Result<ConnectRequest>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let username = self.negotiate_method(stream).await?;
        let (dest, port) = self.read_request(stream).await?;

        if !self.allow.permits(&dest.host()) {
            write_reply(stream, REPLY_NOT_ALLOWED).await?;
            tracing::warn!(peer = %peer, dest = %dest, "Destination denied");
            return Err(Error::DestinationDenied(dest.host()));
        }

        Ok(ConnectRequest {
            dest,
            port,
            username,
        })
    }

    /// Serve one complete session over an accepted stream: handshake, dial,
    /// success reply, then relay until either side closes.
    pub async fn serve_session<S>(&self, mut stream: S, peer: IpAddr) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = self.handshake(&mut stream, peer).await?;
        let target = format!("{}:{}", request.dest.host(), request.port);

        let upstream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(e)) => {
                write_reply(&mut stream, REPLY_GENERAL_FAILURE).await?;
                return Err(Error::UpstreamUnreachable(format!("{target}: {e}")));
            }
            Err(_) => {
                write_reply(&mut stream, REPLY_GENERAL_FAILURE).await?;
                return Err(Error::Timeout(DIAL_TIMEOUT.as_millis() as u64));
            }
        };

        write_reply(&mut stream, REPLY_SUCCESS).await?;
        tracing::info!(
            peer = %peer,
            dest = %request.dest,
            port = request.port,
            user = request.username.as_deref().unwrap_or("-"),
            "Session established"
        );

        let totals = relay(stream, upstream).await;
        Ok(Session {
            peer,
            username: request.username,
            dest: request.dest,
            port: request.port,
            bytes_up: totals.client_to_upstream,
            bytes_down: totals.upstream_to_client,
        })
    }

    /// Greeting and method selection, plus the userpass sub-negotiation when
    /// that method is chosen. Returns the authenticated username, if any.
    async fn negotiate_method<S>(&self, stream: &mut S) -> Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut header = [0u8; 2];
        read_timed(stream, &mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported version 0x{:02x}",
                header[0]
            )));
        }
        let nmethods = header[1] as usize;
        if nmethods == 0 {
            return Err(Error::protocol("empty method list"));
        }
        let mut methods = vec![0u8; nmethods];
        read_timed(stream, &mut methods).await?;

        // with auth disabled, no-auth is selected regardless of the offer
        let method = if self.auth.required() {
            if methods.contains(&METHOD_USERPASS) {
                METHOD_USERPASS
            } else {
                METHOD_UNACCEPTABLE
            }
        } else {
            METHOD_NONE
        };

        stream.write_all(&[SOCKS_VERSION, method]).await?;
        if method == METHOD_UNACCEPTABLE {
            return Err(Error::protocol("no acceptable auth method"));
        }
        if method == METHOD_NONE {
            return Ok(None);
        }

        // RFC 1929 sub-negotiation
        let mut header = [0u8; 2];
        read_timed(stream, &mut header).await?;
        if header[0] != AUTH_VERSION {
            return Err(Error::Protocol(format!(
                "bad auth version 0x{:02x}",
                header[0]
            )));
        }
        let mut username = vec![0u8; header[1] as usize];
        read_timed(stream, &mut username).await?;
        let mut plen = [0u8; 1];
        read_timed(stream, &mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        read_timed(stream, &mut password).await?;

        let username = String::from_utf8_lossy(&username).into_owned();
        let password = String::from_utf8_lossy(&password).into_owned();

        if self.auth.verify(&username, &password) {
            stream.write_all(&[AUTH_VERSION, 0x00]).await?;
            Ok(Some(username))
        } else {
            stream.write_all(&[AUTH_VERSION, 0x01]).await?;
            Err(Error::AuthFailed)
        }
    }

    /// Parse the CONNECT request PDU.
    async fn read_request<S>(&self, stream: &mut S) -> Result<(DestAddr, u16)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut header = [0u8; 4];
        read_timed(stream, &mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(Error::Protocol(format!(
                "bad request version 0x{:02x}",
                header[0]
            )));
        }
        if header[1] != CMD_CONNECT {
            write_reply(stream, REPLY_CMD_UNSUPPORTED).await?;
            return Err(Error::Protocol(format!(
                "unsupported command 0x{:02x}",
                header[1]
            )));
        }

        let dest = match header[3] {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                read_timed(stream, &mut octets).await?;
                DestAddr::Ip(IpAddr::from(octets))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                read_timed(stream, &mut octets).await?;
                DestAddr::Ip(IpAddr::from(octets))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                read_timed(stream, &mut len).await?;
                if len[0] == 0 {
                    return Err(Error::protocol("empty domain name"));
                }
                let mut name = vec![0u8; len[0] as usize];
                read_timed(stream, &mut name).await?;
                let name = String::from_utf8(name)
                    .map_err(|_| Error::protocol("domain name is not UTF-8"))?;
                DestAddr::Domain(name)
            }
            other => {
                write_reply(stream, REPLY_ATYP_UNSUPPORTED).await?;
                return Err(Error::Protocol(format!(
                    "unsupported address type 0x{other:02x}"
                )));
            }
        };

        let mut port = [0u8; 2];
        read_timed(stream, &mut port).await?;
        Ok((dest, u16::from_be_bytes(port)))
    }
}

/// Fixed-format reply: the bind address field is always zeroed, the engine
/// never discloses a local address.
async fn write_reply<S>(stream: &mut S, code: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await?;
    Ok(())
}

async fn read_timed<S>(stream: &mut S, buf: &mut [u8]) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::Timeout(HANDSHAKE_TIMEOUT.as_millis() as u64)),
    }
}
