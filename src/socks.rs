//! Shared SOCKS5 wire definitions (RFC 1928/1929 subset).
//!
//! Used on both sides: the server engine consumes these constants, and the
//! bypass client drives the same handshake from the outside — either
//! sequentially over a raw stream, or as a single combined blob through the
//! tunnel gateways (which forward all bytes at once and return the
//! concatenated replies).

use std::fmt;
use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// SOCKS protocol version.
pub const SOCKS_VERSION: u8 = 0x05;
/// Username/password sub-negotiation version.
pub const AUTH_VERSION: u8 = 0x01;

/// Method: no authentication required.
pub const METHOD_NONE: u8 = 0x00;
/// Method: username/password (RFC 1929).
pub const METHOD_USERPASS: u8 = 0x02;
/// Method selection reply: no acceptable methods.
pub const METHOD_UNACCEPTABLE: u8 = 0xFF;

/// Command: CONNECT. The only supported command.
pub const CMD_CONNECT: u8 = 0x01;

/// Address type: IPv4 (4 bytes).
pub const ATYP_IPV4: u8 = 0x01;
/// Address type: length-prefixed domain name.
pub const ATYP_DOMAIN: u8 = 0x03;
/// Address type: IPv6 (16 bytes).
pub const ATYP_IPV6: u8 = 0x04;

/// Reply code: succeeded.
pub const REPLY_SUCCESS: u8 = 0x00;
/// Reply code: general SOCKS server failure.
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
/// Reply code: connection not allowed by ruleset.
pub const REPLY_NOT_ALLOWED: u8 = 0x02;
/// Reply code: command not supported.
pub const REPLY_CMD_UNSUPPORTED: u8 = 0x07;
/// Reply code: address type not supported.
pub const REPLY_ATYP_UNSUPPORTED: u8 = 0x08;

/// Length of the fixed-format reply PDU the engine emits.
pub const REPLY_LEN: usize = 10;

/// A requested destination address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestAddr {
    /// IPv4 or IPv6 literal
    Ip(IpAddr),
    /// Domain name (not resolved by the engine; passed to the dialer)
    Domain(String),
}

impl DestAddr {
    /// Host string for allow-list checks and dialing.
    pub fn host(&self) -> String {
        match self {
            DestAddr::Ip(ip) => ip.to_string(),
            DestAddr::Domain(d) => d.clone(),
        }
    }
}

impl fmt::Display for DestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestAddr::Ip(ip) => write!(f, "{ip}"),
            DestAddr::Domain(d) => write!(f, "{d}"),
        }
    }
}

/// Encode the request tail for a domain target: `atyp len host port`.
fn encode_domain_target(host: &str, port: u16, out: &mut Vec<u8>) -> Result<()> {
    if host.len() > 255 {
        return Err(Error::protocol("domain name longer than 255 bytes"));
    }
    out.push(ATYP_DOMAIN);
    out.push(host.len() as u8);
    out.extend_from_slice(host.as_bytes());
    out.extend_from_slice(&port.to_be_bytes());
    Ok(())
}

/// Perform the sequential client-side handshake over an established stream:
/// greeting, username/password auth, CONNECT. On success the stream is a
/// transparent pipe to the target.
pub async fn connect<S>(
    stream: &mut S,
    username: &str,
    password: &str,
    host: &str,
    port: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: offer username/password only
    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_USERPASS])
        .await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(Error::protocol("bad greeting reply version"));
    }
    match reply[1] {
        METHOD_USERPASS => {
            let blob = build_auth_request(username, password)?;
            stream.write_all(&blob).await?;
            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(Error::AuthFailed);
            }
        }
        METHOD_NONE => {}
        _ => return Err(Error::protocol("no acceptable auth method")),
    }

    // CONNECT request
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    encode_domain_target(host, port, &mut request)?;
    stream.write_all(&request).await?;

    let mut reply = [0u8; REPLY_LEN];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(Error::protocol("bad reply version"));
    }
    if reply[1] != REPLY_SUCCESS {
        return Err(Error::Tunnel(format!("CONNECT refused: code {}", reply[1])));
    }
    Ok(())
}

fn build_auth_request(username: &str, password: &str) -> Result<Vec<u8>> {
    if username.len() > 255 || password.len() > 255 {
        return Err(Error::protocol("credential longer than 255 bytes"));
    }
    let mut blob = vec![AUTH_VERSION, username.len() as u8];
    blob.extend_from_slice(username.as_bytes());
    blob.push(password.len() as u8);
    blob.extend_from_slice(password.as_bytes());
    Ok(blob)
}

/// Build the combined greeting + auth + CONNECT blob used by the tunnel
/// transports, which carry the whole exchange in one frame.
pub fn build_combined_request(
    username: &str,
    password: &str,
    host: &str,
    port: u16,
) -> Result<Vec<u8>> {
    let mut blob = vec![SOCKS_VERSION, 1, METHOD_USERPASS];
    blob.extend_from_slice(&build_auth_request(username, password)?);
    blob.push(SOCKS_VERSION);
    blob.push(CMD_CONNECT);
    blob.push(0x00);
    encode_domain_target(host, port, &mut blob)?;
    Ok(blob)
}

/// Parse the concatenated replies to a combined request: method selection,
/// optional auth status, and the fixed 10-byte reply PDU.
pub fn parse_combined_reply(buf: &[u8]) -> Result<()> {
    if buf.len() < 2 {
        return Err(Error::protocol("short method selection"));
    }
    if buf[0] != SOCKS_VERSION {
        return Err(Error::protocol("bad method selection version"));
    }

    let reply = match buf[1] {
        METHOD_USERPASS => {
            if buf.len() < 4 {
                return Err(Error::protocol("short auth status"));
            }
            if buf[3] != 0x00 {
                return Err(Error::AuthFailed);
            }
            &buf[4..]
        }
        METHOD_NONE => &buf[2..],
        METHOD_UNACCEPTABLE => return Err(Error::protocol("no acceptable auth method")),
        other => return Err(Error::Protocol(format!("unexpected method 0x{other:02x}"))),
    };

    if reply.len() < REPLY_LEN {
        return Err(Error::protocol("short CONNECT reply"));
    }
    if reply[0] != SOCKS_VERSION {
        return Err(Error::protocol("bad reply version"));
    }
    if reply[1] != REPLY_SUCCESS {
        return Err(Error::Tunnel(format!("CONNECT refused: code {}", reply[1])));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_request_layout() {
        let blob = build_combined_request("admin", "password", "api.telegram.org", 443).unwrap();

        // Greeting
        assert_eq!(&blob[..3], &[0x05, 0x01, 0x02]);
        // Auth: version, ulen, "admin", plen, "password"
        assert_eq!(blob[3], 0x01);
        assert_eq!(blob[4], 5);
        assert_eq!(&blob[5..10], b"admin");
        assert_eq!(blob[10], 8);
        assert_eq!(&blob[11..19], b"password");
        // Request: ver, cmd, rsv, atyp, len, host, port
        assert_eq!(&blob[19..23], &[0x05, 0x01, 0x00, 0x03]);
        assert_eq!(blob[23] as usize, "api.telegram.org".len());
        assert_eq!(&blob[24..40], b"api.telegram.org");
        assert_eq!(&blob[40..42], &443u16.to_be_bytes());
    }

    #[test]
    fn test_combined_reply_success() {
        let mut buf = vec![0x05, 0x02, 0x01, 0x00];
        buf.extend_from_slice(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(parse_combined_reply(&buf).is_ok());
    }

    #[test]
    fn test_combined_reply_no_auth() {
        let mut buf = vec![0x05, 0x00];
        buf.extend_from_slice(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(parse_combined_reply(&buf).is_ok());
    }

    #[test]
    fn test_combined_reply_auth_failure() {
        let buf = vec![0x05, 0x02, 0x01, 0x01];
        assert!(matches!(parse_combined_reply(&buf), Err(Error::AuthFailed)));
    }

    #[test]
    fn test_combined_reply_connect_refused() {
        let mut buf = vec![0x05, 0x02, 0x01, 0x00];
        buf.extend_from_slice(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(parse_combined_reply(&buf), Err(Error::Tunnel(_))));
    }

    #[test]
    fn test_combined_reply_unacceptable_method() {
        let buf = vec![0x05, 0xFF];
        assert!(parse_combined_reply(&buf).is_err());
    }

    #[test]
    fn test_oversized_credentials_rejected() {
        let long = "x".repeat(256);
        assert!(build_combined_request(&long, "p", "host", 80).is_err());
        assert!(build_combined_request("u", "p", &long, 80).is_err());
    }

    #[test]
    fn test_dest_addr_display() {
        let addr = DestAddr::Domain("api.telegram.org".into());
        assert_eq!(addr.to_string(), "api.telegram.org");
        let addr = DestAddr::Ip("149.154.167.51".parse().unwrap());
        assert_eq!(addr.host(), "149.154.167.51");
    }
}
