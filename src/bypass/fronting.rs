//! Domain fronting.
//!
//! Outbound connections dressed up as TLS sessions to a large CDN hostname:
//! the TCP+TLS connection goes to the front, then an HTTP CONNECT inside the
//! tunnel asks the front to splice through to the real target. Certificate
//! verification is disabled on purpose — the front's certificate is for the
//! front's name, never the target's.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Builds fronted tunnels through a rotating set of CDN hostnames.
pub struct FrontedConnector {
    domains: Vec<String>,
    connector: TlsConnector,
}

impl FrontedConnector {
    /// Create a connector over the given front hostnames.
    pub fn new(domains: Vec<String>) -> Result<Self> {
        if domains.is_empty() {
            return Err(Error::config("no fronting domains configured"));
        }
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth();
        Ok(Self {
            domains,
            connector: TlsConnector::from(Arc::new(tls_config)),
        })
    }

    /// Open a tunnel to `target_host:target_port` through a randomly chosen
    /// front. The returned stream is a transparent pipe to the target, ready
    /// for a SOCKS5 handshake.
    pub async fn connect(
        &self,
        target_host: &str,
        target_port: u16,
    ) -> Result<TlsStream<TcpStream>> {
        let front = self
            .domains
            .choose(&mut rand::thread_rng())
            .expect("domains is non-empty")
            .clone();

        let tcp = TcpStream::connect((front.as_str(), 443)).await?;
        let server_name = ServerName::try_from(front.clone())
            .map_err(|_| Error::tunnel(format!("invalid front hostname: {front}")))?;
        let mut tls = self.connector.connect(server_name, tcp).await?;

        let connect_request = format!(
            "CONNECT {target_host}:{target_port} HTTP/1.1\r\n\
             Host: {target_host}:{target_port}\r\n\
             Proxy-Connection: keep-alive\r\n\r\n"
        );
        tls.write_all(connect_request.as_bytes()).await?;

        let status = read_response_head(&mut tls).await?;
        if !status.contains(" 200 ") && !status.ends_with(" 200") {
            return Err(Error::tunnel(format!(
                "fronted CONNECT via {front} refused: {status}"
            )));
        }
        tracing::info!(front = %front, target = %target_host, "Fronted tunnel established");
        Ok(tls)
    }
}

/// Read up to the end of the response header block and return the status
/// line.
async fn read_response_head<S>(stream: &mut S) -> Result<String>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8192 {
            return Err(Error::tunnel("oversized CONNECT response header"));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::tunnel("connection closed during CONNECT"));
        }
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head);
    Ok(head.lines().next().unwrap_or_default().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_domain_list_rejected() {
        assert!(matches!(
            FrontedConnector::new(Vec::new()),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_read_response_head_parses_status_line() {
        let (mut near, mut far) = tokio::io::duplex(256);
        far.write_all(b"HTTP/1.1 200 Connection established\r\nVia: front\r\n\r\n")
            .await
            .unwrap();

        let status = read_response_head(&mut near).await.unwrap();
        assert_eq!(status, "HTTP/1.1 200 Connection established");
    }

    #[tokio::test]
    async fn test_read_response_head_rejects_truncated() {
        let (mut near, mut far) = tokio::io::duplex(256);
        far.write_all(b"HTTP/1.1 403 For").await.unwrap();
        drop(far);

        assert!(read_response_head(&mut near).await.is_err());
    }
}
