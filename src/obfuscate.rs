//! Traffic obfuscation.
//!
//! Disguises tunneled proxy bytes as ordinary web traffic: the payload is
//! AEAD-encrypted, wrapped in a fake HTTP request header block, and padded
//! with a random-length tail. This defeats pattern-based inspection; it is
//! not an integrity or confidentiality guarantee against an attacker who
//! holds the key.
//!
//! Wire format of an obfuscated blob:
//!
//! ```text
//! fake request headers \r\n\r\n nonce(12) ciphertext+tag padding(1..=16) pad_len(1)
//! ```
//!
//! The trailing length byte makes the padding self-describing, so stripping
//! it is exact and a failed decryption is a hard error rather than a silent
//! pass-through of undecryptable bytes.

use chacha20poly1305::aead::{Aead as AeadTrait, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

/// Size of the symmetric key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the AEAD nonce in bytes.
const NONCE_SIZE: usize = 12;

/// Size of the AEAD authentication tag in bytes.
const TAG_SIZE: usize = 16;

/// Maximum random padding appended to a blob.
const MAX_PADDING: usize = 16;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36",
];

const FAKE_PATHS: &[&str] = &[
    "/api/v1/data",
    "/static/js/app.js",
    "/images/logo.png",
    "/css/style.css",
];

const FAKE_HOST: &str = "cdn.cloudflare.com";

/// Symmetric obfuscation context: one key and its cipher, immutable for the
/// process lifetime and shared by the obfuscator and both tunnel gateways.
#[derive(ZeroizeOnDrop)]
pub struct Obfuscator {
    key: [u8; KEY_SIZE],
    #[zeroize(skip)]
    cipher: ChaCha20Poly1305,
}

impl Obfuscator {
    /// Create a context from an existing key.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        Self { key, cipher }
    }

    /// Create a context with a fresh random key.
    pub fn random() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    /// The raw key bytes, for sharing with the peer out of band.
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Wrap a payload so it resembles an HTTP request on the wire.
    pub fn obfuscate(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| Error::obfuscation("encryption failed"))?;

        let padding_len = (OsRng.next_u32() as usize % MAX_PADDING) + 1;
        let mut padding = vec![0u8; padding_len];
        OsRng.fill_bytes(&mut padding);

        let headers = fake_request_headers();

        let mut blob =
            Vec::with_capacity(headers.len() + NONCE_SIZE + ciphertext.len() + padding_len + 1);
        blob.extend_from_slice(headers.as_bytes());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        blob.extend_from_slice(&padding);
        blob.push(padding_len as u8);
        Ok(blob)
    }

    /// Recover the payload from an obfuscated blob.
    ///
    /// Fails with an explicit error on a missing header delimiter, malformed
    /// padding, or an authentication failure; corrupted input is never
    /// silently passed through.
    pub fn deobfuscate(&self, blob: &[u8]) -> Result<Vec<u8>> {
        let body_start = find_delimiter(blob)
            .ok_or_else(|| Error::obfuscation("missing header delimiter"))?;
        let body = &blob[body_start..];

        let (&padding_len, rest) = body
            .split_last()
            .ok_or_else(|| Error::obfuscation("empty body"))?;
        let padding_len = padding_len as usize;
        if padding_len == 0 || padding_len > MAX_PADDING || rest.len() < padding_len {
            return Err(Error::obfuscation("malformed padding"));
        }

        let content = &rest[..rest.len() - padding_len];
        if content.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::obfuscation("truncated ciphertext"));
        }

        let (nonce, ciphertext) = content.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::obfuscation("decryption failed"))
    }
}

/// Offset of the first byte after the `\r\n\r\n` blank-line marker.
fn find_delimiter(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn fake_request_headers() -> String {
    let path = FAKE_PATHS[OsRng.next_u32() as usize % FAKE_PATHS.len()];
    let user_agent = USER_AGENTS[OsRng.next_u32() as usize % USER_AGENTS.len()];

    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {FAKE_HOST}\r\n\
         User-Agent: {user_agent}\r\n\
         Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n\
         Accept-Language: en-US,en;q=0.5\r\n\
         Accept-Encoding: gzip, deflate\r\n\
         Connection: keep-alive\r\n\r\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let obf = Obfuscator::random();
        let payload = b"\x05\x01\x02 some socks bytes";

        let blob = obf.obfuscate(payload).unwrap();
        assert_ne!(&blob[..], &payload[..]);

        let recovered = obf.deobfuscate(&blob).unwrap();
        assert_eq!(recovered, payload);
    }

    #[test]
    fn test_roundtrip_empty() {
        let obf = Obfuscator::random();
        let blob = obf.obfuscate(b"").unwrap();
        assert_eq!(obf.deobfuscate(&blob).unwrap(), b"");
    }

    #[test]
    fn test_roundtrip_large() {
        let obf = Obfuscator::random();
        let payload: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
        let blob = obf.obfuscate(&payload).unwrap();
        assert_eq!(obf.deobfuscate(&blob).unwrap(), payload);
    }

    #[test]
    fn test_blob_looks_like_http() {
        let obf = Obfuscator::random();
        let blob = obf.obfuscate(b"payload").unwrap();
        assert!(blob.starts_with(b"GET /"));
        let text = String::from_utf8_lossy(&blob);
        assert!(text.contains("Host: cdn.cloudflare.com"));
    }

    #[test]
    fn test_wrong_key_is_explicit_error() {
        let blob = Obfuscator::random().obfuscate(b"secret").unwrap();
        let other = Obfuscator::random();
        assert!(matches!(
            other.deobfuscate(&blob),
            Err(Error::Obfuscation(_))
        ));
    }

    #[test]
    fn test_tampered_blob_is_explicit_error() {
        let obf = Obfuscator::random();
        let mut blob = obf.obfuscate(b"secret").unwrap();
        let mid = blob.len() / 2;
        blob[mid] ^= 0x01;
        assert!(obf.deobfuscate(&blob).is_err());
    }

    #[test]
    fn test_raw_bytes_rejected() {
        let obf = Obfuscator::random();
        assert!(matches!(
            obf.deobfuscate(b"\x05\x01\x00"),
            Err(Error::Obfuscation(_))
        ));
    }

    #[test]
    fn test_same_key_shared_context() {
        let a = Obfuscator::random();
        let b = Obfuscator::new(*a.key());
        let blob = a.obfuscate(b"hello").unwrap();
        assert_eq!(b.deobfuscate(&blob).unwrap(), b"hello");
    }
}
