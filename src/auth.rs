//! Username/password authentication.
//!
//! Credentials are loaded once at startup into a table of
//! username → hex(SHA-256(secret)) and shared read-only by all sessions.
//! Sources, in order: the `PROXY_AUTH_TOKENS` JSON map, then a single
//! "admin" entry derived from `ADMIN_PASSWORD` or `ADMIN_TOKEN`.

use std::collections::HashMap;
use std::env;

use sha2::{Digest, Sha256};

/// Verifies client credentials against the loaded token table.
pub struct AuthManager {
    required: bool,
    tokens: HashMap<String, String>,
}

impl AuthManager {
    /// Build from an explicit token table (username → hex SHA-256 digest).
    pub fn new(required: bool, tokens: HashMap<String, String>) -> Self {
        Self { required, tokens }
    }

    /// Build with the token table loaded from the environment.
    pub fn from_env(required: bool) -> Self {
        Self::new(required, load_tokens())
    }

    /// Verify a credential pair.
    ///
    /// With authentication disabled every pair succeeds. The digest
    /// comparison is constant-time so a probe cannot learn how many leading
    /// characters of a stored hash it matched.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        if !self.required {
            return true;
        }

        let supplied = hex::encode(Sha256::digest(password.as_bytes()));
        match self.tokens.get(username) {
            Some(stored) => constant_time_eq(stored.as_bytes(), supplied.as_bytes()),
            None => false,
        }
    }

    /// Whether authentication is required.
    pub fn required(&self) -> bool {
        self.required
    }

    /// Number of loaded credentials.
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}

/// Hash a password the way the token table stores it.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn load_tokens() -> HashMap<String, String> {
    if let Ok(raw) = env::var("PROXY_AUTH_TOKENS") {
        match serde_json::from_str::<HashMap<String, String>>(&raw) {
            Ok(tokens) if !tokens.is_empty() => return tokens,
            Ok(_) => {}
            Err(e) => tracing::error!("Invalid PROXY_AUTH_TOKENS format: {}", e),
        }
    }

    // Single admin credential fallback
    let mut tokens = HashMap::new();
    let secret = env::var("ADMIN_PASSWORD")
        .or_else(|_| env::var("ADMIN_TOKEN"))
        .unwrap_or_else(|_| "default_admin_token_change_me".into());
    tokens.insert("admin".into(), hash_password(&secret));
    tokens
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(user: &str, pass: &str) -> HashMap<String, String> {
        let mut tokens = HashMap::new();
        tokens.insert(user.to_string(), hash_password(pass));
        tokens
    }

    #[test]
    fn test_verify_correct_credentials() {
        let auth = AuthManager::new(true, table("admin", "password"));
        assert!(auth.verify("admin", "password"));
    }

    #[test]
    fn test_verify_rejects_wrong_password() {
        let auth = AuthManager::new(true, table("admin", "password"));
        assert!(!auth.verify("admin", "Password"));
        assert!(!auth.verify("admin", ""));
    }

    #[test]
    fn test_verify_rejects_unknown_user() {
        let auth = AuthManager::new(true, table("admin", "password"));
        assert!(!auth.verify("root", "password"));
    }

    #[test]
    fn test_auth_disabled_accepts_anything() {
        let auth = AuthManager::new(false, HashMap::new());
        assert!(auth.verify("anyone", "anything"));
        assert!(auth.verify("", ""));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_hash_password_is_sha256_hex() {
        // sha256("password")
        assert_eq!(
            hash_password("password"),
            "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8"
        );
    }
}
