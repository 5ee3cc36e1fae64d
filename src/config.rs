//! Process configuration.
//!
//! All options are read from environment-style keys at startup and are
//! immutable afterwards. The two binaries have separate surfaces: the proxy
//! reads `PROXY_*` keys, the bypass gateway reads `SOCKS_*`/`BYPASS_*` keys.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default destinations permitted by the proxy: the Telegram API hostnames
/// and data-center address blocks.
pub const DEFAULT_DESTINATIONS: &[&str] = &[
    "api.telegram.org",
    "core.telegram.org",
    "web.telegram.org",
    "desktop.telegram.org",
    "updates.tdesktop.com",
    "149.154.160.0/20",
    "149.154.164.0/22",
    "149.154.168.0/22",
    "149.154.172.0/22",
    "91.108.4.0/22",
    "91.108.8.0/22",
    "91.108.12.0/22",
    "91.108.16.0/22",
    "91.108.20.0/22",
    "91.108.56.0/22",
];

/// Configuration for the SOCKS5 proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen address
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Maximum concurrent sessions
    pub max_connections: usize,
    /// Rate limit: max admissions per source IP per window
    pub rate_limit_per_ip: u32,
    /// Rate limit: window duration
    pub rate_limit_window: Duration,
    /// Require username/password authentication
    pub auth_required: bool,
    /// Port for the Prometheus metrics exporter
    pub metrics_port: u16,
    /// Allow-list entries: hostnames and CIDR blocks
    pub allowed_destinations: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 1080,
            max_connections: 1000,
            rate_limit_per_ip: 10,
            rate_limit_window: Duration::from_secs(60),
            auth_required: true,
            metrics_port: 8080,
            allowed_destinations: DEFAULT_DESTINATIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let allowed_destinations = match env::var("ALLOWED_DESTINATIONS") {
            Ok(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => defaults.allowed_destinations,
        };

        Ok(Self {
            host: env::var("PROXY_HOST").unwrap_or(defaults.host),
            port: env_parse("PROXY_PORT", defaults.port)?,
            max_connections: env_parse("MAX_CONNECTIONS", defaults.max_connections)?,
            rate_limit_per_ip: env_parse("RATE_LIMIT_PER_IP", defaults.rate_limit_per_ip)?,
            rate_limit_window: Duration::from_secs(env_parse(
                "RATE_LIMIT_WINDOW",
                defaults.rate_limit_window.as_secs(),
            )?),
            auth_required: env_bool("AUTH_REQUIRED", defaults.auth_required),
            metrics_port: env_parse("METRICS_PORT", defaults.metrics_port)?,
            allowed_destinations,
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::config("PROXY_HOST cannot be empty"));
        }
        if self.rate_limit_per_ip == 0 {
            return Err(Error::config("RATE_LIMIT_PER_IP must be positive"));
        }
        if self.allowed_destinations.is_empty() {
            return Err(Error::config("allow-list cannot be empty"));
        }
        Ok(())
    }
}

/// Configuration for the bypass gateway process.
#[derive(Debug, Clone)]
pub struct BypassConfig {
    /// Address of the local SOCKS5 engine
    pub socks_host: String,
    /// Port of the local SOCKS5 engine
    pub socks_port: u16,
    /// HTTP tunnel gateway port
    pub http_port: u16,
    /// WebSocket tunnel gateway port
    pub ws_port: u16,
    /// Inclusive port range for hopping
    pub port_range: (u16, u16),
    /// Interval between hops
    pub hop_interval: Duration,
    /// Grace period before the previous listener closes
    pub hop_grace: Duration,
    /// Obfuscation key; `None` runs the tunnels in raw mode
    pub obfuscation_key: Option<[u8; 32]>,
    /// CDN hostnames usable as TLS fronts
    pub fronting_domains: Vec<String>,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            socks_host: "localhost".into(),
            socks_port: 1080,
            http_port: 8443,
            ws_port: 8444,
            port_range: (8000, 9000),
            hop_interval: Duration::from_secs(300),
            hop_grace: Duration::from_secs(60),
            obfuscation_key: None,
            fronting_domains: vec![
                "cloudflare.com".into(),
                "amazonaws.com".into(),
                "googleapis.com".into(),
                "microsoft.com".into(),
                "fastly.com".into(),
            ],
        }
    }
}

impl BypassConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            socks_host: env::var("SOCKS_HOST").unwrap_or(defaults.socks_host),
            socks_port: env_parse("SOCKS_PORT", defaults.socks_port)?,
            http_port: env_parse("BYPASS_HTTP_PORT", defaults.http_port)?,
            ws_port: env_parse("BYPASS_WS_PORT", defaults.ws_port)?,
            port_range: (
                env_parse("PORT_HOP_MIN", defaults.port_range.0)?,
                env_parse("PORT_HOP_MAX", defaults.port_range.1)?,
            ),
            hop_interval: Duration::from_secs(env_parse(
                "PORT_HOP_INTERVAL",
                defaults.hop_interval.as_secs(),
            )?),
            hop_grace: Duration::from_secs(env_parse(
                "PORT_HOP_GRACE",
                defaults.hop_grace.as_secs(),
            )?),
            obfuscation_key: parse_key_env("OBFUSCATION_KEY")?,
            fronting_domains: defaults.fronting_domains,
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.port_range.0 > self.port_range.1 {
            return Err(Error::config("PORT_HOP_MIN must not exceed PORT_HOP_MAX"));
        }
        if self.hop_interval.is_zero() {
            return Err(Error::config("PORT_HOP_INTERVAL must be positive"));
        }
        Ok(())
    }

    /// Address of the local SOCKS5 engine as `host:port`.
    pub fn socks_addr(&self) -> String {
        format!("{}:{}", self.socks_host, self.socks_port)
    }
}

/// Configuration for the fallback connection client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Proxy server hostname or IP
    pub server_host: String,
    /// Main SOCKS5 port on the server
    pub socks_port: u16,
    /// HTTP tunnel gateway port on the server
    pub http_port: u16,
    /// WebSocket tunnel gateway port on the server
    pub ws_port: u16,
    /// Hop range probed when `/port-info` is unreachable
    pub port_range: (u16, u16),
    /// SOCKS5 username
    pub username: String,
    /// SOCKS5 password
    pub password: String,
    /// Obfuscation key shared with the HTTP tunnel gateway
    pub obfuscation_key: Option<[u8; 32]>,
    /// CDN hostnames usable as TLS fronts
    pub fronting_domains: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let bypass = BypassConfig::default();
        Self {
            server_host: "127.0.0.1".into(),
            socks_port: 1080,
            http_port: bypass.http_port,
            ws_port: bypass.ws_port,
            port_range: bypass.port_range,
            username: "admin".into(),
            password: String::new(),
            obfuscation_key: None,
            fronting_domains: bypass.fronting_domains,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let password = env::var("SOCKS_PASSWORD")
            .or_else(|_| env::var("ADMIN_PASSWORD"))
            .unwrap_or(defaults.password);

        Ok(Self {
            server_host: env::var("SERVER_HOST").unwrap_or(defaults.server_host),
            socks_port: env_parse("PROXY_PORT", defaults.socks_port)?,
            http_port: env_parse("BYPASS_HTTP_PORT", defaults.http_port)?,
            ws_port: env_parse("BYPASS_WS_PORT", defaults.ws_port)?,
            port_range: (
                env_parse("PORT_HOP_MIN", defaults.port_range.0)?,
                env_parse("PORT_HOP_MAX", defaults.port_range.1)?,
            ),
            username: env::var("SOCKS_USERNAME").unwrap_or(defaults.username),
            password,
            obfuscation_key: parse_key_env("OBFUSCATION_KEY")?,
            fronting_domains: defaults.fronting_domains,
        })
    }
}

/// Decode an optional 32-byte hex key from the environment.
fn parse_key_env(key: &str) -> Result<Option<[u8; 32]>> {
    match env::var(key) {
        Ok(hex_key) => {
            let bytes = hex::decode(hex_key.trim())
                .map_err(|e| Error::config(format!("invalid {key} hex: {e}")))?;
            let parsed: [u8; 32] = bytes
                .try_into()
                .map_err(|_| Error::config(format!("{key} must be 32 bytes")))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("invalid {key}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}
