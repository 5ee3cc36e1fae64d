//! # hopsocks
//!
//! A domain-restricted SOCKS5 proxy hardened against network-level blocking.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Client Transports                          │
//! │   direct │ hopped port │ HTTP tunnel │ WebSocket │ fronting  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  SOCKS5 Protocol Engine (greeting, auth, request, filter)    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Relay Engine (bidirectional byte pump)                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Admission (sliding-window rate limit) + Observability       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Fail closed**: destinations outside the allow-list are never dialed
//! 2. **Reachability**: port hopping and tunnel gateways survive port/DPI blocks
//! 3. **Camouflage**: tunneled bytes are indistinguishable from web traffic
//!    to casual inspection (not a cryptographic integrity guarantee)

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod auth;
pub mod bypass;
pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod obfuscate;
pub mod server;
pub mod socks;

pub use error::{Error, Result};

/// Chunk size for relay copy loops and tunnel exchanges (bytes).
pub const RELAY_CHUNK_SIZE: usize = 8192;

/// Deadline for the upstream CONNECT dial.
pub const DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Deadline for each handshake-phase read. Peer silence beyond a message
/// boundary is treated as a malformed message and the session closes.
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
