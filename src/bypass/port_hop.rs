//! Port hopping.
//!
//! Rotates the externally visible listening port inside a configured range so
//! that blocking any single port only works until the next hop. Each hopped
//! listener forwards raw bytes to the SOCKS5 engine. The previous listener
//! stays open for a grace period after a hop so established clients are not
//! cut mid-session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::config::BypassConfig;
use crate::error::Result;

/// Snapshot of the hopper's state, served by the HTTP gateway's `/port-info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortHopperStatus {
    /// Most recently opened port
    pub current_port: Option<u16>,
    /// All ports still accepting (current plus any in their grace period)
    pub active_ports: Vec<u16>,
    /// Inclusive hop range
    pub port_range: (u16, u16),
    /// Seconds between hops
    pub hop_interval: u64,
}

struct HopState {
    current_port: Option<u16>,
    listeners: HashMap<u16, JoinHandle<()>>,
}

/// Rotating-port listener front for the SOCKS5 engine.
///
/// State is mutated only by the hop scheduler and the detached grace-close
/// tasks it spawns; everyone else reads through [`status`](Self::status).
pub struct PortHopper {
    socks_addr: String,
    port_range: (u16, u16),
    hop_interval: Duration,
    hop_grace: Duration,
    state: Mutex<HopState>,
}

impl PortHopper {
    /// Create a hopper from the gateway configuration.
    pub fn new(config: &BypassConfig) -> Self {
        Self {
            socks_addr: config.socks_addr(),
            port_range: config.port_range,
            hop_interval: config.hop_interval,
            hop_grace: config.hop_grace,
            state: Mutex::new(HopState {
                current_port: None,
                listeners: HashMap::new(),
            }),
        }
    }

    /// Run the hop schedule: an immediate first hop, then one per interval.
    /// Never returns under normal operation.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!(
            range = ?self.port_range,
            interval_secs = self.hop_interval.as_secs(),
            "Port hopping started"
        );
        loop {
            if let Err(e) = self.hop().await {
                tracing::error!("Port hop failed: {}", e);
            }
            tokio::time::sleep(self.hop_interval).await;
        }
    }

    /// Open a listener on a fresh random in-range port and schedule the
    /// previous one to close after the grace period.
    pub async fn hop(self: &Arc<Self>) -> Result<()> {
        let (min, max) = self.port_range;
        let current = self.state.lock().current_port;

        let mut attempts = 0u32;
        let (port, listener) = loop {
            let candidate = rand::thread_rng().gen_range(min..=max);
            if Some(candidate) == current && min != max {
                continue;
            }
            match TcpListener::bind(("0.0.0.0", candidate)).await {
                Ok(listener) => break (candidate, listener),
                Err(e) => {
                    attempts += 1;
                    if attempts >= 16 {
                        return Err(e.into());
                    }
                }
            }
        };

        let socks_addr = self.socks_addr.clone();
        let accept_task = tokio::spawn(accept_loop(listener, socks_addr));

        let previous = {
            let mut state = self.state.lock();
            state.listeners.insert(port, accept_task);
            state.current_port.replace(port)
        };
        tracing::info!(from = ?previous, to = port, "Hopped listening port");

        if let Some(old_port) = previous {
            // detached so a later hop cannot cancel the grace period
            let hopper = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(hopper.hop_grace).await;
                if let Some(handle) = hopper.state.lock().listeners.remove(&old_port) {
                    handle.abort();
                    tracing::info!(port = old_port, "Closed previous hop port");
                }
            });
        }
        Ok(())
    }

    /// Read-only snapshot for the `/port-info` endpoint.
    pub fn status(&self) -> PortHopperStatus {
        let state = self.state.lock();
        let mut active_ports: Vec<u16> = state.listeners.keys().copied().collect();
        active_ports.sort_unstable();
        PortHopperStatus {
            current_port: state.current_port,
            active_ports,
            port_range: self.port_range,
            hop_interval: self.hop_interval.as_secs(),
        }
    }
}

/// Accept connections on a hopped port and splice each to the SOCKS5 engine.
async fn accept_loop(listener: TcpListener, socks_addr: String) {
    loop {
        let (mut inbound, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Hopped listener accept failed: {}", e);
                return;
            }
        };
        tracing::debug!(peer = %peer, "Hopped port connection");

        let socks_addr = socks_addr.clone();
        tokio::spawn(async move {
            match TcpStream::connect(&socks_addr).await {
                Ok(mut upstream) => {
                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut upstream).await;
                }
                Err(e) => tracing::warn!("Hop forward to {} failed: {}", socks_addr, e),
            }
        });
    }
}
