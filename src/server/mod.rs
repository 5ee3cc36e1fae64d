//! SOCKS5 proxy server: accept loop, admission control, and observability.

pub mod engine;
pub mod metrics;
pub mod rate_limit;
pub mod relay;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;

use crate::auth::AuthManager;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::filter::AllowSet;

use engine::Engine;
use metrics::Metrics;
use rate_limit::RateLimiter;

/// Shared per-process state handed to every session. Built once at startup;
/// everything inside is immutable or internally synchronized.
pub struct ProxyContext {
    /// Process configuration
    pub config: ProxyConfig,
    /// Destination allow-list
    pub allow: Arc<AllowSet>,
    /// Credential verifier
    pub auth: Arc<AuthManager>,
    /// Per-IP admission control
    pub limiter: Arc<RateLimiter>,
    /// Metrics collector
    pub metrics: Arc<Metrics>,
}

impl ProxyContext {
    /// Build the context from a validated configuration, loading credentials
    /// from the environment.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let allow = Arc::new(AllowSet::new(config.allowed_destinations.iter()));
        let auth = Arc::new(AuthManager::from_env(config.auth_required));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_per_ip,
            config.rate_limit_window,
        ));
        let metrics = Arc::new(Metrics::new());

        Ok(Self {
            config,
            allow,
            auth,
            limiter,
            metrics,
        })
    }

    /// Admission control for a newly accepted connection. A denied peer is
    /// a silent close: the stream is dropped without any reply bytes.
    pub fn admit(&self, peer: IpAddr) -> Result<()> {
        if !self.limiter.check(peer) {
            self.metrics.rate_limit_hit();
            return Err(Error::RateLimited);
        }
        Ok(())
    }
}

/// The SOCKS5 proxy server.
pub struct Server {
    context: Arc<ProxyContext>,
    engine: Arc<Engine>,
}

impl Server {
    /// Create a server over a prepared context.
    pub fn new(context: ProxyContext) -> Self {
        let engine = Arc::new(Engine::new(
            Arc::clone(&context.auth),
            Arc::clone(&context.allow),
        ));
        Self {
            context: Arc::new(context),
            engine,
        }
    }

    /// Shared context, for inspection and for the metrics exporter.
    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.context
    }

    /// Bind the configured addresses and serve until the process exits.
    /// Spawns the metrics exporter on its own port.
    pub async fn run(&self) -> Result<()> {
        let config = &self.context.config;

        let metrics_listener =
            TcpListener::bind((config.host.as_str(), config.metrics_port)).await?;
        tracing::info!(port = config.metrics_port, "Metrics exporter listening");
        let exporter_metrics = Arc::clone(&self.context.metrics);
        tokio::spawn(async move {
            if let Err(e) = metrics::serve_exporter(exporter_metrics, metrics_listener).await {
                tracing::error!("Metrics exporter failed: {}", e);
            }
        });

        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        tracing::info!(
            addr = %listener.local_addr()?,
            auth = config.auth_required,
            hostnames = self.context.allow.hostname_count(),
            networks = self.context.allow.network_count(),
            "SOCKS5 proxy listening"
        );
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            };

            let context = Arc::clone(&self.context);
            let metrics = &context.metrics;

            if let Err(e) = context.admit(peer.ip()) {
                tracing::warn!(peer = %peer.ip(), "Connection dropped: {}", e);
                continue;
            }

            if metrics.active_connections() >= context.config.max_connections as u64 {
                tracing::warn!(
                    limit = context.config.max_connections,
                    "Connection limit reached"
                );
                continue;
            }

            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                let metrics = Arc::clone(&context.metrics);
                metrics.connection_opened();
                let started = Instant::now();

                match engine.serve_session(stream, peer.ip()).await {
                    Ok(session) => {
                        metrics.add_relayed_bytes(session.bytes_up, session.bytes_down);
                        tracing::debug!(
                            peer = %session.peer,
                            dest = %session.dest,
                            up = session.bytes_up,
                            down = session.bytes_down,
                            "Session finished"
                        );
                    }
                    Err(e) => {
                        match &e {
                            Error::AuthFailed => metrics.auth_failure(),
                            Error::DestinationDenied(_) => metrics.destination_blocked(),
                            _ => {}
                        }
                        tracing::debug!(peer = %peer.ip(), "Session ended: {}", e);
                    }
                }

                metrics.observe_request_duration(started.elapsed());
                metrics.connection_closed();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(limit: u32) -> ProxyContext {
        let mut config = ProxyConfig::default();
        config.rate_limit_per_ip = limit;
        ProxyContext::new(config).unwrap()
    }

    #[test]
    fn test_admit_denies_over_budget_peer() {
        let context = context(2);
        // public source, not covered by the private-range exemption
        let peer: IpAddr = "203.0.113.5".parse().unwrap();

        assert!(context.admit(peer).is_ok());
        assert!(context.admit(peer).is_ok());

        let err = context.admit(peer).unwrap_err();
        assert!(matches!(err, Error::RateLimited));
        assert!(err.is_silent_close());
        assert_eq!(context.metrics.rate_limit_hits(), 1);
    }

    #[test]
    fn test_admit_exempts_loopback() {
        let context = context(1);
        let peer: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..10 {
            assert!(context.admit(peer).is_ok());
        }
    }

    #[test]
    fn test_context_rejects_invalid_config() {
        let mut config = ProxyConfig::default();
        config.rate_limit_per_ip = 0;
        assert!(ProxyContext::new(config).is_err());
    }
}
