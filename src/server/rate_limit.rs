//! Per-source sliding-window admission control.
//!
//! Each source IP gets an ordered sequence of admission timestamps, pruned
//! lazily on every check. Loopback and private management addresses (health
//! probes, Docker-internal traffic) bypass the limiter entirely — they are
//! never exempt from authentication.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Sliding-window rate limiter keyed by source IP.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<Windows>,
}

struct Windows {
    per_ip: HashMap<IpAddr, VecDeque<Instant>>,
    last_cleanup: Instant,
}

impl RateLimiter {
    /// Create a limiter admitting `max_requests` per `window` per source IP.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(Windows {
                per_ip: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Check whether a connection from this IP is admitted, recording the
    /// admission timestamp if so.
    pub fn check(&self, ip: IpAddr) -> bool {
        if is_exempt(ip) {
            return true;
        }

        let now = Instant::now();
        let mut windows = self.windows.lock();

        if now.duration_since(windows.last_cleanup) > self.window * 2 {
            self.cleanup(&mut windows, now);
        }

        let requests = windows.per_ip.entry(ip).or_default();
        while let Some(&front) = requests.front() {
            if now.duration_since(front) >= self.window {
                requests.pop_front();
            } else {
                break;
            }
        }

        if requests.len() >= self.max_requests as usize {
            return false;
        }
        requests.push_back(now);
        true
    }

    /// Current in-window admission count for an IP.
    pub fn current_count(&self, ip: IpAddr) -> usize {
        let now = Instant::now();
        let windows = self.windows.lock();
        windows
            .per_ip
            .get(&ip)
            .map(|requests| {
                requests
                    .iter()
                    .filter(|&&t| now.duration_since(t) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Number of tracked source IPs.
    pub fn tracked_count(&self) -> usize {
        self.windows.lock().per_ip.len()
    }

    fn cleanup(&self, windows: &mut Windows, now: Instant) {
        let window = self.window;
        windows
            .per_ip
            .retain(|_, requests| match requests.back() {
                Some(&last) => now.duration_since(last) < window,
                None => false,
            });
        windows.last_cleanup = now;
    }
}

/// Loopback and private management addresses are exempt from rate limiting
/// only, never from authentication.
fn is_exempt(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBLIC_IP: &str = "203.0.113.5";

    #[test]
    fn test_allows_under_limit() {
        let limiter = RateLimiter::new(10, Duration::from_secs(60));
        let ip: IpAddr = PUBLIC_IP.parse().unwrap();

        for _ in 0..10 {
            assert!(limiter.check(ip));
        }
    }

    #[test]
    fn test_blocks_over_limit() {
        let limiter = RateLimiter::new(10, Duration::from_secs(60));
        let ip: IpAddr = PUBLIC_IP.parse().unwrap();

        for _ in 0..10 {
            assert!(limiter.check(ip));
        }
        // 11th connection within the window is rejected
        assert!(!limiter.check(ip));
        assert_eq!(limiter.current_count(ip), 10);
    }

    #[test]
    fn test_window_expiry_readmits() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));
        let ip: IpAddr = PUBLIC_IP.parse().unwrap();

        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));

        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.check(ip));
    }

    #[test]
    fn test_per_ip_isolation() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let a: IpAddr = "203.0.113.5".parse().unwrap();
        let b: IpAddr = "203.0.113.6".parse().unwrap();

        assert!(limiter.check(a));
        assert!(!limiter.check(a));
        assert!(limiter.check(b));
    }

    #[test]
    fn test_loopback_and_private_exempt() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));

        for ip in ["127.0.0.1", "::1", "10.1.2.3", "172.17.0.2", "192.168.1.9"] {
            let ip: IpAddr = ip.parse().unwrap();
            for _ in 0..5 {
                assert!(limiter.check(ip), "{ip} should be exempt");
            }
        }
        // exempt addresses are not tracked at all
        assert_eq!(limiter.tracked_count(), 0);
    }

    #[test]
    fn test_cleanup_drops_stale_entries() {
        let limiter = RateLimiter::new(5, Duration::from_millis(10));
        let a: IpAddr = "203.0.113.5".parse().unwrap();
        let b: IpAddr = "203.0.113.6".parse().unwrap();

        assert!(limiter.check(a));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check(b));
        assert!(limiter.tracked_count() <= 2);
    }
}
