use std::{net::IpAddr, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window request counter keyed by `(ip, method)`.
///
/// A window opens on the first request for a key and lasts for the configured
/// duration; the count resets in one step once it elapses.
#[derive(Clone, Default)]
pub struct MethodRateLimiter {
    windows: Arc<DashMap<(IpAddr, String), RateWindow>>,
}

impl MethodRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one request and reports whether it exceeds `limit` for the
    /// current window.
    ///
    /// Rejected requests do not consume budget.
    pub fn should_rate_limit(
        &self,
        ip: IpAddr,
        method: &str,
        limit: u32,
        window: Duration,
        request_id: &str,
    ) -> bool {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry((ip, method.to_string()))
            .or_insert_with(|| RateWindow {
                count: 0,
                reset_at: now + window,
            });

        if entry.reset_at <= now {
            entry.count = 0;
            entry.reset_at = now + window;
        }

        if entry.count >= limit {
            warn!(
                "[Request ID: {}] Rate limit call to {}, {} out of {} calls per {:?} from {}",
                request_id, method, entry.count, limit, window, ip
            );
            return true;
        }

        entry.count += 1;
        false
    }

    /// Drops windows that have already expired and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| window.reset_at > now);
        before - self.windows.len()
    }

    /// Starts a background task purging expired windows on a fixed schedule.
    pub fn spawn_cleanup(&self, every: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let removed = limiter.purge_expired();
                if removed > 0 {
                    debug!("Purged {} expired rate limit windows", removed);
                }
            }
        })
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "192.168.0.5".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn limits_after_ceiling_within_window() {
        let limiter = MethodRateLimiter::new();
        let window = Duration::from_secs(60);
        assert!(!limiter.should_rate_limit(ip(), "eth_call", 2, window, "r1"));
        assert!(!limiter.should_rate_limit(ip(), "eth_call", 2, window, "r2"));
        assert!(limiter.should_rate_limit(ip(), "eth_call", 2, window, "r3"));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_per_ip_and_method() {
        let limiter = MethodRateLimiter::new();
        let window = Duration::from_secs(60);
        let other: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(!limiter.should_rate_limit(ip(), "eth_call", 1, window, "r"));
        assert!(limiter.should_rate_limit(ip(), "eth_call", 1, window, "r"));
        assert!(!limiter.should_rate_limit(ip(), "eth_chainId", 1, window, "r"));
        assert!(!limiter.should_rate_limit(other, "eth_call", 1, window, "r"));
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_duration() {
        let limiter = MethodRateLimiter::new();
        let window = Duration::from_millis(500);
        assert!(!limiter.should_rate_limit(ip(), "eth_call", 1, window, "r"));
        assert!(limiter.should_rate_limit(ip(), "eth_call", 1, window, "r"));

        tokio::time::advance(Duration::from_millis(501)).await;
        assert!(!limiter.should_rate_limit(ip(), "eth_call", 1, window, "r"));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_expired_windows() {
        let limiter = MethodRateLimiter::new();
        let _ = limiter.should_rate_limit(ip(), "a", 5, Duration::from_millis(100), "r");
        let _ = limiter.should_rate_limit(ip(), "b", 5, Duration::from_secs(100), "r");
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.window_count(), 1);
    }
}
