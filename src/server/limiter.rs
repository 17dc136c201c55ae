use std::{collections::HashMap, net::IpAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::{
    config::SharedConfig,
    relay::methods,
    server::{client::Connection, health::RelayMetrics, middleware::MethodRateLimiter},
    utils::error::CloseReason,
};

#[derive(Debug, Default)]
struct ConnectionCounters {
    total: usize,
    per_ip: HashMap<IpAddr, usize>,
}

/// Counter values observed by one connection at the moment it was counted.
///
/// Admission is decided against this snapshot rather than the live counters,
/// so concurrent arrivals each see their own position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub total: usize,
    pub per_ip: usize,
}

/// Admission control, inactivity TTLs, subscription quotas and per-method rate
/// limits for every connection.
///
/// Limits are read from the shared configuration on each check, so changes
/// apply to the next connection or request.
pub struct ConnectionLimiter {
    config: SharedConfig,
    metrics: RelayMetrics,
    counters: Mutex<ConnectionCounters>,
    rate_limiter: MethodRateLimiter,
}

impl ConnectionLimiter {
    pub fn new(config: SharedConfig, metrics: RelayMetrics) -> Self {
        Self {
            config,
            metrics,
            counters: Mutex::new(ConnectionCounters::default()),
            rate_limiter: MethodRateLimiter::new(),
        }
    }

    /// Purges expired rate-limit windows once per configured window.
    pub fn spawn_rate_limit_cleanup(&self) -> JoinHandle<()> {
        let every = self.config.read().rate_limit_duration();
        self.rate_limiter.spawn_cleanup(every.max(Duration::from_millis(1)))
    }

    /// Counts a newly accepted connection and resets its subscription counter.
    ///
    /// The returned snapshot is taken under the same lock as the increment and
    /// is what [`apply_limits`](Self::apply_limits) checks.
    pub fn increment_counters(&self, conn: &Connection) -> AdmissionSnapshot {
        let ip = conn.ip();
        let snapshot = {
            let mut guard = self.counters.lock();
            let counters = &mut *guard;
            counters.total += 1;
            let per_ip = counters.per_ip.entry(ip).or_insert(0);
            *per_ip += 1;
            AdmissionSnapshot {
                total: counters.total,
                per_ip: *per_ip,
            }
        };
        conn.reset_subscriptions();

        self.metrics
            .connections
            .set(i64::try_from(snapshot.total).unwrap_or(i64::MAX));
        self.metrics.set_ip_connections(ip, snapshot.per_ip);
        snapshot
    }

    /// Releases a closed connection's slot. Must run exactly once per
    /// [`increment_counters`](Self::increment_counters).
    pub fn decrement_counters(&self, conn: &Connection) {
        let ip = conn.ip();
        let (total, per_ip) = {
            let mut guard = self.counters.lock();
            let counters = &mut *guard;
            counters.total = counters.total.saturating_sub(1);
            let per_ip = match counters.per_ip.get_mut(&ip) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    *count
                }
                _ => {
                    counters.per_ip.remove(&ip);
                    0
                }
            };
            (counters.total, per_ip)
        };

        self.metrics.connections.set(i64::try_from(total).unwrap_or(i64::MAX));
        self.metrics.set_ip_connections(ip, per_ip);
    }

    /// Checks a counted connection against the global and per-IP limits, using
    /// the snapshot returned by [`increment_counters`](Self::increment_counters).
    ///
    /// Over-limit connections are sent the coded error and close frames and
    /// `false` is returned. Admitted connections get their inactivity timer
    /// started.
    #[instrument(skip(self, conn), fields(connection_id = %conn.id, ip = %conn.ip()))]
    pub fn apply_limits(&self, conn: &Arc<Connection>, snapshot: AdmissionSnapshot) -> bool {
        let (max_connections, max_per_ip) = {
            let config = self.config.read();
            (config.max_connections, config.max_connections_per_ip)
        };
        let AdmissionSnapshot { total, per_ip } = snapshot;

        let reason = if total > max_connections {
            info!(
                "Closing connection {} due to exceeded maximum connections (max_con={})",
                conn.id, max_connections
            );
            Some(("connection_limit", CloseReason::ConnectionLimitExceeded { limit: max_connections }))
        } else if per_ip > max_per_ip {
            info!(
                "Closing connection {} due to exceeded maximum connections from a single IP: address {} - {} connections. (max_con={})",
                conn.id,
                conn.ip(),
                per_ip,
                max_per_ip
            );
            Some(("ip_limit", CloseReason::IpLimitExceeded { limit: max_per_ip }))
        } else {
            None
        };

        if let Some((label, reason)) = reason {
            self.metrics.limit_rejections.with_label_values(&[label]).inc();
            conn.close_with(&reason);
            return false;
        }

        self.start_inactivity_ttl_timer(conn);
        true
    }

    /// Arms the inactivity deadline and starts the connection's watchdog task
    /// if it is not running yet.
    pub fn start_inactivity_ttl_timer(&self, conn: &Arc<Connection>) {
        let ttl = self.config.read().inactivity_ttl();
        conn.arm_inactivity_timer(ttl);

        if !conn.claim_watchdog() {
            return;
        }
        let conn = conn.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            if !conn.idle_expired().await {
                return;
            }
            let ttl_ms = conn
                .inactivity_ttl()
                .map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or_default();
            if conn.close_with(&CloseReason::TtlExpired { ttl_ms }) {
                info!(
                    "Closing connection {} due to reaching TTL ({}ms)",
                    conn.id, ttl_ms
                );
                metrics.ttl_expirations.inc();
            }
        });
    }

    /// Restarts the inactivity deadline from now, picking up the current TTL.
    pub fn reset_inactivity_ttl_timer(&self, conn: &Connection) {
        let ttl = self.config.read().inactivity_ttl();
        conn.arm_inactivity_timer(ttl);
    }

    pub fn increment_subs(&self, conn: &Connection) {
        conn.add_subscriptions(1);
        debug!(
            "Connection {}: subscription count is now {}",
            conn.id,
            conn.subscription_count()
        );
    }

    pub fn decrement_subs(&self, conn: &Connection, amount: usize) {
        if amount == 0 {
            return;
        }
        conn.remove_subscriptions(amount);
        debug!(
            "Connection {}: subscription count is now {}",
            conn.id,
            conn.subscription_count()
        );
    }

    /// Whether the connection may open one more subscription.
    pub fn validate_subscription_limit(&self, conn: &Connection) -> bool {
        conn.subscription_count() < self.config.read().subscription_limit
    }

    /// Counts a request against its `(ip, method)` window and reports whether
    /// it must be rejected.
    ///
    /// Subscription management methods and unknown methods are never limited.
    pub fn should_rate_limit_on_method(&self, ip: IpAddr, method: &str, request_id: &str) -> bool {
        let (limit, window) = {
            let config = self.config.read();
            if config.rate_limit_disabled {
                return false;
            }
            let Some(spec) = methods::lookup(method).filter(|spec| !spec.is_subscription()) else {
                return false;
            };
            (spec.tier.limit(&config), config.rate_limit_duration())
        };
        self.rate_limiter
            .should_rate_limit(ip, method, limit, window, request_id)
    }

    pub fn connection_count(&self) -> usize {
        self.counters.lock().total
    }

    pub fn ip_connection_count(&self, ip: IpAddr) -> usize {
        self.counters.lock().per_ip.get(&ip).copied().unwrap_or_default()
    }
}
