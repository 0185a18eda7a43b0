//! Lightweight Prometheus-compatible metrics shared by every tier.
//!
//! Uses atomic counters for lock-free instrumentation. Rendered in
//! Prometheus text exposition format as the reply to a node's status
//! request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    /// Requests forwarded to a downstream hop (counter)
    pub forwards_total: AtomicU64,
    /// Forwarded requests that failed (counter)
    pub forward_errors_total: AtomicU64,
    /// Successful (re)connections by connection managers (counter)
    pub reconnections_total: AtomicU64,
    /// Failed connection attempts (counter)
    pub connect_failures_total: AtomicU64,
    /// Requests answered by this node's server (counter)
    pub requests_handled_total: AtomicU64,
    /// Peers or requests refused by this node's server (counter)
    pub requests_rejected_total: AtomicU64,
    /// Downstream services currently connected (gauge)
    pub healthy_services: AtomicU64,
    /// Downstream services configured (gauge)
    pub total_services: AtomicU64,
    /// Process start time (for uptime calculation)
    pub start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            forwards_total: AtomicU64::new(0),
            forward_errors_total: AtomicU64::new(0),
            reconnections_total: AtomicU64::new(0),
            connect_failures_total: AtomicU64::new(0),
            requests_handled_total: AtomicU64::new(0),
            requests_rejected_total: AtomicU64::new(0),
            healthy_services: AtomicU64::new(0),
            total_services: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_health(&self, healthy: usize, total: usize) {
        self.healthy_services.store(healthy as u64, Ordering::Relaxed);
        self.total_services.store(total as u64, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP inception_forwards_total Requests forwarded to a downstream hop\n\
             # TYPE inception_forwards_total counter\n\
             inception_forwards_total {}\n\
             # HELP inception_forward_errors_total Forwarded requests that failed\n\
             # TYPE inception_forward_errors_total counter\n\
             inception_forward_errors_total {}\n\
             # HELP inception_reconnections_total Successful connections by connection managers\n\
             # TYPE inception_reconnections_total counter\n\
             inception_reconnections_total {}\n\
             # HELP inception_connect_failures_total Failed connection attempts\n\
             # TYPE inception_connect_failures_total counter\n\
             inception_connect_failures_total {}\n\
             # HELP inception_requests_handled_total Requests answered by this node\n\
             # TYPE inception_requests_handled_total counter\n\
             inception_requests_handled_total {}\n\
             # HELP inception_requests_rejected_total Peers or requests refused by this node\n\
             # TYPE inception_requests_rejected_total counter\n\
             inception_requests_rejected_total {}\n\
             # HELP inception_healthy_services Downstream services currently connected\n\
             # TYPE inception_healthy_services gauge\n\
             inception_healthy_services {}\n\
             # HELP inception_total_services Downstream services configured\n\
             # TYPE inception_total_services gauge\n\
             inception_total_services {}\n\
             # HELP inception_uptime_seconds Process uptime in seconds\n\
             # TYPE inception_uptime_seconds gauge\n\
             inception_uptime_seconds {}\n",
            self.forwards_total.load(Ordering::Relaxed),
            self.forward_errors_total.load(Ordering::Relaxed),
            self.reconnections_total.load(Ordering::Relaxed),
            self.connect_failures_total.load(Ordering::Relaxed),
            self.requests_handled_total.load(Ordering::Relaxed),
            self.requests_rejected_total.load(Ordering::Relaxed),
            self.healthy_services.load(Ordering::Relaxed),
            self.total_services.load(Ordering::Relaxed),
            uptime,
        )
    }
}
