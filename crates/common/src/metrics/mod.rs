//! Metrics and observability utilities
//!
//! Provides Prometheus-friendly metric descriptions, message statistics
//! for queue producers and standardized naming conventions.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics prefix for all devgate metrics
pub const METRICS_PREFIX: &str = "devgate";

/// Buckets for queue send latency (in seconds)
pub const SEND_LATENCY_BUCKETS: &[f64] = &[
    0.001,  // 1ms
    0.005,  // 5ms
    0.010,  // 10ms
    0.025,  // 25ms
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    5.000,  // 5s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Queue traffic
    describe_counter!(
        format!("{}_messages_total", METRICS_PREFIX),
        Unit::Count,
        "Messages sent by the transport, by stage and outcome"
    );

    describe_histogram!(
        format!("{}_queue_send_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Queue send latency in seconds"
    );

    // Admission control
    describe_counter!(
        format!("{}_rate_limit_rejections_total", METRICS_PREFIX),
        Unit::Count,
        "Requests rejected by rate limits"
    );

    // Sessions
    describe_gauge!(
        format!("{}_sessions_active", METRICS_PREFIX),
        Unit::Count,
        "Registered device sessions"
    );

    describe_counter!(
        format!("{}_sessions_expired_total", METRICS_PREFIX),
        Unit::Count,
        "Sessions closed by inactivity or sync timeout"
    );

    // Activity
    describe_counter!(
        format!("{}_activity_reports_total", METRICS_PREFIX),
        Unit::Count,
        "Activity reports sent to the core stage"
    );

    // Routing
    describe_counter!(
        format!("{}_routing_unavailable_total", METRICS_PREFIX),
        Unit::Count,
        "Messages sent without a resolved device profile"
    );

    describe_counter!(
        format!("{}_rpc_timeouts_total", METRICS_PREFIX),
        Unit::Count,
        "Device-to-server RPCs that got no response in time"
    );

    // Cache metrics
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache misses"
    );

    tracing::info!("Metrics registered");
}

/// Send statistics for one destination
#[derive(Debug)]
pub struct MessagesStats {
    name: &'static str,
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
}

impl MessagesStats {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn increment_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_successful(&self) {
        self.successful.fetch_add(1, Ordering::Relaxed);
        record_message(self.name, "success");
    }

    pub fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        record_message(self.name, "failure");
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn successful(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Clear counters after they were logged
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.successful.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }
}

fn record_message(stage: &'static str, status: &'static str) {
    counter!(
        format!("{}_messages_total", METRICS_PREFIX),
        "stage" => stage,
        "status" => status
    )
    .increment(1);
}

/// Helper to record queue send latency
pub fn record_send_duration(stage: &'static str, duration_secs: f64) {
    histogram!(
        format!("{}_queue_send_duration_seconds", METRICS_PREFIX),
        "stage" => stage
    )
    .record(duration_secs);
}

/// Helper to record a rate-limit rejection
pub fn record_rate_limited(scope: &'static str) {
    counter!(
        format!("{}_rate_limit_rejections_total", METRICS_PREFIX),
        "scope" => scope
    )
    .increment(1);
}

/// Helper to publish the session count
pub fn record_sessions_active(count: usize) {
    gauge!(format!("{}_sessions_active", METRICS_PREFIX)).set(count as f64);
}

/// Helper to record a session closed by the transport itself
pub fn record_session_expired(reason: &'static str) {
    counter!(
        format!("{}_sessions_expired_total", METRICS_PREFIX),
        "reason" => reason
    )
    .increment(1);
}

/// Helper to record an activity report outcome
pub fn record_activity_report(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        format!("{}_activity_reports_total", METRICS_PREFIX),
        "status" => status
    )
    .increment(1);
}

pub fn record_routing_unavailable() {
    counter!(format!("{}_routing_unavailable_total", METRICS_PREFIX)).increment(1);
}

pub fn record_rpc_timeout() {
    counter!(format!("{}_rpc_timeouts_total", METRICS_PREFIX)).increment(1);
}

/// Helper to record cache metrics
pub fn record_cache(hit: bool, cache_name: &'static str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "cache" => cache_name
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "cache" => cache_name
        )
        .increment(1);
    }
}
