//! Registry metrics
//!
//! Each [`Registry`](crate::registry::Registry) owns one [`RegistryMetrics`];
//! there is no process-global collector, so independent registries (and tests)
//! never observe each other's counters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Thread-safe counters for one registry
#[derive(Debug)]
pub struct RegistryMetrics {
    // Session metrics
    sessions_created: AtomicU64,
    sessions_closed: AtomicU64,

    // Connection metrics
    connect_attempts: AtomicU64,
    connect_successes: AtomicU64,
    connect_failures: AtomicU64,
    connect_latencies: Mutex<Vec<u64>>, // in milliseconds

    // Traffic metrics
    publishes: AtomicU64,
    publish_failures: AtomicU64,
    events_dispatched: AtomicU64,
    events_dropped: AtomicU64,

    started_at: DateTime<Utc>,
}

impl Default for RegistryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryMetrics {
    pub fn new() -> Self {
        Self {
            sessions_created: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            connect_successes: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            connect_latencies: Mutex::new(Vec::new()),
            publishes: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_succeeded(&self, latency: Duration) {
        self.connect_successes.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn published(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        if let Ok(mut samples) = self.connect_latencies.lock() {
            samples.push(latency.as_millis() as u64);

            // Keep the most recent samples only
            if samples.len() > MAX_LATENCY_SAMPLES {
                samples.remove(0);
            }
        }
    }

    fn latency_statistics(&self) -> (f64, f64, f64) {
        let Ok(samples) = self.connect_latencies.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if samples.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self, live_sessions: usize) -> MetricsSnapshot {
        let (avg, p50, p95) = self.latency_statistics();
        let now = Utc::now();

        MetricsSnapshot {
            captured_at: now,
            uptime_seconds: (now - self.started_at).num_seconds().max(0) as u64,
            sessions: SessionMetrics {
                live: live_sessions as u64,
                created: self.sessions_created.load(Ordering::Relaxed),
                closed: self.sessions_closed.load(Ordering::Relaxed),
            },
            connections: ConnectionMetrics {
                attempts: self.connect_attempts.load(Ordering::Relaxed),
                successes: self.connect_successes.load(Ordering::Relaxed),
                failures: self.connect_failures.load(Ordering::Relaxed),
                avg_connect_time_ms: avg,
                connect_time_p50_ms: p50,
                connect_time_p95_ms: p95,
            },
            traffic: TrafficMetrics {
                publishes: self.publishes.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
                events_dropped: self.events_dropped.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub sessions: SessionMetrics,
    pub connections: ConnectionMetrics,
    pub traffic: TrafficMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub live: u64,
    pub created: u64,
    pub closed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_connect_time_ms: f64,
    pub connect_time_p50_ms: f64,
    pub connect_time_p95_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficMetrics {
    pub publishes: u64,
    pub publish_failures: u64,
    pub events_dispatched: u64,
    pub events_dropped: u64,
}

/// Linear-interpolated percentile over sorted data
fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;

    if lower == upper {
        sorted_data[lower] as f64
    } else {
        let weight = index - lower as f64;
        sorted_data[lower] as f64 * (1.0 - weight) + sorted_data[upper] as f64 * weight
    }
}
