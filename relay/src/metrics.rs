//! Metrics Collection for Backhaul Relay
//!
//! Atomic counters and a latency ring buffer, rendered in the
//! Prometheus text format on the metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Relay-wide metrics
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    /// Dispatch attempts
    dispatches: AtomicU64,
    /// Dispatch outcomes
    outcome_ok: AtomicU64,
    outcome_unavailable: AtomicU64,
    outcome_timeout: AtomicU64,
    outcome_send_failed: AtomicU64,
    outcome_invalid_status: AtomicU64,
    /// Status codes returned by private servers
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    /// Session lifecycle
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_superseded: AtomicU64,
    malformed_frames: AtomicU64,
    /// Body bytes forwarded in each direction
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    latencies: Mutex<LatencyHistogram>,
}

/// Latency ring buffer for percentile calculation
struct LatencyHistogram {
    /// Recent latencies in microseconds
    values: Vec<u64>,
    pos: usize,
    count: u64,
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum = self.sum.saturating_add(latency_us);
    }

    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.min(self.values.len() as u64) as usize;
        if count == 0 {
            return 0;
        }

        let mut sorted = self.values[..count].to_vec();
        sorted.sort_unstable();

        let idx = ((count as f64 * p / 100.0) as usize).min(count - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }
}

/// How a dispatch ended, for counting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok(u16),
    Unavailable,
    Timeout,
    SendFailed,
    InvalidStatus,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                dispatches: AtomicU64::new(0),
                outcome_ok: AtomicU64::new(0),
                outcome_unavailable: AtomicU64::new(0),
                outcome_timeout: AtomicU64::new(0),
                outcome_send_failed: AtomicU64::new(0),
                outcome_invalid_status: AtomicU64::new(0),
                status_2xx: AtomicU64::new(0),
                status_3xx: AtomicU64::new(0),
                status_4xx: AtomicU64::new(0),
                status_5xx: AtomicU64::new(0),
                sessions_opened: AtomicU64::new(0),
                sessions_closed: AtomicU64::new(0),
                sessions_superseded: AtomicU64::new(0),
                malformed_frames: AtomicU64::new(0),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                latencies: Mutex::new(LatencyHistogram::new(10000)),
            }),
        }
    }

    /// Record a finished dispatch
    pub async fn record_dispatch(&self, outcome: Outcome, latency_us: u64, bytes_in: u64, bytes_out: u64) {
        let inner = &self.inner;
        inner.dispatches.fetch_add(1, Ordering::Relaxed);
        inner.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        inner.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);

        match outcome {
            Outcome::Ok(status) => {
                inner.outcome_ok.fetch_add(1, Ordering::Relaxed);
                match status / 100 {
                    2 => { inner.status_2xx.fetch_add(1, Ordering::Relaxed); }
                    3 => { inner.status_3xx.fetch_add(1, Ordering::Relaxed); }
                    4 => { inner.status_4xx.fetch_add(1, Ordering::Relaxed); }
                    5 => { inner.status_5xx.fetch_add(1, Ordering::Relaxed); }
                    _ => {}
                }
            }
            Outcome::Unavailable => { inner.outcome_unavailable.fetch_add(1, Ordering::Relaxed); }
            Outcome::Timeout => { inner.outcome_timeout.fetch_add(1, Ordering::Relaxed); }
            Outcome::SendFailed => { inner.outcome_send_failed.fetch_add(1, Ordering::Relaxed); }
            Outcome::InvalidStatus => { inner.outcome_invalid_status.fetch_add(1, Ordering::Relaxed); }
        }

        inner.latencies.lock().await.record(latency_us);
    }

    pub fn session_opened(&self) {
        self.inner.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.inner.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_superseded(&self) {
        self.inner.sessions_superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_frame(&self) {
        self.inner.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> u64 {
        let opened = self.inner.sessions_opened.load(Ordering::Relaxed);
        let closed = self.inner.sessions_closed.load(Ordering::Relaxed);
        opened.saturating_sub(closed)
    }

    pub fn dispatches(&self) -> u64 {
        self.inner.dispatches.load(Ordering::Relaxed)
    }

    /// Generate Prometheus-format metrics text
    pub async fn to_prometheus(&self) -> String {
        let lat = self.inner.latencies.lock().await;
        let p50 = lat.percentile(50.0);
        let p95 = lat.percentile(95.0);
        let p99 = lat.percentile(99.0);
        let avg = lat.average();
        drop(lat);

        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let inner = &self.inner;

        format!(
r#"# HELP backhaul_dispatches_total Requests dispatched to private servers
# TYPE backhaul_dispatches_total counter
backhaul_dispatches_total {}

# HELP backhaul_dispatch_outcomes_total Dispatch results by outcome
# TYPE backhaul_dispatch_outcomes_total counter
backhaul_dispatch_outcomes_total{{outcome="ok"}} {}
backhaul_dispatch_outcomes_total{{outcome="unavailable"}} {}
backhaul_dispatch_outcomes_total{{outcome="timeout"}} {}
backhaul_dispatch_outcomes_total{{outcome="send_failed"}} {}
backhaul_dispatch_outcomes_total{{outcome="invalid_status"}} {}

# HELP backhaul_responses_by_status Private server responses by HTTP status class
# TYPE backhaul_responses_by_status counter
backhaul_responses_by_status{{status="2xx"}} {}
backhaul_responses_by_status{{status="3xx"}} {}
backhaul_responses_by_status{{status="4xx"}} {}
backhaul_responses_by_status{{status="5xx"}} {}

# HELP backhaul_active_sessions Live tunnel sessions
# TYPE backhaul_active_sessions gauge
backhaul_active_sessions {}

# HELP backhaul_sessions_superseded_total Sessions replaced by a reconnect
# TYPE backhaul_sessions_superseded_total counter
backhaul_sessions_superseded_total {}

# HELP backhaul_malformed_frames_total Undecodable frames received
# TYPE backhaul_malformed_frames_total counter
backhaul_malformed_frames_total {}

# HELP backhaul_bytes_total Body bytes forwarded
# TYPE backhaul_bytes_total counter
backhaul_bytes_total{{direction="in"}} {}
backhaul_bytes_total{{direction="out"}} {}

# HELP backhaul_dispatch_latency_us Dispatch latency in microseconds
# TYPE backhaul_dispatch_latency_us summary
backhaul_dispatch_latency_us{{quantile="0.5"}} {}
backhaul_dispatch_latency_us{{quantile="0.95"}} {}
backhaul_dispatch_latency_us{{quantile="0.99"}} {}
backhaul_dispatch_latency_us_avg {}
"#,
            load(&inner.dispatches),
            load(&inner.outcome_ok),
            load(&inner.outcome_unavailable),
            load(&inner.outcome_timeout),
            load(&inner.outcome_send_failed),
            load(&inner.outcome_invalid_status),
            load(&inner.status_2xx),
            load(&inner.status_3xx),
            load(&inner.status_4xx),
            load(&inner.status_5xx),
            self.active_sessions(),
            load(&inner.sessions_superseded),
            load(&inner.malformed_frames),
            load(&inner.bytes_in),
            load(&inner.bytes_out),
            p50, p95, p99, avg,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
