//! Metrics for monitoring the exchange.
//!
//! Counters track protocol traffic (rows written, results observed, chunk
//! transfers, store retries), gauges track outstanding work, and histograms
//! track request round-trip latency.
//!
//! # Example
//!
//! ```rust
//! use glue_exchange::metrics::ExchangeMetrics;
//!
//! let metrics = ExchangeMetrics::new();
//! metrics.record_written(3);
//! assert_eq!(metrics.snapshot().requests_written, 3);
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::Counter;
pub use gauges::Gauge;
pub use histograms::{Histogram, HistogramSnapshot, HistogramTimer, DEFAULT_BUCKETS};

use std::fmt::Write as _;

/// Metrics owned by one exchange instance.
#[derive(Debug)]
pub struct ExchangeMetrics {
    /// Request rows written to the store.
    pub requests_written: Counter,
    /// Result rows accepted into a result table.
    pub results_observed: Counter,
    /// Result rows discarded because the id already had a value.
    pub duplicate_results: Counter,
    /// Store queries issued while waiting for results.
    pub poll_rounds: Counter,
    /// Store operations retried after contention.
    pub store_retries: Counter,
    /// Non-transient store failures.
    pub store_failures: Counter,
    /// Waits abandoned at their deadline.
    pub timeouts: Counter,
    /// Chunks sent to another rank.
    pub chunks_sent: Counter,
    /// Chunks received from another rank.
    pub chunks_received: Counter,

    /// Requests written but not yet answered.
    pub outstanding: Gauge,

    /// Time from first write to last result for one call.
    pub request_latency: Histogram,
}

impl ExchangeMetrics {
    pub fn new() -> Self {
        Self {
            requests_written: Counter::new("glue_requests_written_total", "Request rows written"),
            results_observed: Counter::new("glue_results_observed_total", "Result rows accepted"),
            duplicate_results: Counter::new(
                "glue_duplicate_results_total",
                "Result rows discarded as duplicates",
            ),
            poll_rounds: Counter::new("glue_poll_rounds_total", "Result queries issued"),
            store_retries: Counter::new(
                "glue_store_retries_total",
                "Store operations retried after contention",
            ),
            store_failures: Counter::new("glue_store_failures_total", "Fatal store errors"),
            timeouts: Counter::new("glue_timeouts_total", "Waits abandoned at deadline"),
            chunks_sent: Counter::new("glue_chunks_sent_total", "Chunks sent to peers"),
            chunks_received: Counter::new("glue_chunks_received_total", "Chunks received from peers"),
            outstanding: Gauge::new("glue_outstanding_requests", "Requests awaiting results"),
            request_latency: Histogram::new(
                "glue_request_latency_seconds",
                "Round trip of one request call",
            ),
        }
    }

    pub fn record_written(&self, count: u64) {
        self.requests_written.inc_by(count);
        self.outstanding.add(count as i64);
    }

    pub fn record_answered(&self, count: u64) {
        self.outstanding.sub(count as i64);
    }

    /// Stop tracking requests whose wait failed.
    pub fn record_abandoned(&self, count: u64) {
        self.outstanding.sub(count as i64);
    }

    /// Record the outcome of one `insert_if_absent`.
    pub fn record_observation(&self, inserted: bool) {
        if inserted {
            self.results_observed.inc();
        } else {
            self.duplicate_results.inc();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_written: self.requests_written.get(),
            results_observed: self.results_observed.get(),
            duplicate_results: self.duplicate_results.get(),
            poll_rounds: self.poll_rounds.get(),
            store_retries: self.store_retries.get(),
            store_failures: self.store_failures.get(),
            timeouts: self.timeouts.get(),
            chunks_sent: self.chunks_sent.get(),
            chunks_received: self.chunks_received.get(),
            outstanding: self.outstanding.get(),
            request_latency: self.request_latency.snapshot(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        for counter in [
            &self.requests_written,
            &self.results_observed,
            &self.duplicate_results,
            &self.poll_rounds,
            &self.store_retries,
            &self.store_failures,
            &self.timeouts,
            &self.chunks_sent,
            &self.chunks_received,
        ] {
            let _ = write!(
                out,
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n",
                name = counter.name(),
                help = counter.help(),
                value = counter.get()
            );
        }

        let _ = write!(
            out,
            "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n",
            name = self.outstanding.name(),
            help = self.outstanding.help(),
            value = self.outstanding.get()
        );

        let latency = self.request_latency.snapshot();
        let _ = write!(
            out,
            "# HELP {name} {help}\n# TYPE {name} histogram\n{name}_sum {sum}\n{name}_count {count}\n",
            name = self.request_latency.name(),
            help = self.request_latency.help(),
            sum = latency.sum,
            count = latency.count
        );

        out
    }
}

impl Default for ExchangeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`ExchangeMetrics`].
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub requests_written: u64,
    pub results_observed: u64,
    pub duplicate_results: u64,
    pub poll_rounds: u64,
    pub store_retries: u64,
    pub store_failures: u64,
    pub timeouts: u64,
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub outstanding: i64,
    pub request_latency: HistogramSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outstanding_tracks_written_and_answered() {
        let metrics = ExchangeMetrics::new();
        metrics.record_written(5);
        metrics.record_answered(2);
        let snap = metrics.snapshot();
        assert_eq!(snap.requests_written, 5);
        assert_eq!(snap.outstanding, 3);
    }

    #[test]
    fn test_observation_split() {
        let metrics = ExchangeMetrics::new();
        metrics.record_observation(true);
        metrics.record_observation(false);
        metrics.record_observation(false);
        let snap = metrics.snapshot();
        assert_eq!(snap.results_observed, 1);
        assert_eq!(snap.duplicate_results, 2);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = ExchangeMetrics::new();
        metrics.chunks_sent.inc_by(3);
        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE glue_chunks_sent_total counter"));
        assert!(text.contains("glue_chunks_sent_total 3"));
        assert!(text.contains("glue_request_latency_seconds_count 0"));
    }
}
