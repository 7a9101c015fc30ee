pub mod server;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    // Headers
    header_height: IntGauge,
    header_requests: IntCounter,
    // Blocks
    blocks_delivered: IntCounter,
    duplicate_blocks: IntCounter,
    unsolicited_blocks: IntCounter,
    pending_blocks: IntGauge,
    // Batches
    scheduler_depth: IntGauge,
    batches_sent: IntCounterVec,
    requests_requeued: IntCounterVec,
    batch_latency: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let header_height = IntGauge::with_opts(Opts::new("catchup_header_height", "Height of the best known header")).unwrap();
        registry.register(Box::new(header_height.clone())).unwrap();

        let header_requests = IntCounter::with_opts(Opts::new("catchup_header_requests_total", "Total number of getheaders requests sent")).unwrap();
        registry.register(Box::new(header_requests.clone())).unwrap();

        let blocks_delivered = IntCounter::with_opts(Opts::new("catchup_blocks_delivered_total", "Total number of blocks handed to the caller")).unwrap();
        registry.register(Box::new(blocks_delivered.clone())).unwrap();

        let duplicate_blocks = IntCounter::with_opts(Opts::new("catchup_duplicate_blocks_total", "Blocks received after another peer already delivered them")).unwrap();
        registry.register(Box::new(duplicate_blocks.clone())).unwrap();

        let unsolicited_blocks = IntCounter::with_opts(Opts::new("catchup_unsolicited_blocks_total", "Blocks received that nothing was waiting for")).unwrap();
        registry.register(Box::new(unsolicited_blocks.clone())).unwrap();

        let pending_blocks = IntGauge::with_opts(Opts::new("catchup_pending_blocks", "Blocks requested but not yet consumed")).unwrap();
        registry.register(Box::new(pending_blocks.clone())).unwrap();

        let scheduler_depth = IntGauge::with_opts(Opts::new("catchup_scheduler_depth", "Fetch requests waiting in the scheduler")).unwrap();
        registry.register(Box::new(scheduler_depth.clone())).unwrap();

        let batches_sent = IntCounterVec::new(
            Opts::new("catchup_batches_sent_total", "Total number of getdata batches sent"),
            &["peer"],
        ).unwrap();
        registry.register(Box::new(batches_sent.clone())).unwrap();

        let requests_requeued = IntCounterVec::new(
            Opts::new("catchup_requests_requeued_total", "Fetch requests a peer failed to serve within its batch"),
            &["peer"],
        ).unwrap();
        registry.register(Box::new(requests_requeued.clone())).unwrap();

        let batch_latency = HistogramVec::new(
            HistogramOpts::new("catchup_batch_latency_seconds", "Time from getdata until every batch member resolved or timed out")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &[],
        ).unwrap();
        registry.register(Box::new(batch_latency.clone())).unwrap();

        Self {
            registry,
            header_height,
            header_requests,
            blocks_delivered,
            duplicate_blocks,
            unsolicited_blocks,
            pending_blocks,
            scheduler_depth,
            batches_sent,
            requests_requeued,
            batch_latency,
        }
    }

    pub fn gather(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer).expect("failed to encode metrics");
        String::from_utf8(buffer).expect("metrics not utf8")
    }

    // Headers
    pub fn set_header_height(&self, v: i64) {
        self.header_height.set(v);
    }

    pub fn inc_header_requests(&self) {
        self.header_requests.inc();
    }

    // Blocks
    pub fn inc_blocks_delivered(&self) {
        self.blocks_delivered.inc();
    }

    pub fn inc_duplicate_blocks(&self) {
        self.duplicate_blocks.inc();
    }

    pub fn inc_unsolicited_blocks(&self) {
        self.unsolicited_blocks.inc();
    }

    pub fn set_pending_blocks(&self, v: i64) {
        self.pending_blocks.set(v);
    }

    // Batches
    pub fn set_scheduler_depth(&self, v: i64) {
        self.scheduler_depth.set(v);
    }

    pub fn inc_batches_sent(&self, peer: &str) {
        self.batches_sent.with_label_values(&[peer]).inc();
    }

    pub fn inc_requests_requeued(&self, peer: &str, count: u64) {
        self.requests_requeued.with_label_values(&[peer]).inc_by(count);
    }

    pub fn observe_batch_latency(&self, duration: f64) {
        self.batch_latency.with_label_values::<&str>(&[]).observe(duration);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathered_text_contains_catchup_metrics() {
        let metrics = Metrics::new();
        metrics.inc_blocks_delivered();
        metrics.inc_batches_sent("peer-a");
        metrics.set_header_height(42);

        let text = metrics.gather();
        assert!(text.contains("catchup_blocks_delivered_total 1"));
        assert!(text.contains("catchup_header_height 42"));
        assert!(text.contains("catchup_batches_sent_total{peer=\"peer-a\"} 1"));
    }
}
