//! Counter sink backing the Prometheus scrape endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::{error, trace};

use crate::enumerator::InterfaceId;
use crate::metrics::TrackedMetric;
use crate::poller::CycleReport;

/// Labels attached to every republished counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct CounterLabels {
    pub hostname: String,
    pub interface_id: String,
}

impl CounterLabels {
    pub fn new(hostname: impl Into<String>, interface: InterfaceId) -> Self {
        Self {
            hostname: hostname.into(),
            interface_id: interface.to_string(),
        }
    }
}

/// Destination of reconciled deltas.
///
/// Counters can only grow: the sink offers `add` and nothing that sets or
/// lowers a value.
pub trait CounterSink: Send + Sync {
    /// Add `delta` to the series of `metric` identified by `labels`.
    fn add(&self, metric: TrackedMetric, labels: &CounterLabels, delta: u64);

    /// Called once the poller knows which interfaces it tracks.
    fn record_initialized(&self, _interfaces: usize) {}

    /// Called after every completed poll cycle.
    fn record_cycle(&self, _report: &CycleReport) {}
}

impl<S: CounterSink + ?Sized> CounterSink for Arc<S> {
    fn add(&self, metric: TrackedMetric, labels: &CounterLabels, delta: u64) {
        (**self).add(metric, labels, delta);
    }

    fn record_initialized(&self, interfaces: usize) {
        (**self).record_initialized(interfaces);
    }

    fn record_cycle(&self, report: &CycleReport) {
        (**self).record_cycle(report);
    }
}

/// Progress of the poller, as seen by the HTTP readiness check.
#[derive(Debug, Clone, Default)]
pub struct PollStatus {
    /// Number of interfaces being polled, `None` before enumeration finished.
    pub interfaces: Option<usize>,
    pub cycles_completed: u64,
    pub last_cycle: Option<Instant>,
}

/// Exporter self-monitoring counters.
#[derive(Debug, Clone, Default)]
pub struct CollectorStats {
    pub cycles: u64,
    pub updates: u64,
    pub fetch_failures: u64,
    pub skipped: u64,
    pub upstream_resets: u64,
}

/// Prometheus registry holding one counter family per tracked metric.
pub struct MetricCollector {
    registry: Registry,
    families: HashMap<TrackedMetric, Family<CounterLabels, Counter>>,
    cycles: Counter,
    updates: Counter,
    fetch_failures: Counter,
    skipped: Counter,
    upstream_resets: Counter,
    tracked_interfaces: Gauge,
    status: RwLock<PollStatus>,
}

impl MetricCollector {
    /// Create a collector for `metrics`, with series names under `prefix`.
    pub fn new(prefix: &str, metrics: &[TrackedMetric]) -> Self {
        let mut registry = if prefix.is_empty() {
            Registry::default()
        } else {
            Registry::with_prefix(prefix)
        };

        let mut families = HashMap::with_capacity(metrics.len());
        for metric in metrics {
            let family = Family::<CounterLabels, Counter>::default();
            registry.register(metric.series_name(), metric.help(), family.clone());
            families.insert(*metric, family);
        }

        let exporter = registry.sub_registry_with_prefix("exporter");

        let cycles = Counter::default();
        exporter.register("poll_cycles", "Completed poll cycles", cycles.clone());
        let updates = Counter::default();
        exporter.register(
            "updates",
            "Upstream observations applied to counters",
            updates.clone(),
        );
        let fetch_failures = Counter::default();
        exporter.register(
            "fetch_failures",
            "Upstream fetches that failed after all retries",
            fetch_failures.clone(),
        );
        let skipped = Counter::default();
        exporter.register(
            "skipped_items",
            "Observations skipped because the payload was unusable",
            skipped.clone(),
        );
        let upstream_resets = Counter::default();
        exporter.register(
            "upstream_resets",
            "Upstream counter resets detected",
            upstream_resets.clone(),
        );
        let tracked_interfaces = Gauge::default();
        exporter.register(
            "tracked_interfaces",
            "Number of ntopng interfaces being polled",
            tracked_interfaces.clone(),
        );

        Self {
            registry,
            families,
            cycles,
            updates,
            fetch_failures,
            skipped,
            upstream_resets,
            tracked_interfaces,
            status: RwLock::new(PollStatus::default()),
        }
    }

    /// Render all metrics in the OpenMetrics text format.
    pub fn render(&self) -> String {
        let mut output = String::new();
        if let Err(e) = encode(&mut output, &self.registry) {
            error!(error = %e, "Failed to encode metrics");
        }
        output
    }

    /// Current poller progress.
    pub fn status(&self) -> PollStatus {
        self.status.read().clone()
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            cycles: self.cycles.get(),
            updates: self.updates.get(),
            fetch_failures: self.fetch_failures.get(),
            skipped: self.skipped.get(),
            upstream_resets: self.upstream_resets.get(),
        }
    }
}

impl CounterSink for MetricCollector {
    fn add(&self, metric: TrackedMetric, labels: &CounterLabels, delta: u64) {
        let Some(family) = self.families.get(&metric) else {
            error!(metric = %metric, "Metric not registered, dropping delta");
            return;
        };

        family.get_or_create(labels).inc_by(delta);
        trace!(
            metric = %metric,
            hostname = %labels.hostname,
            interface_id = %labels.interface_id,
            delta,
            "Counter incremented"
        );
    }

    fn record_initialized(&self, interfaces: usize) {
        self.tracked_interfaces
            .set(i64::try_from(interfaces).unwrap_or(i64::MAX));
        self.status.write().interfaces = Some(interfaces);
    }

    fn record_cycle(&self, report: &CycleReport) {
        self.cycles.inc();
        self.updates.inc_by(report.updated);
        self.fetch_failures.inc_by(report.failed);
        self.skipped.inc_by(report.skipped);
        self.upstream_resets.inc_by(report.resets);

        let mut status = self.status.write();
        status.cycles_completed += 1;
        status.last_cycle = Some(Instant::now());
    }
}

/// Create a shareable collector handle.
pub type SharedCollector = Arc<MetricCollector>;


#[cfg(test)]
mod tests {
    use super::*;

    fn labels(ifid: u32) -> CounterLabels {
        CounterLabels::new("probe01", InterfaceId(ifid))
    }

    #[test]
    fn test_render_registered_families() {
        let collector = MetricCollector::new("nettel", &TrackedMetric::ALL);
        let output = collector.render();

        assert!(output.contains("# TYPE nettel_zmq_rcvd_messages counter"));
        assert!(output.contains("# TYPE nettel_flow_drops counter"));
        assert!(output.contains("# TYPE nettel_zmq_msg_drops counter"));
        assert!(output.contains("# TYPE nettel_zmq_avg_msg_perflows counter"));
        assert!(output.contains("# HELP nettel_flow_drops Count of flow records dropped by ntopng"));
        assert!(output.ends_with("# EOF\n"));
    }

    #[test]
    fn test_add_accumulates() {
        let collector = MetricCollector::new("nettel", &TrackedMetric::ALL);

        collector.add(TrackedMetric::ZmqMsgRcvd, &labels(0), 10);
        collector.add(TrackedMetric::ZmqMsgRcvd, &labels(0), 32);
        collector.add(TrackedMetric::ZmqMsgRcvd, &labels(1), 5);

        let output = collector.render();
        assert!(output.contains(
            "nettel_zmq_rcvd_messages_total{hostname=\"probe01\",interface_id=\"0\"} 42"
        ));
        assert!(output.contains(
            "nettel_zmq_rcvd_messages_total{hostname=\"probe01\",interface_id=\"1\"} 5"
        ));
    }

    #[test]
    fn test_zero_delta_creates_series() {
        let collector = MetricCollector::new("nettel", &TrackedMetric::ALL);

        collector.add(TrackedMetric::DroppedFlows, &labels(3), 0);

        assert!(collector.render().contains(
            "nettel_flow_drops_total{hostname=\"probe01\",interface_id=\"3\"} 0"
        ));
    }

    #[test]
    fn test_unregistered_metric_is_dropped() {
        let collector = MetricCollector::new("nettel", &[TrackedMetric::ZmqMsgRcvd]);

        collector.add(TrackedMetric::DroppedFlows, &labels(0), 9);

        assert!(!collector.render().contains("flow_drops"));
    }

    #[test]
    fn test_record_cycle_updates_stats_and_status() {
        let collector = MetricCollector::new("nettel", &TrackedMetric::ALL);
        assert!(collector.status().interfaces.is_none());

        collector.record_initialized(2);
        collector.record_cycle(&CycleReport {
            updated: 6,
            skipped: 1,
            failed: 1,
            resets: 2,
        });

        let stats = collector.stats();
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.updates, 6);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.fetch_failures, 1);
        assert_eq!(stats.upstream_resets, 2);

        let status = collector.status();
        assert_eq!(status.interfaces, Some(2));
        assert_eq!(status.cycles_completed, 1);
        assert!(status.last_cycle.is_some());

        let output = collector.render();
        assert!(output.contains("nettel_exporter_poll_cycles_total 1"));
        assert!(output.contains("nettel_exporter_tracked_interfaces 2"));
    }

    #[test]
    fn test_shared_sink_forwards() {
        let collector: SharedCollector = Arc::new(MetricCollector::new("nettel", &TrackedMetric::ALL));
        let sink: &dyn CounterSink = &collector;

        sink.add(TrackedMetric::ZmqMsgDrops, &labels(0), 3);

        assert!(collector.render().contains(
            "nettel_zmq_msg_drops_total{hostname=\"probe01\",interface_id=\"0\"} 3"
        ));
    }
}
