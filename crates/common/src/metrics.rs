use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    messages_in: CounterVec,
    messages_out: CounterVec,
    duplicates_dropped: CounterVec,
    messages_requeued: CounterVec,
    eof_emitted: CounterVec,
    handle_seconds: HistogramVec,
    spill_bytes: CounterVec,
    wal_bytes_written: CounterVec,
    wal_compactions: CounterVec,
    recovery_replays: CounterVec,
    active_clients: GaugeVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// One inbound message handled by `node`; `kind` is the envelope type header.
    pub fn record_message_in(&self, node: &str, queue: &str, kind: &str, secs: f64) {
        self.inner
            .messages_in
            .with_label_values(&[node, queue, kind])
            .inc();
        self.inner
            .handle_seconds
            .with_label_values(&[node, kind])
            .observe(secs.max(0.0));
    }

    pub fn record_message_out(&self, node: &str, queue: &str, kind: &str) {
        self.inner
            .messages_out
            .with_label_values(&[node, queue, kind])
            .inc();
        if kind.starts_with("EOF") {
            self.inner
                .eof_emitted
                .with_label_values(&[node, queue])
                .inc();
        }
    }

    pub fn inc_duplicates(&self, node: &str, queue: &str) {
        self.inner
            .duplicates_dropped
            .with_label_values(&[node, queue])
            .inc();
    }

    pub fn inc_requeued(&self, node: &str, queue: &str) {
        self.inner
            .messages_requeued
            .with_label_values(&[node, queue])
            .inc();
    }

    pub fn record_spill(&self, node: &str, stream: &str, bytes: u64) {
        self.inner
            .spill_bytes
            .with_label_values(&[node, stream])
            .inc_by(bytes as f64);
    }

    pub fn record_wal_write(&self, node: &str, bytes: u64) {
        self.inner
            .wal_bytes_written
            .with_label_values(&[node])
            .inc_by(bytes as f64);
    }

    pub fn inc_wal_compactions(&self, node: &str) {
        self.inner.wal_compactions.with_label_values(&[node]).inc();
    }

    /// `kind` is `startup` (WAL replay on boot) or `rebuild` (state rebuilt after a failed handle).
    pub fn inc_recovery_replays(&self, node: &str, kind: &str) {
        self.inner
            .recovery_replays
            .with_label_values(&[node, kind])
            .inc();
    }

    pub fn set_active_clients(&self, node: &str, clients: u64) {
        self.inner
            .active_clients
            .with_label_values(&[node])
            .set(clients as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let messages_in = counter_vec(
            &registry,
            "cq_messages_in_total",
            "Inbound messages handled per node",
            &["node", "queue", "kind"],
        );
        let messages_out = counter_vec(
            &registry,
            "cq_messages_out_total",
            "Envelopes published per node",
            &["node", "queue", "kind"],
        );
        let duplicates_dropped = counter_vec(
            &registry,
            "cq_duplicates_dropped_total",
            "Redelivered messages acknowledged without processing",
            &["node", "queue"],
        );
        let messages_requeued = counter_vec(
            &registry,
            "cq_messages_requeued_total",
            "Messages requeued after a transient failure",
            &["node", "queue"],
        );
        let eof_emitted = counter_vec(
            &registry,
            "cq_eof_emitted_total",
            "End-of-stream markers published",
            &["node", "queue"],
        );
        let handle_seconds = histogram_vec(
            &registry,
            "cq_handle_seconds",
            "Time spent handling one inbound message",
            &["node", "kind"],
        );
        let spill_bytes = counter_vec(
            &registry,
            "cq_spill_bytes_total",
            "Bytes appended to spill files",
            &["node", "stream"],
        );
        let wal_bytes_written = counter_vec(
            &registry,
            "cq_wal_bytes_written_total",
            "Bytes appended to the write-ahead log",
            &["node"],
        );
        let wal_compactions = counter_vec(
            &registry,
            "cq_wal_compactions_total",
            "Write-ahead log compactions",
            &["node"],
        );
        let recovery_replays = counter_vec(
            &registry,
            "cq_recovery_replays_total",
            "State rebuilds from the write-ahead log",
            &["node", "kind"],
        );
        let active_clients = gauge_vec(
            &registry,
            "cq_active_clients",
            "Clients with live state on this node",
            &["node"],
        );

        Self {
            registry,
            messages_in,
            messages_out,
            duplicates_dropped,
            messages_requeued,
            eof_emitted,
            handle_seconds,
            spill_bytes,
            wal_bytes_written,
            wal_compactions,
            recovery_replays,
            active_clients,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn eof_publishes_count_towards_eof_family() {
        let m = MetricsRegistry::new();
        m.record_message_out("filter-1", "broker", "MOVIES");
        m.record_message_out("filter-1", "broker", "EOF");
        let text = m.render_prometheus();
        assert!(text.contains("cq_messages_out_total"));
        assert!(text.contains("cq_eof_emitted_total{node=\"filter-1\",queue=\"broker\"} 1"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.record_message_in("joiner-1", "joiner_request_3_1", "RATINGS", 0.002);
        m.record_message_out("joiner-1", "aggregator_request_3", "RESULT");
        m.record_message_out("joiner-1", "aggregator_request_3", "EOF");
        m.inc_duplicates("joiner-1", "joiner_request_3_1");
        m.inc_requeued("joiner-1", "joiner_request_3_1");
        m.record_spill("joiner-1", "ratings", 4096);
        m.record_wal_write("joiner-1", 512);
        m.inc_wal_compactions("joiner-1");
        m.inc_recovery_replays("joiner-1", "startup");
        m.set_active_clients("joiner-1", 2);
        let text = m.render_prometheus();

        for family in [
            "cq_messages_in_total",
            "cq_messages_out_total",
            "cq_duplicates_dropped_total",
            "cq_messages_requeued_total",
            "cq_eof_emitted_total",
            "cq_handle_seconds",
            "cq_spill_bytes_total",
            "cq_wal_bytes_written_total",
            "cq_wal_compactions_total",
            "cq_recovery_replays_total",
            "cq_active_clients",
        ] {
            assert!(text.contains(family), "missing {family}");
        }
    }
}
