//! Prometheus metrics for the master

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Master-side counters, exposed at `/metrics`
pub struct MasterMetrics {
    pub registry: Registry,

    pub items_pulled: IntCounter,
    pub results_submitted: IntCounter,
    pub items_acknowledged: IntCounter,

    /// Rejected requests by reason
    pub protocol_failures: IntCounterVec,

    pub active_sessions: IntGauge,

    /// Seconds from item creation to result submission
    pub item_latency: Histogram,
}

impl MasterMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let items_pulled = IntCounter::new(
            "mailsift_items_pulled_total",
            "Work items handed out to workers",
        )?;
        registry.register(Box::new(items_pulled.clone()))?;

        let results_submitted = IntCounter::new(
            "mailsift_results_submitted_total",
            "Result records submitted by workers",
        )?;
        registry.register(Box::new(results_submitted.clone()))?;

        let items_acknowledged = IntCounter::new(
            "mailsift_items_acknowledged_total",
            "Work items released without a result",
        )?;
        registry.register(Box::new(items_acknowledged.clone()))?;

        let protocol_failures = IntCounterVec::new(
            Opts::new(
                "mailsift_protocol_failures_total",
                "Rejected worker requests by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(protocol_failures.clone()))?;

        let active_sessions =
            IntGauge::new("mailsift_active_sessions", "Workers with a live session")?;
        registry.register(Box::new(active_sessions.clone()))?;

        let item_latency = Histogram::with_opts(
            HistogramOpts::new(
                "mailsift_item_latency_seconds",
                "Time from ingestion to result submission",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
        )?;
        registry.register(Box::new(item_latency.clone()))?;

        Ok(Self {
            registry,
            items_pulled,
            results_submitted,
            items_acknowledged,
            protocol_failures,
            active_sessions,
            item_latency,
        })
    }

    pub fn inc_protocol_failure(&self, reason: &str) {
        self.protocol_failures.with_label_values(&[reason]).inc();
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
