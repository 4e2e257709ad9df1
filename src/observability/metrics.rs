use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub samples_total: IntCounterVec,
    pub sink_failures_total: IntCounterVec,
    pub mutations_total: IntCounterVec,
    pub pending_writes: IntGauge,
    pub fanout_latency_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let samples_total = IntCounterVec::new(
            Opts::new("samples_total", "Location samples seen by the filter, by verdict"),
            &["outcome"],
        )
        .expect("valid samples_total metric");

        let sink_failures_total = IntCounterVec::new(
            Opts::new("sink_failures_total", "Failed fan-out deliveries by sink"),
            &["sink"],
        )
        .expect("valid sink_failures_total metric");

        let mutations_total = IntCounterVec::new(
            Opts::new("mutations_total", "Optimistic mutations by operation and outcome"),
            &["operation", "outcome"],
        )
        .expect("valid mutations_total metric");

        let pending_writes = IntGauge::new("pending_writes", "Remote writes waiting in the outbox")
            .expect("valid pending_writes metric");

        let fanout_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "fanout_latency_seconds",
                "Time to deliver one accepted sample to every sink",
            ),
            &["outcome"],
        )
        .expect("valid fanout_latency_seconds metric");

        registry
            .register(Box::new(samples_total.clone()))
            .expect("register samples_total");
        registry
            .register(Box::new(sink_failures_total.clone()))
            .expect("register sink_failures_total");
        registry
            .register(Box::new(mutations_total.clone()))
            .expect("register mutations_total");
        registry
            .register(Box::new(pending_writes.clone()))
            .expect("register pending_writes");
        registry
            .register(Box::new(fanout_latency_seconds.clone()))
            .expect("register fanout_latency_seconds");

        Self {
            registry,
            samples_total,
            sink_failures_total,
            mutations_total,
            pending_writes,
            fanout_latency_seconds,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
