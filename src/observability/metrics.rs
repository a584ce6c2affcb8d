use prometheus::{Encoder, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub offers_total: IntCounterVec,
    pub delivery_ops_total: IntCounterVec,
    pub delivery_op_latency_seconds: HistogramVec,
    pub public_id_allocations_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let offers_total = IntCounterVec::new(
            Opts::new("offers_total", "Offer ledger operations by status"),
            &["status"],
        )
        .expect("valid offers_total metric");

        let delivery_ops_total = IntCounterVec::new(
            Opts::new("delivery_ops_total", "Delivery operations by op and outcome"),
            &["op", "outcome"],
        )
        .expect("valid delivery_ops_total metric");

        let delivery_op_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "delivery_op_latency_seconds",
                "Latency of delivery operations in seconds",
            ),
            &["op"],
        )
        .expect("valid delivery_op_latency_seconds metric");

        let public_id_allocations_total = IntCounter::new(
            "public_id_allocations_total",
            "Sequential public ids handed out by the allocator",
        )
        .expect("valid public_id_allocations_total metric");

        registry
            .register(Box::new(offers_total.clone()))
            .expect("register offers_total");
        registry
            .register(Box::new(delivery_ops_total.clone()))
            .expect("register delivery_ops_total");
        registry
            .register(Box::new(delivery_op_latency_seconds.clone()))
            .expect("register delivery_op_latency_seconds");
        registry
            .register(Box::new(public_id_allocations_total.clone()))
            .expect("register public_id_allocations_total");

        Self {
            registry,
            offers_total,
            delivery_ops_total,
            delivery_op_latency_seconds,
            public_id_allocations_total,
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
