use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref MALFORMED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_malformed_messages_total",
        "Telemetry payloads dropped because they could not be parsed"
    ))
    .unwrap();
    pub static ref SAMPLES_STORED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_samples_stored_total",
        "Telemetry samples appended to the log"
    ))
    .unwrap();
    pub static ref SAMPLES_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_samples_dropped_total",
        "Telemetry samples dropped after persistence failures"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_db_failures_total",
        "Total failed store operations, including retried ones"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "bridge_ingest_latency_seconds",
            "Time taken to append one sample, retries included"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_channel_full_total",
        "Messages dropped because a subscriber buffer was full"
    ))
    .unwrap();
    pub static ref BROKER_CONNECTED: Gauge = Gauge::with_opts(Opts::new(
        "bridge_broker_connected",
        "1 while the broker session is up"
    ))
    .unwrap();
    pub static ref BROKER_RECONNECTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_broker_reconnects_total",
        "Broker sessions lost after having been established"
    ))
    .unwrap();
    pub static ref COMMANDS_FORWARDED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "bridge_commands_forwarded_total",
            "Operator commands published to the device"
        ),
        &["instruction"]
    )
    .unwrap();
    pub static ref COMMANDS_FAILED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_commands_failed_total",
        "Operator commands that could not be published"
    ))
    .unwrap();
    pub static ref COMMANDS_REDELIVERED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_commands_redelivered_total",
        "Operator commands re-forwarded after a reconnect"
    ))
    .unwrap();
}

pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(MESSAGES_TOTAL.clone()),
        Box::new(MALFORMED_MESSAGES_TOTAL.clone()),
        Box::new(SAMPLES_STORED_TOTAL.clone()),
        Box::new(SAMPLES_DROPPED_TOTAL.clone()),
        Box::new(DB_FAILURES_TOTAL.clone()),
        Box::new(INGEST_LATENCY_SECONDS.clone()),
        Box::new(CHANNEL_FULL_TOTAL.clone()),
        Box::new(BROKER_CONNECTED.clone()),
        Box::new(BROKER_RECONNECTS_TOTAL.clone()),
        Box::new(COMMANDS_FORWARDED_TOTAL.clone()),
        Box::new(COMMANDS_FAILED_TOTAL.clone()),
        Box::new(COMMANDS_REDELIVERED_TOTAL.clone()),
    ];

    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            error!("Failed to register metric: {}", e);
        }
    }
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_registered_metrics() {
        init_metrics();
        MESSAGES_TOTAL.inc();
        COMMANDS_FORWARDED_TOTAL.with_label_values(&["ON"]).inc();

        let text = gather_metrics();
        assert!(text.contains("bridge_messages_total"));
        assert!(text.contains("bridge_commands_forwarded_total{instruction=\"ON\"}"));
    }
}
