use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};

/// Dispatcher counters. Taken from the global meter, so they are no-ops
/// until a meter provider is installed by the logger.
#[derive(Debug, Clone)]
pub struct DispatchMetrics {
    pub messages_sent: Counter<u64>,
    pub messages_retried: Counter<u64>,
    pub messages_failed: Counter<u64>,
    pub send_latency_ms: Histogram<f64>,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        let meter = global::meter("chatflow-dispatch");
        DispatchMetrics {
            messages_sent: meter
                .u64_counter("messages_sent")
                .with_description("Outbound messages accepted by a transport")
                .build(),
            messages_retried: meter.u64_counter("messages_retried").build(),
            messages_failed: meter
                .u64_counter("messages_failed")
                .with_description("Outbound messages that ran out of attempts")
                .build(),
            send_latency_ms: meter
                .f64_histogram("send_latency_ms")
                .with_description("Transport send latency")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn sent(&self, channel_id: &str, latency_ms: f64) {
        let attrs = [KeyValue::new("channel_id", channel_id.to_string())];
        self.messages_sent.add(1, &attrs);
        self.send_latency_ms.record(latency_ms, &attrs);
    }

    pub fn retried(&self, channel_id: &str) {
        self.messages_retried
            .add(1, &[KeyValue::new("channel_id", channel_id.to_string())]);
    }

    pub fn failed(&self, channel_id: &str) {
        self.messages_failed
            .add(1, &[KeyValue::new("channel_id", channel_id.to_string())]);
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}
