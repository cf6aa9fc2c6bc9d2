//! Observability hooks for connections and pools.
//!
//! Components take an `Arc<dyn Metrics>` instead of touching global
//! counters, so tests run against [`NoopMetrics`] and production wires in
//! [`PrometheusMetrics`].
//!
//! ## Exported series
//!
//! - `chanpool_messages_received_total`
//! - `chanpool_messages_sent_total`
//! - `chanpool_reconnects_total` - server-requested reconnects
//! - `chanpool_connects_total` / `chanpool_disconnects_total`
//! - `chanpool_subconns` - live sub-connections of a pool

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Fire-and-forget event sink. Every method defaults to a no-op.
pub trait Metrics: Send + Sync + 'static {
    fn message_received(&self) {}
    fn message_sent(&self) {}
    fn reconnect_requested(&self) {}
    fn connected(&self) {}
    fn disconnected(&self) {}
    fn set_subconns(&self, _count: usize) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// Prometheus-backed metrics with a registry owned by the instance.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    received: IntCounter,
    sent: IntCounter,
    reconnects: IntCounter,
    connects: IntCounter,
    disconnects: IntCounter,
    subconns: IntGauge,
}

impl PrometheusMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        macro_rules! register {
            ($metric:expr) => {{
                let m = $metric?;
                registry.register(Box::new(m.clone()))?;
                m
            }};
        }

        Ok(Self {
            received: register!(IntCounter::new(
                "chanpool_messages_received_total",
                "Messages received from the server"
            )),
            sent: register!(IntCounter::new(
                "chanpool_messages_sent_total",
                "Messages written to the server"
            )),
            reconnects: register!(IntCounter::new(
                "chanpool_reconnects_total",
                "Server-requested reconnects"
            )),
            connects: register!(IntCounter::new(
                "chanpool_connects_total",
                "Connections that completed the handshake"
            )),
            disconnects: register!(IntCounter::new(
                "chanpool_disconnects_total",
                "Connections closed"
            )),
            subconns: register!(IntGauge::new(
                "chanpool_subconns",
                "Live sub-connections in the pool"
            )),
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather all metrics and encode them in Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = vec![];
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        })
    }
}

impl Metrics for PrometheusMetrics {
    fn message_received(&self) {
        self.received.inc();
    }

    fn message_sent(&self) {
        self.sent.inc();
    }

    fn reconnect_requested(&self) {
        self.reconnects.inc();
    }

    fn connected(&self) {
        self.connects.inc();
    }

    fn disconnected(&self) {
        self.disconnects.inc();
    }

    fn set_subconns(&self, count: usize) {
        self.subconns.set(count as i64);
    }
}
