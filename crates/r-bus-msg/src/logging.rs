//! ---
//! bus_section: "02-messaging-ipc-data-model"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Bus client and protocol layers over a retained pub/sub transport."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use tracing::debug;

use crate::transport::BusMessage;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Message handed to the transport.
    Outbound,
    /// Message received from the transport.
    Inbound,
    /// Message buffered while offline.
    Queued,
}

/// Emit a structured log entry for message activity.
pub fn log_message(direction: MessageDirection, message: &BusMessage) {
    debug!(
        topic = %message.topic,
        bytes = message.payload.len(),
        retained = message.retained,
        tombstone = message.is_tombstone(),
        direction = ?direction,
        "messaging activity"
    );
}

/// Snapshot of client messaging counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MessagingMetrics {
    /// Messages handed to the transport.
    pub sent: u64,
    /// Messages routed to at least one subscription.
    pub received: u64,
    /// Messages lost to transport errors or queue overflow.
    pub dropped: u64,
    /// Publishes buffered while offline.
    pub queued: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    queued: AtomicU64,
}

impl Counters {
    pub(crate) fn sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MessagingMetrics {
        MessagingMetrics {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
        }
    }
}

/// Prometheus metric handles for messaging activity.
pub struct MessagingMetricsExporter {
    sent: IntCounter,
    received: IntCounter,
    dropped: IntCounter,
    queued: IntCounter,
    latency: Histogram,
}

impl MessagingMetricsExporter {
    /// Register messaging metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sent = IntCounter::with_opts(Opts::new(
            "bus_messages_sent_total",
            "Messages published via the transport",
        ))?;
        let received = IntCounter::with_opts(Opts::new(
            "bus_messages_received_total",
            "Messages routed from the transport",
        ))?;
        let dropped = IntCounter::with_opts(Opts::new(
            "bus_messages_dropped_total",
            "Messages that failed to deliver or overflowed the offline queue",
        ))?;
        let queued = IntCounter::with_opts(Opts::new(
            "bus_messages_queued_total",
            "Publishes buffered while offline",
        ))?;
        let latency = Histogram::with_opts(HistogramOpts::new(
            "bus_rpc_roundtrip_latency_seconds",
            "Observed latency between an rpc request and its reply",
        ))?;

        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(queued.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            sent,
            received,
            dropped,
            queued,
            latency,
        })
    }

    /// Record a sent message.
    pub fn observe_sent(&self) {
        self.sent.inc();
    }

    /// Record a received message.
    pub fn observe_received(&self) {
        self.received.inc();
    }

    /// Record a dropped message.
    pub fn observe_dropped(&self) {
        self.dropped.inc();
    }

    /// Record a buffered publish.
    pub fn observe_queued(&self) {
        self.queued.inc();
    }

    /// Record rpc round trip latency.
    pub fn observe_latency(&self, duration: Duration) {
        self.latency.observe(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_exporter_records_counts() {
        let registry = Registry::new();
        let metrics = MessagingMetricsExporter::register(&registry).expect("register metrics");
        metrics.observe_sent();
        metrics.observe_received();
        metrics.observe_dropped();
        metrics.observe_queued();
        metrics.observe_latency(Duration::from_millis(10));

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "bus_messages_queued_total"));
    }

    #[test]
    fn counters_snapshot() {
        let counters = Counters::default();
        counters.sent();
        counters.sent();
        counters.queued();
        assert_eq!(
            counters.snapshot(),
            MessagingMetrics {
                sent: 2,
                received: 0,
                dropped: 0,
                queued: 1
            }
        );
    }
}
