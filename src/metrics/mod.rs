//! Prometheus metrics for the inbound path
//!
//! Every session reports into an [`InboundMetrics`]; share one instance
//! between sessions to aggregate them. The owner decides how to expose the
//! text rendered by [`InboundMetrics::encode`].

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::protocol::QoS;

/// All inbound metrics in one place
#[derive(Clone)]
pub struct InboundMetrics {
    pub registry: Registry,

    pub publishes_received: IntCounterVec,
    pub publishes_delivered: IntCounter,
    pub qos0_dropped: IntCounter,
    pub unmatched_publishes: IntCounter,
    pub acknowledgements_sent: IntCounterVec,
    pub protocol_violations: IntCounter,
    pub queued_publishes: IntGaugeVec,
}

impl InboundMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let publishes_received = IntCounterVec::new(
            Opts::new(
                "vibemq_inbound_publishes_received_total",
                "Inbound PUBLISH packets received, by QoS",
            ),
            &["qos"],
        )
        .expect("valid metric");

        let publishes_delivered = IntCounter::with_opts(Opts::new(
            "vibemq_inbound_publishes_delivered_total",
            "Publishes handed to application flows",
        ))
        .expect("valid metric");

        let qos0_dropped = IntCounter::with_opts(Opts::new(
            "vibemq_inbound_qos0_dropped_total",
            "QoS 0 publishes dropped because the QoS 0 queue was full",
        ))
        .expect("valid metric");

        let unmatched_publishes = IntCounter::with_opts(Opts::new(
            "vibemq_inbound_unmatched_publishes_total",
            "Publishes for which no flow was registered",
        ))
        .expect("valid metric");

        let acknowledgements_sent = IntCounterVec::new(
            Opts::new(
                "vibemq_inbound_acknowledgements_sent_total",
                "PUBACK, PUBREC and PUBCOMP packets handed to the transport",
            ),
            &["packet"],
        )
        .expect("valid metric");

        let protocol_violations = IntCounter::with_opts(Opts::new(
            "vibemq_inbound_protocol_violations_total",
            "Broker protocol violations that disconnected the session",
        ))
        .expect("valid metric");

        let queued_publishes = IntGaugeVec::new(
            Opts::new(
                "vibemq_inbound_queued_publishes",
                "Publishes waiting for delivery or acknowledgement, by queue",
            ),
            &["queue"],
        )
        .expect("valid metric");

        registry
            .register(Box::new(publishes_received.clone()))
            .expect("unique metric");
        registry
            .register(Box::new(publishes_delivered.clone()))
            .expect("unique metric");
        registry
            .register(Box::new(qos0_dropped.clone()))
            .expect("unique metric");
        registry
            .register(Box::new(unmatched_publishes.clone()))
            .expect("unique metric");
        registry
            .register(Box::new(acknowledgements_sent.clone()))
            .expect("unique metric");
        registry
            .register(Box::new(protocol_violations.clone()))
            .expect("unique metric");
        registry
            .register(Box::new(queued_publishes.clone()))
            .expect("unique metric");

        InboundMetrics {
            registry,
            publishes_received,
            publishes_delivered,
            qos0_dropped,
            unmatched_publishes,
            acknowledgements_sent,
            protocol_violations,
            queued_publishes,
        }
    }

    pub fn publish_received(&self, qos: QoS) {
        self.publishes_received
            .with_label_values(&[qos.as_str()])
            .inc();
    }

    pub fn publish_delivered(&self) {
        self.publishes_delivered.inc();
    }

    pub fn qos0_dropped(&self) {
        self.qos0_dropped.inc();
    }

    pub fn publish_unmatched(&self) {
        self.unmatched_publishes.inc();
    }

    pub fn acknowledgement_sent(&self, packet: &str) {
        self.acknowledgements_sent
            .with_label_values(&[packet])
            .inc();
    }

    pub fn protocol_violation(&self) {
        self.protocol_violations.inc();
    }

    pub fn update_queues(&self, qos0: usize, qos12: usize) {
        self.queued_publishes
            .with_label_values(&["qos0"])
            .set(qos0 as i64);
        self.queued_publishes
            .with_label_values(&["qos12"])
            .set(qos12 as i64);
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl Default for InboundMetrics {
    fn default() -> Self {
        Self::new()
    }
}
