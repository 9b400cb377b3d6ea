//! Decoded packet values exchanged with the transport layer

use std::sync::Arc;

use bytes::Bytes;

use super::{Properties, QoS, ReasonCode};

/// Packets the inbound path hands back to the transport for writing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    PubAck(PubAck),
    PubRec(PubRec),
    PubComp(PubComp),
    Disconnect(Disconnect),
}

impl Packet {
    /// Packet identifier of an acknowledgement, `None` for DISCONNECT
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::PubAck(p) => Some(p.packet_id),
            Packet::PubRec(p) => Some(p.packet_id),
            Packet::PubComp(p) => Some(p.packet_id),
            Packet::Disconnect(_) => None,
        }
    }
}

/// A stateful PUBLISH as received from the broker
///
/// The topic field uses `Arc<str>` and the payload `Bytes`, so handing the
/// same publish to several flows only bumps reference counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Duplicate delivery flag
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: Arc<str>,
    /// Packet identifier (present only for QoS > 0)
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    /// Properties (v5.0 only)
    pub properties: Properties,
}

impl Publish {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
            properties: Properties::default(),
        }
    }

    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    pub fn with_subscription_identifiers(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.properties.subscription_identifiers = ids.into_iter().collect();
        self
    }

    #[inline]
    pub fn subscription_identifiers(&self) -> &[u32] {
        &self.properties.subscription_identifiers
    }
}

impl Default for Publish {
    fn default() -> Self {
        Self::new("", Bytes::new(), QoS::AtMostOnce)
    }
}

/// PUBACK packet (QoS 1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubAck {
    pub packet_id: u16,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl PubAck {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        }
    }
}

/// PUBREC packet (QoS 2 step 1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubRec {
    pub packet_id: u16,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl PubRec {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        }
    }
}

/// PUBREL packet (QoS 2 step 2, broker -> client here)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubRel {
    pub packet_id: u16,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl PubRel {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        }
    }
}

/// PUBCOMP packet (QoS 2 step 3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubComp {
    pub packet_id: u16,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl PubComp {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        }
    }
}

/// DISCONNECT request raised on a protocol violation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub reason_code: ReasonCode,
    /// The human-readable reason travels as the reason string
    pub properties: Properties,
}
