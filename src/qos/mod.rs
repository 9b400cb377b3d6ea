//! Incoming QoS 1/2 state per packet identifier
//!
//! ```text
//! QoS 1:  Pending --acknowledge--> PubAck --written--> (removed)
//! QoS 2:  Pending --acknowledge--> PubRec --PUBREL--> (removed, PUBCOMP)
//! ```
//!
//! A PUBACK that could not be written stays cached and is resent when the
//! broker resends the PUBLISH with DUP set. A PUBREC stays until the PUBREL,
//! unless it carries an error code, in which case the exchange ends once it
//! is written.

use ahash::AHashMap;
use tracing::debug;

use crate::dispatch::{MessageId, PendingPublish};
use crate::hooks::{AckBuilder, AckInterceptor};
use crate::protocol::{Packet, ProtocolError, PubAck, PubRec, PubRel, Publish, QoS, ReasonCode};

#[cfg(test)]
mod tests;

/// What the session holds for one packet identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tracked {
    /// Dispatched, acknowledgement not produced yet
    Pending {
        qos: QoS,
        message: MessageId,
        epoch: u64,
    },
    /// PUBACK produced but not written yet
    PubAck {
        packet: PubAck,
        epoch: u64,
    },
    /// PUBREC produced; kept until the PUBREL
    PubRec {
        packet: PubRec,
        epoch: u64,
    },
}

impl Tracked {
    pub fn qos(&self) -> QoS {
        match self {
            Tracked::Pending { qos, .. } => *qos,
            Tracked::PubAck { .. } => QoS::AtLeastOnce,
            Tracked::PubRec { .. } => QoS::ExactlyOnce,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            Tracked::Pending { epoch, .. }
            | Tracked::PubAck { epoch, .. }
            | Tracked::PubRec { epoch, .. } => *epoch,
        }
    }

    fn cached(&self) -> Option<Packet> {
        match self {
            Tracked::Pending { .. } => None,
            Tracked::PubAck { packet, .. } => Some(Packet::PubAck(packet.clone())),
            Tracked::PubRec { packet, .. } => Some(Packet::PubRec(packet.clone())),
        }
    }
}

/// Decision for an inbound QoS 1/2 PUBLISH
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishAction {
    /// New message: hand it to the dispatch engine. If admission fails,
    /// pass `replaced` to [`IncomingQos::restore`].
    Dispatch { replaced: Option<Tracked> },
    /// Resend of a message still being delivered
    Ignore,
    /// Resend of an acknowledged message: write the cached acknowledgement
    Resend(Packet),
}

#[derive(Debug, Default)]
pub struct IncomingQos {
    messages: AHashMap<u16, Tracked>,
}

impl IncomingQos {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, packet_id: u16) -> Option<&Tracked> {
        self.messages.get(&packet_id)
    }

    pub fn on_publish(
        &mut self,
        publish: &Publish,
        epoch: u64,
        message: MessageId,
    ) -> Result<PublishAction, ProtocolError> {
        let qos = publish.qos;
        let Some(packet_id) = publish.packet_id else {
            return Err(ProtocolError::Violation(
                "QoS 1 and 2 PUBLISH must carry a packet identifier",
            ));
        };
        let pending = Tracked::Pending {
            qos,
            message,
            epoch,
        };

        let Some(previous) = self.messages.get(&packet_id) else {
            self.messages.insert(packet_id, pending);
            return Ok(PublishAction::Dispatch { replaced: None });
        };

        if previous.qos() != qos {
            return Err(ProtocolError::Violation(match qos {
                QoS::ExactlyOnce => {
                    "QoS 2 PUBLISH must not be received with the same packet identifier as a QoS 1 PUBLISH"
                }
                _ => {
                    "QoS 1 PUBLISH must not be received with the same packet identifier as a QoS 2 PUBLISH"
                }
            }));
        }

        if publish.dup {
            return Ok(match previous.cached() {
                Some(packet) => {
                    debug!("resending acknowledgement for packet {}", packet_id);
                    PublishAction::Resend(packet)
                }
                None => PublishAction::Ignore,
            });
        }

        if previous.epoch() == epoch {
            return Err(ProtocolError::Violation(match qos {
                QoS::ExactlyOnce => "DUP flag must be set for a resent QoS 2 PUBLISH",
                _ => "DUP flag must be set for a resent QoS 1 PUBLISH",
            }));
        }

        // Same identifier reused on a new connection without DUP: a new message
        debug!(
            "packet {} reused in epoch {}, replacing message from epoch {}",
            packet_id,
            epoch,
            previous.epoch()
        );
        let replaced = self.messages.insert(packet_id, pending);
        Ok(PublishAction::Dispatch { replaced })
    }

    /// Undo an [`on_publish`](Self::on_publish) whose message was not admitted
    pub fn restore(&mut self, packet_id: u16, replaced: Option<Tracked>) {
        match replaced {
            Some(previous) => {
                self.messages.insert(packet_id, previous);
            }
            None => {
                self.messages.remove(&packet_id);
            }
        }
    }

    /// Produce the PUBACK/PUBREC for a consumed and confirmed publish
    ///
    /// Returns `None` if the packet identifier was meanwhile reused by a
    /// newer message; the interceptor is not called then.
    pub fn acknowledge(
        &mut self,
        pending: &PendingPublish,
        interceptor: &dyn AckInterceptor,
    ) -> Option<Packet> {
        let packet_id = pending.publish.packet_id?;
        let epoch = match self.messages.get(&packet_id) {
            Some(Tracked::Pending { message, epoch, .. }) if *message == pending.id => *epoch,
            _ => {
                debug!(
                    "acknowledgement of {:?} dropped, packet {} was reused",
                    pending.id, packet_id
                );
                return None;
            }
        };

        let mut builder = AckBuilder::new(ReasonCode::Success);
        let (tracked, packet) = match pending.publish.qos {
            QoS::AtLeastOnce => {
                interceptor.on_qos1_publish(&pending.publish, &mut builder);
                let puback = builder.into_puback(packet_id);
                let packet = Packet::PubAck(puback.clone());
                (Tracked::PubAck { packet: puback, epoch }, packet)
            }
            QoS::ExactlyOnce => {
                interceptor.on_qos2_publish(&pending.publish, &mut builder);
                let pubrec = builder.into_pubrec(packet_id);
                let packet = Packet::PubRec(pubrec.clone());
                (Tracked::PubRec { packet: pubrec, epoch }, packet)
            }
            QoS::AtMostOnce => return None,
        };
        self.messages.insert(packet_id, tracked);
        Some(packet)
    }

    /// The transport accepted `packet` for writing
    pub fn written(&mut self, packet: &Packet) {
        let (packet_id, finished) = match packet {
            Packet::PubAck(p) => (p.packet_id, true),
            Packet::PubRec(p) => (p.packet_id, p.reason_code.is_error()),
            Packet::PubComp(_) | Packet::Disconnect(_) => return,
        };
        if !finished {
            return;
        }
        let same = match (self.messages.get(&packet_id), packet) {
            (Some(Tracked::PubAck { packet: cached, .. }), Packet::PubAck(p)) => cached == p,
            (Some(Tracked::PubRec { packet: cached, .. }), Packet::PubRec(p)) => cached == p,
            _ => false,
        };
        if same {
            self.messages.remove(&packet_id);
        }
    }

    /// Answer a PUBREL with a PUBCOMP
    pub fn on_pubrel(
        &mut self,
        pubrel: &PubRel,
        interceptor: &dyn AckInterceptor,
    ) -> Result<Packet, ProtocolError> {
        let code = match self.messages.get(&pubrel.packet_id) {
            Some(Tracked::PubRec { .. }) => ReasonCode::Success,
            None => ReasonCode::PacketIdNotFound,
            Some(Tracked::Pending {
                qos: QoS::ExactlyOnce,
                ..
            }) => {
                return Err(ProtocolError::Violation(
                    "PUBREL must not be received when the PUBREC has not been sent yet",
                ))
            }
            Some(_) => {
                return Err(ProtocolError::Violation(
                    "PUBREL must not be received with the same packet identifier as a QoS 1 PUBLISH",
                ))
            }
        };
        if code == ReasonCode::Success {
            self.messages.remove(&pubrel.packet_id);
        } else {
            debug!("PUBREL for unknown packet {}", pubrel.packet_id);
        }

        let mut builder = AckBuilder::new(code);
        interceptor.on_pubrel(pubrel, &mut builder);
        Ok(Packet::PubComp(builder.into_pubcomp(pubrel.packet_id)))
    }

    /// Forget every packet identifier; the session state is gone
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
