use std::sync::Arc;

use pretty_assertions::assert_eq;
use test_case::test_case;

use super::*;
use crate::config::Qos0Overflow;
use crate::dispatch::DispatchEngine;
use crate::flow::FlowRegistry;
use crate::hooks::DefaultInterceptor;
use crate::metrics::InboundMetrics;
use crate::protocol::PubComp;

/// Runs publishes through a dispatch engine without flows, so every
/// admitted publish is immediately acknowledgeable
struct Harness {
    qos: IncomingQos,
    dispatch: DispatchEngine,
    registry: FlowRegistry,
    acknowledgeable: Vec<PendingPublish>,
}

impl Harness {
    fn new() -> Self {
        Self {
            qos: IncomingQos::new(),
            dispatch: DispatchEngine::new(
                10,
                Qos0Overflow::DropOldest,
                Arc::new(InboundMetrics::new()),
            ),
            registry: FlowRegistry::new(),
            acknowledgeable: Vec::new(),
        }
    }

    fn publish(&mut self, publish: Publish, epoch: u64) -> Result<PublishAction, ProtocolError> {
        let message = self.dispatch.next_message_id();
        let action = self.qos.on_publish(&publish, epoch, message)?;
        if let PublishAction::Dispatch { .. } = action {
            let acked = self
                .dispatch
                .on_publish_qos12(message, publish, epoch, &mut self.registry)?;
            self.acknowledgeable.extend(acked);
        }
        Ok(action)
    }

    /// Acknowledge everything admitted so far
    fn acknowledge(&mut self) -> Vec<Packet> {
        let pending = std::mem::take(&mut self.acknowledgeable);
        pending
            .iter()
            .filter_map(|p| self.qos.acknowledge(p, &DefaultInterceptor))
            .collect()
    }
}

fn qos1(packet_id: u16) -> Publish {
    Publish::new("a/b", "x", QoS::AtLeastOnce).with_packet_id(packet_id)
}

fn qos2(packet_id: u16) -> Publish {
    Publish::new("a/b", "x", QoS::ExactlyOnce).with_packet_id(packet_id)
}

#[test]
fn test_qos1_puback_removed_once_written() {
    let mut h = Harness::new();
    assert_eq!(
        h.publish(qos1(1), 1).unwrap(),
        PublishAction::Dispatch { replaced: None }
    );

    let packets = h.acknowledge();
    assert_eq!(packets, vec![Packet::PubAck(PubAck::new(1))]);
    assert!(matches!(h.qos.get(1), Some(Tracked::PubAck { .. })));

    h.qos.written(&packets[0]);
    assert!(h.qos.is_empty());
}

#[test]
fn test_unwritten_puback_resent_on_dup() {
    let mut h = Harness::new();
    h.publish(qos1(1), 1).unwrap();
    let packets = h.acknowledge();

    // Reconnected; the broker resends with DUP
    let action = h.publish(qos1(1).with_dup(true), 2).unwrap();
    assert_eq!(action, PublishAction::Resend(packets[0].clone()));
}

#[test]
fn test_qos2_dup_resends_cached_pubrec() {
    let mut h = Harness::new();
    h.publish(qos2(5), 1).unwrap();
    let packets = h.acknowledge();
    assert_eq!(packets, vec![Packet::PubRec(PubRec::new(5))]);
    h.qos.written(&packets[0]);

    // A successful PUBREC stays until PUBREL
    let action = h.publish(qos2(5).with_dup(true), 1).unwrap();
    assert_eq!(action, PublishAction::Resend(Packet::PubRec(PubRec::new(5))));
    assert_eq!(h.dispatch.qos12_len(), 0);
}

#[test]
fn test_dup_while_pending_is_ignored() {
    let mut h = Harness::new();
    h.publish(qos2(5), 1).unwrap();
    assert_eq!(
        h.publish(qos2(5).with_dup(true), 1).unwrap(),
        PublishAction::Ignore
    );
}

#[test_case(qos1(3), "DUP flag must be set for a resent QoS 1 PUBLISH" ; "qos1")]
#[test_case(qos2(3), "DUP flag must be set for a resent QoS 2 PUBLISH" ; "qos2")]
fn test_resend_without_dup_is_violation(publish: Publish, message: &'static str) {
    let mut h = Harness::new();
    h.publish(publish.clone(), 1).unwrap();
    assert_eq!(
        h.publish(publish, 1).unwrap_err(),
        ProtocolError::Violation(message)
    );
}

#[test]
fn test_qos_mismatch_is_violation() {
    let mut h = Harness::new();
    h.publish(qos1(9), 1).unwrap();
    assert_eq!(
        h.publish(qos2(9).with_dup(true), 1).unwrap_err(),
        ProtocolError::Violation(
            "QoS 2 PUBLISH must not be received with the same packet identifier as a QoS 1 PUBLISH"
        )
    );
}

#[test]
fn test_reuse_in_new_epoch_replaces_message() {
    let mut h = Harness::new();
    h.publish(qos2(4), 1).unwrap();
    let stale = std::mem::take(&mut h.acknowledgeable);

    let action = h.publish(qos2(4), 2).unwrap();
    let PublishAction::Dispatch {
        replaced: Some(Tracked::Pending { epoch: 1, .. }),
    } = &action
    else {
        panic!("unexpected action {:?}", action);
    };

    // The old message's acknowledgement must not hit the new one
    assert_eq!(h.qos.acknowledge(&stale[0], &DefaultInterceptor), None);
    assert_eq!(h.acknowledge(), vec![Packet::PubRec(PubRec::new(4))]);
}

#[test]
fn test_restore_after_rejected_admission() {
    let mut qos = IncomingQos::new();
    let first = qos.on_publish(&qos1(2), 1, MessageId::new(1)).unwrap();
    assert_eq!(first, PublishAction::Dispatch { replaced: None });
    qos.restore(2, None);
    assert!(qos.is_empty());

    qos.on_publish(&qos1(2), 1, MessageId::new(2)).unwrap();
    let PublishAction::Dispatch { replaced } = qos.on_publish(&qos1(2), 2, MessageId::new(3)).unwrap()
    else {
        panic!("expected dispatch");
    };
    qos.restore(2, replaced);
    assert_eq!(
        qos.get(2),
        Some(&Tracked::Pending {
            qos: QoS::AtLeastOnce,
            message: MessageId::new(2),
            epoch: 1
        })
    );
}

#[test]
fn test_pubrel_completes_exchange() {
    let mut h = Harness::new();
    h.publish(qos2(8), 1).unwrap();
    let packets = h.acknowledge();
    h.qos.written(&packets[0]);

    let pubcomp = h.qos.on_pubrel(&PubRel::new(8), &DefaultInterceptor).unwrap();
    assert_eq!(pubcomp, Packet::PubComp(PubComp::new(8)));
    assert!(h.qos.is_empty());

    // Resent PUBREL after the state is gone
    let Packet::PubComp(again) = h.qos.on_pubrel(&PubRel::new(8), &DefaultInterceptor).unwrap()
    else {
        panic!("expected PUBCOMP");
    };
    assert_eq!(again.reason_code, ReasonCode::PacketIdNotFound);
}

#[test]
fn test_pubrel_before_pubrec_is_violation() {
    let mut h = Harness::new();
    h.publish(qos2(8), 1).unwrap();
    let err = h.qos.on_pubrel(&PubRel::new(8), &DefaultInterceptor).unwrap_err();
    assert_eq!(
        err,
        ProtocolError::Violation("PUBREL must not be received when the PUBREC has not been sent yet")
    );
    assert!(matches!(h.qos.get(8), Some(Tracked::Pending { .. })));
}

#[test]
fn test_pubrel_for_qos1_is_violation() {
    let mut h = Harness::new();
    h.publish(qos1(8), 1).unwrap();
    h.acknowledge();
    assert!(h.qos.on_pubrel(&PubRel::new(8), &DefaultInterceptor).is_err());
    assert!(matches!(h.qos.get(8), Some(Tracked::PubAck { .. })));
}

struct RejectQos2;

impl AckInterceptor for RejectQos2 {
    fn on_qos2_publish(&self, _publish: &Publish, pubrec: &mut AckBuilder) {
        pubrec.set_reason_code(ReasonCode::QuotaExceeded);
    }
}

#[test]
fn test_error_pubrec_removed_once_written() {
    let mut h = Harness::new();
    h.publish(qos2(6), 1).unwrap();
    let pending = std::mem::take(&mut h.acknowledgeable);
    let packet = h.qos.acknowledge(&pending[0], &RejectQos2).unwrap();
    let Packet::PubRec(pubrec) = &packet else {
        panic!("expected PUBREC");
    };
    assert_eq!(pubrec.reason_code, ReasonCode::QuotaExceeded);

    h.qos.written(&packet);
    assert!(h.qos.is_empty());
}

#[test]
fn test_missing_packet_id_is_violation() {
    let mut qos = IncomingQos::new();
    let publish = Publish::new("a", "x", QoS::AtLeastOnce);
    assert!(qos.on_publish(&publish, 1, MessageId::new(1)).is_err());
}
