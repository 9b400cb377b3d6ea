//! Hooks module tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::*;
use crate::protocol::QoS;

#[test]
fn test_default_interceptor_keeps_success() {
    let interceptor = DefaultInterceptor;
    let publish = Publish::new("a/b", "x", QoS::AtLeastOnce).with_packet_id(1);

    let mut builder = AckBuilder::new(ReasonCode::Success);
    interceptor.on_qos1_publish(&publish, &mut builder);
    let puback = builder.into_puback(1);
    assert_eq!(puback.reason_code, ReasonCode::Success);
    assert!(puback.properties.is_empty());
}

struct Reject;

impl AckInterceptor for Reject {
    fn on_qos2_publish(&self, _publish: &Publish, pubrec: &mut AckBuilder) {
        pubrec
            .set_reason_code(ReasonCode::QuotaExceeded)
            .set_reason_string("full");
    }
}

struct Tag(&'static str);

impl AckInterceptor for Tag {
    fn on_qos2_publish(&self, _publish: &Publish, pubrec: &mut AckBuilder) {
        pubrec.add_user_property("seen-by", self.0);
    }

    fn on_pubrel(&self, _pubrel: &PubRel, pubcomp: &mut AckBuilder) {
        pubcomp.add_user_property("seen-by", self.0);
    }
}

#[test]
fn test_composite_runs_in_order() {
    let composite = CompositeInterceptor::new()
        .with(Tag("first"))
        .with(Reject)
        .with(Tag("second"));
    let publish = Publish::new("a/b", "x", QoS::ExactlyOnce).with_packet_id(4);

    let mut builder = AckBuilder::new(ReasonCode::Success);
    composite.on_qos2_publish(&publish, &mut builder);
    let pubrec = builder.into_pubrec(4);

    assert_eq!(pubrec.reason_code, ReasonCode::QuotaExceeded);
    assert_eq!(pubrec.properties.reason_string.as_deref(), Some("full"));
    assert_eq!(
        pubrec.properties.user_properties,
        vec![
            ("seen-by".to_string(), "first".to_string()),
            ("seen-by".to_string(), "second".to_string()),
        ]
    );
}

#[test]
fn test_invalid_reason_codes_are_replaced() {
    let mut builder = AckBuilder::new(ReasonCode::Success);
    builder.set_reason_code(ReasonCode::ReceiveMaxExceeded);
    assert_eq!(
        builder.clone().into_puback(1).reason_code,
        ReasonCode::UnspecifiedError
    );
    assert_eq!(builder.into_pubcomp(1).reason_code, ReasonCode::Success);

    let mut builder = AckBuilder::new(ReasonCode::Success);
    builder.set_reason_code(ReasonCode::PacketIdNotFound);
    assert_eq!(
        builder.into_pubcomp(1).reason_code,
        ReasonCode::PacketIdNotFound
    );
}

struct Counting(AtomicUsize);

impl AckInterceptor for Counting {
    fn on_pubrel(&self, _pubrel: &PubRel, _pubcomp: &mut AckBuilder) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_arc_interceptor_forwards() {
    let counting = Arc::new(Counting(AtomicUsize::new(0)));
    let composite = CompositeInterceptor::new().with(counting.clone());

    let mut builder = AckBuilder::new(ReasonCode::Success);
    composite.on_pubrel(&PubRel::new(1), &mut builder);
    assert_eq!(counting.0.load(Ordering::SeqCst), 1);
}
