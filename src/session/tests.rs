use pretty_assertions::assert_eq;
use test_case::test_case;
use tokio::sync::mpsc;

use super::*;
use crate::config::InboundConfig;
use crate::flow::{signal_channel, FlowEvent};
use crate::protocol::{PubAck, PubComp, PubRec};

struct Fixture {
    session: InboundSession,
    signals: SignalReceiver,
    outbound: mpsc::UnboundedReceiver<Packet>,
}

impl Fixture {
    fn new(receive_maximum: u16) -> Self {
        let config = InboundConfig {
            receive_maximum,
            ..InboundConfig::default()
        };
        let (tx, signals) = signal_channel();
        let mut session = InboundSession::new(&config, tx);
        let outbound = Self::attach(&mut session);
        Self {
            session,
            signals,
            outbound,
        }
    }

    fn attach(session: &mut InboundSession) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        session.connect(tx);
        rx
    }

    fn reconnect(&mut self) {
        self.session.disconnect();
        self.outbound = Self::attach(&mut self.session);
    }

    fn flow(&mut self, filter: &str, manual: bool) -> PublishFlow {
        let subs = vec![Subscription::parse(filter, QoS::ExactlyOnce).unwrap()];
        let flow = self.session.subscribe(&subs, None, manual);
        self.session.sub_ack(&subs, None, &[ReasonCode::GrantedQoS2]);
        flow
    }

    fn written(&mut self) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Ok(packet) = self.outbound.try_recv() {
            out.push(packet);
        }
        out
    }

    fn process(&mut self) -> usize {
        self.session.process_signals(&mut self.signals)
    }
}

fn qos1(topic: &str, packet_id: u16) -> Publish {
    Publish::new(topic, "x", QoS::AtLeastOnce).with_packet_id(packet_id)
}

fn qos2(topic: &str, packet_id: u16) -> Publish {
    Publish::new(topic, "x", QoS::ExactlyOnce).with_packet_id(packet_id)
}

#[test]
fn test_connect_increments_epoch() {
    let mut fx = Fixture::new(10);
    assert_eq!(fx.session.epoch(), 1);
    fx.reconnect();
    assert_eq!(fx.session.epoch(), 2);
    assert!(fx.session.is_connected());

    fx.session.disconnect();
    assert!(!fx.session.is_connected());
}

#[test]
fn test_unmatched_qos1_acknowledged() {
    let mut fx = Fixture::new(10);
    fx.session.on_publish(qos1("a", 1)).unwrap();
    assert_eq!(fx.written(), vec![Packet::PubAck(PubAck::new(1))]);
    assert!(fx.session.qos.is_empty());
}

#[test]
fn test_puback_cached_while_disconnected() {
    let mut fx = Fixture::new(10);
    let flow = fx.flow("a", true);
    fx.session.on_publish(qos1("a", 1)).unwrap();
    fx.session.disconnect();

    // The flow never requested anything; cancelling it releases the publish
    drop(flow);
    fx.process();
    assert!(matches!(
        fx.session.qos.get(1),
        Some(crate::qos::Tracked::PubAck { .. })
    ));

    fx.reconnect();
    fx.session.on_publish(qos1("a", 1).with_dup(true)).unwrap();
    assert_eq!(fx.written(), vec![Packet::PubAck(PubAck::new(1))]);
    assert!(fx.session.qos.is_empty());
}

#[test]
fn test_invalid_topic_disconnects() {
    let mut fx = Fixture::new(10);
    let err = fx
        .session
        .on_publish(Publish::new("a/+", "x", QoS::AtMostOnce))
        .unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidTopicName(_)));

    let written = fx.written();
    let [Packet::Disconnect(disconnect)] = written.as_slice() else {
        panic!("expected a DISCONNECT, got {:?}", written);
    };
    assert_eq!(disconnect.reason_code, ReasonCode::TopicNameInvalid);
    assert!(!fx.session.is_connected());
}

#[test]
fn test_receive_maximum_exceeded_disconnects() {
    let mut fx = Fixture::new(1);
    let _flow = fx.flow("a", false);

    fx.session.on_publish(qos1("a", 1)).unwrap();
    assert_eq!(
        fx.session.on_publish(qos1("a", 2)).unwrap_err(),
        ProtocolError::ReceiveMaximumExceeded
    );
    assert!(fx.session.qos.get(2).is_none());
    assert_eq!(fx.session.queued(), (0, 1));

    let written = fx.written();
    let [Packet::Disconnect(disconnect)] = written.as_slice() else {
        panic!("expected a DISCONNECT, got {:?}", written);
    };
    assert_eq!(disconnect.reason_code, ReasonCode::ReceiveMaxExceeded);
}

#[test]
fn test_manual_confirmation_releases_puback() {
    let mut fx = Fixture::new(10);
    let mut flow = fx.flow("a/#", true);
    flow.request(1);

    fx.session.on_publish(qos1("a/b", 3)).unwrap();
    assert!(fx.written().is_empty());

    let Some(FlowEvent::Publish(incoming)) = flow.try_next() else {
        panic!("no publish delivered");
    };
    let confirmation = incoming.confirmation.expect("manual flow gets a confirmation");
    assert!(confirmation.confirm());

    assert_eq!(fx.process(), 1);
    assert_eq!(fx.written(), vec![Packet::PubAck(PubAck::new(3))]);
    assert_eq!(fx.session.queued(), (0, 0));
}

#[test_case(false ; "hash flow confirms first")]
#[test_case(true ; "plus flow confirms first")]
fn test_two_manual_flows_both_confirm(plus_first: bool) {
    let mut fx = Fixture::new(10);
    let mut hash = fx.flow("t/#", true);
    let mut plus = fx.flow("t/+", true);
    hash.request(1);
    plus.request(1);

    fx.session.on_publish(qos1("t/x", 5)).unwrap();
    let Some(FlowEvent::Publish(from_hash)) = hash.try_next() else {
        panic!("t/# got nothing");
    };
    let Some(FlowEvent::Publish(from_plus)) = plus.try_next() else {
        panic!("t/+ got nothing");
    };
    let (mut first, mut second) = if plus_first {
        (from_plus, from_hash)
    } else {
        (from_hash, from_plus)
    };

    assert!(first.confirm());
    fx.process();
    assert!(fx.written().is_empty());
    assert_eq!(fx.session.queued(), (0, 1));

    assert!(second.confirm());
    fx.process();
    assert_eq!(fx.written(), vec![Packet::PubAck(PubAck::new(5))]);
    assert_eq!(fx.session.queued(), (0, 0));
}

#[test]
fn test_request_signal_drains_queue() {
    let mut fx = Fixture::new(10);
    let mut flow = fx.flow("a", false);

    fx.session.on_publish(qos1("a", 1)).unwrap();
    assert!(fx.written().is_empty());

    flow.request(1);
    assert_eq!(fx.process(), 1);
    assert_eq!(fx.written(), vec![Packet::PubAck(PubAck::new(1))]);
    assert!(matches!(flow.try_next(), Some(FlowEvent::Publish(_))));
}

#[test]
fn test_qos2_exchange() {
    let mut fx = Fixture::new(10);
    fx.session.on_publish(qos2("a", 9)).unwrap();
    assert_eq!(fx.written(), vec![Packet::PubRec(PubRec::new(9))]);

    // Resent PUBLISH before PUBREL: answered from the cache, not redelivered
    fx.session.on_publish(qos2("a", 9).with_dup(true)).unwrap();
    assert_eq!(fx.written(), vec![Packet::PubRec(PubRec::new(9))]);

    fx.session.on_pubrel(PubRel::new(9)).unwrap();
    assert_eq!(fx.written(), vec![Packet::PubComp(PubComp::new(9))]);
    assert!(fx.session.qos.is_empty());
}

#[test]
fn test_pubrel_violation_disconnects() {
    let mut fx = Fixture::new(10);
    let _flow = fx.flow("a", false);
    fx.session.on_publish(qos2("a", 9)).unwrap();

    assert!(fx.session.on_pubrel(PubRel::new(9)).is_err());
    assert!(matches!(fx.written().as_slice(), [Packet::Disconnect(_)]));
    assert!(!fx.session.is_connected());
}

#[test]
fn test_end_fails_flows() {
    let mut fx = Fixture::new(10);
    let mut flow = fx.flow("a", true);
    let mut global = fx.session.subscribe_global(GlobalFilter::AllPublishes, false);
    fx.session.on_publish(qos1("a", 1)).unwrap();

    fx.session.end(SessionEndCause::NotPresent);
    let expected = FlowError::SessionEnded(SessionEndCause::NotPresent);
    assert!(matches!(flow.try_next(), Some(FlowEvent::Failed(e)) if e == expected));
    assert!(matches!(global.try_next(), Some(FlowEvent::Failed(e)) if e == expected));
    assert_eq!(fx.session.queued(), (0, 0));
    assert!(fx.session.registry().flows().is_empty());
    assert!(fx.session.subscriptions().is_empty());
}

#[test]
fn test_acknowledgements_counted() {
    let mut fx = Fixture::new(10);
    fx.session.on_publish(qos1("a", 1)).unwrap();
    fx.session.on_publish(qos2("a", 2)).unwrap();
    fx.session.on_pubrel(PubRel::new(2)).unwrap();

    let metrics = fx.session.metrics();
    for packet in ["puback", "pubrec", "pubcomp"] {
        assert_eq!(
            metrics
                .acknowledgements_sent
                .with_label_values(&[packet])
                .get(),
            1
        );
    }
}

#[tokio::test]
async fn test_spawned_session() {
    let (tx, signals) = signal_channel();
    let session = InboundSession::new(&InboundConfig::default(), tx);
    let (handle, task) = spawn(session, signals, 16);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    assert_eq!(handle.connect(out_tx).await.unwrap(), 1);

    let subs = vec![Subscription::parse("sensors/+", QoS::AtLeastOnce).unwrap()];
    let mut flow = handle.subscribe(subs.clone(), None, false).await.unwrap();
    handle
        .sub_ack(subs, None, vec![ReasonCode::GrantedQoS1])
        .await
        .unwrap();
    flow.request_unbounded();

    handle.publish(qos1("sensors/t1", 4)).await.unwrap();
    let Some(FlowEvent::Publish(incoming)) = flow.next().await else {
        panic!("expected a publish");
    };
    assert_eq!(&*incoming.publish.topic, "sensors/t1");
    assert_eq!(out_rx.recv().await, Some(Packet::PubAck(PubAck::new(4))));

    handle.end(SessionEndCause::Closed).await.unwrap();
    task.await.unwrap();
    assert!(matches!(flow.next().await, Some(FlowEvent::Failed(_))));
    assert!(flow.next().await.is_none());
    assert!(handle.subscriptions().await.is_err());
}
