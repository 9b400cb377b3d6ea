//! Inbound Session
//!
//! Owns the registry, dispatch engine and QoS state of one client session and
//! is driven by three sources:
//! - the transport, with decoded PUBLISH/PUBREL packets and connection changes
//! - the subscription layer, with SUBSCRIBE/SUBACK/UNSUBACK outcomes
//! - application handles, through [`Signal`]s
//!
//! Everything runs on the caller's task; [`spawn`] runs a session on its own
//! tokio task behind a [`SessionHandle`].

mod task;

pub use task::{spawn, SessionHandle};

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::InboundConfig;
use crate::dispatch::{DispatchEngine, PendingPublish};
use crate::error::{FlowError, SessionEndCause};
use crate::flow::{FlowRegistry, GlobalFilter, PublishFlow, Signal, SignalReceiver, SignalSender};
use crate::hooks::{AckInterceptor, DefaultInterceptor};
use crate::metrics::InboundMetrics;
use crate::protocol::{Packet, ProtocolError, PubRel, Publish, QoS, ReasonCode};
use crate::qos::{IncomingQos, PublishAction};
use crate::topic::{validate_topic_name, Subscription, TopicFilter};

#[cfg(test)]
mod tests;

/// Channel the session writes acknowledgements and DISCONNECTs to
pub type PacketSender = mpsc::UnboundedSender<Packet>;

/// Inbound PUBLISH handling of one client session
pub struct InboundSession {
    registry: FlowRegistry,
    dispatch: DispatchEngine,
    qos: IncomingQos,
    interceptor: Arc<dyn AckInterceptor>,
    signals: SignalSender,
    outbound: Option<PacketSender>,
    /// Incremented on every connect; identifies the connection a publish arrived on
    epoch: u64,
    metrics: Arc<InboundMetrics>,
}

impl InboundSession {
    /// Create a session; application handles report back through `signals`,
    /// whose receiver must be fed to [`handle_signal`](Self::handle_signal)
    pub fn new(config: &InboundConfig, signals: SignalSender) -> Self {
        Self::with_metrics(config, signals, Arc::new(InboundMetrics::new()))
    }

    pub fn with_metrics(
        config: &InboundConfig,
        signals: SignalSender,
        metrics: Arc<InboundMetrics>,
    ) -> Self {
        Self {
            registry: FlowRegistry::new(),
            dispatch: DispatchEngine::new(
                config.receive_maximum,
                config.qos0_overflow,
                metrics.clone(),
            ),
            qos: IncomingQos::new(),
            interceptor: Arc::new(DefaultInterceptor),
            signals,
            outbound: None,
            epoch: 0,
            metrics,
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn AckInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn metrics(&self) -> &Arc<InboundMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.is_some()
    }

    /// Queued (QoS 0, QoS 1/2) publishes
    pub fn queued(&self) -> (usize, usize) {
        (self.dispatch.qos0_len(), self.dispatch.qos12_len())
    }

    /// Attach a new connection; returns its epoch
    pub fn connect(&mut self, outbound: PacketSender) -> u64 {
        self.epoch += 1;
        self.outbound = Some(outbound);
        debug!("inbound session connected, epoch {}", self.epoch);
        self.epoch
    }

    /// Detach the connection; acknowledgements are cached until the broker
    /// resends
    pub fn disconnect(&mut self) {
        if self.outbound.take().is_some() {
            debug!("inbound session disconnected, epoch {}", self.epoch);
        }
    }

    pub fn on_publish(&mut self, publish: Publish) -> Result<(), ProtocolError> {
        self.metrics.publish_received(publish.qos);
        if let Err(reason) = validate_topic_name(&publish.topic) {
            return self.fail(ProtocolError::InvalidTopicName(reason));
        }

        if publish.qos == QoS::AtMostOnce {
            let acknowledged = self.dispatch.on_publish_qos0(publish, &mut self.registry);
            self.acknowledge_all(acknowledged);
            return Ok(());
        }

        let message = self.dispatch.next_message_id();
        let action = match self.qos.on_publish(&publish, self.epoch, message) {
            Ok(action) => action,
            Err(e) => return self.fail(e),
        };
        match action {
            PublishAction::Ignore => Ok(()),
            PublishAction::Resend(packet) => {
                self.write(packet);
                Ok(())
            }
            PublishAction::Dispatch { replaced } => {
                let packet_id = publish.packet_id;
                match self
                    .dispatch
                    .on_publish_qos12(message, publish, self.epoch, &mut self.registry)
                {
                    Ok(acknowledged) => {
                        self.acknowledge_all(acknowledged);
                        Ok(())
                    }
                    Err(e) => {
                        if let Some(packet_id) = packet_id {
                            self.qos.restore(packet_id, replaced);
                        }
                        self.fail(e)
                    }
                }
            }
        }
    }

    pub fn on_pubrel(&mut self, pubrel: PubRel) -> Result<(), ProtocolError> {
        match self.qos.on_pubrel(&pubrel, self.interceptor.as_ref()) {
            Ok(packet) => {
                self.write(packet);
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Register a SUBSCRIBE; the returned flow receives matching publishes
    /// once the SUBACK is applied with [`sub_ack`](Self::sub_ack)
    pub fn subscribe(
        &mut self,
        subscriptions: &[Subscription],
        subscription_identifier: Option<u32>,
        manual_acknowledgement: bool,
    ) -> PublishFlow {
        self.registry.subscribe_flow(
            subscriptions,
            subscription_identifier,
            manual_acknowledgement,
            &self.signals,
        )
    }

    /// Register a SUBSCRIBE whose publishes go to the global flows only
    pub fn subscribe_without_flow(
        &mut self,
        subscriptions: &[Subscription],
        subscription_identifier: Option<u32>,
    ) {
        self.registry
            .subscribe(subscriptions, subscription_identifier, None);
    }

    pub fn sub_ack(
        &mut self,
        subscriptions: &[Subscription],
        subscription_identifier: Option<u32>,
        reason_codes: &[ReasonCode],
    ) {
        self.registry
            .sub_ack(subscriptions, subscription_identifier, reason_codes);
    }

    pub fn unsubscribe(&mut self, filters: &[TopicFilter], reason_codes: &[ReasonCode]) {
        self.registry.unsubscribe(filters, reason_codes);
    }

    pub fn subscribe_global(
        &mut self,
        filter: GlobalFilter,
        manual_acknowledgement: bool,
    ) -> PublishFlow {
        self.registry
            .subscribe_global(filter, manual_acknowledgement, &self.signals)
    }

    /// Acknowledged subscriptions, grouped by subscription identifier
    pub fn subscriptions(&self) -> Vec<(Option<u32>, Vec<Subscription>)> {
        self.registry.subscriptions()
    }

    pub fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Request(flow) => {
                if !self.registry.flows().contains(flow) {
                    debug!("request for finished flow {:?} ignored", flow);
                    return;
                }
                if self.dispatch.referenced_flow_count() > 0 {
                    self.drain();
                }
            }
            Signal::Cancel(flow) => {
                self.registry.cancel(flow);
                if self.dispatch.referenced_flow_count() > 0 {
                    self.drain();
                }
            }
            Signal::Acknowledge { flow, message } => {
                self.dispatch.acknowledge(message);
                let flows = self.registry.flows_mut();
                match flows.get_mut(flow) {
                    Some(state) => {
                        state.acknowledge();
                        flows.release(flow);
                    }
                    None => debug!("confirmation from finished flow {:?} ignored", flow),
                }
                self.drain();
            }
        }
    }

    /// Handle every signal already in `signals`; returns how many there were
    pub fn process_signals(&mut self, signals: &mut SignalReceiver) -> usize {
        let mut count = 0;
        while let Ok(signal) = signals.try_recv() {
            self.handle_signal(signal);
            count += 1;
        }
        count
    }

    /// Tear down all inbound state; every live flow fails with `cause`
    pub fn end(&mut self, cause: SessionEndCause) {
        info!("inbound session ended: {}", cause);
        self.dispatch.clear(self.registry.flows_mut());
        self.qos.clear();
        self.registry.clear(FlowError::SessionEnded(cause));
    }

    fn drain(&mut self) {
        let acknowledged = self.dispatch.drain(self.registry.flows_mut());
        self.acknowledge_all(acknowledged);
    }

    fn acknowledge_all(&mut self, acknowledged: Vec<PendingPublish>) {
        for pending in acknowledged {
            if let Some(packet) = self.qos.acknowledge(&pending, self.interceptor.as_ref()) {
                self.write(packet);
            }
        }
    }

    /// Hand `packet` to the transport; unwritten acknowledgements stay cached
    fn write(&mut self, packet: Packet) {
        let Some(outbound) = &self.outbound else {
            debug!("not connected, packet {:?} not written", packet.packet_id());
            return;
        };
        match outbound.send(packet.clone()) {
            Ok(()) => {
                if let Some(kind) = acknowledgement_kind(&packet) {
                    self.metrics.acknowledgement_sent(kind);
                }
                self.qos.written(&packet);
            }
            Err(_) => {
                debug!("transport closed, packet {:?} not written", packet.packet_id());
                self.outbound = None;
            }
        }
    }

    /// Answer a protocol violation with a DISCONNECT and drop the connection
    fn fail(&mut self, error: ProtocolError) -> Result<(), ProtocolError> {
        warn!("protocol violation by broker: {}", error);
        self.metrics.protocol_violation();
        self.write(Packet::Disconnect(error.to_disconnect()));
        self.outbound = None;
        Err(error)
    }
}

fn acknowledgement_kind(packet: &Packet) -> Option<&'static str> {
    match packet {
        Packet::PubAck(_) => Some("puback"),
        Packet::PubRec(_) => Some("pubrec"),
        Packet::PubComp(_) => Some("pubcomp"),
        Packet::Disconnect(_) => None,
    }
}
