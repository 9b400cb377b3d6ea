//! Dispatch engine
//!
//! Two FIFO queues of publishes waiting for delivery: QoS 0 and QoS 1/2.
//! A drain run walks both queues and emits each publish to every flow of its
//! set that has demand. A QoS 1/2 publish leaves its queue once every flow
//! got it and every manual flow confirmed it, and only from the head, so
//! acknowledgements go out in arrival order.
//!
//! A drain run stops early once every referenced flow is blocked: nothing
//! further down the queues can make progress.

use std::collections::VecDeque;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::config::Qos0Overflow;
use crate::flow::{Demand, FlowId, FlowRegistry, FlowTable};
use crate::metrics::InboundMetrics;
use crate::protocol::{ProtocolError, Publish};


/// Session-local identity of an admitted publish
///
/// Packet identifiers are reused by the broker; a message id never is, so a
/// late confirmation can never be mistaken for one of a newer publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

/// A publish with the flows it still has to reach
#[derive(Debug)]
pub struct PendingPublish {
    pub id: MessageId,
    pub publish: Publish,
    /// Connection epoch the publish arrived on
    pub epoch: u64,
    pub subscription_found: bool,
    flows: SmallVec<[FlowId; 4]>,
    missing_acknowledgements: usize,
}

impl PendingPublish {
    /// Every flow got the publish
    pub fn is_consumed(&self) -> bool {
        self.flows.is_empty()
    }

    /// Every manual flow confirmed the publish
    pub fn is_acknowledged(&self) -> bool {
        self.missing_acknowledgements == 0
    }

    pub fn flows(&self) -> &[FlowId] {
        &self.flows
    }
}

#[derive(Debug, Default)]
struct DrainState {
    run_index: u64,
    blocking_flow_count: usize,
    referenced_flow_count: usize,
}

/// QoS 0 and QoS 1/2 delivery queues of one session
pub struct DispatchEngine {
    qos0: VecDeque<PendingPublish>,
    qos12: VecDeque<PendingPublish>,
    receive_maximum: u16,
    overflow: Qos0Overflow,
    next_message: u64,
    state: DrainState,
    metrics: Arc<InboundMetrics>,
}

impl DispatchEngine {
    pub fn new(receive_maximum: u16, overflow: Qos0Overflow, metrics: Arc<InboundMetrics>) -> Self {
        Self {
            qos0: VecDeque::new(),
            qos12: VecDeque::new(),
            receive_maximum,
            overflow,
            next_message: 0,
            state: DrainState::default(),
            metrics,
        }
    }

    pub fn receive_maximum(&self) -> u16 {
        self.receive_maximum
    }

    pub fn qos0_len(&self) -> usize {
        self.qos0.len()
    }

    pub fn qos12_len(&self) -> usize {
        self.qos12.len()
    }

    /// Flows that are referenced by at least one queued publish
    pub fn referenced_flow_count(&self) -> usize {
        self.state.referenced_flow_count
    }

    pub fn next_message_id(&mut self) -> MessageId {
        self.next_message += 1;
        MessageId::new(self.next_message)
    }

    /// Admit a QoS 0 publish; returns QoS 1/2 publishes that became
    /// acknowledgeable during the drain
    pub fn on_publish_qos0(
        &mut self,
        publish: Publish,
        registry: &mut FlowRegistry,
    ) -> Vec<PendingPublish> {
        let capacity = 2 * usize::from(self.receive_maximum);
        if self.qos0.len() >= capacity {
            match self.overflow {
                Qos0Overflow::DropOldest => {
                    if let Some(dropped) = self.qos0.pop_front() {
                        warn!(
                            "QoS 0 queue full, dropping oldest publish on {}",
                            dropped.publish.topic
                        );
                        self.metrics.qos0_dropped();
                        self.release(dropped, registry.flows_mut());
                    }
                }
                Qos0Overflow::DropNewest => {
                    warn!("QoS 0 queue full, dropping publish on {}", publish.topic);
                    self.metrics.qos0_dropped();
                    return Vec::new();
                }
            }
        }

        let id = self.next_message_id();
        let entry = self.admit(id, publish, 0, registry);
        if entry.is_consumed() {
            return Vec::new();
        }
        self.qos0.push_back(entry);
        self.drain(registry.flows_mut())
    }

    /// Admit a QoS 1/2 publish under receive-maximum flow control
    ///
    /// Returns the publishes that are ready to be acknowledged, in order,
    /// possibly including this one.
    pub fn on_publish_qos12(
        &mut self,
        id: MessageId,
        publish: Publish,
        epoch: u64,
        registry: &mut FlowRegistry,
    ) -> Result<Vec<PendingPublish>, ProtocolError> {
        if self.qos12.len() >= usize::from(self.receive_maximum) {
            return Err(ProtocolError::ReceiveMaximumExceeded);
        }

        let entry = self.admit(id, publish, epoch, registry);
        if self.qos12.is_empty() && entry.is_consumed() && entry.is_acknowledged() {
            return Ok(vec![entry]);
        }
        self.qos12.push_back(entry);
        Ok(self.drain(registry.flows_mut()))
    }

    fn admit(
        &mut self,
        id: MessageId,
        publish: Publish,
        epoch: u64,
        registry: &mut FlowRegistry,
    ) -> PendingPublish {
        let matches = registry.find_matching(&publish);
        if matches.is_empty() {
            warn!("No publish flow registered for {}", publish.topic);
            self.metrics.publish_unmatched();
        }

        let tracked = publish.qos.is_acknowledged();
        let mut missing_acknowledgements = 0;
        let flows = registry.flows_mut();
        for &flow_id in &matches.flows {
            let Some(flow) = flows.get_mut(flow_id) else {
                continue;
            };
            if flow.reference() == 1 {
                self.state.referenced_flow_count += 1;
            }
            if tracked && flow.manual_acknowledgement() {
                flow.increase_missing_acknowledgements();
                missing_acknowledgements += 1;
            }
        }
        trace!(
            "admitted {:?} on {} for {} flows",
            id,
            publish.topic,
            matches.len()
        );

        PendingPublish {
            id,
            publish,
            epoch,
            subscription_found: matches.subscription_found,
            flows: matches.flows,
            missing_acknowledgements,
        }
    }

    /// Run one delivery pass over both queues
    ///
    /// Returns the QoS 1/2 publishes popped from the head because they are
    /// consumed and acknowledged.
    pub fn drain(&mut self, flows: &mut FlowTable) -> Vec<PendingPublish> {
        self.state.run_index += 1;
        self.state.blocking_flow_count = 0;
        let mut acknowledged = Vec::new();

        let mut i = 0;
        while i < self.qos12.len() {
            let entry = &mut self.qos12[i];
            emit(&mut self.state, entry, flows, &self.metrics);
            if i == 0 && entry.is_consumed() && entry.is_acknowledged() {
                if let Some(entry) = self.qos12.pop_front() {
                    acknowledged.push(entry);
                }
            } else if self.state.blocking_flow_count == self.state.referenced_flow_count {
                self.update_metrics();
                return acknowledged;
            } else {
                i += 1;
            }
        }

        let mut i = 0;
        while i < self.qos0.len() {
            let entry = &mut self.qos0[i];
            emit(&mut self.state, entry, flows, &self.metrics);
            if entry.is_consumed() {
                self.qos0.remove(i);
            } else if self.state.blocking_flow_count == self.state.referenced_flow_count {
                break;
            } else {
                i += 1;
            }
        }

        self.update_metrics();
        acknowledged
    }

    /// Record one confirmation of a manually acknowledged publish
    pub fn acknowledge(&mut self, message: MessageId) -> bool {
        match self.qos12.iter_mut().find(|entry| entry.id == message) {
            Some(entry) => {
                entry.missing_acknowledgements = entry.missing_acknowledgements.saturating_sub(1);
                true
            }
            None => {
                debug!("confirmation for {:?} ignored, publish no longer queued", message);
                false
            }
        }
    }

    /// Drop every queued publish, releasing its flow references
    pub fn clear(&mut self, flows: &mut FlowTable) {
        let entries: Vec<_> = self.qos12.drain(..).chain(self.qos0.drain(..)).collect();
        for entry in entries {
            self.release(entry, flows);
        }
        self.state.referenced_flow_count = 0;
        self.state.blocking_flow_count = 0;
        self.update_metrics();
    }

    /// Give up on delivering `entry` to the flows it has not reached yet
    fn release(&mut self, entry: PendingPublish, flows: &mut FlowTable) {
        let tracked = entry.publish.qos.is_acknowledged();
        for flow_id in entry.flows {
            let Some(flow) = flows.get_mut(flow_id) else {
                continue;
            };
            if tracked && flow.manual_acknowledgement() {
                flow.acknowledge();
            }
            if flow.dereference() == 0 {
                self.state.referenced_flow_count =
                    self.state.referenced_flow_count.saturating_sub(1);
                flows.release(flow_id);
            }
        }
    }

    fn update_metrics(&self) {
        self.metrics.update_queues(self.qos0.len(), self.qos12.len());
    }
}

/// Emit `entry` to every flow of its set that has demand
fn emit(
    state: &mut DrainState,
    entry: &mut PendingPublish,
    flows: &mut FlowTable,
    metrics: &InboundMetrics,
) {
    let tracked = entry.publish.qos.is_acknowledged();
    let mut i = 0;
    while i < entry.flows.len() {
        let flow_id = entry.flows[i];
        let Some(flow) = flows.get_mut(flow_id) else {
            entry.flows.remove(i);
            continue;
        };
        let manual = tracked && flow.manual_acknowledgement();

        let delivered = if flow.is_cancelled() {
            false
        } else {
            match flow.poll_demand(state.run_index) {
                Demand::Ready => {
                    let confirmation = manual.then(|| flow.confirmation(entry.id));
                    let sent = flow.emit(entry.publish.clone(), confirmation);
                    if sent {
                        trace!("emitted {:?} to {:?}", entry.id, flow_id);
                        metrics.publish_delivered();
                    }
                    sent
                }
                Demand::Blocked => {
                    state.blocking_flow_count += 1;
                    if state.blocking_flow_count == state.referenced_flow_count {
                        return;
                    }
                    i += 1;
                    continue;
                }
                Demand::AlreadyBlocked => {
                    i += 1;
                    continue;
                }
            }
        };

        // Gone from the set either way; an undelivered publish owes no confirmation
        entry.flows.remove(i);
        if manual && !delivered {
            flow.acknowledge();
            entry.missing_acknowledgements = entry.missing_acknowledgements.saturating_sub(1);
        }
        if flow.dereference() == 0 {
            state.referenced_flow_count = state.referenced_flow_count.saturating_sub(1);
            flows.release(flow_id);
        }
    }
}
