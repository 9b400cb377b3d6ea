//! Publish flows
//!
//! A flow is the application-side consumer of inbound publishes. The
//! session-owned half ([`Flow`], stored in a [`FlowTable`]) carries the
//! delivery bookkeeping and is only touched by the session task. The
//! application half ([`PublishFlow`]) may live on any task; it talks back to
//! the session through the atomics in [`FlowShared`] and a [`Signal`] channel.
//!
//! Demand handshake: the application adds to `new_requested` and swaps the
//! request state to `NEW_REQUESTS`. If the state was `BLOCKED` the session had
//! parked the flow and a [`Signal::Request`] wakes it. The session folds
//! `new_requested` into its local counter only when the local counter is
//! exhausted, so the hot path never touches the atomics.

mod handle;
mod registry;

pub use handle::{Confirmation, FlowEvent, IncomingPublish, PublishFlow};
pub use registry::FlowRegistry;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tracing::debug;

use crate::dispatch::MessageId;
use crate::error::FlowError;
use crate::protocol::Publish;
use crate::topic::{EntryId, TopicFilter};

const NO_NEW_REQUESTS: u8 = 0;
const NEW_REQUESTS: u8 = 1;
const BLOCKED: u8 = 2;

new_key_type! {
    /// Identifier of a flow within one session
    ///
    /// Keys of removed flows never resolve again, so a signal or
    /// confirmation that outlives its flow is ignored.
    pub struct FlowId;
}

/// Messages sent from application handles to the session task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// New demand after the flow was parked
    Request(FlowId),
    Cancel(FlowId),
    /// A manually acknowledged publish was confirmed
    Acknowledge { flow: FlowId, message: MessageId },
}

pub type SignalSender = mpsc::UnboundedSender<Signal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<Signal>;

pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    mpsc::unbounded_channel()
}

/// Selection rules for flows not bound to a topic filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalFilter {
    /// Every publish that matched at least one subscription
    AllSubscriptions,
    /// Every publish that matched no subscription
    Unsolicited,
    /// Every publish
    AllPublishes,
    /// Publishes no other flow consumed
    Remaining,
}

impl GlobalFilter {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug)]
pub enum FlowKind {
    Subscribed {
        topic_filters: SmallVec<[(EntryId, TopicFilter); 1]>,
        subscription_identifier: Option<u32>,
    },
    Global(GlobalFilter),
}

/// State shared between a flow and its application handle
#[derive(Debug, Default)]
pub(crate) struct FlowShared {
    new_requested: AtomicU64,
    request_state: AtomicU8,
    cancelled: AtomicBool,
}

impl FlowShared {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns true if the session must be woken up
    pub(crate) fn request(&self, n: u64) -> bool {
        if n == 0 || self.is_cancelled() {
            return false;
        }
        let _ = self
            .new_requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(n))
            });
        self.request_state.swap(NEW_REQUESTS, Ordering::AcqRel) == BLOCKED
    }

    /// Returns true on the first call only
    pub(crate) fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }
}

/// Outcome of a demand check during one drain run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Demand {
    Ready,
    /// Parked in this run; counts towards the blocking total once
    Blocked,
    /// Already counted as blocking in this run
    AlreadyBlocked,
}

/// Session-side half of a publish flow
#[derive(Debug)]
pub struct Flow {
    id: FlowId,
    kind: FlowKind,
    shared: Arc<FlowShared>,
    events: mpsc::UnboundedSender<FlowEvent>,
    signals: SignalSender,
    manual_acknowledgement: bool,
    /// Local demand, `u64::MAX` is unbounded
    requested: u64,
    blocking: bool,
    blocked_index: u64,
    referenced: usize,
    missing_acknowledgements: usize,
    outcome: Option<Result<(), FlowError>>,
    /// Cancel was processed and the flow is no longer registered anywhere
    detached: bool,
}

impl Flow {
    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn kind(&self) -> &FlowKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut FlowKind {
        &mut self.kind
    }

    pub fn manual_acknowledgement(&self) -> bool {
        self.manual_acknowledgement
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn referenced(&self) -> usize {
        self.referenced
    }

    pub fn missing_acknowledgements(&self) -> usize {
        self.missing_acknowledgements
    }

    pub(crate) fn poll_demand(&mut self, run_index: u64) -> Demand {
        if self.requested > 0 {
            return Demand::Ready;
        }
        if self.blocking && self.blocked_index != run_index {
            self.blocking = false;
        }
        if self.blocking {
            return Demand::AlreadyBlocked;
        }
        loop {
            if self
                .shared
                .request_state
                .compare_exchange(NO_NEW_REQUESTS, BLOCKED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.blocked_index = run_index;
                self.blocking = true;
                return Demand::Blocked;
            }
            self.shared
                .request_state
                .store(NO_NEW_REQUESTS, Ordering::Release);
            let new_requested = self.shared.new_requested.swap(0, Ordering::AcqRel);
            if new_requested > 0 {
                self.requested = self.requested.saturating_add(new_requested);
                return Demand::Ready;
            }
        }
    }

    /// Hand one publish to the application
    ///
    /// Returns false if the application dropped its receiver; the flow is
    /// then marked cancelled and the publish counts as not delivered.
    pub(crate) fn emit(&mut self, publish: Publish, confirmation: Option<Confirmation>) -> bool {
        if self.requested != u64::MAX {
            self.requested -= 1;
        }
        let event = FlowEvent::Publish(IncomingPublish {
            publish,
            confirmation,
        });
        if self.events.send(event).is_err() {
            debug!("flow {:?} receiver dropped, cancelling", self.id);
            if self.shared.cancel() {
                let _ = self.signals.send(Signal::Cancel(self.id));
            }
            return false;
        }
        true
    }

    pub(crate) fn confirmation(&self, message: MessageId) -> Confirmation {
        Confirmation::new(self.id, message, self.signals.clone())
    }

    /// Returns the new reference count
    pub(crate) fn reference(&mut self) -> usize {
        self.referenced += 1;
        self.referenced
    }

    /// Returns the new reference count
    pub(crate) fn dereference(&mut self) -> usize {
        self.referenced = self.referenced.saturating_sub(1);
        self.referenced
    }

    pub(crate) fn increase_missing_acknowledgements(&mut self) {
        self.missing_acknowledgements += 1;
    }

    pub(crate) fn acknowledge(&mut self) {
        self.missing_acknowledgements = self.missing_acknowledgements.saturating_sub(1);
    }

    pub(crate) fn complete(&mut self) {
        if self.outcome.is_none() {
            self.outcome = Some(Ok(()));
        }
    }

    pub(crate) fn fail(&mut self, error: FlowError) {
        if self.outcome.is_none() {
            self.outcome = Some(Err(error));
        }
    }

    pub(crate) fn detach(&mut self) {
        self.detached = true;
    }

    /// Forget outstanding deliveries when the session ends
    pub(crate) fn reset_references(&mut self) {
        self.referenced = 0;
        self.missing_acknowledgements = 0;
    }

    fn is_finished(&self) -> bool {
        (self.outcome.is_some() || self.detached)
            && self.referenced == 0
            && self.missing_acknowledgements == 0
    }

    fn finish(self) {
        if self.is_cancelled() {
            return;
        }
        let event = match self.outcome {
            Some(Ok(())) => FlowEvent::Completed,
            Some(Err(e)) => FlowEvent::Failed(e),
            None => return,
        };
        // A dropped receiver has nothing left to tell
        let _ = self.events.send(event);
    }
}

/// Session-owned storage of every live flow
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: SlotMap<FlowId, Flow>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub(crate) fn create(
        &mut self,
        kind: FlowKind,
        manual_acknowledgement: bool,
        signals: &SignalSender,
    ) -> PublishFlow {
        let shared = Arc::new(FlowShared::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = self.flows.insert_with_key(|id| Flow {
            id,
            kind,
            shared: shared.clone(),
            events: events_tx,
            signals: signals.clone(),
            manual_acknowledgement,
            requested: 0,
            blocking: false,
            blocked_index: 0,
            referenced: 0,
            missing_acknowledgements: 0,
            outcome: None,
            detached: false,
        });
        PublishFlow::new(id, shared, signals.clone(), events_rx)
    }

    pub fn get(&self, id: FlowId) -> Option<&Flow> {
        self.flows.get(id)
    }

    pub fn get_mut(&mut self, id: FlowId) -> Option<&mut Flow> {
        self.flows.get_mut(id)
    }

    pub fn contains(&self, id: FlowId) -> bool {
        self.flows.contains_key(id)
    }

    pub fn ids(&self) -> Vec<FlowId> {
        self.flows.keys().collect()
    }

    /// Remove the flow if it has nothing left to do, signalling its outcome
    pub(crate) fn release(&mut self, id: FlowId) -> bool {
        let finished = self.flows.get(id).is_some_and(Flow::is_finished);
        if !finished {
            return false;
        }
        if let Some(flow) = self.flows.remove(id) {
            debug!("flow {:?} finished", id);
            flow.finish();
        }
        true
    }
}
