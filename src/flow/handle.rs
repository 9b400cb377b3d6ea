//! Application-side handles of a publish flow

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{FlowId, FlowShared, Signal, SignalSender};
use crate::dispatch::MessageId;
use crate::error::FlowError;
use crate::protocol::Publish;

/// Events delivered to a [`PublishFlow`]
#[derive(Debug)]
pub enum FlowEvent {
    Publish(IncomingPublish),
    /// The flow ended normally, e.g. all its filters were unsubscribed
    Completed,
    Failed(FlowError),
}

/// A publish handed to the application
#[derive(Debug)]
pub struct IncomingPublish {
    pub publish: Publish,
    /// Present when the flow acknowledges manually and the publish is QoS 1/2
    pub confirmation: Option<Confirmation>,
}

impl IncomingPublish {
    /// Confirm the publish if it needs it
    ///
    /// Returns false only if a confirmation was pending and the session is gone.
    pub fn confirm(&mut self) -> bool {
        match self.confirmation.take() {
            Some(confirmation) => confirmation.confirm(),
            None => true,
        }
    }
}

/// One-shot acknowledgement of a manually acknowledged publish
///
/// The PUBACK/PUBREC for a message goes out only once every manual flow that
/// received it has confirmed it.
#[derive(Debug)]
pub struct Confirmation {
    flow: FlowId,
    message: MessageId,
    signals: SignalSender,
}

impl Confirmation {
    pub(crate) fn new(flow: FlowId, message: MessageId, signals: SignalSender) -> Self {
        Self {
            flow,
            message,
            signals,
        }
    }

    pub fn message(&self) -> MessageId {
        self.message
    }

    /// Returns false if the session is no longer running
    pub fn confirm(self) -> bool {
        self.signals
            .send(Signal::Acknowledge {
                flow: self.flow,
                message: self.message,
            })
            .is_ok()
    }
}

/// Application handle of a publish flow
///
/// Nothing is delivered until demand is signalled with [`request`](Self::request).
/// Dropping the handle cancels the flow.
#[derive(Debug)]
pub struct PublishFlow {
    id: FlowId,
    shared: Arc<FlowShared>,
    signals: SignalSender,
    events: mpsc::UnboundedReceiver<FlowEvent>,
}

impl PublishFlow {
    pub(crate) fn new(
        id: FlowId,
        shared: Arc<FlowShared>,
        signals: SignalSender,
        events: mpsc::UnboundedReceiver<FlowEvent>,
    ) -> Self {
        Self {
            id,
            shared,
            signals,
            events,
        }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    /// Allow `n` more publishes to be delivered; saturates at unbounded
    pub fn request(&self, n: u64) {
        if self.shared.request(n) {
            let _ = self.signals.send(Signal::Request(self.id));
        }
    }

    pub fn request_unbounded(&self) {
        self.request(u64::MAX);
    }

    pub fn cancel(&self) {
        if self.shared.cancel() {
            let _ = self.signals.send(Signal::Cancel(self.id));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Next event, or `None` once the flow is finished and removed
    pub async fn next(&mut self) -> Option<FlowEvent> {
        self.events.recv().await
    }

    pub fn try_next(&mut self) -> Option<FlowEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for PublishFlow {
    fn drop(&mut self) {
        self.cancel();
    }
}
