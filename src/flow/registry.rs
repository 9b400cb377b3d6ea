//! Flow registry: which flows receive which publishes

use smallvec::SmallVec;
use tracing::debug;

use super::{FlowId, FlowKind, FlowTable, GlobalFilter, PublishFlow, SignalSender};
use crate::error::FlowError;
use crate::protocol::{Publish, ReasonCode};
use crate::topic::{Detached, MatchSet, Subscription, SubscriptionIndex, TopicFilter};

/// Subscription index, global flows and the flow table of one session
#[derive(Debug, Default)]
pub struct FlowRegistry {
    index: SubscriptionIndex<FlowId>,
    flows: FlowTable,
    globals: [SmallVec<[FlowId; 2]>; 4],
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    pub fn flows_mut(&mut self) -> &mut FlowTable {
        &mut self.flows
    }

    pub fn index(&self) -> &SubscriptionIndex<FlowId> {
        &self.index
    }

    /// Create a flow for `subscriptions` and register them; the flow receives
    /// nothing until the SUBACK acknowledges the filters
    pub fn subscribe_flow(
        &mut self,
        subscriptions: &[Subscription],
        subscription_identifier: Option<u32>,
        manual_acknowledgement: bool,
        signals: &SignalSender,
    ) -> PublishFlow {
        let kind = FlowKind::Subscribed {
            topic_filters: SmallVec::new(),
            subscription_identifier,
        };
        let flow = self.flows.create(kind, manual_acknowledgement, signals);
        self.subscribe(subscriptions, subscription_identifier, Some(flow.id()));
        flow
    }

    /// Register subscriptions, optionally owned by an existing flow
    pub fn subscribe(
        &mut self,
        subscriptions: &[Subscription],
        subscription_identifier: Option<u32>,
        flow: Option<FlowId>,
    ) {
        let flow = flow.filter(|&id| self.flows.contains(id));
        for subscription in subscriptions {
            let entry = self
                .index
                .subscribe(subscription, subscription_identifier, flow);
            let Some(id) = flow else { continue };
            if let Some(FlowKind::Subscribed { topic_filters, .. }) =
                self.flows.get_mut(id).map(|f| f.kind_mut())
            {
                topic_filters.push((entry, subscription.filter.clone()));
            }
        }
    }

    /// Apply the SUBACK of a SUBSCRIBE
    ///
    /// `reason_codes` lines up with `subscriptions`; a missing code counts as
    /// success (MQTT 3.1.1 brokers that grant silently).
    pub fn sub_ack(
        &mut self,
        subscriptions: &[Subscription],
        subscription_identifier: Option<u32>,
        reason_codes: &[ReasonCode],
    ) {
        for (i, subscription) in subscriptions.iter().enumerate() {
            let code = reason_codes.get(i).copied();
            let error = code.is_some_and(ReasonCode::is_error);
            let detached = self
                .index
                .suback(&subscription.filter, subscription_identifier, error);
            let code = code.unwrap_or(ReasonCode::UnspecifiedError);
            for d in detached {
                self.detach_entry(d, |flow| flow.fail(FlowError::SubscribeRejected(code)));
            }
        }
    }

    /// Apply the UNSUBACK of an UNSUBSCRIBE; error codes leave the
    /// subscription in place
    pub fn unsubscribe(&mut self, filters: &[TopicFilter], reason_codes: &[ReasonCode]) {
        for (i, filter) in filters.iter().enumerate() {
            if reason_codes.get(i).is_some_and(|code| code.is_error()) {
                debug!("unsubscribe of {} rejected, keeping subscription", filter);
                continue;
            }
            for d in self.index.unsubscribe(filter) {
                self.detach_entry(d, |flow| flow.complete());
            }
        }
    }

    /// Remove one filter from its flow, ending the flow when none is left
    fn detach_entry(&mut self, detached: Detached<FlowId>, on_empty: impl FnOnce(&mut super::Flow)) {
        let Some(flow) = self.flows.get_mut(detached.flow) else {
            return;
        };
        let FlowKind::Subscribed {
            topic_filters,
            subscription_identifier,
        } = flow.kind_mut()
        else {
            return;
        };
        topic_filters.retain(|(entry, _)| *entry != detached.entry);
        if !topic_filters.is_empty() {
            return;
        }
        let subscription_identifier = *subscription_identifier;
        on_empty(flow);
        if let Some(id) = subscription_identifier {
            self.index.forget_identifier(id, detached.flow);
        }
        self.flows.release(detached.flow);
    }

    pub fn subscribe_global(
        &mut self,
        filter: GlobalFilter,
        manual_acknowledgement: bool,
        signals: &SignalSender,
    ) -> PublishFlow {
        let flow = self
            .flows
            .create(FlowKind::Global(filter), manual_acknowledgement, signals);
        self.globals[filter.index()].push(flow.id());
        flow
    }

    /// Detach a cancelled flow from the index or the global lists
    ///
    /// The flow stays in the table until its in-flight publishes are
    /// dereferenced and its confirmations are in.
    pub fn cancel(&mut self, id: FlowId) {
        let Some(flow) = self.flows.get_mut(id) else {
            debug!("cancel of unknown flow {:?} ignored", id);
            return;
        };
        match flow.kind_mut() {
            FlowKind::Subscribed {
                topic_filters,
                subscription_identifier,
            } => {
                let entries: SmallVec<[_; 4]> =
                    topic_filters.drain(..).map(|(entry, _)| entry).collect();
                let subscription_identifier = *subscription_identifier;
                self.index.cancel(id, subscription_identifier, entries);
            }
            FlowKind::Global(filter) => {
                let filter = *filter;
                self.globals[filter.index()].retain(|flow| *flow != id);
            }
        }
        if let Some(flow) = self.flows.get_mut(id) {
            flow.detach();
        }
        self.flows.release(id);
    }

    /// Select the flows for one inbound publish
    ///
    /// Subscription flows first, then the globals: all-subscriptions or
    /// unsolicited depending on whether a subscription matched, then
    /// all-publishes, and remaining only if nothing else was selected.
    pub fn find_matching(&self, publish: &Publish) -> MatchSet<FlowId> {
        let mut matches = MatchSet::new();
        self.index.find_matching(publish, &mut matches);

        let selected = if matches.subscription_found {
            GlobalFilter::AllSubscriptions
        } else {
            GlobalFilter::Unsolicited
        };
        matches.extend(self.globals[selected.index()].iter().copied());
        matches.extend(self.globals[GlobalFilter::AllPublishes.index()].iter().copied());
        if matches.is_empty() {
            matches.extend(self.globals[GlobalFilter::Remaining.index()].iter().copied());
        }

        matches.flows.retain(|id| self.flows.contains(*id));
        matches
    }

    pub fn subscriptions(&self) -> Vec<(Option<u32>, Vec<Subscription>)> {
        self.index.subscriptions()
    }

    /// End every flow with `error` and drop all registrations
    ///
    /// In-flight deliveries must already be released; outstanding
    /// confirmations are forgotten.
    pub fn clear(&mut self, error: FlowError) {
        let acknowledged = self.index.clear();
        debug!(
            "clearing {} flows ({} with acknowledged subscriptions)",
            self.flows.len(),
            acknowledged.len()
        );
        for globals in &mut self.globals {
            globals.clear();
        }
        for id in self.flows.ids() {
            if let Some(flow) = self.flows.get_mut(id) {
                flow.reset_references();
                flow.fail(error.clone());
                flow.detach();
            }
            self.flows.release(id);
        }
    }
}
