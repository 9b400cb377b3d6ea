//! Subscription index: topic trie plus a subscription identifier shortcut

use ahash::AHashMap;
use smallvec::SmallVec;

use super::{Detached, EntryId, Subscription, TopicFilter, TopicTrie};
use crate::protocol::Publish;

/// Flows selected for one inbound PUBLISH
///
/// Each flow appears at most once, in the order it was first matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchSet<F> {
    pub flows: SmallVec<[F; 4]>,
    /// At least one subscription matched, with or without a flow
    pub subscription_found: bool,
}

impl<F: Copy + Eq> MatchSet<F> {
    pub fn new() -> Self {
        Self {
            flows: SmallVec::new(),
            subscription_found: false,
        }
    }

    /// Add `flow` unless it is already selected
    pub fn push(&mut self, flow: F) -> bool {
        if self.flows.contains(&flow) {
            return false;
        }
        self.flows.push(flow);
        true
    }

    pub fn extend(&mut self, flows: impl IntoIterator<Item = F>) {
        for flow in flows {
            self.push(flow);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }
}

impl<F: Copy + Eq> Default for MatchSet<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Flow registered under a subscription identifier
#[derive(Debug, Clone, Copy)]
struct Identified<F> {
    flow: F,
    acknowledged: bool,
}

/// Subscriptions of one session
///
/// Only acknowledged subscriptions match. A publish that carries
/// subscription identifiers is routed through `by_identifier` first; only
/// identifiers without an acknowledged mapping fall back to the trie.
/// Entries without an identifier are always matched by topic.
#[derive(Debug)]
pub struct SubscriptionIndex<F> {
    trie: TopicTrie<F>,
    by_identifier: AHashMap<u32, Identified<F>>,
}

impl<F: Copy + Eq> SubscriptionIndex<F> {
    pub fn new() -> Self {
        Self {
            trie: TopicTrie::new(),
            by_identifier: AHashMap::new(),
        }
    }

    pub fn trie(&self) -> &TopicTrie<F> {
        &self.trie
    }

    pub fn subscribe(
        &mut self,
        subscription: &Subscription,
        subscription_identifier: Option<u32>,
        flow: Option<F>,
    ) -> EntryId {
        if let (Some(id), Some(flow)) = (subscription_identifier, flow) {
            self.by_identifier.insert(
                id,
                Identified {
                    flow,
                    acknowledged: false,
                },
            );
        }
        self.trie.subscribe(
            &subscription.filter,
            subscription.options,
            subscription_identifier,
            flow,
        )
    }

    pub fn suback(
        &mut self,
        filter: &TopicFilter,
        subscription_identifier: Option<u32>,
        error: bool,
    ) -> SmallVec<[Detached<F>; 2]> {
        if let Some(id) = subscription_identifier.filter(|_| !error) {
            if let Some(identified) = self.by_identifier.get_mut(&id) {
                identified.acknowledged = true;
            }
        }
        self.trie.suback(filter, subscription_identifier, error)
    }

    pub fn unsubscribe(&mut self, filter: &TopicFilter) -> SmallVec<[Detached<F>; 2]> {
        self.trie.unsubscribe(filter)
    }

    /// Drop the identifier shortcut if it still points at `flow`
    pub fn forget_identifier(&mut self, subscription_identifier: u32, flow: F) {
        let current = self.by_identifier.get(&subscription_identifier);
        if current.is_some_and(|identified| identified.flow == flow) {
            self.by_identifier.remove(&subscription_identifier);
        }
    }

    pub fn cancel(
        &mut self,
        flow: F,
        subscription_identifier: Option<u32>,
        entries: impl IntoIterator<Item = EntryId>,
    ) {
        if let Some(id) = subscription_identifier {
            self.forget_identifier(id, flow);
        }
        self.trie.cancel(flow, entries);
    }

    pub fn find_matching(&self, publish: &Publish, matches: &mut MatchSet<F>) {
        let identifiers = publish.subscription_identifiers();
        let mut unresolved: SmallVec<[u32; 4]> = SmallVec::new();
        for &id in identifiers {
            match self.by_identifier.get(&id) {
                Some(identified) if identified.acknowledged => {
                    matches.subscription_found = true;
                    matches.push(identified.flow);
                }
                _ => unresolved.push(id),
            }
        }

        self.trie.find_matching(&publish.topic, &mut |_, entry| {
            if !entry.acknowledged {
                return;
            }
            let qualifies = match entry.subscription_identifier {
                Some(id) if !identifiers.is_empty() => unresolved.contains(&id),
                _ => true,
            };
            if qualifies {
                matches.subscription_found = true;
                if let Some(flow) = entry.flow {
                    matches.push(flow);
                }
            }
        });
    }

    /// Drop everything, returning the flows of acknowledged subscriptions
    pub fn clear(&mut self) -> Vec<F> {
        self.by_identifier.clear();
        self.trie.clear()
    }

    pub fn subscriptions(&self) -> Vec<(Option<u32>, Vec<Subscription>)> {
        self.trie.subscriptions()
    }
}

impl<F: Copy + Eq> Default for SubscriptionIndex<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::QoS;

    fn subscribe(index: &mut SubscriptionIndex<u32>, f: &str, id: Option<u32>, flow: Option<u32>) {
        let subscription = Subscription::parse(f, QoS::AtLeastOnce).unwrap();
        index.subscribe(&subscription, id, flow);
        index.suback(&subscription.filter, id, false);
    }

    fn matching(index: &SubscriptionIndex<u32>, publish: &Publish) -> MatchSet<u32> {
        let mut matches = MatchSet::new();
        index.find_matching(publish, &mut matches);
        matches
    }

    #[test]
    fn test_match_set_deduplicates() {
        let mut set = MatchSet::new();
        assert!(set.push(1u32));
        assert!(!set.push(1));
        set.extend([2, 1, 3]);
        assert_eq!(set.flows.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_flow_matched_by_two_filters_once() {
        let mut index = SubscriptionIndex::new();
        subscribe(&mut index, "a/+/c", None, Some(1));
        subscribe(&mut index, "a/#", None, Some(1));

        let matches = matching(&index, &Publish::new("a/b/c", "x", QoS::AtMostOnce));
        assert!(matches.subscription_found);
        assert_eq!(matches.flows.as_slice(), &[1]);
    }

    #[test]
    fn test_subscription_without_flow_counts_as_found() {
        let mut index = SubscriptionIndex::new();
        subscribe(&mut index, "a/b", None, None);

        let matches = matching(&index, &Publish::new("a/b", "x", QoS::AtMostOnce));
        assert!(matches.subscription_found);
        assert!(matches.is_empty());
    }

    #[test]
    fn test_identifier_bypasses_topic() {
        let mut index = SubscriptionIndex::new();
        subscribe(&mut index, "a/b", Some(7), Some(1));

        // Identifier lookup does not depend on the topic
        let publish = Publish::new("other", "x", QoS::AtMostOnce).with_subscription_identifiers([7]);
        let matches = matching(&index, &publish);
        assert!(matches.subscription_found);
        assert_eq!(matches.flows.as_slice(), &[1]);
    }

    #[test]
    fn test_unresolved_identifier_falls_back_to_trie() {
        let mut index = SubscriptionIndex::new();
        subscribe(&mut index, "a/b", Some(7), None);
        subscribe(&mut index, "a/+", Some(8), Some(2));
        subscribe(&mut index, "a/#", None, Some(3));

        let publish = Publish::new("a/b", "x", QoS::AtMostOnce).with_subscription_identifiers([7, 8]);
        let mut matches = matching(&index, &publish);
        matches.flows.sort_unstable();
        assert!(matches.subscription_found);
        assert_eq!(matches.flows.as_slice(), &[2, 3]);
    }

    #[test]
    fn test_identified_entries_ignored_for_other_identifiers() {
        let mut index = SubscriptionIndex::new();
        subscribe(&mut index, "a/b", Some(7), Some(1));
        subscribe(&mut index, "a/+", Some(8), Some(2));
        index.forget_identifier(7, 1);

        let publish = Publish::new("a/b", "x", QoS::AtMostOnce).with_subscription_identifiers([8]);
        assert_eq!(matching(&index, &publish).flows.as_slice(), &[2]);
    }

    #[test]
    fn test_only_acknowledged_subscriptions_match() {
        let mut index = SubscriptionIndex::new();
        let identified = Subscription::parse("a/b", QoS::AtLeastOnce).unwrap();
        let plain = Subscription::parse("a/#", QoS::AtLeastOnce).unwrap();
        index.subscribe(&identified, Some(7), Some(1));
        index.subscribe(&plain, None, Some(2));

        let by_topic = Publish::new("a/b", "x", QoS::AtMostOnce);
        let by_identifier = by_topic.clone().with_subscription_identifiers([7]);
        assert!(!matching(&index, &by_topic).subscription_found);
        assert!(!matching(&index, &by_identifier).subscription_found);

        index.suback(&identified.filter, Some(7), false);
        assert_eq!(matching(&index, &by_topic).flows.as_slice(), &[1]);
        assert_eq!(matching(&index, &by_identifier).flows.as_slice(), &[1]);

        index.suback(&plain.filter, None, false);
        let mut flows = matching(&index, &by_topic).flows;
        flows.sort_unstable();
        assert_eq!(flows.as_slice(), &[1, 2]);
    }

    #[test]
    fn test_cancel_forgets_identifier() {
        let mut index = SubscriptionIndex::new();
        let subscription = Subscription::parse("a/b", QoS::AtLeastOnce).unwrap();
        let entry = index.subscribe(&subscription, Some(7), Some(1));
        index.suback(&subscription.filter, Some(7), false);

        index.cancel(1, Some(7), [entry]);

        let publish = Publish::new("a/b", "x", QoS::AtMostOnce).with_subscription_identifiers([7]);
        let matches = matching(&index, &publish);
        assert!(matches.subscription_found);
        assert!(matches.is_empty());
    }

    #[test]
    fn test_forget_identifier_keeps_newer_mapping() {
        let mut index = SubscriptionIndex::new();
        subscribe(&mut index, "a/b", Some(7), Some(1));
        subscribe(&mut index, "c/d", Some(7), Some(2));
        index.forget_identifier(7, 1);

        let publish = Publish::new("c/d", "x", QoS::AtMostOnce).with_subscription_identifiers([7]);
        assert_eq!(matching(&index, &publish).flows.as_slice(), &[2]);
    }

    #[test]
    fn test_clear_returns_acknowledged_flows() {
        let mut index = SubscriptionIndex::new();
        subscribe(&mut index, "a/b", Some(7), Some(1));
        let pending = Subscription::parse("c/d", QoS::AtMostOnce).unwrap();
        index.subscribe(&pending, None, Some(2));

        assert_eq!(index.clear(), vec![1]);
        let publish = Publish::new("a/b", "x", QoS::AtMostOnce).with_subscription_identifiers([7]);
        assert!(!matching(&index, &publish).subscription_found);
        assert!(index.trie().is_empty());
    }
}
