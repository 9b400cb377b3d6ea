//! Topic trie for subscription matching
//!
//! Nodes and entries live in slot maps and reference each other by key.
//! A node's `levels` is a run of one or more topic levels: a chain of nodes
//! with one child and no entries is fused into a single node, and split again
//! when a new filter diverges inside the run. Children are keyed by the first
//! level of their run; a run starting with `+` sits in the `single_level` slot.

use std::collections::BTreeMap;

use ahash::AHashMap;
use compact_str::{format_compact, CompactString};
use smallvec::SmallVec;

use super::{Subscription, TopicFilter, TopicIterator};
use slotmap::{new_key_type, SlotMap};

use crate::protocol::SubscriptionOptions;

new_key_type! {
    /// Key of a subscription entry stored in a [`TopicTrie`]
    pub struct EntryId;
    struct NodeKey;
}

/// One subscription of one filter, as recorded on subscribe
#[derive(Debug, Clone)]
pub struct TrieEntry<F> {
    share_prefix: Option<CompactString>,
    pub options: SubscriptionOptions,
    pub subscription_identifier: Option<u32>,
    /// Owning flow; `None` for subscriptions without a flow or after cancel
    pub flow: Option<F>,
    /// Set by a successful SUBACK reason code
    pub acknowledged: bool,
}

impl<F> TrieEntry<F> {
    pub fn share_prefix(&self) -> Option<&str> {
        self.share_prefix.as_deref()
    }
}

/// An entry removed from the trie while still owned by a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detached<F> {
    pub flow: F,
    pub entry: EntryId,
}

#[derive(Debug)]
struct Node {
    parent: Option<NodeKey>,
    /// One or more levels joined by `/`; empty only for the root
    levels: CompactString,
    children: AHashMap<CompactString, NodeKey>,
    single_level: Option<NodeKey>,
    entries: Vec<EntryId>,
    multi_level_entries: Vec<EntryId>,
}

impl Node {
    fn new(parent: Option<NodeKey>, levels: CompactString) -> Self {
        Self {
            parent,
            levels,
            children: AHashMap::new(),
            single_level: None,
            entries: Vec::new(),
            multi_level_entries: Vec::new(),
        }
    }

    fn list(&mut self, multi_level: bool) -> &mut Vec<EntryId> {
        if multi_level {
            &mut self.multi_level_entries
        } else {
            &mut self.entries
        }
    }

    fn has_entries(&self) -> bool {
        !self.entries.is_empty() || !self.multi_level_entries.is_empty()
    }
}

#[inline]
fn first_level(levels: &str) -> &str {
    levels.split('/').next().unwrap_or(levels)
}

/// Split a run after its first `at` levels
fn split_run(levels: &str, at: usize) -> (CompactString, CompactString) {
    match levels.match_indices('/').nth(at - 1) {
        Some((i, _)) => (levels[..i].into(), levels[i + 1..].into()),
        None => (levels.into(), CompactString::default()),
    }
}

/// Wildcard-aware trie of subscription entries owned by flows of type `F`
#[derive(Debug)]
pub struct TopicTrie<F> {
    nodes: SlotMap<NodeKey, Node>,
    entries: SlotMap<EntryId, TrieEntry<F>>,
    root: NodeKey,
}

impl<F: Copy + Eq> TopicTrie<F> {
    pub fn new() -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(Node::new(None, CompactString::default()));
        Self {
            nodes,
            entries: SlotMap::with_key(),
            root,
        }
    }

    /// Number of live subscription entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of trie nodes including the root
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn entry(&self, id: EntryId) -> Option<&TrieEntry<F>> {
        self.entries.get(id)
    }

    /// Record a subscription; nodes are created lazily along the filter
    pub fn subscribe(
        &mut self,
        filter: &TopicFilter,
        options: SubscriptionOptions,
        subscription_identifier: Option<u32>,
        flow: Option<F>,
    ) -> EntryId {
        let (levels, multi_level) = TopicIterator::of_filter(filter.levels());
        let node = self.insert_path(levels);
        let entry = self.entries.insert(TrieEntry {
            share_prefix: filter.share_prefix().map(CompactString::from),
            options,
            subscription_identifier,
            flow,
            acknowledged: false,
        });
        self.nodes[node].list(multi_level).push(entry);
        entry
    }

    /// Apply one SUBACK reason code
    ///
    /// Success flags the matching entries acknowledged. An error removes them
    /// and returns the ones that were owned by a flow.
    pub fn suback(
        &mut self,
        filter: &TopicFilter,
        subscription_identifier: Option<u32>,
        error: bool,
    ) -> SmallVec<[Detached<F>; 2]> {
        let mut detached = SmallVec::new();
        let (levels, multi_level) = TopicIterator::of_filter(filter.levels());
        let Some(node) = self.locate(levels) else {
            return detached;
        };

        let prefix = filter.share_prefix();
        let mut list = std::mem::take(self.nodes[node].list(multi_level));
        list.retain(|&id| {
            let Some(entry) = self.entries.get_mut(id) else {
                return false;
            };
            if entry.subscription_identifier != subscription_identifier
                || entry.share_prefix() != prefix
            {
                return true;
            }
            if !error {
                entry.acknowledged = true;
                return true;
            }
            if let Some(flow) = entry.flow {
                detached.push(Detached { flow, entry: id });
            }
            self.entries.remove(id);
            false
        });
        *self.nodes[node].list(multi_level) = list;

        if error {
            self.compact(node);
        }
        detached
    }

    /// Remove every acknowledged entry of `filter`, whatever its
    /// subscription identifier
    ///
    /// Unacknowledged entries stay: their SUBACK may still arrive.
    pub fn unsubscribe(&mut self, filter: &TopicFilter) -> SmallVec<[Detached<F>; 2]> {
        let mut detached = SmallVec::new();
        let (levels, multi_level) = TopicIterator::of_filter(filter.levels());
        let Some(node) = self.locate(levels) else {
            return detached;
        };

        let prefix = filter.share_prefix();
        let mut list = std::mem::take(self.nodes[node].list(multi_level));
        list.retain(|&id| {
            let Some(entry) = self.entries.get(id) else {
                return false;
            };
            if !entry.acknowledged || entry.share_prefix() != prefix {
                return true;
            }
            if let Some(flow) = entry.flow {
                detached.push(Detached { flow, entry: id });
            }
            self.entries.remove(id);
            false
        });
        *self.nodes[node].list(multi_level) = list;

        self.compact(node);
        detached
    }

    /// Detach `flow` from its own entries, leaving the subscriptions in place
    pub fn cancel(&mut self, flow: F, entries: impl IntoIterator<Item = EntryId>) {
        for id in entries {
            if let Some(entry) = self.entries.get_mut(id) {
                if entry.flow == Some(flow) {
                    entry.flow = None;
                }
            }
        }
    }

    /// Visit every entry whose filter matches `topic`
    ///
    /// Multi-level entries match any remaining suffix including the empty
    /// one. Topics starting with `$` skip wildcards at the root level.
    /// Unacknowledged entries are visited too; callers check `acknowledged`.
    pub fn find_matching(&self, topic: &str, visit: &mut dyn FnMut(EntryId, &TrieEntry<F>)) {
        let system = topic.starts_with('$');
        self.match_node(self.root, TopicIterator::new(topic), system, visit);
    }

    /// Drop every node and entry, returning the flows of acknowledged entries
    pub fn clear(&mut self) -> Vec<F> {
        let flows = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.acknowledged)
            .filter_map(|(_, entry)| entry.flow)
            .collect();
        self.entries.clear();
        self.nodes.clear();
        self.root = self.nodes.insert(Node::new(None, CompactString::default()));
        flows
    }

    /// Acknowledged subscriptions grouped by subscription identifier,
    /// highest identifier first and the group without identifier last
    pub fn subscriptions(&self) -> Vec<(Option<u32>, Vec<Subscription>)> {
        let mut groups: BTreeMap<Option<u32>, Vec<Subscription>> = BTreeMap::new();
        let mut stack: Vec<(NodeKey, Option<CompactString>)> = vec![(self.root, None)];

        while let Some((handle, parent_path)) = stack.pop() {
            let node = &self.nodes[handle];
            let path = match (node.parent, parent_path) {
                (None, _) => None,
                (Some(_), None) => Some(node.levels.clone()),
                (Some(_), Some(parent)) => Some(format_compact!("{}/{}", parent, node.levels)),
            };
            self.collect_subscriptions(&node.entries, path.as_deref(), false, &mut groups);
            self.collect_subscriptions(
                &node.multi_level_entries,
                path.as_deref(),
                true,
                &mut groups,
            );
            for &child in node.children.values().chain(node.single_level.iter()) {
                stack.push((child, path.clone()));
            }
        }

        groups.into_iter().rev().collect()
    }

    fn collect_subscriptions(
        &self,
        list: &[EntryId],
        path: Option<&str>,
        multi_level: bool,
        groups: &mut BTreeMap<Option<u32>, Vec<Subscription>>,
    ) {
        let levels = match (path, multi_level) {
            (None, true) => CompactString::const_new("#"),
            (Some(path), true) => format_compact!("{}/#", path),
            (Some(path), false) => CompactString::from(path),
            (None, false) => return,
        };

        // newest first; an older exact subscription was overwritten by the newer one
        let mut exact_found = false;
        for entry in list.iter().rev().filter_map(|&id| self.entries.get(id)) {
            if !entry.acknowledged {
                continue;
            }
            if entry.share_prefix.is_none() {
                if exact_found {
                    continue;
                }
                exact_found = true;
            }
            groups
                .entry(entry.subscription_identifier)
                .or_default()
                .push(Subscription::new(
                    TopicFilter::from_parts(entry.share_prefix(), &levels),
                    entry.options,
                ));
        }
    }

    fn match_node(
        &self,
        handle: NodeKey,
        mut topic: TopicIterator<'_>,
        system: bool,
        visit: &mut dyn FnMut(EntryId, &TrieEntry<F>),
    ) {
        let node = &self.nodes[handle];
        let Some(level) = topic.next() else {
            self.visit_list(&node.entries, visit);
            self.visit_list(&node.multi_level_entries, visit);
            return;
        };

        if !system {
            self.visit_list(&node.multi_level_entries, visit);
        }
        if let Some(&child) = node.children.get(level) {
            let mut fork = topic.fork();
            if self.follow_run(child, &mut fork) {
                self.match_node(child, fork, false, visit);
            }
        }
        if let (false, Some(child)) = (system, node.single_level) {
            let mut fork = topic.fork();
            if self.follow_run(child, &mut fork) {
                self.match_node(child, fork, false, visit);
            }
        }
    }

    /// Advance `topic` over the rest of a child's run; `+` matches any level
    fn follow_run(&self, child: NodeKey, topic: &mut TopicIterator<'_>) -> bool {
        self.nodes[child].levels.split('/').skip(1).all(|run_level| {
            matches!(topic.next(), Some(level) if run_level == "+" || run_level == level)
        })
    }

    fn visit_list(&self, list: &[EntryId], visit: &mut dyn FnMut(EntryId, &TrieEntry<F>)) {
        for &id in list {
            if let Some(entry) = self.entries.get(id) {
                visit(id, entry);
            }
        }
    }

    fn child(&self, node: NodeKey, level: &str) -> Option<NodeKey> {
        let node = &self.nodes[node];
        if level == "+" {
            node.single_level
        } else {
            node.children.get(level).copied()
        }
    }

    fn link(&mut self, parent: NodeKey, first: &str, child: NodeKey) {
        let parent = &mut self.nodes[parent];
        if first == "+" {
            parent.single_level = Some(child);
        } else {
            parent.children.insert(first.into(), child);
        }
    }

    fn unlink(&mut self, parent: NodeKey, first: &str) {
        let parent = &mut self.nodes[parent];
        if first == "+" {
            parent.single_level = None;
        } else {
            parent.children.remove(first);
        }
    }

    /// Walk (and grow) the trie along exact filter levels
    fn insert_path(&mut self, mut levels: TopicIterator<'_>) -> NodeKey {
        let mut node = self.root;
        while let Some(level) = levels.next() {
            let Some(child) = self.child(node, level) else {
                let run = match levels.remaining() {
                    Some(rest) => format_compact!("{}/{}", level, rest),
                    None => CompactString::from(level),
                };
                let created = self.nodes.insert(Node::new(Some(node), run));
                self.link(node, level, created);
                return created;
            };

            let run = &self.nodes[child].levels;
            let mut matched = 1;
            for run_level in run.split('/').skip(1) {
                let mut lookahead = levels.fork();
                match lookahead.next() {
                    Some(next) if next == run_level => {
                        levels = lookahead;
                        matched += 1;
                    }
                    _ => break,
                }
            }
            node = if matched == run.split('/').count() {
                child
            } else {
                self.split(node, child, matched)
            };
        }
        node
    }

    /// Split `child`'s run after `at` levels, returning the new upper node
    fn split(&mut self, parent: NodeKey, child: NodeKey, at: usize) -> NodeKey {
        let (before, after) = split_run(&self.nodes[child].levels, at);
        let upper = self.nodes.insert(Node::new(Some(parent), before.clone()));
        self.link(parent, first_level(&before), upper);

        let lower = &mut self.nodes[child];
        lower.parent = Some(upper);
        lower.levels = after.clone();
        self.link(upper, first_level(&after), child);
        upper
    }

    /// Exact lookup of the node a filter terminates at
    fn locate(&self, mut levels: TopicIterator<'_>) -> Option<NodeKey> {
        let mut node = self.root;
        while let Some(level) = levels.next() {
            let child = self.child(node, level)?;
            for run_level in self.nodes[child].levels.split('/').skip(1) {
                if levels.next() != Some(run_level) {
                    return None;
                }
            }
            node = child;
        }
        Some(node)
    }

    /// Prune emptied nodes toward the root and fuse single-child chains
    fn compact(&mut self, mut handle: NodeKey) {
        loop {
            let node = &self.nodes[handle];
            let Some(parent) = node.parent else {
                return;
            };
            if node.has_entries() {
                return;
            }
            let only_child = match node.children.len() {
                1 => node.children.values().next().copied(),
                _ => None,
            };
            match (node.single_level, node.children.len()) {
                (None, 0) => {
                    let first = CompactString::from(first_level(&node.levels));
                    self.unlink(parent, &first);
                    self.nodes.remove(handle);
                    handle = parent;
                }
                (Some(child), 0) => return self.fuse(handle, parent, child),
                (None, 1) => {
                    if let Some(child) = only_child {
                        self.fuse(handle, parent, child);
                    }
                    return;
                }
                _ => return,
            }
        }
    }

    /// Merge an entry-less node into its only child
    fn fuse(&mut self, handle: NodeKey, parent: NodeKey, child: NodeKey) {
        let Some(removed) = self.nodes.remove(handle) else {
            return;
        };
        let lower = &mut self.nodes[child];
        lower.levels = format_compact!("{}/{}", removed.levels, lower.levels);
        lower.parent = Some(parent);
        self.link(parent, first_level(&removed.levels), child);
    }
}

impl<F: Copy + Eq> Default for TopicTrie<F> {
    fn default() -> Self {
        Self::new()
    }
}
