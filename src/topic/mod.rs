//! Topic filters, wildcard matching and the subscription index
//!
//! The trie stores subscription entries keyed by topic filter levels and is
//! matched against inbound topic names. Performance notes:
//! - Single-child chains are fused into one node holding a multi-level run
//! - Matching is callback-based and allocation free
//! - Topic iteration uses a `Copy` cursor so wildcard branches fork for free

mod index;
mod iter;
mod trie;
pub mod validation;

pub use index::{MatchSet, SubscriptionIndex};
pub use iter::TopicIterator;
pub use trie::{Detached, EntryId, TopicTrie, TrieEntry};
pub use validation::{
    split_shared_subscription, topic_matches_filter, validate_topic_filter, validate_topic_name,
};

use std::fmt;
use std::str::FromStr;

use compact_str::CompactString;

use crate::protocol::{ProtocolError, SubscriptionOptions};

/// A validated topic filter, possibly a shared subscription
///
/// The `$share/{group}/` part is kept as a prefix: matching only looks at the
/// levels after it, while acknowledgement and unsubscribe bookkeeping compare
/// the prefix too.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    text: CompactString,
    prefix_len: usize,
}

impl TopicFilter {
    pub fn parse(filter: &str) -> Result<Self, ProtocolError> {
        validate_topic_filter(filter).map_err(ProtocolError::InvalidTopicFilter)?;
        let prefix_len = match split_shared_subscription(filter) {
            Ok(Some((prefix, _))) => prefix.len(),
            _ => 0,
        };
        Ok(Self {
            text: CompactString::from(filter),
            prefix_len,
        })
    }

    /// Rebuild a filter from trie parts that were validated on the way in
    pub(crate) fn from_parts(prefix: Option<&str>, levels: &str) -> Self {
        let prefix = prefix.unwrap_or_default();
        let mut text = CompactString::with_capacity(prefix.len() + levels.len());
        text.push_str(prefix);
        text.push_str(levels);
        Self {
            text,
            prefix_len: prefix.len(),
        }
    }

    /// The full filter as subscribed, including a share prefix
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The filter levels used for matching
    #[inline]
    pub fn levels(&self) -> &str {
        &self.text[self.prefix_len..]
    }

    /// `$share/{group}/` for shared subscriptions
    #[inline]
    pub fn share_prefix(&self) -> Option<&str> {
        (self.prefix_len > 0).then(|| &self.text[..self.prefix_len])
    }

    pub fn share_group(&self) -> Option<&str> {
        self.share_prefix()
            .map(|prefix| &prefix[validation::SHARE_PREFIX.len()..prefix.len() - 1])
    }

    pub fn has_wildcard(&self) -> bool {
        self.levels().contains(['+', '#'])
    }

    /// Whether `topic` matches this filter under MQTT wildcard rules
    pub fn matches(&self, topic: &str) -> bool {
        topic_matches_filter(topic, self.levels())
    }
}

impl FromStr for TopicFilter {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for TopicFilter {
    type Error = ProtocolError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// One entry of a SUBSCRIBE: filter plus options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: TopicFilter,
    pub options: SubscriptionOptions,
}

impl Subscription {
    pub fn new(filter: TopicFilter, options: SubscriptionOptions) -> Self {
        Self { filter, options }
    }

    /// Parse a filter and subscribe with the given maximum QoS
    pub fn parse(filter: &str, qos: crate::protocol::QoS) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            TopicFilter::parse(filter)?,
            SubscriptionOptions::with_qos(qos),
        ))
    }
}
