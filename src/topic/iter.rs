//! Forkable level cursor over a topic or topic filter
//!
//! Trie matching explores the literal child and the `+` child with the same
//! remaining topic tail. The cursor is `Copy`, so forking is a plain copy and
//! each branch advances its own copy.

/// Cursor over the `/`-separated levels of a topic
///
/// `"a/b"` yields `a`, `b`; `"/"` yields two empty levels. An iterator created
/// with [`TopicIterator::empty`] yields nothing, which is what the levels of a
/// bare `#` filter look like once the wildcard is stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicIterator<'a> {
    remaining: Option<&'a str>,
}

impl<'a> TopicIterator<'a> {
    pub fn new(topic: &'a str) -> Self {
        Self {
            remaining: Some(topic),
        }
    }

    pub fn empty() -> Self {
        Self { remaining: None }
    }

    /// Levels of a topic filter without its trailing multi-level wildcard,
    /// plus whether the wildcard was present
    pub fn of_filter(filter: &'a str) -> (Self, bool) {
        if filter == "#" {
            (Self::empty(), true)
        } else if let Some(levels) = filter.strip_suffix("/#") {
            (Self::new(levels), true)
        } else {
            (Self::new(filter), false)
        }
    }

    /// Independent cursor at the same position
    #[inline]
    pub fn fork(&self) -> Self {
        *self
    }

    #[inline]
    pub fn has_next(&self) -> bool {
        self.remaining.is_some()
    }

    /// The not yet consumed levels, joined
    #[inline]
    pub fn remaining(&self) -> Option<&'a str> {
        self.remaining
    }
}

impl<'a> Iterator for TopicIterator<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let rest = self.remaining?;
        match rest.find('/') {
            Some(i) => {
                self.remaining = Some(&rest[i + 1..]);
                Some(&rest[..i])
            }
            None => {
                self.remaining = None;
                Some(rest)
            }
        }
    }
}
