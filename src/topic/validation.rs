//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Multi-level wildcard (#) must be the last level and occupy it entirely
//! - Single-level wildcard (+) must occupy an entire level
//! - Topics starting with $ do not match filters starting with a wildcard

const MAX_TOPIC_LEN: usize = 65535;

/// Prefix introducing a shared subscription: `$share/{group}/{filter}`
pub const SHARE_PREFIX: &str = "$share/";

/// Validate a topic name received in a PUBLISH
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }
    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Split a shared subscription into its `$share/{group}/` prefix and the
/// actual filter. Returns `Ok(None)` for a plain filter.
pub fn split_shared_subscription(filter: &str) -> Result<Option<(&str, &str)>, &'static str> {
    let Some(rest) = filter.strip_prefix(SHARE_PREFIX) else {
        return Ok(None);
    };
    let Some(slash) = rest.find('/') else {
        return Err("invalid shared subscription format");
    };
    let group = &rest[..slash];
    if group.is_empty() {
        return Err("shared subscription group name cannot be empty");
    }
    if group.contains(['+', '#']) {
        return Err("shared subscription group name cannot contain wildcards");
    }
    if rest.len() == slash + 1 {
        return Err("shared subscription filter cannot be empty");
    }
    let prefix_len = SHARE_PREFIX.len() + slash + 1;
    Ok(Some(filter.split_at(prefix_len)))
}

/// Validate a topic filter used in SUBSCRIBE/UNSUBSCRIBE, shared or not
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err("topic filter exceeds maximum length");
    }
    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let actual = match split_shared_subscription(filter)? {
        Some((_, actual)) => actual,
        None => filter,
    };

    let mut levels = actual.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }
    Ok(())
}

/// Check if a (non-shared) topic filter matches a topic name, level by level
///
/// Linear reference matcher; the trie is the fast path.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(level) if filter_level == "+" || filter_level == level => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}
