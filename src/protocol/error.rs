//! Protocol violations detected on the inbound path

use std::fmt;

use super::{Disconnect, Properties, ReasonCode};

/// Broker behaviour that is fatal to the connection
///
/// Never retried locally; the session answers with a DISCONNECT carrying
/// [`ProtocolError::reason_code`] and the display text as reason string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Generic protocol violation (duplicate packet identifiers, missing DUP, bad PUBREL)
    Violation(&'static str),
    /// More unacknowledged QoS 1/2 publishes than the announced receive maximum
    ReceiveMaximumExceeded,
    /// PUBLISH topic name is not a valid topic name
    InvalidTopicName(&'static str),
    /// Topic filter handed to subscribe/unsubscribe is invalid
    InvalidTopicFilter(&'static str),
}

impl ProtocolError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::Violation(_) => ReasonCode::ProtocolError,
            Self::ReceiveMaximumExceeded => ReasonCode::ReceiveMaxExceeded,
            Self::InvalidTopicName(_) => ReasonCode::TopicNameInvalid,
            Self::InvalidTopicFilter(_) => ReasonCode::TopicFilterInvalid,
        }
    }

    pub fn to_disconnect(&self) -> Disconnect {
        Disconnect {
            reason_code: self.reason_code(),
            properties: Properties::with_reason_string(self.to_string()),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Violation(msg) => write!(f, "{}", msg),
            Self::ReceiveMaximumExceeded => write!(
                f,
                "Received more QoS 1 and/or 2 PUBLISHes than allowed by Receive Maximum"
            ),
            Self::InvalidTopicName(msg) => write!(f, "invalid topic name: {}", msg),
            Self::InvalidTopicFilter(msg) => write!(f, "invalid topic filter: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_disconnect_carries_reason() {
        let disconnect = ProtocolError::ReceiveMaximumExceeded.to_disconnect();
        assert_eq!(disconnect.reason_code, ReasonCode::ReceiveMaxExceeded);
        assert_eq!(
            disconnect.properties.reason_string.as_deref(),
            Some("Received more QoS 1 and/or 2 PUBLISHes than allowed by Receive Maximum")
        );
    }
}
