//! MQTT v5.0 properties carried by inbound publishes and acknowledgements

use bytes::Bytes;
use smallvec::SmallVec;

/// The property subset relevant on the inbound path
///
/// Connection-level properties (session expiry, authentication, server
/// capabilities) are consumed by the connection layer and never reach here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    /// Subscription identifiers echoed by the broker on a PUBLISH
    pub subscription_identifiers: SmallVec<[u32; 2]>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

impl Properties {
    pub fn is_empty(&self) -> bool {
        self.payload_format_indicator.is_none()
            && self.message_expiry_interval.is_none()
            && self.content_type.is_none()
            && self.response_topic.is_none()
            && self.correlation_data.is_none()
            && self.subscription_identifiers.is_empty()
            && self.reason_string.is_none()
            && self.user_properties.is_empty()
    }

    pub fn with_reason_string(reason: impl Into<String>) -> Self {
        Self {
            reason_string: Some(reason.into()),
            ..Self::default()
        }
    }
}
