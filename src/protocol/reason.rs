//! MQTT v5.0 reason codes seen on the inbound path
//!
//! Covers PUBACK/PUBREC/PUBCOMP, SUBACK/UNSUBACK and the DISCONNECT codes
//! this crate can raise.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ReasonCode {
    /// Success / Granted QoS 0
    #[default]
    Success = 0x00,
    GrantedQoS1 = 0x01,
    GrantedQoS2 = 0x02,
    NoMatchingSubscribers = 0x10,
    NoSubscriptionExisted = 0x11,
    UnspecifiedError = 0x80,
    MalformedPacket = 0x81,
    ProtocolError = 0x82,
    ImplementationError = 0x83,
    NotAuthorized = 0x87,
    TopicFilterInvalid = 0x8F,
    TopicNameInvalid = 0x90,
    PacketIdInUse = 0x91,
    PacketIdNotFound = 0x92,
    ReceiveMaxExceeded = 0x93,
    QuotaExceeded = 0x97,
    PayloadFormatInvalid = 0x99,
    SharedSubsNotSupported = 0x9E,
    SubIdNotSupported = 0xA1,
    WildcardSubsNotSupported = 0xA2,
}

impl ReasonCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(ReasonCode::Success),
            0x01 => Some(ReasonCode::GrantedQoS1),
            0x02 => Some(ReasonCode::GrantedQoS2),
            0x10 => Some(ReasonCode::NoMatchingSubscribers),
            0x11 => Some(ReasonCode::NoSubscriptionExisted),
            0x80 => Some(ReasonCode::UnspecifiedError),
            0x81 => Some(ReasonCode::MalformedPacket),
            0x82 => Some(ReasonCode::ProtocolError),
            0x83 => Some(ReasonCode::ImplementationError),
            0x87 => Some(ReasonCode::NotAuthorized),
            0x8F => Some(ReasonCode::TopicFilterInvalid),
            0x90 => Some(ReasonCode::TopicNameInvalid),
            0x91 => Some(ReasonCode::PacketIdInUse),
            0x92 => Some(ReasonCode::PacketIdNotFound),
            0x93 => Some(ReasonCode::ReceiveMaxExceeded),
            0x97 => Some(ReasonCode::QuotaExceeded),
            0x99 => Some(ReasonCode::PayloadFormatInvalid),
            0x9E => Some(ReasonCode::SharedSubsNotSupported),
            0xA1 => Some(ReasonCode::SubIdNotSupported),
            0xA2 => Some(ReasonCode::WildcardSubsNotSupported),
            _ => None,
        }
    }

    #[inline]
    pub fn is_success(self) -> bool {
        (self as u8) < 0x80
    }

    #[inline]
    pub fn is_error(self) -> bool {
        (self as u8) >= 0x80
    }

    /// Codes a PUBACK or PUBREC may carry (MQTT v5.0 3.4.2.1 / 3.5.2.1)
    pub fn is_valid_for_puback(self) -> bool {
        matches!(
            self,
            ReasonCode::Success
                | ReasonCode::NoMatchingSubscribers
                | ReasonCode::UnspecifiedError
                | ReasonCode::ImplementationError
                | ReasonCode::NotAuthorized
                | ReasonCode::TopicNameInvalid
                | ReasonCode::PacketIdInUse
                | ReasonCode::QuotaExceeded
                | ReasonCode::PayloadFormatInvalid
        )
    }

    /// Codes a PUBCOMP may carry (MQTT v5.0 3.7.2.1)
    pub fn is_valid_for_pubcomp(self) -> bool {
        matches!(self, ReasonCode::Success | ReasonCode::PacketIdNotFound)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReasonCode::Success => "Success",
            ReasonCode::GrantedQoS1 => "Granted QoS 1",
            ReasonCode::GrantedQoS2 => "Granted QoS 2",
            ReasonCode::NoMatchingSubscribers => "No matching subscribers",
            ReasonCode::NoSubscriptionExisted => "No subscription existed",
            ReasonCode::UnspecifiedError => "Unspecified error",
            ReasonCode::MalformedPacket => "Malformed Packet",
            ReasonCode::ProtocolError => "Protocol Error",
            ReasonCode::ImplementationError => "Implementation specific error",
            ReasonCode::NotAuthorized => "Not authorized",
            ReasonCode::TopicFilterInvalid => "Topic Filter invalid",
            ReasonCode::TopicNameInvalid => "Topic Name invalid",
            ReasonCode::PacketIdInUse => "Packet Identifier in use",
            ReasonCode::PacketIdNotFound => "Packet Identifier not found",
            ReasonCode::ReceiveMaxExceeded => "Receive Maximum exceeded",
            ReasonCode::QuotaExceeded => "Quota exceeded",
            ReasonCode::PayloadFormatInvalid => "Payload format invalid",
            ReasonCode::SharedSubsNotSupported => "Shared Subscriptions not supported",
            ReasonCode::SubIdNotSupported => "Subscription Identifiers not supported",
            ReasonCode::WildcardSubsNotSupported => "Wildcard Subscriptions not supported",
        };
        f.write_str(text)
    }
}
