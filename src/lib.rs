//! VibeMQ inbound - the receiving half of an MQTT v3.1.1/v5.0 client session
//!
//! Routes inbound PUBLISH packets to application flows through a wildcard
//! topic trie, applies per-flow backpressure, and produces PUBACK, PUBREC and
//! PUBCOMP in the order the publishes arrived once every flow consumed (and,
//! for manual flows, confirmed) them.
//!
//! The transport decodes packets and hands them to an
//! [`InboundSession`](session::InboundSession); the session writes
//! acknowledgements back on a channel.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod hooks;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod qos;
pub mod session;
pub mod topic;

pub use config::{Config, InboundConfig, Qos0Overflow};
pub use error::{FlowError, SessionEndCause, SessionError};
pub use flow::{Confirmation, FlowEvent, FlowId, GlobalFilter, IncomingPublish, PublishFlow};
pub use hooks::{AckBuilder, AckInterceptor, CompositeInterceptor, DefaultInterceptor};
pub use metrics::InboundMetrics;
pub use protocol::{Packet, ProtocolError, Publish, QoS, ReasonCode};
pub use session::{spawn, InboundSession, SessionHandle};
pub use topic::{Subscription, TopicFilter};
