//! Hooks Module
//!
//! Extensibility points for the acknowledgements the inbound path writes.
//! An interceptor sees each QoS 1/2 PUBLISH right before its PUBACK/PUBREC is
//! built and each PUBREL before its PUBCOMP, and may set the reason code,
//! reason string and user properties.

use tracing::warn;

use crate::protocol::{Properties, PubAck, PubComp, PubRec, PubRel, Publish, ReasonCode};

#[cfg(test)]
mod tests;

/// Mutable view of an acknowledgement under construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckBuilder {
    reason_code: ReasonCode,
    reason_string: Option<String>,
    user_properties: Vec<(String, String)>,
}

impl AckBuilder {
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            reason_string: None,
            user_properties: Vec::new(),
        }
    }

    pub fn reason_code(&self) -> ReasonCode {
        self.reason_code
    }

    pub fn set_reason_code(&mut self, code: ReasonCode) -> &mut Self {
        self.reason_code = code;
        self
    }

    pub fn set_reason_string(&mut self, reason: impl Into<String>) -> &mut Self {
        self.reason_string = Some(reason.into());
        self
    }

    pub fn add_user_property(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    fn properties(&self) -> Properties {
        Properties {
            reason_string: self.reason_string.clone(),
            user_properties: self.user_properties.clone(),
            ..Properties::default()
        }
    }

    /// Reason code with codes not allowed on PUBACK/PUBREC replaced
    fn publish_reason_code(&self, packet: &str) -> ReasonCode {
        if self.reason_code.is_valid_for_puback() {
            return self.reason_code;
        }
        warn!(
            "Reason code {:?} is not valid for {}, using UnspecifiedError",
            self.reason_code, packet
        );
        ReasonCode::UnspecifiedError
    }

    pub fn into_puback(self, packet_id: u16) -> PubAck {
        PubAck {
            packet_id,
            reason_code: self.publish_reason_code("PUBACK"),
            properties: self.properties(),
        }
    }

    pub fn into_pubrec(self, packet_id: u16) -> PubRec {
        PubRec {
            packet_id,
            reason_code: self.publish_reason_code("PUBREC"),
            properties: self.properties(),
        }
    }

    pub fn into_pubcomp(self, packet_id: u16) -> PubComp {
        let reason_code = if self.reason_code.is_valid_for_pubcomp() {
            self.reason_code
        } else {
            warn!(
                "Reason code {:?} is not valid for PUBCOMP, using Success",
                self.reason_code
            );
            ReasonCode::Success
        };
        PubComp {
            packet_id,
            reason_code,
            properties: self.properties(),
        }
    }
}

/// Acknowledgement interceptor trait
///
/// All methods have default implementations that leave the acknowledgement
/// untouched. Interceptors run on the session task and must not block.
pub trait AckInterceptor: Send + Sync {
    /// Called once per QoS 1 PUBLISH before its PUBACK is written
    fn on_qos1_publish(&self, _publish: &Publish, _puback: &mut AckBuilder) {}

    /// Called once per QoS 2 PUBLISH before its PUBREC is written
    fn on_qos2_publish(&self, _publish: &Publish, _pubrec: &mut AckBuilder) {}

    /// Called once per PUBREL before its PUBCOMP is written
    fn on_pubrel(&self, _pubrel: &PubRel, _pubcomp: &mut AckBuilder) {}
}

/// Default interceptor that leaves every acknowledgement unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultInterceptor;

impl AckInterceptor for DefaultInterceptor {}

/// Implement AckInterceptor for Arc<T> where T: AckInterceptor
impl<T: AckInterceptor + ?Sized> AckInterceptor for std::sync::Arc<T> {
    fn on_qos1_publish(&self, publish: &Publish, puback: &mut AckBuilder) {
        (**self).on_qos1_publish(publish, puback);
    }

    fn on_qos2_publish(&self, publish: &Publish, pubrec: &mut AckBuilder) {
        (**self).on_qos2_publish(publish, pubrec);
    }

    fn on_pubrel(&self, pubrel: &PubRel, pubcomp: &mut AckBuilder) {
        (**self).on_pubrel(pubrel, pubcomp);
    }
}

/// Composite interceptor that runs several interceptors in order
///
/// Later interceptors see the builder as left by earlier ones.
#[derive(Default)]
pub struct CompositeInterceptor {
    interceptors: Vec<Box<dyn AckInterceptor>>,
}

impl CompositeInterceptor {
    pub fn new() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }

    pub fn add<I: AckInterceptor + 'static>(&mut self, interceptor: I) {
        self.interceptors.push(Box::new(interceptor));
    }

    /// Add an interceptor and return self for chaining
    pub fn with<I: AckInterceptor + 'static>(mut self, interceptor: I) -> Self {
        self.add(interceptor);
        self
    }
}

impl AckInterceptor for CompositeInterceptor {
    fn on_qos1_publish(&self, publish: &Publish, puback: &mut AckBuilder) {
        for interceptor in &self.interceptors {
            interceptor.on_qos1_publish(publish, puback);
        }
    }

    fn on_qos2_publish(&self, publish: &Publish, pubrec: &mut AckBuilder) {
        for interceptor in &self.interceptors {
            interceptor.on_qos2_publish(publish, pubrec);
        }
    }

    fn on_pubrel(&self, pubrel: &PubRel, pubcomp: &mut AckBuilder) {
        for interceptor in &self.interceptors {
            interceptor.on_pubrel(pubrel, pubcomp);
        }
    }
}
